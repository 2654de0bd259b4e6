use anyhow::Context;
use privcloud_common::{ResourceTemplate, TemplateSet};
use privcloud_orchestrator::api::{self, AppState};
use privcloud_orchestrator::provider_manager::ProviderManager;
use privcloud_orchestrator::settings::OrchestratorSettings;
use privcloud_orchestrator::ProvisioningDriver;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn load_template(settings: &OrchestratorSettings) -> anyhow::Result<TemplateSet> {
    match &settings.template_file {
        Some(path) => TemplateSet::load(path)
            .with_context(|| format!("failed to load template {}", path.display())),
        None => {
            println!("⚠️  PRIVCLOUD_TEMPLATE_FILE not set, using the built-in sample template");
            Ok(TemplateSet::new(ResourceTemplate::new("ami-sample", "m1.small")))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = OrchestratorSettings::from_env()?;
    let template = Arc::new(load_template(&settings)?);

    let provider_name = ProviderManager::current_provider_name();
    let handles = ProviderManager::get_provider(&provider_name)
        .with_context(|| format!("provider '{}' is not available in this build", provider_name))?;
    println!("✅ Provider '{}' ready", provider_name);

    let driver = Arc::new(
        ProvisioningDriver::builder(handles.compute, handles.store, template, settings.driver.clone())
            .build()
            .context("failed to build provisioning driver")?,
    );

    let app = api::create_router(AppState::new(driver.clone()));
    let listener = tokio::net::TcpListener::bind(&settings.api_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.api_addr))?;
    println!("🚀 Orchestrator admin API listening on {}", settings.api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("admin API server failed")?;

    driver.shutdown().await;
    println!("👋 Orchestrator stopped");
    Ok(())
}
