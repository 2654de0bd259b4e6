use crate::driver::DriverSettings;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of host-supplied variables forwarded to every machine's env script
/// (`PRIVCLOUD_EXPORT_FOO=bar` exports `FOO=bar`).
pub const EXPORT_PREFIX: &str = "PRIVCLOUD_EXPORT_";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub provider: String,
    pub template_file: Option<PathBuf>,
    pub api_addr: String,
    pub driver: DriverSettings,
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| raw.parse::<T>().with_context(|| format!("{} has an invalid value '{}'", name, raw)))
        .transpose()
}

impl OrchestratorSettings {
    /// Read `PRIVCLOUD_*` variables. Call `dotenv::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> {
        let group = var("PRIVCLOUD_MANAGEMENT_GROUP").context("PRIVCLOUD_MANAGEMENT_GROUP must be set")?;
        let mut driver = DriverSettings::new(group);

        if let Some(n) = parsed::<usize>("PRIVCLOUD_MANAGEMENT_MACHINES")? {
            driver.management_machines = n;
        }
        if let Some(prefix) = var("PRIVCLOUD_MACHINE_PREFIX") {
            driver.machine_prefix = prefix;
        }
        if let Some(prefix) = var("PRIVCLOUD_VOLUME_PREFIX") {
            driver.volume_prefix = prefix;
        }
        if let Some(port) = parsed::<u16>("PRIVCLOUD_AGENT_PORT")? {
            driver.agent_port = port;
        }
        if let Some(ms) = parsed::<u64>("PRIVCLOUD_POLL_INTERVAL_MS")? {
            driver.poll_interval = Duration::from_millis(ms);
        }
        if let Some(dir) = var("PRIVCLOUD_REMOTE_DIR") {
            driver.remote_dir = dir;
        }
        driver.management_files_dir = var("PRIVCLOUD_MANAGEMENT_FILES_DIR").map(PathBuf::from);
        driver.worker_files_dir = var("PRIVCLOUD_WORKER_FILES_DIR").map(PathBuf::from);
        if let Some(bucket) = var("PRIVCLOUD_BUCKET") {
            driver.bucket = bucket;
        }
        if let Some(secs) = parsed::<u64>("PRIVCLOUD_PRESIGN_TTL_SECS")? {
            driver.presign_ttl = Duration::from_secs(secs);
        }
        if let Some(port) = parsed::<u16>("PRIVCLOUD_LOOKUP_PORT")? {
            driver.lookup_port = port;
        }
        driver.env = exported_vars(env::vars());

        driver
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid orchestrator settings")?;

        Ok(Self {
            provider: var("PRIVCLOUD_PROVIDER").unwrap_or_else(|| "mock".to_string()),
            template_file: var("PRIVCLOUD_TEMPLATE_FILE").map(PathBuf::from),
            api_addr: var("PRIVCLOUD_API_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string()),
            driver,
        })
    }
}

/// `PRIVCLOUD_EXPORT_<NAME>=<value>` pairs, keyed by `<NAME>`.
pub fn exported_vars(vars: impl Iterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.filter_map(|(key, value)| {
        key.strip_prefix(EXPORT_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| (name.to_string(), value))
    })
    .collect()
}
