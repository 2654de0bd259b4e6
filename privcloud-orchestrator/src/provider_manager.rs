use privcloud_providers::{CloudProvider, ObjectStore};
use std::env;
use std::sync::Arc;

/// Compute provider and object store of one backend.
pub struct ProviderHandles {
    pub compute: Arc<dyn CloudProvider>,
    pub store: Arc<dyn ObjectStore>,
}

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PRIVCLOUD_PROVIDER")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "mock".to_string())
    }

    pub fn get_provider(provider_name: &str) -> Option<ProviderHandles> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use privcloud_providers::mock::{MockObjectStore, MockProvider};
                // Mock machines report loopback so the agent probe has something to hit.
                let address = env::var("PRIVCLOUD_MOCK_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());
                Some(ProviderHandles {
                    compute: Arc::new(MockProvider::new().with_address(address.trim())),
                    store: Arc::new(MockObjectStore::new()),
                })
            }
            // Add other providers here:
            // "ec2" => ...
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(ProviderManager::get_provider("nimbus").is_none());
    }

    #[cfg(feature = "provider-mock")]
    #[test]
    fn mock_is_case_insensitive() {
        assert!(ProviderManager::get_provider("MOCK").is_some());
    }
}
