pub mod agent_probe;
pub mod api;
pub mod bootstrap;
pub mod clock;
pub mod driver;
pub mod fleet;
pub mod logger;
pub mod names;
pub mod poller;
pub mod provider_manager;
pub mod provisioner;
pub mod settings;

pub use driver::{DriverSettings, ProvisioningDriver};
