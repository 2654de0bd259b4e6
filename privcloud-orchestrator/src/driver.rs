use crate::agent_probe::{AgentProbe, TcpAgentProbe};
use crate::bootstrap::{BootstrapConfig, BootstrapPackager, RemoteContext};
use crate::clock::{Clock, TokioClock};
use crate::fleet::FleetCoordinator;
use crate::logger::ActionLog;
use crate::names::{NameAllocator, NameCounters};
use crate::poller::LifecyclePoller;
use crate::provisioner::InstanceProvisioner;
use privcloud_common::{
    MachineDescriptor, MachineRole, ProvisioningError, ProvisioningTask, ResourceKind, TemplateSet,
};
use privcloud_providers::{is_not_found, CloudProvider, InstanceFilter, ObjectStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MANAGEMENT_MACHINES: usize = 1;
pub const DEFAULT_MACHINE_PREFIX: &str = "privcloud-agent-";
pub const DEFAULT_VOLUME_PREFIX: &str = "privcloud-storage-";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_REMOTE_DIR: &str = "/opt/privcloud";
pub const DEFAULT_BUCKET: &str = "privcloud-bootstrap";
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_LOOKUP_PORT: u16 = 4174;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub management_group: String,
    pub management_machines: usize,
    pub machine_prefix: String,
    pub volume_prefix: String,
    pub poll_interval: Duration,
    pub agent_port: u16,
    pub lookup_port: u16,
    pub remote_dir: String,
    pub bucket: String,
    pub presign_ttl: Duration,
    pub management_files_dir: Option<PathBuf>,
    pub worker_files_dir: Option<PathBuf>,
    /// Exported by every machine's env script.
    pub env: BTreeMap<String, String>,
}

impl DriverSettings {
    pub fn new(management_group: impl Into<String>) -> Self {
        Self {
            management_group: management_group.into(),
            management_machines: DEFAULT_MANAGEMENT_MACHINES,
            machine_prefix: DEFAULT_MACHINE_PREFIX.to_string(),
            volume_prefix: DEFAULT_VOLUME_PREFIX.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            agent_port: crate::agent_probe::DEFAULT_AGENT_PORT,
            lookup_port: DEFAULT_LOOKUP_PORT,
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            presign_ttl: DEFAULT_PRESIGN_TTL,
            management_files_dir: None,
            worker_files_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            bucket: self.bucket.clone(),
            presign_ttl: self.presign_ttl,
            remote_dir: self.remote_dir.clone(),
            agent_port: self.agent_port,
            lookup_port: self.lookup_port,
            management_group: self.management_group.trim().to_string(),
            management_files_dir: self.management_files_dir.clone(),
            worker_files_dir: self.worker_files_dir.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ProvisioningError> {
        if self.management_group.trim().is_empty() {
            return Err(ProvisioningError::Configuration {
                reason: "management group must not be blank".to_string(),
            });
        }
        if self.management_machines == 0 {
            return Err(ProvisioningError::Configuration {
                reason: "management fleet needs at least one machine".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ProvisioningError::Configuration {
                reason: "poll interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}

pub struct DriverBuilder {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn ObjectStore>,
    template: Arc<TemplateSet>,
    settings: DriverSettings,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Arc<dyn AgentProbe>>,
    counters: Option<Arc<NameCounters>>,
}

impl DriverBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn AgentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_counters(mut self, counters: Arc<NameCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn build(self) -> Result<ProvisioningDriver, ProvisioningError> {
        self.settings.validate()?;
        self.template
            .validate()
            .map_err(|e| ProvisioningError::Configuration { reason: e.to_string() })?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(TcpAgentProbe::new(self.settings.agent_port, clock.clone())));
        let counters = self.counters.unwrap_or_default();

        let names = NameAllocator::new(self.provider.clone(), counters);
        let poller = LifecyclePoller::new(self.provider.clone(), clock.clone(), self.settings.poll_interval);
        let packager = Arc::new(BootstrapPackager::new(self.store, self.settings.bootstrap_config()));
        let provisioner = InstanceProvisioner::new(
            self.provider.clone(),
            poller.clone(),
            names.clone(),
            packager,
            probe,
            self.settings.volume_prefix.clone(),
        );
        let fleet = FleetCoordinator::new(
            self.provider.clone(),
            provisioner.clone(),
            clock.clone(),
            self.settings.management_group.trim(),
        );

        Ok(ProvisioningDriver {
            provider: self.provider,
            template: self.template,
            settings: self.settings,
            clock,
            names,
            poller,
            provisioner,
            fleet,
            closed: AtomicBool::new(false),
        })
    }
}

/// Host-facing provisioning surface over one provider, object store and template.
pub struct ProvisioningDriver {
    provider: Arc<dyn CloudProvider>,
    template: Arc<TemplateSet>,
    settings: DriverSettings,
    clock: Arc<dyn Clock>,
    names: NameAllocator,
    poller: LifecyclePoller,
    provisioner: InstanceProvisioner,
    fleet: FleetCoordinator,
    closed: AtomicBool,
}

impl ProvisioningDriver {
    pub fn builder(
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn ObjectStore>,
        template: Arc<TemplateSet>,
        settings: DriverSettings,
    ) -> DriverBuilder {
        DriverBuilder {
            provider,
            store,
            template,
            settings,
            clock: None,
            probe: None,
            counters: None,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ProvisioningError> {
        if self.is_closed() {
            Err(ProvisioningError::DriverClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_future(&self, deadline: Instant) -> Result<(), ProvisioningError> {
        if self.clock.now() >= deadline {
            Err(ProvisioningError::InvalidDuration)
        } else {
            Ok(())
        }
    }

    fn remote_context(&self, location_id: Option<String>) -> RemoteContext {
        RemoteContext {
            location_id,
            env: self.settings.env.clone(),
        }
    }

    /// Start one worker machine named from the machine prefix.
    ///
    /// An empty `location_id` falls back to the first management machine's location.
    pub async fn provision_one(
        &self,
        location_id: Option<&str>,
        deadline: Instant,
    ) -> Result<MachineDescriptor, ProvisioningError> {
        self.ensure_open()?;
        self.ensure_future(deadline)?;

        let location = match location_id.map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => Some(location.to_string()),
            None => self
                .fleet
                .list_fleet()
                .await?
                .into_iter()
                .next()
                .and_then(|md| md.location_id),
        };
        let name = self
            .names
            .allocate(ResourceKind::Instance, &self.settings.machine_prefix)
            .await?;
        let task = ProvisioningTask::new(name, self.template.clone(), MachineRole::Worker, deadline);

        self.provisioner
            .provision(&task, &self.remote_context(location), None)
            .await
            .map_err(|failure| {
                if let Some(id) = &failure.instance_id {
                    tracing::warn!(
                        "⚠️ [driver] {} failed at {}; instance {} left for the caller",
                        task.desired_name,
                        failure.stage.as_str(),
                        id
                    );
                }
                failure.into()
            })
    }

    /// Terminate the machine with private address `address` and wait until it
    /// stops. Returns `false` if no machine has that address.
    pub async fn terminate_one(&self, address: &str, deadline: Instant) -> Result<bool, ProvisioningError> {
        self.ensure_open()?;
        self.ensure_future(deadline)?;

        let address = crate::agent_probe::clean_host(address);
        let found = match self
            .provider
            .describe_instances(&InstanceFilter::by_private_ip(address))
            .await
        {
            Ok(found) => found,
            Err(e) if is_not_found(&e) => Vec::new(),
            Err(e) => return Err(ProvisioningError::remote("describe_instances", e)),
        };
        let ids: Vec<String> = found.into_iter().map(|i| i.instance_id).collect();
        if ids.is_empty() {
            tracing::warn!("⚠️ [driver] no machine with private address {}", address);
            return Ok(false);
        }

        let action = ActionLog::start("TERMINATE_MACHINE", address, Some(json!({ "instance_ids": ids })));
        let result = self.terminate_and_wait(&ids, deadline).await;
        match &result {
            Ok(()) => action.success(None),
            Err(e) => action.failure(e),
        }
        result.map(|()| true)
    }

    async fn terminate_and_wait(&self, ids: &[String], deadline: Instant) -> Result<(), ProvisioningError> {
        self.provider
            .terminate_instances(ids)
            .await
            .map_err(|e| ProvisioningError::remote("terminate_instances", e))?;
        for id in ids {
            self.poller.await_stopped(id, deadline).await?;
        }
        Ok(())
    }

    /// Start the whole management group; machines are named `<group>1..=<group>n`.
    pub async fn provision_management_fleet(
        &self,
        deadline: Instant,
    ) -> Result<Vec<MachineDescriptor>, ProvisioningError> {
        self.ensure_open()?;
        let group = self.fleet.management_group().to_string();
        let location = self.template.instance.availability_zone.clone();

        self.fleet
            .provision_fleet(
                self.settings.management_machines,
                |index| {
                    let task = ProvisioningTask::new(
                        format!("{}{}", group, index + 1),
                        self.template.clone(),
                        MachineRole::Management,
                        deadline,
                    );
                    (task, self.remote_context(location.clone()))
                },
                deadline,
            )
            .await
    }

    pub async fn terminate_management_fleet(&self) -> Result<Vec<String>, ProvisioningError> {
        self.ensure_open()?;
        self.fleet.terminate_fleet().await
    }

    pub async fn list_management_fleet(&self) -> Result<Vec<MachineDescriptor>, ProvisioningError> {
        self.ensure_open()?;
        self.fleet.list_fleet().await
    }

    /// Release the provider; every later call fails with `DriverClosed`.
    pub async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("🛑 [driver] shutting down provider");
            self.provider.shutdown().await;
        }
    }
}
