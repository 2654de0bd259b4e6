// Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use privcloud_common::{ResourceTemplate, Tag, TemplateSet, VolumeSpec};
use privcloud_orchestrator::agent_probe::AgentProbe;
use privcloud_orchestrator::clock::{Clock, TokioClock};
use privcloud_orchestrator::{DriverSettings, ProvisioningDriver};
use privcloud_providers::mock::{MockObjectStore, MockProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const GROUP: &str = "privcloud-mgmt";

/// Tokio clock that counts sleeps.
#[derive(Default)]
pub struct CountingClock {
    sleeps: AtomicUsize,
}

impl CountingClock {
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Clock for CountingClock {
    fn now(&self) -> Instant {
        TokioClock.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        TokioClock.sleep(duration).await;
    }
}

/// Probe answering a fixed value and remembering the hosts it was asked about.
pub struct StaticProbe {
    reachable: bool,
    hosts: std::sync::Mutex<Vec<String>>,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable,
            hosts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProbe for StaticProbe {
    async fn probe(&self, host: &str, _deadline: Instant) -> bool {
        self.hosts.lock().unwrap().push(host.to_string());
        self.reachable
    }
}

/// `ami-123` / `m1.small` with one data volume on `/dev/sdb`.
pub fn sample_template() -> TemplateSet {
    let mut instance = ResourceTemplate::new("ami-123", "m1.small");
    instance.availability_zone = Some("us-east-1a".to_string());
    instance.tags = vec![Tag::new("team", "infra")];
    instance.user_data = Some("echo provisioned\n".to_string());
    TemplateSet::new(instance).with_volume(
        "/dev/sdb",
        "data",
        VolumeSpec {
            size_gb: Some(20),
            volume_type: Some("gp2".to_string()),
            tags: vec![Tag::new("tier", "data")],
            ..Default::default()
        },
    )
}

pub fn settings() -> DriverSettings {
    let mut settings = DriverSettings::new(GROUP);
    settings.management_machines = 3;
    settings.poll_interval = Duration::from_millis(10);
    settings
}

pub struct Harness {
    pub provider: Arc<MockProvider>,
    pub store: Arc<MockObjectStore>,
    pub clock: Arc<CountingClock>,
    pub probe: Arc<StaticProbe>,
    pub driver: ProvisioningDriver,
}

pub fn harness(provider: MockProvider) -> Harness {
    harness_with(provider, MockObjectStore::new(), settings())
}

pub fn harness_with(provider: MockProvider, store: MockObjectStore, settings: DriverSettings) -> Harness {
    let provider = Arc::new(provider);
    let store = Arc::new(store);
    let clock = Arc::new(CountingClock::default());
    let probe = Arc::new(StaticProbe::new(true));
    let driver = ProvisioningDriver::builder(
        provider.clone(),
        store.clone(),
        Arc::new(sample_template()),
        settings,
    )
    .with_clock(clock.clone())
    .with_probe(probe.clone())
    .build()
    .expect("driver should build");
    Harness {
        provider,
        store,
        clock,
        probe,
        driver,
    }
}

pub fn in_secs(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

/// Provisioner wired the way the driver wires it, for stage-level assertions.
pub fn provisioner(
    provider: Arc<MockProvider>,
    store: Arc<MockObjectStore>,
    clock: Arc<CountingClock>,
) -> privcloud_orchestrator::provisioner::InstanceProvisioner {
    use privcloud_orchestrator::bootstrap::BootstrapPackager;
    use privcloud_orchestrator::names::{NameAllocator, NameCounters};
    use privcloud_orchestrator::poller::LifecyclePoller;
    use privcloud_orchestrator::provisioner::InstanceProvisioner;

    let settings = settings();
    InstanceProvisioner::new(
        provider.clone(),
        LifecyclePoller::new(provider.clone(), clock, settings.poll_interval),
        NameAllocator::new(provider.clone(), Arc::new(NameCounters::new())),
        Arc::new(BootstrapPackager::new(store, settings.bootstrap_config())),
        Arc::new(StaticProbe::new(true)),
        settings.volume_prefix,
    )
}

pub fn worker_task(name: &str, deadline: Instant) -> privcloud_common::ProvisioningTask {
    privcloud_common::ProvisioningTask::new(
        name,
        Arc::new(sample_template()),
        privcloud_common::MachineRole::Worker,
        deadline,
    )
}
