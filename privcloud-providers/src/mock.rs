use crate::{
    inventory, CloudProvider, InstanceFilter, LaunchRequest, ObjectStore, ProviderError,
    StoredObject, TagFilter,
};
use anyhow::Result;
use async_trait::async_trait;
use privcloud_common::{tag_pattern, LifecycleState, ResourceKind, Tag, TAG_NAME};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_ZONE: &str = "mock-zone-1";

/// Every call the mock received, for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub run_instances: Vec<LaunchRequest>,
    /// Ids returned by successful `run_instances` calls.
    pub launched: Vec<String>,
    pub describe_instances: usize,
    pub describe_volumes: usize,
    pub describe_tags: usize,
    pub create_tags: Vec<(String, Vec<Tag>)>,
    pub terminate_instances: Vec<Vec<String>>,
    pub shutdown: bool,
}

impl MockCalls {
    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminate_instances.iter().flatten().cloned().collect()
    }

    pub fn tags_for(&self, resource_id: &str) -> Vec<&Vec<Tag>> {
        self.create_tags
            .iter()
            .filter(|(id, _)| id == resource_id)
            .map(|(_, tags)| tags)
            .collect()
    }
}

struct MockInstance {
    current: LifecycleState,
    // States reported by the next describes; the last one sticks.
    script: VecDeque<LifecycleState>,
    not_found_left: u32,
    private_ip: String,
    public_ip: Option<String>,
    zone: String,
    tags: Vec<Tag>,
}

impl MockInstance {
    fn advance(&mut self) {
        if let Some(next) = self.script.pop_front() {
            self.current = next;
        }
    }

    fn name(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == TAG_NAME)
            .map(|t| t.value.as_str())
    }
}

enum ListingFailure {
    Error(String),
    NotFound,
}

struct MockState {
    instances: BTreeMap<String, MockInstance>,
    volumes: Vec<inventory::AttachedVolume>,
    tags: Vec<inventory::TagDescription>,
    launches: usize,
    next_id: u32,
    default_script: Vec<LifecycleState>,
    scripts_by_launch: HashMap<usize, Vec<LifecycleState>>,
    failing_launches: HashSet<usize>,
    launch_delays: HashMap<usize, Duration>,
    not_found_describes: u32,
    all_names_taken: bool,
    fail_terminate: bool,
    fail_create_tags: bool,
    listing_failure: Option<ListingFailure>,
    address_override: Option<String>,
    calls: MockCalls,
}

/// In-memory compute provider.
///
/// Instances move through a scripted state sequence (default `pending, running`),
/// one step per describe by id. Failures, delays and pre-existing resources are
/// configured with the `with_*` / `seed_*` methods.
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                instances: BTreeMap::new(),
                volumes: Vec::new(),
                tags: Vec::new(),
                launches: 0,
                next_id: 0,
                default_script: vec![LifecycleState::Pending, LifecycleState::Running],
                scripts_by_launch: HashMap::new(),
                failing_launches: HashSet::new(),
                launch_delays: HashMap::new(),
                not_found_describes: 0,
                all_names_taken: false,
                fail_terminate: false,
                fail_create_tags: false,
                listing_failure: None,
                address_override: None,
                calls: MockCalls::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// States reported by successive describes of every new instance.
    pub fn with_state_sequence(self, states: Vec<LifecycleState>) -> Self {
        self.lock().default_script = states;
        self
    }

    /// Override the state sequence of the instance created by the `launch`-th call (0-based).
    pub fn with_state_sequence_for(self, launch: usize, states: Vec<LifecycleState>) -> Self {
        self.lock().scripts_by_launch.insert(launch, states);
        self
    }

    /// Make the `launch`-th `run_instances` call fail.
    pub fn with_failing_launch(self, launch: usize) -> Self {
        self.lock().failing_launches.insert(launch);
        self
    }

    /// Delay the `launch`-th `run_instances` call.
    pub fn with_launch_delay(self, launch: usize, delay: Duration) -> Self {
        self.lock().launch_delays.insert(launch, delay);
        self
    }

    /// The first `count` describes of each new instance answer "not found".
    pub fn with_not_found_describes(self, count: u32) -> Self {
        self.lock().not_found_describes = count;
        self
    }

    /// Every tag lookup reports a match.
    pub fn with_all_names_taken(self) -> Self {
        self.lock().all_names_taken = true;
        self
    }

    pub fn with_failing_terminate(self) -> Self {
        self.lock().fail_terminate = true;
        self
    }

    pub fn with_failing_create_tags(self) -> Self {
        self.lock().fail_create_tags = true;
        self
    }

    /// Make `describe_instances` fail with `error` whenever no id filter is set.
    pub fn with_failing_listing(self, error: &str) -> Self {
        self.lock().listing_failure = Some(ListingFailure::Error(error.to_string()));
        self
    }

    /// Make `describe_instances` answer "not found" whenever no id filter is set.
    pub fn with_listing_not_found(self) -> Self {
        self.lock().listing_failure = Some(ListingFailure::NotFound);
        self
    }

    /// Report `address` as both private and public address of new instances.
    pub fn with_address(self, address: &str) -> Self {
        self.lock().address_override = Some(address.to_string());
        self
    }

    /// Register an existing instance carrying a `Name` tag; returns its id.
    pub fn seed_instance(&self, name: &str, state: LifecycleState, private_ip: &str) -> String {
        let mut st = self.lock();
        st.next_id += 1;
        let id = format!("i-{:08x}", st.next_id);
        st.instances.insert(
            id.clone(),
            MockInstance {
                current: state,
                script: VecDeque::new(),
                not_found_left: 0,
                private_ip: private_ip.to_string(),
                public_ip: None,
                zone: DEFAULT_ZONE.to_string(),
                tags: vec![Tag::name(name)],
            },
        );
        st.tags.push(inventory::TagDescription {
            resource_id: id.clone(),
            resource_type: ResourceKind::Instance,
            key: TAG_NAME.to_string(),
            value: name.to_string(),
        });
        id
    }

    /// Mark a name as used by some resource of `kind`.
    pub fn seed_tag(&self, kind: ResourceKind, value: &str) {
        let mut st = self.lock();
        let resource_id = format!("seed-{}", st.tags.len());
        st.tags.push(inventory::TagDescription {
            resource_id,
            resource_type: kind,
            key: TAG_NAME.to_string(),
            value: value.to_string(),
        });
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    pub fn state_of(&self, instance_id: &str) -> Option<LifecycleState> {
        self.lock().instances.get(instance_id).map(|i| i.current)
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn run_instances(&self, request: &LaunchRequest) -> Result<Vec<String>> {
        let (launch, delay) = {
            let mut st = self.lock();
            let launch = st.launches;
            st.launches += 1;
            st.calls.run_instances.push(request.clone());
            (launch, st.launch_delays.get(&launch).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut st = self.lock();
        if st.failing_launches.contains(&launch) {
            return Err(anyhow::anyhow!(
                "InsufficientInstanceCapacity: no {} capacity (launch {})",
                request.instance_type,
                launch
            ));
        }

        let script = st
            .scripts_by_launch
            .get(&launch)
            .cloned()
            .unwrap_or_else(|| st.default_script.clone());
        let count = request.max_count.max(1);
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            st.next_id += 1;
            let n = st.next_id;
            let id = format!("i-{:08x}", n);
            let (private_ip, public_ip) = match &st.address_override {
                Some(addr) => (addr.clone(), Some(addr.clone())),
                None => (
                    request
                        .private_ip_address
                        .clone()
                        .unwrap_or_else(|| format!("10.0.{}.{}", n / 250, n % 250 + 1)),
                    Some(format!("203.0.113.{}", n % 250 + 1)),
                ),
            };
            let not_found_left = st.not_found_describes;
            st.instances.insert(
                id.clone(),
                MockInstance {
                    current: LifecycleState::Pending,
                    script: script.iter().copied().collect(),
                    not_found_left,
                    private_ip,
                    public_ip,
                    zone: request
                        .availability_zone
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ZONE.to_string()),
                    tags: Vec::new(),
                },
            );
            for (i, bdm) in request.block_devices.iter().enumerate() {
                st.volumes.push(inventory::AttachedVolume {
                    volume_id: format!("vol-{:08x}{:02}", n, i),
                    instance_id: id.clone(),
                    device: bdm.device_name.clone(),
                    size_gb: bdm.size_gb,
                });
            }
            ids.push(id);
        }
        st.calls.launched.extend(ids.iter().cloned());
        tracing::debug!("[mock] run_instances launch={} ids={:?}", launch, ids);
        Ok(ids)
    }

    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<inventory::DiscoveredInstance>> {
        let mut st = self.lock();
        st.calls.describe_instances += 1;

        if filter.instance_ids.is_empty() {
            match &st.listing_failure {
                Some(ListingFailure::Error(err)) => return Err(anyhow::anyhow!(err.clone())),
                Some(ListingFailure::NotFound) => {
                    return Err(ProviderError::NotFound("instances".to_string()).into())
                }
                None => {}
            }
        }

        for id in &filter.instance_ids {
            let Some(instance) = st.instances.get_mut(id) else {
                return Err(ProviderError::NotFound(id.clone()).into());
            };
            if instance.not_found_left > 0 {
                instance.not_found_left -= 1;
                return Err(ProviderError::NotFound(id.clone()).into());
            }
            instance.advance();
        }

        Ok(st
            .instances
            .iter()
            .filter(|(id, _)| filter.instance_ids.is_empty() || filter.instance_ids.contains(id))
            .filter(|(_, i)| filter.state.map_or(true, |s| i.current == s))
            .filter(|(_, i)| {
                filter
                    .private_ip_address
                    .as_deref()
                    .map_or(true, |ip| i.private_ip == ip)
            })
            .filter(|(_, i)| {
                filter.name_pattern.as_deref().map_or(true, |pattern| {
                    i.name()
                        .map_or(false, |name| tag_pattern::value_matches(name, pattern))
                })
            })
            .map(|(id, i)| inventory::DiscoveredInstance {
                instance_id: id.clone(),
                state: i.current,
                private_ip_address: Some(i.private_ip.clone()),
                public_ip_address: i.public_ip.clone(),
                availability_zone: Some(i.zone.clone()),
                tags: i.tags.clone(),
            })
            .collect())
    }

    async fn describe_volumes(&self, instance_id: &str) -> Result<Vec<inventory::AttachedVolume>> {
        let mut st = self.lock();
        st.calls.describe_volumes += 1;
        Ok(st
            .volumes
            .iter()
            .filter(|v| v.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()> {
        let mut st = self.lock();
        st.calls.create_tags.push((resource_id.to_string(), tags.to_vec()));
        if st.fail_create_tags {
            return Err(anyhow::anyhow!("RequestLimitExceeded: create_tags throttled"));
        }

        let kind = if let Some(instance) = st.instances.get_mut(resource_id) {
            for tag in tags {
                instance.tags.retain(|t| t.key != tag.key);
                instance.tags.push(tag.clone());
            }
            ResourceKind::Instance
        } else if st.volumes.iter().any(|v| v.volume_id == resource_id) {
            ResourceKind::Volume
        } else {
            return Err(ProviderError::NotFound(resource_id.to_string()).into());
        };

        for tag in tags {
            st.tags
                .retain(|t| !(t.resource_id == resource_id && t.key == tag.key));
            st.tags.push(inventory::TagDescription {
                resource_id: resource_id.to_string(),
                resource_type: kind,
                key: tag.key.clone(),
                value: tag.value.clone(),
            });
        }
        Ok(())
    }

    async fn describe_tags(&self, filter: &TagFilter) -> Result<Vec<inventory::TagDescription>> {
        let mut st = self.lock();
        st.calls.describe_tags += 1;
        if st.all_names_taken {
            return Ok(vec![inventory::TagDescription {
                resource_id: "taken".to_string(),
                resource_type: filter.resource_type.unwrap_or(ResourceKind::Instance),
                key: TAG_NAME.to_string(),
                value: filter.value.clone().unwrap_or_default(),
            }]);
        }
        Ok(st
            .tags
            .iter()
            .filter(|t| filter.resource_type.map_or(true, |k| t.resource_type == k))
            .filter(|t| filter.key.as_deref().map_or(true, |k| t.key == k))
            .filter(|t| filter.value.as_deref().map_or(true, |v| t.value == v))
            .cloned()
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<String>> {
        let mut st = self.lock();
        st.calls.terminate_instances.push(instance_ids.to_vec());
        if st.fail_terminate {
            return Err(anyhow::anyhow!("UnauthorizedOperation: terminate_instances denied"));
        }
        let mut terminating = Vec::new();
        for id in instance_ids {
            if let Some(instance) = st.instances.get_mut(id) {
                instance.current = LifecycleState::ShuttingDown;
                instance.script = VecDeque::from(vec![LifecycleState::Terminated]);
                terminating.push(id.clone());
            }
        }
        Ok(terminating)
    }

    async fn shutdown(&self) {
        self.lock().calls.shutdown = true;
    }
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, String), Vec<u8>>,
    // Every upload with its bytes, kept after deletion.
    history: Vec<(StoredObject, Vec<u8>)>,
    presigns: usize,
    deleted: Vec<StoredObject>,
    fail_upload: bool,
    fail_presign: bool,
    delete_delay: Option<Duration>,
}

/// In-memory object store keeping uploaded bytes for inspection.
#[derive(Default)]
pub struct MockObjectStore {
    state: Mutex<StoreState>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_failing_upload(self) -> Self {
        self.lock().fail_upload = true;
        self
    }

    pub fn with_failing_presign(self) -> Self {
        self.lock().fail_presign = true;
        self
    }

    /// Every delete stalls for `delay` before it takes effect.
    pub fn with_delete_delay(self, delay: Duration) -> Self {
        self.lock().delete_delay = Some(delay);
        self
    }

    pub fn upload_count(&self) -> usize {
        self.lock().history.len()
    }

    pub fn presign_count(&self) -> usize {
        self.lock().presigns
    }

    pub fn delete_count(&self) -> usize {
        self.lock().deleted.len()
    }

    pub fn deleted(&self) -> Vec<StoredObject> {
        self.lock().deleted.clone()
    }

    /// Objects uploaded and not deleted yet.
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Bytes of the most recent upload, kept even after deletion.
    pub fn last_upload(&self) -> Option<(StoredObject, Vec<u8>)> {
        self.lock().history.last().cloned()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn upload(&self, bucket: &str, path: &Path) -> Result<StoredObject> {
        if self.lock().fail_upload {
            return Err(anyhow::anyhow!("NoSuchBucket: {}", bucket));
        }
        let bytes = tokio::fs::read(path).await?;
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("upload path has no file name: {}", path.display()))?;
        let object = StoredObject {
            bucket: bucket.to_string(),
            key,
        };
        let mut st = self.lock();
        st.objects
            .insert((object.bucket.clone(), object.key.clone()), bytes.clone());
        st.history.push((object.clone(), bytes));
        Ok(object)
    }

    async fn presign(&self, object: &StoredObject, ttl: Duration) -> Result<String> {
        let mut st = self.lock();
        st.presigns += 1;
        if st.fail_presign {
            return Err(anyhow::anyhow!("AccessDenied: cannot sign {}", object.key));
        }
        Ok(format!(
            "https://{}.mock-storage.local/{}?expires={}&signature={}",
            object.bucket,
            object.key,
            ttl.as_secs(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    async fn delete(&self, object: &StoredObject) -> Result<()> {
        let delay = self.lock().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.lock();
        st.objects
            .remove(&(object.bucket.clone(), object.key.clone()));
        st.deleted.push(object.clone());
        Ok(())
    }
}
