use anyhow::Result;
use async_trait::async_trait;
use privcloud_common::{LifecycleState, ResourceKind, Tag};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Typed provider errors the orchestrator needs to tell apart.
/// Everything else is returned as a plain `anyhow::Error` and treated as fatal.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider does not (yet) know the resource, e.g. right after creation.
    #[error("{0} not found")]
    NotFound(String),
}

/// True if any error in the chain is a `ProviderError::NotFound`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<ProviderError>(), Some(ProviderError::NotFound(_))))
}

/// Compute API collaborator: instance, volume and tag CRUD.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the ids of the instances the provider accepted.
    async fn run_instances(&self, request: &LaunchRequest) -> Result<Vec<String>>;

    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<inventory::DiscoveredInstance>>;

    // Volumes currently attached to a server (attachment.instance-id filter).
    async fn describe_volumes(&self, instance_id: &str) -> Result<Vec<inventory::AttachedVolume>>;

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()>;

    async fn describe_tags(&self, filter: &TagFilter) -> Result<Vec<inventory::TagDescription>>;

    /// Returns the ids the provider started terminating.
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<String>>;

    // Optional: release HTTP clients / credentials held by the provider.
    // Default is a no-op.
    async fn shutdown(&self) {}
}

/// Object-storage collaborator used for the bootstrap archive hand-off.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file; the object key is the file name.
    async fn upload(&self, bucket: &str, path: &Path) -> Result<StoredObject>;

    /// Time-limited fetch URL for an uploaded object.
    async fn presign(&self, object: &StoredObject, ttl: Duration) -> Result<String>;

    async fn delete(&self, object: &StoredObject) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub size_gb: Option<u32>,
    pub iops: Option<u32>,
    pub snapshot_id: Option<String>,
    pub volume_type: Option<String>,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: Option<String>,
    pub key_name: Option<String>,
    pub private_ip_address: Option<String>,
    pub security_group_ids: Vec<String>,
    pub security_groups: Vec<String>,
    pub block_devices: Vec<BlockDeviceMapping>,
    /// Base64-encoded startup data.
    pub user_data: Option<String>,
    pub min_count: u32,
    pub max_count: u32,
}

/// Conjunction of instance filters; unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub instance_ids: Vec<String>,
    pub private_ip_address: Option<String>,
    pub state: Option<LifecycleState>,
    /// Pattern on the `Name` tag, `*` wildcard allowed.
    pub name_pattern: Option<String>,
}

impl InstanceFilter {
    pub fn by_id(instance_id: &str) -> Self {
        Self {
            instance_ids: vec![instance_id.to_string()],
            ..Default::default()
        }
    }

    pub fn by_private_ip(address: &str) -> Self {
        Self {
            private_ip_address: Some(address.to_string()),
            ..Default::default()
        }
    }

    pub fn running_named(pattern: &str) -> Self {
        Self {
            state: Some(LifecycleState::Running),
            name_pattern: Some(pattern.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub resource_type: Option<ResourceKind>,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl TagFilter {
    /// Every tag of `kind` resources whose value is exactly `value`.
    pub fn value_of_kind(kind: ResourceKind, value: &str) -> Self {
        Self {
            resource_type: Some(kind),
            key: None,
            value: Some(value.to_string()),
        }
    }
}

pub mod inventory {
    use privcloud_common::{LifecycleState, ResourceKind, Tag, TAG_NAME};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DiscoveredInstance {
        pub instance_id: String,
        pub state: LifecycleState,
        pub private_ip_address: Option<String>,
        pub public_ip_address: Option<String>,
        pub availability_zone: Option<String>,
        pub tags: Vec<Tag>,
    }

    impl DiscoveredInstance {
        pub fn name(&self) -> Option<&str> {
            self.tags
                .iter()
                .find(|t| t.key == TAG_NAME)
                .map(|t| t.value.as_str())
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AttachedVolume {
        pub volume_id: String,
        pub instance_id: String,
        pub device: String,
        pub size_gb: Option<u32>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TagDescription {
        pub resource_id: String,
        pub resource_type: ResourceKind,
        pub key: String,
        pub value: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
