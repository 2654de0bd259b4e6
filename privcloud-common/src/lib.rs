use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

pub mod error;
pub mod tag_pattern;
pub mod template;

pub use error::ProvisioningError;
pub use template::{ResourceTemplate, TemplateError, TemplateSet, VolumeAttachment, VolumeSpec};

/// Tag key carrying a resource's human-readable name.
pub const TAG_NAME: &str = "Name";

// --- Enums ---

/// Observed status of a remote instance. Never cached: every poll re-fetches it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Pending,
    Running,
    Stopping,
    ShuttingDown,
    Stopped,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Terminated => "terminated",
        }
    }

    /// Parse a provider state name (case-insensitive, `_` and `-` are equivalent).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pending" => Some(LifecycleState::Pending),
            "running" => Some(LifecycleState::Running),
            "stopping" => Some(LifecycleState::Stopping),
            "shutting-down" => Some(LifecycleState::ShuttingDown),
            "stopped" => Some(LifecycleState::Stopped),
            "terminated" => Some(LifecycleState::Terminated),
            _ => None,
        }
    }

    /// EC2-style numeric state code. The high byte is reserved for internal use by
    /// the provider and must be ignored.
    pub fn from_code(code: u16) -> Option<Self> {
        match code & 0xff {
            0 => Some(LifecycleState::Pending),
            16 => Some(LifecycleState::Running),
            32 => Some(LifecycleState::ShuttingDown),
            48 => Some(LifecycleState::Terminated),
            64 => Some(LifecycleState::Stopping),
            80 => Some(LifecycleState::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource families sharing a name space in the tag index.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instance,
    Volume,
}

impl ResourceKind {
    /// Value of the `resource-type` tag filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    Management,
    Worker,
}

impl MachineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineRole::Management => "management",
            MachineRole::Worker => "worker",
        }
    }

    pub fn is_management(&self) -> bool {
        matches!(self, MachineRole::Management)
    }
}

/// Where a single provisioning run stopped.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    Packaging,
    Creating,
    AwaitingRunning,
    Tagging,
    TaggingVolumes,
    /// The run was still in flight when the fleet deadline passed.
    Cancelled,
}

impl ProvisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStage::Packaging => "packaging",
            ProvisionStage::Creating => "creating",
            ProvisionStage::AwaitingRunning => "awaiting_running",
            ProvisionStage::Tagging => "tagging",
            ProvisionStage::TaggingVolumes => "tagging_volumes",
            ProvisionStage::Cancelled => "cancelled",
        }
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn name(value: impl Into<String>) -> Self {
        Self::new(TAG_NAME, value)
    }
}

/// One unit of provisioning work. Immutable once built; the deadline is shared by
/// every wait performed on its behalf.
#[derive(Debug, Clone)]
pub struct ProvisioningTask {
    pub desired_name: String,
    pub template: Arc<TemplateSet>,
    pub role: MachineRole,
    pub deadline: Instant,
}

impl ProvisioningTask {
    pub fn new(
        desired_name: impl Into<String>,
        template: Arc<TemplateSet>,
        role: MachineRole,
        deadline: Instant,
    ) -> Self {
        Self {
            desired_name: desired_name.into(),
            template,
            role,
            deadline,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MachineDescriptor {
    pub instance_id: String,
    pub private_address: Option<String>,
    pub public_address: Option<String>,
    pub agent_reachable: bool,
    pub location_id: Option<String>,
}

impl MachineDescriptor {
    /// `Machine ID: i-1, Public IP: 1.2.3.4, Private IP: 10.0.0.1` (absent addresses omitted).
    pub fn describe(&self) -> String {
        let mut out = format!("Machine ID: {}", self.instance_id);
        if let Some(public) = &self.public_address {
            out.push_str(&format!(", Public IP: {}", public));
        }
        if let Some(private) = &self.private_address {
            out.push_str(&format!(", Private IP: {}", private));
        }
        out
    }
}

/// Failure of one provisioning run, with the stage it reached.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub stage: ProvisionStage,
    /// Set once the create call returned an id; the instance is then left to the caller.
    pub instance_id: Option<String>,
    pub cause: ProvisioningError,
}

impl ProvisionFailure {
    pub fn new(stage: ProvisionStage, instance_id: Option<String>, cause: ProvisioningError) -> Self {
        Self {
            stage,
            instance_id,
            cause,
        }
    }

    pub fn into_record(self, task_index: usize) -> FailureRecord {
        FailureRecord {
            task_index,
            stage: self.stage,
            instance_id: self.instance_id,
            cause: self.cause,
        }
    }
}

impl fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage.as_str(), self.cause)
    }
}

impl From<ProvisionFailure> for ProvisioningError {
    fn from(failure: ProvisionFailure) -> Self {
        failure.cause
    }
}

#[derive(Debug)]
pub struct FailureRecord {
    pub task_index: usize,
    pub stage: ProvisionStage,
    pub instance_id: Option<String>,
    pub cause: ProvisioningError,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Provisioned(MachineDescriptor),
    Failed(FailureRecord),
}

/// Per-task outcomes of a coordinated run, in task-index order.
#[derive(Debug, Default)]
pub struct FleetResult {
    pub outcomes: Vec<TaskOutcome>,
}

impl FleetResult {
    pub fn total_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::Failed(_)))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.failure_count() == 0
    }

    /// Split into descriptors and failures, both still ordered by task index.
    pub fn partition(self) -> (Vec<MachineDescriptor>, Vec<FailureRecord>) {
        let mut provisioned = Vec::new();
        let mut failed = Vec::new();
        for outcome in self.outcomes {
            match outcome {
                TaskOutcome::Provisioned(md) => provisioned.push(md),
                TaskOutcome::Failed(record) => failed.push(record),
            }
        }
        (provisioned, failed)
    }
}
