use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

/// Action log for provisioning milestones.
///
/// Every action gets an id at start; completion events carry the same id so a
/// collector can pair them. Events go to the `privcloud::action` tracing target.
pub fn log_event(
    action_type: &str,
    status: &str,
    subject: &str,
    error_message: Option<&str>,
) -> Uuid {
    log_event_with_metadata(action_type, status, subject, error_message, None)
}

/// Log event with metadata (context info)
pub fn log_event_with_metadata(
    action_type: &str,
    status: &str,
    subject: &str,
    error_message: Option<&str>,
    metadata: Option<Value>,
) -> Uuid {
    let log_id = Uuid::new_v4();
    let metadata = metadata.map(|m| m.to_string()).unwrap_or_default();
    match error_message {
        Some(err) => tracing::warn!(
            target: "privcloud::action",
            %log_id, action_type, status, subject, error = err, %metadata,
            "📝 [orchestrator] {} - {}", action_type, status
        ),
        None => tracing::info!(
            target: "privcloud::action",
            %log_id, action_type, status, subject, %metadata,
            "📝 [orchestrator] {} - {}", action_type, status
        ),
    }
    log_id
}

/// Log event completion with metadata
pub fn log_event_complete_with_metadata(
    log_id: Uuid,
    action_type: &str,
    status: &str,
    duration_ms: u64,
    error_message: Option<&str>,
    metadata: Option<Value>,
) {
    let metadata = metadata.map(|m| m.to_string()).unwrap_or_default();
    match error_message {
        Some(err) => tracing::error!(
            target: "privcloud::action",
            %log_id, action_type, status, duration_ms, error = err, %metadata,
            "❌ [orchestrator] {} {} after {}ms: {}", action_type, status, duration_ms, err
        ),
        None => tracing::info!(
            target: "privcloud::action",
            %log_id, action_type, status, duration_ms, %metadata,
            "✅ [orchestrator] {} {} in {}ms", action_type, status, duration_ms
        ),
    }
}

/// An action in progress; completes exactly once.
pub struct ActionLog {
    log_id: Uuid,
    action_type: &'static str,
    started: Instant,
}

impl ActionLog {
    pub fn start(action_type: &'static str, subject: &str, metadata: Option<Value>) -> Self {
        let log_id = log_event_with_metadata(action_type, "in_progress", subject, None, metadata);
        Self {
            log_id,
            action_type,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.log_id
    }

    pub fn success(self, metadata: Option<Value>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        log_event_complete_with_metadata(
            self.log_id,
            self.action_type,
            "success",
            duration_ms,
            None,
            metadata,
        );
    }

    pub fn failure(self, error: &privcloud_common::ProvisioningError) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        log_event_complete_with_metadata(
            self.log_id,
            self.action_type,
            "failed",
            duration_ms,
            Some(&error.to_string()),
            Some(serde_json::json!({ "error_code": error.code() })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_gets_its_own_id() {
        let a = log_event("PROVISION_FLEET", "in_progress", "mgmt", None);
        let b = log_event("PROVISION_FLEET", "in_progress", "mgmt", None);
        assert_ne!(a, b);
    }

    #[test]
    fn action_keeps_its_id_until_completion() {
        let action = ActionLog::start("TERMINATE_MACHINE", "10.0.0.4", None);
        let id = action.id();
        assert!(!id.is_nil());
        action.failure(&privcloud_common::ProvisioningError::InvalidDuration);
    }
}
