use crate::agent_probe::AgentProbe;
use crate::bootstrap::{BootstrapPackager, RemoteContext};
use crate::logger::ActionLog;
use crate::names::NameAllocator;
use crate::poller::LifecyclePoller;
use privcloud_common::{
    MachineDescriptor, ProvisionFailure, ProvisionStage, ProvisioningError, ProvisioningTask,
    ResourceKind, Tag, TemplateSet, TAG_NAME,
};
use privcloud_providers::{BlockDeviceMapping, CloudProvider, LaunchRequest};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Minimum time left on the task deadline once the agent probe gives up.
pub const PROBE_RESERVE: Duration = Duration::from_millis(200);

/// Drives one machine from template to tagged, running instance.
///
/// Never cleans up after itself: a failure past `Creating` carries the instance
/// id and the caller decides what to do with it.
#[derive(Clone)]
pub struct InstanceProvisioner {
    provider: Arc<dyn CloudProvider>,
    poller: LifecyclePoller,
    names: NameAllocator,
    packager: Arc<BootstrapPackager>,
    probe: Arc<dyn AgentProbe>,
    volume_prefix: String,
}

impl InstanceProvisioner {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        poller: LifecyclePoller,
        names: NameAllocator,
        packager: Arc<BootstrapPackager>,
        probe: Arc<dyn AgentProbe>,
        volume_prefix: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            poller,
            names,
            packager,
            probe,
            volume_prefix: volume_prefix.into(),
        }
    }

    /// Provision one machine. Every id returned by the create call is sent on
    /// `created` before anything else can fail.
    pub async fn provision(
        &self,
        task: &ProvisioningTask,
        ctx: &RemoteContext,
        created: Option<&UnboundedSender<String>>,
    ) -> Result<MachineDescriptor, ProvisionFailure> {
        let action = ActionLog::start(
            "PROVISION_MACHINE",
            &task.desired_name,
            Some(json!({ "role": task.role.as_str(), "location_id": ctx.location_id })),
        );
        let result = self.run(task, ctx, created).await;
        match &result {
            Ok(md) => action.success(Some(json!({
                "instance_id": md.instance_id,
                "agent_reachable": md.agent_reachable,
            }))),
            Err(failure) => action.failure(&failure.cause),
        }
        result
    }

    async fn run(
        &self,
        task: &ProvisioningTask,
        ctx: &RemoteContext,
        created: Option<&UnboundedSender<String>>,
    ) -> Result<MachineDescriptor, ProvisionFailure> {
        let template = task.template.as_ref();

        let request = launch_request(template)
            .map_err(|reason| ProvisioningError::Configuration { reason })
            .map_err(failed(ProvisionStage::Packaging, None))?;

        // 1. Bootstrap payload
        let package = self
            .packager
            .package(task, ctx)
            .await
            .map_err(failed(ProvisionStage::Packaging, None))?;
        let request = LaunchRequest {
            user_data: Some(package.user_data.clone()),
            ..request
        };

        // 2. Create; the archive is no longer needed whatever the outcome.
        tracing::info!(
            "🔵 [provision] creating {} ({} / {})",
            task.desired_name,
            request.image_id,
            request.instance_type
        );
        let created_ids = self.provider.run_instances(&request).await;
        // Hand the ids off before the next await so a cancelled run still gets rolled back.
        if let (Ok(ids), Some(tx)) = (&created_ids, created) {
            for id in ids {
                let _ = tx.send(id.clone());
            }
        }
        package.handoff.release().await;
        let ids = created_ids
            .map_err(|e| ProvisioningError::remote("run_instances", e))
            .map_err(failed(ProvisionStage::Creating, None))?;

        let instance_id = match ids.as_slice() {
            [id] => id.clone(),
            _ => {
                return Err(ProvisionFailure::new(
                    ProvisionStage::Creating,
                    ids.first().cloned(),
                    ProvisioningError::UnexpectedResponse {
                        call: "run_instances",
                        detail: format!("expected exactly 1 instance, got {}", ids.len()),
                    },
                ))
            }
        };
        let id = Some(instance_id.as_str());

        // 3. Running
        let observed = self
            .poller
            .await_running_after_create(&instance_id, task.deadline)
            .await
            .map_err(failed(ProvisionStage::AwaitingRunning, id))?;
        tracing::info!("✅ [provision] {} is running as {}", task.desired_name, instance_id);

        // 4. Tags
        self.provider
            .create_tags(&instance_id, &instance_tags(template, &task.desired_name))
            .await
            .map_err(|e| ProvisioningError::remote("create_tags", e))
            .map_err(failed(ProvisionStage::Tagging, id))?;

        self.tag_volumes(&instance_id, template)
            .await
            .map_err(failed(ProvisionStage::TaggingVolumes, id))?;

        // 5. Agent
        let host = observed
            .public_ip_address
            .as_deref()
            .or(observed.private_ip_address.as_deref());
        let agent_reachable = match host {
            Some(host) => self.probe.probe(host, self.probe_deadline(task.deadline)).await,
            None => {
                tracing::warn!("⚠️ [provision] {} reports no address to probe", instance_id);
                false
            }
        };

        Ok(MachineDescriptor {
            instance_id,
            private_address: observed.private_ip_address,
            public_address: observed.public_ip_address,
            agent_reachable,
            location_id: observed.availability_zone,
        })
    }

    /// The probe stops early enough for the run to report its result before
    /// the task deadline.
    fn probe_deadline(&self, deadline: Instant) -> Instant {
        let reserve = self.poller.interval().max(PROBE_RESERVE);
        deadline.checked_sub(reserve).unwrap_or(deadline)
    }

    async fn tag_volumes(&self, instance_id: &str, template: &TemplateSet) -> Result<(), ProvisioningError> {
        let volumes = self
            .provider
            .describe_volumes(instance_id)
            .await
            .map_err(|e| ProvisioningError::remote("describe_volumes", e))?;

        for volume in volumes {
            let Some((_, spec)) = template.volume_for_device(&volume.device) else {
                continue;
            };
            let name = self.names.allocate(ResourceKind::Volume, &self.volume_prefix).await?;
            let mut tags: Vec<Tag> = spec
                .map(|s| s.tags.iter().filter(|t| t.key != TAG_NAME).cloned().collect())
                .unwrap_or_default();
            tags.push(Tag::name(&name));
            self.provider
                .create_tags(&volume.volume_id, &tags)
                .await
                .map_err(|e| ProvisioningError::remote("create_tags", e))?;
            tracing::debug!("[provision] tagged volume {} on {} as {}", volume.volume_id, volume.device, name);
        }
        Ok(())
    }
}

fn failed(
    stage: ProvisionStage,
    instance_id: Option<&str>,
) -> impl FnOnce(ProvisioningError) -> ProvisionFailure + '_ {
    move |cause| ProvisionFailure::new(stage, instance_id.map(str::to_string), cause)
}

/// Template tags with `Name` set to the machine name.
pub fn instance_tags(template: &TemplateSet, name: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = template
        .instance
        .tags
        .iter()
        .filter(|t| t.key != TAG_NAME)
        .cloned()
        .collect();
    tags.push(Tag::name(name));
    tags
}

/// Single-instance create request; user data is filled in after packaging.
pub fn launch_request(template: &TemplateSet) -> Result<LaunchRequest, String> {
    let instance = &template.instance;
    let block_devices = instance
        .volumes
        .iter()
        .map(|attachment| {
            let spec = template.volume(&attachment.volume_ref).ok_or_else(|| {
                format!(
                    "attachment on {} references unknown volume '{}'",
                    attachment.device, attachment.volume_ref
                )
            })?;
            Ok(BlockDeviceMapping {
                device_name: attachment.device.clone(),
                size_gb: spec.size_gb,
                iops: spec.iops,
                snapshot_id: spec.snapshot_id.clone(),
                volume_type: spec.volume_type.clone(),
                delete_on_termination: true,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(LaunchRequest {
        image_id: instance.image_id.clone(),
        instance_type: instance.instance_type.clone(),
        availability_zone: instance.availability_zone.clone(),
        key_name: instance.key_name.clone(),
        private_ip_address: instance.private_ip_address.clone(),
        security_group_ids: instance.security_group_ids.clone(),
        security_groups: instance.security_groups.clone(),
        block_devices,
        user_data: None,
        min_count: 1,
        max_count: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use privcloud_common::{ResourceTemplate, VolumeSpec};

    #[test]
    fn launch_request_maps_attachments() {
        let set = TemplateSet::new(ResourceTemplate::new("ami-123", "m1.small")).with_volume(
            "/dev/sdb",
            "data",
            VolumeSpec {
                size_gb: Some(20),
                volume_type: Some("gp2".into()),
                ..Default::default()
            },
        );
        let req = launch_request(&set).unwrap();
        assert_eq!((req.min_count, req.max_count), (1, 1));
        assert_eq!(req.block_devices.len(), 1);
        assert_eq!(req.block_devices[0].device_name, "/dev/sdb");
        assert_eq!(req.block_devices[0].size_gb, Some(20));
        assert!(req.block_devices[0].delete_on_termination);
    }

    #[test]
    fn dangling_attachment_is_rejected() {
        let mut set = TemplateSet::new(ResourceTemplate::new("ami-123", "m1.small"));
        set.instance.volumes.push(privcloud_common::VolumeAttachment {
            device: "/dev/sdc".into(),
            volume_ref: "ghost".into(),
        });
        assert!(launch_request(&set).unwrap_err().contains("ghost"));
    }

    #[test]
    fn name_tag_overrides_template_name() {
        let mut template = ResourceTemplate::new("ami-123", "m1.small");
        template.tags = vec![Tag::new("team", "infra"), Tag::name("stale")];
        let tags = instance_tags(&TemplateSet::new(template), "mgmt1");
        assert_eq!(tags, vec![Tag::new("team", "infra"), Tag::name("mgmt1")]);
    }
}
