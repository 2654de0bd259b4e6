use crate::bootstrap::RemoteContext;
use crate::clock::Clock;
use crate::logger::ActionLog;
use crate::provisioner::InstanceProvisioner;
use privcloud_common::{
    tag_pattern, FailureRecord, FleetResult, MachineDescriptor, ProvisionStage, ProvisioningError,
    ProvisioningTask, TaskOutcome,
};
use privcloud_providers::{inventory::DiscoveredInstance, is_not_found, CloudProvider, InstanceFilter};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Provisions a management group as a unit: all machines come up or none stay.
pub struct FleetCoordinator {
    provider: Arc<dyn CloudProvider>,
    provisioner: InstanceProvisioner,
    clock: Arc<dyn Clock>,
    management_group: String,
}

impl FleetCoordinator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        provisioner: InstanceProvisioner,
        clock: Arc<dyn Clock>,
        management_group: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            provisioner,
            clock,
            management_group: management_group.into(),
        }
    }

    pub fn management_group(&self) -> &str {
        &self.management_group
    }

    /// Running instances whose `Name` matches `<group>*`. "Not found" means none.
    pub async fn list_fleet(&self) -> Result<Vec<MachineDescriptor>, ProvisioningError> {
        let filter = InstanceFilter::running_named(&tag_pattern::group_pattern(&self.management_group));
        match self.provider.describe_instances(&filter).await {
            Ok(found) => Ok(found.into_iter().map(descriptor_of).collect()),
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(ProvisioningError::remote("describe_instances", e)),
        }
    }

    /// Terminate every listed fleet machine in one call; returns the ids sent.
    pub async fn terminate_fleet(&self) -> Result<Vec<String>, ProvisioningError> {
        let ids: Vec<String> = self
            .list_fleet()
            .await?
            .into_iter()
            .map(|md| md.instance_id)
            .collect();
        if ids.is_empty() {
            tracing::info!("[fleet] no running machines in group {}", self.management_group);
            return Ok(ids);
        }
        tracing::info!("🛑 [fleet] terminating {:?}", ids);
        self.provider
            .terminate_instances(&ids)
            .await
            .map_err(|e| ProvisioningError::remote("terminate_instances", e))?;
        Ok(ids)
    }

    /// Start `n` machines in parallel under one deadline.
    ///
    /// On any failure every instance a task reported as created is terminated
    /// and the lowest-index failure is returned inside `PartialFleetFailure`.
    pub async fn provision_fleet<F>(
        &self,
        n: usize,
        task_fn: F,
        deadline: Instant,
    ) -> Result<Vec<MachineDescriptor>, ProvisioningError>
    where
        F: Fn(usize) -> (ProvisioningTask, RemoteContext),
    {
        if self.clock.now() >= deadline {
            return Err(ProvisioningError::InvalidDuration);
        }

        let existing = self.list_fleet().await?;
        if !existing.is_empty() {
            let descriptions = existing
                .iter()
                .map(|md| format!("[{}]", md.describe()))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ProvisioningError::AlreadyProvisioned {
                group: self.management_group.clone(),
                descriptions,
            });
        }

        let action = ActionLog::start(
            "PROVISION_FLEET",
            &self.management_group,
            Some(json!({ "machines": n })),
        );
        let (result, created) = self.run_tasks(n, task_fn, deadline).await;
        let failure_count = result.failure_count();
        let total_count = result.total_count();

        if result.is_complete() {
            let (machines, _) = result.partition();
            action.success(Some(json!({
                "instance_ids": machines.iter().map(|m| m.instance_id.as_str()).collect::<Vec<_>>()
            })));
            return Ok(machines);
        }

        let (_, failures) = result.partition();
        for record in &failures {
            tracing::error!(
                "❌ [fleet] task {} failed at {} (instance {:?}): {}",
                record.task_index,
                record.stage.as_str(),
                record.instance_id,
                record.cause
            );
        }
        let cleanup_errors = self.roll_back(&created).await;

        let first_cause = failures
            .into_iter()
            .next()
            .map(|record| record.cause)
            .unwrap_or_else(|| ProvisioningError::UnexpectedResponse {
                call: "provision_fleet",
                detail: "failure reported without a cause".to_string(),
            });
        let err = ProvisioningError::PartialFleetFailure {
            first_cause: Box::new(first_cause),
            failure_count,
            total_count,
            cleanup_errors,
        };
        action.failure(&err);
        Err(err)
    }

    /// Run every task to completion or until the deadline; returns per-index
    /// outcomes and every instance id reported as created (including by tasks
    /// that failed or were cancelled).
    pub async fn run_tasks<F>(&self, n: usize, task_fn: F, deadline: Instant) -> (FleetResult, Vec<String>)
    where
        F: Fn(usize) -> (ProvisioningTask, RemoteContext),
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut set = JoinSet::new();
        let mut indices = HashMap::new();

        for index in 0..n {
            let (task, ctx) = task_fn(index);
            let provisioner = self.provisioner.clone();
            let tx = tx.clone();
            let handle = set.spawn(async move { provisioner.provision(&task, &ctx, Some(&tx)).await });
            indices.insert(handle.id(), index);
        }
        drop(tx);

        let mut slots: Vec<Option<TaskOutcome>> = (0..n).map(|_| None).collect();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    let Some(&index) = indices.get(&id) else { continue };
                    slots[index] = Some(match outcome {
                        Ok(md) => TaskOutcome::Provisioned(md),
                        Err(failure) => TaskOutcome::Failed(failure.into_record(index)),
                    });
                }
                Ok(Some(Err(join_err))) => {
                    let Some(&index) = indices.get(&join_err.id()) else { continue };
                    tracing::error!("❌ [fleet] task {} aborted: {}", index, join_err);
                    slots[index] = Some(TaskOutcome::Failed(FailureRecord {
                        task_index: index,
                        stage: ProvisionStage::Cancelled,
                        instance_id: None,
                        cause: ProvisioningError::remote("provision_task", anyhow::anyhow!(join_err.to_string())),
                    }));
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "⏱️ [fleet] deadline reached with {} task(s) still running; cancelling",
                        set.len()
                    );
                    set.abort_all();
                    // Let aborted tasks unwind so their created ids are on the channel.
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    TaskOutcome::Failed(FailureRecord {
                        task_index: index,
                        stage: ProvisionStage::Cancelled,
                        instance_id: None,
                        cause: ProvisioningError::timeout("provision_fleet", format!("task {}", index)),
                    })
                })
            })
            .collect();

        let mut created = Vec::new();
        while let Ok(id) = rx.try_recv() {
            created.push(id);
        }
        (FleetResult { outcomes }, created)
    }

    /// Best-effort termination of `instance_ids`; returns the errors hit.
    async fn roll_back(&self, instance_ids: &[String]) -> Vec<String> {
        let unique: BTreeSet<&String> = instance_ids.iter().collect();
        let mut errors = Vec::new();
        for id in unique {
            tracing::info!("🔄 [fleet] rolling back {}", id);
            if let Err(e) = self.provider.terminate_instances(std::slice::from_ref(id)).await {
                tracing::warn!("⚠️ [fleet] failed to terminate {} during rollback: {:#}", id, e);
                errors.push(format!("{}: {:#}", id, e));
            }
        }
        errors
    }
}

pub fn descriptor_of(instance: DiscoveredInstance) -> MachineDescriptor {
    MachineDescriptor {
        instance_id: instance.instance_id,
        private_address: instance.private_ip_address,
        public_address: instance.public_ip_address,
        // Listing does not probe.
        agent_reachable: false,
        location_id: instance.availability_zone,
    }
}
