// Single-machine provisioning: bootstrap hand-off, stages and tagging.

mod common;

use base64::Engine;
use common::{harness, in_secs, provisioner, worker_task, CountingClock};
use privcloud_common::{LifecycleState, ProvisionStage, ProvisioningError, Tag};
use privcloud_orchestrator::bootstrap::{RemoteContext, ENV_SCRIPT_NAME};
use privcloud_providers::mock::{MockObjectStore, MockProvider};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn provisions_tagged_machine_end_to_end() {
    let h = harness(MockProvider::new());

    let md = h.driver.provision_one(Some("us-east-1a"), in_secs(10)).await.unwrap();

    let calls = h.provider.calls();
    assert_eq!(calls.launched, vec![md.instance_id.clone()]);
    assert!(md.instance_id.starts_with("i-"));
    assert!(md.agent_reachable);
    assert_eq!(md.location_id.as_deref(), Some("us-east-1a"));
    assert_eq!(h.probe.hosts(), vec![md.public_address.clone().unwrap()]);

    let request = &calls.run_instances[0];
    assert_eq!(request.image_id, "ami-123");
    assert_eq!(request.instance_type, "m1.small");
    assert_eq!((request.min_count, request.max_count), (1, 1));
    assert_eq!(request.block_devices.len(), 1);
    assert_eq!(request.block_devices[0].device_name, "/dev/sdb");
    assert!(request.block_devices[0].delete_on_termination);

    let instance_tags = calls.tags_for(&md.instance_id);
    assert_eq!(instance_tags.len(), 1);
    assert_eq!(
        instance_tags[0],
        &vec![Tag::new("team", "infra"), Tag::name("privcloud-agent-1")]
    );

    let volume_calls: Vec<_> = calls
        .create_tags
        .iter()
        .filter(|(id, _)| id.starts_with("vol-"))
        .collect();
    assert_eq!(volume_calls.len(), 1);
    assert_eq!(
        volume_calls[0].1,
        vec![Tag::new("tier", "data"), Tag::name("privcloud-storage-1")]
    );

    assert_eq!(h.store.upload_count(), 1);
    assert_eq!(h.store.delete_count(), h.store.upload_count());
}

#[tokio::test]
async fn startup_data_fetches_the_uploaded_archive() {
    let h = harness(MockProvider::new());

    h.driver.provision_one(Some("us-east-1a"), in_secs(10)).await.unwrap();

    let (object, bytes) = h.store.last_upload().unwrap();
    let encoded = h.provider.calls().run_instances[0].user_data.clone().unwrap();
    let script = String::from_utf8(
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap(),
    )
    .unwrap();
    let lines: Vec<&str> = script.lines().collect();

    assert_eq!(lines[0], "#!/bin/bash");
    assert_eq!(lines[1], "export TMP_DIRECTORY=/tmp >> /tmp/privcloud-bootstrap.log");
    assert!(lines[2].contains(&format!("{}.mock-storage.local/{}", object.bucket, object.key)));
    assert_eq!(lines[4], "mkdir -p /opt/privcloud >> /tmp/privcloud-bootstrap.log");
    assert_eq!(lines[9], "source /opt/privcloud/privcloud_env.sh >> /tmp/privcloud-bootstrap.log");
    assert_eq!(lines[10], "echo provisioned");

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
    let mut env_script = None;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == ENV_SCRIPT_NAME {
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            env_script = Some(body);
        }
    }
    let env_script = env_script.expect("env script at archive root");
    assert!(env_script.contains("export PRIVCLOUD_MACHINE_NAME='privcloud-agent-1'"));
    assert!(env_script.contains("export PRIVCLOUD_MACHINE_ROLE='worker'"));
    assert!(env_script.contains("export PRIVCLOUD_LOCATION_ID='us-east-1a'"));
}

#[tokio::test]
async fn archive_is_released_when_create_fails() {
    let h = harness(MockProvider::new().with_failing_launch(0));

    let err = h.driver.provision_one(None, in_secs(10)).await.unwrap_err();

    assert!(matches!(err, ProvisioningError::RemoteCallFailure { call: "run_instances", .. }));
    assert_eq!(h.store.upload_count(), 1);
    assert_eq!(h.store.live_objects(), 0);
    let (object, _) = h.store.last_upload().unwrap();
    assert_eq!(h.store.deleted(), vec![object]);
}

#[tokio::test]
async fn presign_failure_releases_and_never_creates() {
    let provider = Arc::new(MockProvider::new());
    let store = Arc::new(MockObjectStore::new().with_failing_presign());
    let p = provisioner(provider.clone(), store.clone(), Arc::new(CountingClock::default()));

    let failure = p
        .provision(&worker_task("w1", in_secs(10)), &RemoteContext::default(), None)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, ProvisionStage::Packaging);
    assert!(failure.instance_id.is_none());
    assert_eq!(store.presign_count(), 1);
    assert_eq!(store.upload_count(), 1);
    assert_eq!(store.delete_count(), 1);
    assert!(provider.calls().run_instances.is_empty());
}

#[tokio::test]
async fn upload_failure_aborts_before_create() {
    let provider = Arc::new(MockProvider::new());
    let store = Arc::new(MockObjectStore::new().with_failing_upload());
    let p = provisioner(provider.clone(), store.clone(), Arc::new(CountingClock::default()));

    let failure = p
        .provision(&worker_task("w1", in_secs(10)), &RemoteContext::default(), None)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, ProvisionStage::Packaging);
    assert!(matches!(failure.cause, ProvisioningError::RemoteCallFailure { call: "upload_archive", .. }));
    assert!(provider.calls().run_instances.is_empty());
}

#[tokio::test]
async fn terminal_state_keeps_instance_id_and_skips_tagging() {
    use LifecycleState::*;
    let provider = Arc::new(MockProvider::new().with_state_sequence(vec![Pending, Terminated]));
    let store = Arc::new(MockObjectStore::new());
    let p = provisioner(provider.clone(), store.clone(), Arc::new(CountingClock::default()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let failure = p
        .provision(&worker_task("w1", in_secs(10)), &RemoteContext::default(), Some(&tx))
        .await
        .unwrap_err();

    let calls = provider.calls();
    assert_eq!(failure.stage, ProvisionStage::AwaitingRunning);
    assert_eq!(failure.instance_id.as_ref(), Some(&calls.launched[0]));
    assert_eq!(rx.try_recv().unwrap(), calls.launched[0]);
    assert!(calls.create_tags.is_empty());
    // No self-cleanup.
    assert!(calls.terminate_instances.is_empty());
}

#[tokio::test]
async fn tagging_failure_reports_stage() {
    let provider = Arc::new(MockProvider::new().with_failing_create_tags());
    let store = Arc::new(MockObjectStore::new());
    let p = provisioner(provider.clone(), store, Arc::new(CountingClock::default()));

    let failure = p
        .provision(&worker_task("w1", in_secs(10)), &RemoteContext::default(), None)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, ProvisionStage::Tagging);
    assert!(failure.instance_id.is_some());
}

#[tokio::test]
async fn unreachable_agent_is_not_an_error() {
    use privcloud_orchestrator::agent_probe::TcpAgentProbe;
    use privcloud_orchestrator::ProvisioningDriver;

    // Nothing listens on the port the probe is pointed at.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let provider = Arc::new(MockProvider::new().with_address("127.0.0.1"));
    let clock = Arc::new(CountingClock::default());
    let driver = ProvisioningDriver::builder(
        provider.clone(),
        Arc::new(MockObjectStore::new()),
        Arc::new(common::sample_template()),
        common::settings(),
    )
    .with_clock(clock.clone())
    .with_probe(Arc::new(
        TcpAgentProbe::new(port, clock).with_retry_interval(Duration::from_millis(20)),
    ))
    .build()
    .unwrap();

    let md = driver
        .provision_one(Some("us-east-1a"), tokio::time::Instant::now() + Duration::from_millis(500))
        .await
        .unwrap();

    assert!(!md.agent_reachable);
    assert_eq!(md.public_address.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn cancelled_run_still_releases_the_archive() {
    let provider = Arc::new(MockProvider::new().with_launch_delay(0, Duration::from_secs(3600)));
    let store = Arc::new(MockObjectStore::new());
    let p = provisioner(provider.clone(), store.clone(), Arc::new(CountingClock::default()));

    let handle = tokio::spawn(async move {
        p.provision(&worker_task("w1", in_secs(7200)), &RemoteContext::default(), None)
            .await
    });
    for _ in 0..200 {
        if provider.calls().run_instances.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    for _ in 0..200 {
        if store.delete_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.upload_count(), 1);
    assert_eq!(store.delete_count(), 1);
    assert!(provider.calls().launched.is_empty());
}
