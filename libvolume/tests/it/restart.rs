//! Crash recovery: claims persisted mid-sequence are resumed by a new
//! process over the same state directory.

use libvolume::fake::FakeRpc;
use libvolume::*;

use crate::common::TestCluster;

/// Write a claim straight into the record, as a process that died mid-way
/// would have left it.
async fn leave_claim(t: &TestCluster, key: &VolumeKey, claim: Claim) {
    let mut lock = t.coordinator().registry().lock(key).await.unwrap();
    lock.volume_mut()
        .claims
        .insert(claim.instance_id.clone(), claim);
    lock.persist().await.unwrap();
}

#[tokio::test]
async fn attach_resumes_from_recorded_step() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;

    let mut claim = Claim::new("a1".into(), "n1".into(), ClaimMode::ReadWrite);
    claim.attach = AttachState::NodeStaging;
    claim.controller_node = Some("ctl".into());
    claim
        .publish_context
        .insert("device".into(), "/dev/xvdf".into());
    leave_claim(&t, &key, claim).await;

    let t = t.restart().await;
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!(
        report,
        ResumeReport {
            attaches: 1,
            detaches: 0,
            failed: 0
        }
    );

    assert_eq!(t.plugin.count(FakeRpc::ControllerPublish), 0);
    assert_eq!(t.plugin.count(FakeRpc::NodeStage), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodePublish), 1);

    let claims = t.claims(&key).await;
    assert_eq!(claims[0].state, ClaimState::Claimed);
    assert_eq!(claims[0].attach, AttachState::Published);
    assert_eq!(claims[0].publish_context["device"], "/dev/xvdf");

    // Nothing left to resume.
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!(report, ResumeReport::default());
}

#[tokio::test]
async fn failed_resumed_attach_rolls_back() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;

    let mut claim = Claim::new("a1".into(), "n1".into(), ClaimMode::ReadWrite);
    claim.attach = AttachState::NodePublishing;
    leave_claim(&t, &key, claim).await;

    let t = t.restart().await;
    t.plugin.fail_always(
        FakeRpc::NodePublish,
        CsiError::MountFailed {
            path: "/target".into(),
            reason: "read-only filesystem".into(),
        },
    );
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!((report.attaches, report.failed), (1, 1));
    assert!(t.claims(&key).await.is_empty());
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 1);
}

#[tokio::test]
async fn interrupted_rollback_is_finished() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;

    let mut claim = Claim::new("a1".into(), "n1".into(), ClaimMode::ReadWrite);
    claim.attach = AttachState::NodeUnstaging;
    claim.controller_node = Some("ctl".into());
    leave_claim(&t, &key, claim).await;

    let t = t.restart().await;
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!((report.attaches, report.failed), (1, 1));
    assert!(t.claims(&key).await.is_empty());
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 0);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 1);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodePublish), 0);
}

#[tokio::test]
async fn detach_resumes_where_it_stopped() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeMultiWriter).await;
    t.coordinator()
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();

    let mut claim = t.claims(&key).await.remove(0);
    claim.state = ClaimState::Unpublishing;
    claim.attach = AttachState::ControllerUnpublishing;
    leave_claim(&t, &key, claim).await;

    let t = t.restart().await;
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!((report.detaches, report.failed), (1, 0));
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 0);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 1);
    assert!(t.claims(&key).await.is_empty());
}

#[tokio::test]
async fn granted_claims_survive_restart_untouched() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeMultiWriter).await;
    let granted = t
        .coordinator()
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();

    let t = t.restart().await;
    t.plugin.reset_log();
    let report = t.coordinator().resume_interrupted().await.unwrap();
    assert_eq!(report, ResumeReport::default());
    assert!(t.plugin.calls().is_empty());
    assert_eq!(t.claims(&key).await, vec![granted]);
}
