//! Claim grant, release, rollback and cancellation through the full stack.

use std::sync::Arc;
use std::time::Duration;

use libvolume::fake::FakeRpc;
use libvolume::*;

use crate::common::TestCluster;

#[tokio::test(flavor = "multi_thread")]
async fn second_concurrent_writer_is_rejected() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeSingleWriter).await;
    t.plugin
        .delay(FakeRpc::NodePublish, Duration::from_millis(100));

    let coordinator = t.coordinator();
    let (first, second) = tokio::join!(
        coordinator.request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite),
        coordinator.request_claim(&key, "a2".into(), "n2".into(), ClaimMode::ReadWrite),
    );

    let results = [first, second];
    let granted = results.iter().filter(|r| r.is_ok()).count();
    let violations = results
        .iter()
        .filter(|r| matches!(r, Err(VolumeError::AccessModeViolation { .. })))
        .count();
    assert_eq!((granted, violations), (1, 1));

    let claims = t.claims(&key).await;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].state, ClaimState::Claimed);

    // Readers still fit next to the writer.
    coordinator
        .request_claim(&key, "r1".into(), "n2".into(), ClaimMode::ReadOnly)
        .await
        .unwrap();
    assert_eq!(t.claims(&key).await.len(), 2);
}

#[tokio::test]
async fn node_exclusive_volume_stays_on_one_node() {
    let t = TestCluster::new().await;
    let key = t.register("scratch", AccessMode::SingleNodeReaderOnly).await;
    let coordinator = t.coordinator();

    coordinator
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadOnly)
        .await
        .unwrap();
    coordinator
        .request_claim(&key, "a2".into(), "n1".into(), ClaimMode::ReadOnly)
        .await
        .unwrap();
    assert!(matches!(
        coordinator
            .request_claim(&key, "a3".into(), "n2".into(), ClaimMode::ReadOnly)
            .await,
        Err(VolumeError::AccessModeViolation { .. })
    ));
    assert!(matches!(
        coordinator
            .request_claim(&key, "a4".into(), "n1".into(), ClaimMode::ReadWrite)
            .await,
        Err(VolumeError::AccessModeViolation { .. })
    ));
}

#[tokio::test]
async fn transient_stage_failure_within_budget_is_claimed() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;
    t.plugin
        .fail_times(FakeRpc::NodeStage, 2, CsiError::Unavailable("restarting".into()));

    let claim = t
        .coordinator()
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
    assert_eq!(claim.state, ClaimState::Claimed);
    assert_eq!(t.plugin.count(FakeRpc::NodeStage), 3);
    assert_eq!(claim.controller_node, Some(NodeId::from("ctl")));
}

#[tokio::test]
async fn persistent_stage_failure_restores_claim_set() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeMultiWriter).await;
    let coordinator = t.coordinator();
    coordinator
        .request_claim(&key, "a0".into(), "n2".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
    let before = t.claims(&key).await;

    t.plugin
        .fail_always(FakeRpc::NodeStage, CsiError::Timeout("device busy".into()));
    let err = coordinator
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VolumeError::AttachTimeout {
            step: AttachState::NodeStaging,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(t.claims(&key).await, before);
    // Stage may have half-run, so it is undone along with the controller publish.
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 0);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 1);
}

#[tokio::test]
async fn unhealthy_node_plugin_fails_fast() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeMultiWriter).await;
    t.service.report_plugin(PluginFingerprint {
        plugin_id: crate::common::PLUGIN.into(),
        provider: String::new(),
        version: String::new(),
        instance: PluginInstance {
            node_id: "n1".into(),
            role: PluginRole::Node,
            healthy: false,
            health_description: "csi socket missing".into(),
            topology: None,
            capabilities: Vec::new(),
            endpoint: None,
            job: None,
        },
    });

    let err = t
        .coordinator()
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::PluginUnhealthy { .. }));
    assert!(err.to_string().contains("csi socket missing"));
    assert!(t.plugin.calls().is_empty());
    assert!(t.claims(&key).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_tears_down_inflight_attach() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;
    t.plugin
        .delay(FakeRpc::NodePublish, Duration::from_secs(30));

    let coordinator = Arc::clone(t.coordinator());
    let attach = tokio::spawn({
        let key = key.clone();
        async move {
            coordinator
                .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
                .await
        }
    });

    t.wait_for_calls(FakeRpc::NodePublish, 1).await;
    let pending = t.claims(&key).await;
    assert_eq!(pending[0].state, ClaimState::Pending);
    assert_eq!(pending[0].attach, AttachState::NodePublishing);

    assert!(t.coordinator().cancel_claim(&key, &"a1".into()).await);
    let result = attach.await.unwrap();
    assert!(matches!(result, Err(VolumeError::Cancelled { .. })));

    assert!(t.claims(&key).await.is_empty());
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 1);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 1);
    assert!(!t.coordinator().cancel_claim(&key, &"a1".into()).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn releasing_pending_claim_waits_for_rollback() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;
    t.plugin
        .delay(FakeRpc::NodeStage, Duration::from_secs(30));

    let coordinator = Arc::clone(t.coordinator());
    let attach = tokio::spawn({
        let key = key.clone();
        async move {
            coordinator
                .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
                .await
        }
    });
    t.wait_for_calls(FakeRpc::NodeStage, 1).await;

    let released = t
        .coordinator()
        .release_claim(&key, &"a1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(released.state, ClaimState::Released);
    assert!(t.claims(&key).await.is_empty());
    assert!(matches!(
        attach.await.unwrap(),
        Err(VolumeError::Cancelled { .. })
    ));

    // The freed volume can be claimed again right away.
    t.plugin.delay(FakeRpc::NodeStage, Duration::ZERO);
    t.coordinator()
        .request_claim(&key, "a2".into(), "n2".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
}

#[tokio::test]
async fn node_staging_is_torn_down_with_its_last_claim() {
    let t = TestCluster::new().await;
    let key = t.register("shared", AccessMode::MultiNodeMultiWriter).await;
    let coordinator = t.coordinator();
    for instance in ["a1", "a2"] {
        coordinator
            .request_claim(&key, instance.into(), "n1".into(), ClaimMode::ReadWrite)
            .await
            .unwrap();
    }
    t.plugin.reset_log();

    // A failed attach next to live claims undoes only its own publish.
    t.plugin
        .fail_always(FakeRpc::NodePublish, CsiError::Internal("no".into()));
    assert!(
        coordinator
            .request_claim(&key, "a3".into(), "n1".into(), ClaimMode::ReadWrite)
            .await
            .is_err()
    );
    t.plugin.clear_failures();
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 1);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 0);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 0);
    assert_eq!(t.claims(&key).await.len(), 2);

    coordinator
        .release_claim(&key, &"a1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 2);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 0);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 0);

    coordinator
        .release_claim(&key, &"a2".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 3);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnstage), 1);
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 1);
    assert!(t.claims(&key).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn node_being_detached_refuses_new_claims() {
    let t = TestCluster::new().await;
    let key = t.register("shared", AccessMode::MultiNodeMultiWriter).await;
    let coordinator = Arc::clone(t.coordinator());
    coordinator
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
    t.plugin
        .delay(FakeRpc::NodeUnstage, Duration::from_secs(30));

    let release = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let key = key.clone();
        async move { coordinator.release_claim(&key, &"a1".into()).await }
    });
    t.wait_for_calls(FakeRpc::NodeUnstage, 1).await;

    assert!(matches!(
        coordinator
            .request_claim(&key, "a2".into(), "n1".into(), ClaimMode::ReadWrite)
            .await,
        Err(VolumeError::ClaimConflict { .. })
    ));
    coordinator
        .request_claim(&key, "a3".into(), "n2".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
    release.abort();
}

#[tokio::test]
async fn matcher_uses_topology_and_plugin_health() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::MultiNodeMultiWriter).await;
    t.cluster.set_node_ready(&"n2".into(), false);

    let matcher = TopologyMatcher::new(
        Arc::clone(t.coordinator().registry()),
        Arc::clone(t.coordinator().directory()),
    )
    .with_cluster(t.cluster.clone());
    let candidates: Vec<NodeId> = ["n1", "n2", "n3", "ctl"]
        .into_iter()
        .map(NodeId::from)
        .collect();

    let nodes = matcher.feasible_nodes(&key, &candidates).await.unwrap();
    assert_eq!(nodes, vec![NodeId::from("n1")]);
}
