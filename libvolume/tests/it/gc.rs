//! Orphan reclamation across volumes.

use libvolume::fake::FakeRpc;
use libvolume::*;

use crate::common::TestCluster;

#[tokio::test]
async fn absent_instance_is_released_within_one_sweep() {
    let t = TestCluster::new().await;
    let shared = t.register("shared", AccessMode::MultiNodeMultiWriter).await;
    let db = t.register("db", AccessMode::SingleNodeWriter).await;
    for (key, instance, node) in [(&shared, "a1", "n1"), (&shared, "a2", "n2"), (&db, "a3", "n1")] {
        t.cluster.add_instance(&instance.into());
        t.coordinator()
            .request_claim(key, instance.into(), node.into(), ClaimMode::ReadWrite)
            .await
            .unwrap();
    }

    t.cluster.remove_instance(&"a2".into());
    t.cluster.remove_instance(&"a3".into());
    let gc = t.gc();
    let report = gc.sweep_once().await;
    assert_eq!(
        report,
        SweepReport {
            scanned: 3,
            released: 2,
            retained: 1,
            failed: 0
        }
    );
    assert_eq!(t.plugin.count(FakeRpc::ControllerUnpublish), 2);
    assert_eq!(t.claims(&shared).await.len(), 1);
    assert!(t.claims(&db).await.is_empty());
}

#[tokio::test]
async fn present_instance_is_never_touched() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;
    t.cluster.add_instance(&"a1".into());
    let granted = t
        .coordinator()
        .request_claim(&key, "a1".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();

    let gc = t.gc();
    for _ in 0..5 {
        let report = gc.sweep_once().await;
        assert_eq!((report.scanned, report.retained), (1, 1));
    }
    assert_eq!(t.claims(&key).await, vec![granted]);
    assert_eq!(t.plugin.count(FakeRpc::NodeUnpublish), 0);
}

#[tokio::test]
async fn failed_reclaim_is_retried_next_sweep() {
    let t = TestCluster::new().await;
    let key = t.register("db", AccessMode::SingleNodeWriter).await;
    t.coordinator()
        .request_claim(&key, "gone".into(), "n1".into(), ClaimMode::ReadWrite)
        .await
        .unwrap();
    t.plugin.fail_always(
        FakeRpc::ControllerUnpublish,
        CsiError::Internal("api throttled".into()),
    );

    let gc = t.gc();
    let report = gc.sweep_once().await;
    assert_eq!((report.failed, report.released), (1, 0));
    assert_eq!(t.claims(&key).await[0].state, ClaimState::AttachFailed);

    t.plugin.clear_failures();
    let report = gc.sweep_once().await;
    assert_eq!(report.released, 1);
    assert!(t.claims(&key).await.is_empty());
}
