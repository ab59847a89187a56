//! Volume and plugin CRUD through the service boundary.

use libvolume::*;

use crate::common::{PLUGIN, TestCluster};

#[tokio::test]
async fn register_then_info_returns_identical_fields() {
    let t = TestCluster::new().await;
    let mut vol = Volume::new(
        "analytics",
        "warehouse",
        PLUGIN,
        AccessMode::MultiNodeReaderOnly,
        AttachmentMode::BlockDevice,
    );
    vol.name = "warehouse-snapshot".into();
    vol.topologies = vec![
        Topology::new([("zone", "a"), ("rack", "r1")]),
        Topology::new([("zone", "b"), ("rack", "r7")]),
    ];
    vol.capacity_bytes = 10 << 30;
    vol.mount_options = MountOptions {
        fs_type: "xfs".into(),
        mount_flags: vec!["noatime".into()],
    };
    vol.context.insert("snapshot".into(), "snap-42".into());
    t.service.register(vol.clone()).await.unwrap();

    let info = t.service.volume_info(&vol.key()).await.unwrap();
    assert_eq!(info.volume, vol);
    assert_eq!(info.health.controllers_healthy, 1);
    assert_eq!(info.health.nodes_expected, 3);

    // The record on disk round-trips too.
    let t = t.restart().await;
    assert_eq!(t.service.volume_info(&vol.key()).await.unwrap().volume, vol);
}

#[test]
fn unknown_modes_are_rejected_at_the_boundary() {
    let json = r#"{
        "id": "vol-1", "namespace": "default", "plugin_id": "ebs",
        "access_mode": "multi-node-whatever", "attachment_mode": "file-system"
    }"#;
    assert!(serde_json::from_str::<Volume>(json).is_err());
    assert!("block".parse::<AttachmentMode>().is_err());
}

#[tokio::test]
async fn deregister_follows_force_rules() {
    let t = TestCluster::new().await;
    let empty = t.register("empty", AccessMode::MultiNodeMultiWriter).await;
    t.service.deregister(&empty, false).await.unwrap();
    assert!(matches!(
        t.service.volume_info(&empty).await,
        Err(VolumeError::VolumeNotFound(_))
    ));

    let key = t.register("busy", AccessMode::MultiNodeMultiWriter).await;
    for (instance, node) in [("a1", "n1"), ("a2", "n2")] {
        t.coordinator()
            .request_claim(&key, instance.into(), node.into(), ClaimMode::ReadWrite)
            .await
            .unwrap();
    }
    assert!(matches!(
        t.service.deregister(&key, false).await,
        Err(VolumeError::ForcedDeregisterRequired(_))
    ));
    assert_eq!(t.claims(&key).await.len(), 2);

    t.service.deregister(&key, true).await.unwrap();
    assert!(t.service.list_volumes(None).await.is_empty());
    assert!(!t.dir.path().join("default").join("busy.json").exists());
}

#[tokio::test]
async fn plugin_info_surfaces_jobs() {
    let t = TestCluster::new().await;
    let plugin = t.service.plugin_info(PLUGIN).unwrap();
    assert_eq!(plugin.provider, "ebs.csi.aws.com");
    assert_eq!(plugin.nodes.len(), 3);

    let jobs = plugin.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs["system"].contains("ebs-controller"));
    assert!(jobs["system"].contains("ebs-nodes"));

    let stubs = t.service.list_plugins();
    assert_eq!(stubs[0].health.nodes_healthy, 3);
}
