//! Shared harness: a coordinator over a file-backed registry, one fake
//! plugin serving every instance and a fake cluster.

use std::sync::{Arc, Once};
use std::time::Duration;

use libvolume::fake::{FakeCluster, FakeConnector, FakePlugin};
use libvolume::*;
use tempfile::TempDir;

pub const PLUGIN: &str = "ebs";

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn config(state_dir: &std::path::Path) -> Config {
    Config {
        state_dir: state_dir.to_path_buf(),
        mount_root: "/var/lib/rkvol/csi".into(),
        rpc_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        gc_interval: Duration::from_secs(60),
        gc_parallelism: 4,
    }
}

pub struct TestCluster {
    pub dir: TempDir,
    pub plugin: Arc<FakePlugin>,
    pub cluster: Arc<FakeCluster>,
    pub service: VolumeService,
}

impl TestCluster {
    pub async fn new() -> Self {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir, Arc::new(FakePlugin::new())).await
    }

    /// Build a fresh process over the state left in `dir`.
    pub async fn open(dir: TempDir, plugin: Arc<FakePlugin>) -> Self {
        let config = config(dir.path());
        let store = Arc::new(FileStore::new(&config.state_dir));
        let registry = Arc::new(Registry::open(store).await.unwrap());
        let directory = Arc::new(PluginDirectory::new());
        let driver = AttachmentDriver::new(Arc::new(FakeConnector::new(plugin.clone())), &config);
        let coordinator = Arc::new(ClaimCoordinator::new(registry, directory, driver));
        let service = VolumeService::new(coordinator);
        report_plugins(&service);
        Self {
            dir,
            plugin,
            cluster: Arc::new(FakeCluster::new()),
            service,
        }
    }

    /// Simulate a crash: drop the process, keep the state directory.
    pub async fn restart(self) -> Self {
        let Self { dir, plugin, .. } = self;
        Self::open(dir, plugin).await
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        self.service.coordinator()
    }

    pub fn gc(&self) -> GcSweeper {
        GcSweeper::new(
            Arc::clone(self.coordinator()),
            self.cluster.clone(),
            &config(self.dir.path()),
        )
    }

    pub async fn register(&self, id: &str, access: AccessMode) -> VolumeKey {
        let mut vol = Volume::new("default", id, PLUGIN, access, AttachmentMode::FileSystem);
        vol.topologies = vec![Topology::new([("zone", "a")])];
        self.service.register(vol).await.unwrap().key()
    }

    pub async fn claims(&self, key: &VolumeKey) -> Vec<Claim> {
        let mut claims: Vec<Claim> = self
            .service
            .volume_info(key)
            .await
            .unwrap()
            .volume
            .claims
            .into_values()
            .collect();
        claims.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        claims
    }

    /// Poll until the fake plugin has seen `n` calls of `rpc`.
    pub async fn wait_for_calls(&self, rpc: fake::FakeRpc, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.plugin.count(rpc) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

/// A controller on `ctl` and node plugins on `n1`..`n3`; `n3` is in zone b.
fn report_plugins(service: &VolumeService) {
    let instances = [
        ("ctl", PluginRole::Controller, "a"),
        ("n1", PluginRole::Node, "a"),
        ("n2", PluginRole::Node, "a"),
        ("n3", PluginRole::Node, "b"),
    ];
    for (node, role, zone) in instances {
        service.report_plugin(PluginFingerprint {
            plugin_id: PLUGIN.into(),
            provider: "ebs.csi.aws.com".into(),
            version: "1.2.0".into(),
            instance: PluginInstance {
                node_id: node.into(),
                role,
                healthy: true,
                health_description: String::new(),
                topology: Some(Topology::new([("zone", zone)])),
                capabilities: vec![
                    PluginCapability::StageUnstageVolume,
                    PluginCapability::VolumeAccessibilityConstraints,
                ],
                endpoint: None,
                job: Some(JobRef {
                    namespace: "system".into(),
                    id: match role {
                        PluginRole::Controller => "ebs-controller".into(),
                        _ => "ebs-nodes".into(),
                    },
                }),
            },
        });
    }
}
