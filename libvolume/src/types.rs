//! Core data model: volumes, claims, plugins, topology and plugin requests.
//!
//! These types are shared by the registry, the claim coordinator, the
//! attachment driver and the transport layer.  They are all
//! [`Serialize`]/[`Deserialize`]: volume records are persisted as JSON and
//! plugin requests travel over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::VolumeError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Opaque, unique identifier for a volume within its namespace.
    VolumeId
);
string_id!(
    /// Identifier of a workload instance.  Never reused once allocated.
    InstanceId
);
string_id!(
    /// Identifier of a cluster node.
    NodeId
);

/// Registry key of a volume: volumes are unique per namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeKey {
    pub namespace: String,
    pub id: VolumeId,
}

impl VolumeKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<VolumeId>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Opaque map returned by `ControllerPublishVolume` and handed to the node
/// stage and publish calls.
pub type PublishContext = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Access & attachment modes
// ---------------------------------------------------------------------------

/// How many nodes and writers may hold a volume at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    SingleNodeReaderOnly,
    SingleNodeWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub const ALL: [AccessMode; 5] = [
        AccessMode::SingleNodeReaderOnly,
        AccessMode::SingleNodeWriter,
        AccessMode::MultiNodeReaderOnly,
        AccessMode::MultiNodeSingleWriter,
        AccessMode::MultiNodeMultiWriter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleNodeReaderOnly => "single-node-reader-only",
            Self::SingleNodeWriter => "single-node-writer",
            Self::MultiNodeReaderOnly => "multi-node-reader-only",
            Self::MultiNodeSingleWriter => "multi-node-single-writer",
            Self::MultiNodeMultiWriter => "multi-node-multi-writer",
        }
    }

    /// At most one read-write claim may exist.
    pub fn is_single_writer(self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::MultiNodeSingleWriter)
    }

    /// Every claim must be on the same node.
    pub fn is_node_exclusive(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::SingleNodeWriter)
    }

    /// No read-write claim may exist.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| VolumeError::InvalidArgument(format!("unknown access mode {s:?}")))
    }
}

/// How the volume is presented to the workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentMode {
    BlockDevice,
    #[serde(alias = "filesystem")]
    FileSystem,
}

impl AttachmentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockDevice => "block-device",
            Self::FileSystem => "file-system",
        }
    }
}

impl fmt::Display for AttachmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentMode {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block-device" => Ok(Self::BlockDevice),
            "file-system" | "filesystem" => Ok(Self::FileSystem),
            other => Err(VolumeError::InvalidArgument(format!(
                "unknown attachment mode {other:?}"
            ))),
        }
    }
}

/// Mount parameters forwarded to the node plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem type, empty to let the plugin decide.
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub attachment_mode: AttachmentMode,
    #[serde(default)]
    pub mount_options: MountOptions,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"zone": "us-east-1a"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    pub fn new<K, V>(segments: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Whether a claim may write to the volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimMode {
    ReadOnly,
    ReadWrite,
}

impl ClaimMode {
    pub fn is_write(self) -> bool {
        self == Self::ReadWrite
    }
}

impl fmt::Display for ClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadOnly => "read-only",
            Self::ReadWrite => "read-write",
        })
    }
}

impl FromStr for ClaimMode {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-only" => Ok(Self::ReadOnly),
            "read-write" => Ok(Self::ReadWrite),
            other => Err(VolumeError::InvalidArgument(format!(
                "unknown claim mode {other:?}"
            ))),
        }
    }
}

/// Lifecycle of a claim as seen by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimState {
    /// Reserved; the attach sequence is running.
    Pending,
    /// Attached and usable by the workload instance.
    Claimed,
    /// The detach sequence is running.
    Unpublishing,
    /// Fully detached; about to leave the claim set.
    Released,
    /// An attach or detach sequence gave up; waits for a retried release.
    AttachFailed,
}

impl ClaimState {
    /// Provisional states that still hold the volume while an RPC runs.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Unpublishing)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Unpublishing => "unpublishing",
            Self::Released => "released",
            Self::AttachFailed => "attach-failed",
        })
    }
}

/// Position of a claim in the attach/detach sequence.
///
/// A state names the step that runs next; every step before it has
/// completed.  The state is persisted before the step's RPC is issued, so a
/// restarted process resumes exactly where the previous one stopped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AttachState {
    #[default]
    Pending,
    ControllerPublishing,
    NodeStaging,
    NodePublishing,
    Published,
    NodeUnpublishing,
    NodeUnstaging,
    ControllerUnpublishing,
    Detached,
}

impl AttachState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ControllerPublishing => "controller-publishing",
            Self::NodeStaging => "node-staging",
            Self::NodePublishing => "node-publishing",
            Self::Published => "published",
            Self::NodeUnpublishing => "node-unpublishing",
            Self::NodeUnstaging => "node-unstaging",
            Self::ControllerUnpublishing => "controller-unpublishing",
            Self::Detached => "detached",
        }
    }

    /// States of the attach path, `published` included.
    pub fn is_forward(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::ControllerPublishing
                | Self::NodeStaging
                | Self::NodePublishing
                | Self::Published
        )
    }

    /// Where teardown starts from this state.
    ///
    /// A forward step that was in progress may have taken effect on the
    /// plugin, so it is undone together with everything before it.
    pub fn teardown_entry(self) -> Self {
        match self {
            Self::Pending | Self::Detached => Self::Detached,
            Self::ControllerPublishing => Self::ControllerUnpublishing,
            Self::NodeStaging => Self::NodeUnstaging,
            Self::NodePublishing | Self::Published => Self::NodeUnpublishing,
            Self::NodeUnpublishing | Self::NodeUnstaging | Self::ControllerUnpublishing => self,
        }
    }
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation binding one workload instance to one volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub mode: ClaimMode,
    pub state: ClaimState,
    /// Last recorded position in the attach/detach sequence.
    #[serde(default)]
    pub attach: AttachState,
    /// Node of the controller instance that published the volume.
    #[serde(default)]
    pub controller_node: Option<NodeId>,
    #[serde(default)]
    pub publish_context: PublishContext,
}

impl Claim {
    pub fn new(instance_id: InstanceId, node_id: NodeId, mode: ClaimMode) -> Self {
        Self {
            instance_id,
            node_id,
            mode,
            state: ClaimState::Pending,
            attach: AttachState::Pending,
            controller_node: None,
            publish_context: PublishContext::new(),
        }
    }

    /// Holds, or is acquiring, a mount of the volume on its node.
    pub fn is_mounting(&self) -> bool {
        match self.state {
            ClaimState::Claimed => true,
            ClaimState::Pending => self.attach.is_forward(),
            _ => false,
        }
    }

    /// A detach or a rollback of this claim is under way.
    pub fn is_tearing_down(&self) -> bool {
        match self.state {
            ClaimState::Unpublishing => true,
            ClaimState::Pending => !self.attach.is_forward(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// A registered CSI volume and its live claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub id: VolumeId,
    pub namespace: String,
    /// Display name; defaults to the ID.
    #[serde(default)]
    pub name: String,
    pub plugin_id: String,
    pub access_mode: AccessMode,
    pub attachment_mode: AttachmentMode,
    /// Ordered requirement sets; a node must satisfy at least one.
    #[serde(default)]
    pub topologies: Vec<Topology>,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub mount_options: MountOptions,
    /// User-supplied parameters forwarded to the plugin.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque volume context forwarded to the plugin.
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub claims: HashMap<InstanceId, Claim>,
}

impl Volume {
    pub fn new(
        namespace: impl Into<String>,
        id: impl Into<VolumeId>,
        plugin_id: impl Into<String>,
        access_mode: AccessMode,
        attachment_mode: AttachmentMode,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            namespace: namespace.into(),
            plugin_id: plugin_id.into(),
            access_mode,
            attachment_mode,
            topologies: Vec::new(),
            capacity_bytes: 0,
            mount_options: MountOptions::default(),
            parameters: HashMap::new(),
            context: HashMap::new(),
            claims: HashMap::new(),
        }
    }

    pub fn key(&self) -> VolumeKey {
        VolumeKey {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
        }
    }

    pub fn capability(&self) -> VolumeCapability {
        VolumeCapability {
            access_mode: self.access_mode,
            attachment_mode: self.attachment_mode,
            mount_options: self.mount_options.clone(),
        }
    }

    /// No other claim keeps the volume staged on `claim`'s node, so its
    /// teardown also unstages and detaches the volume from that node.
    pub fn is_last_on_node(&self, claim: &Claim) -> bool {
        !self.claims.values().any(|c| {
            c.instance_id != claim.instance_id && c.node_id == claim.node_id && c.is_mounting()
        })
    }

    /// A claim on `node_id` is tearing the volume down there and no claim
    /// still mounts it, so the staging path is about to disappear.
    pub fn is_detaching_from(&self, node_id: &NodeId) -> bool {
        let mut tearing_down = false;
        for claim in self.claims.values().filter(|c| c.node_id == *node_id) {
            if claim.is_mounting() {
                return false;
            }
            tearing_down |= claim.is_tearing_down();
        }
        tearing_down
    }

    pub fn readers(&self) -> usize {
        self.claims.values().filter(|c| !c.mode.is_write()).count()
    }

    pub fn writers(&self) -> usize {
        self.claims.values().filter(|c| c.mode.is_write()).count()
    }

    /// Reject records that cannot be stored or evaluated.
    ///
    /// Namespace and ID double as path components of the file store.
    pub fn validate(&self) -> Result<(), VolumeError> {
        validate_name("namespace", &self.namespace)?;
        validate_name("volume id", self.id.as_str())?;
        if self.plugin_id.is_empty() {
            return Err(VolumeError::InvalidArgument(format!(
                "volume {} has no plugin id",
                self.key()
            )));
        }
        if let Some(i) = self.topologies.iter().position(|t| t.segments.is_empty()) {
            return Err(VolumeError::InvalidArgument(format!(
                "volume {} topology requirement {i} has no segments",
                self.key()
            )));
        }
        Ok(())
    }
}

fn validate_name(what: &str, value: &str) -> Result<(), VolumeError> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(VolumeError::InvalidArgument(format!(
            "invalid {what} {value:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// Which CSI services a plugin instance runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PluginRole {
    Controller,
    Node,
    /// Both controller and node in one process.
    Monolith,
}

impl PluginRole {
    pub fn serves_controller(self) -> bool {
        matches!(self, Self::Controller | Self::Monolith)
    }

    pub fn serves_node(self) -> bool {
        matches!(self, Self::Node | Self::Monolith)
    }
}

/// Capabilities advertised by a CSI plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Node service implements stage/unstage.
    StageUnstageVolume,
}

/// Job that runs a plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobRef {
    pub namespace: String,
    pub id: String,
}

/// One running plugin instance as reported by fingerprinting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInstance {
    pub node_id: NodeId,
    pub role: PluginRole,
    pub healthy: bool,
    #[serde(default)]
    pub health_description: String,
    /// Topology the node plugin reports for its node.
    #[serde(default)]
    pub topology: Option<Topology>,
    #[serde(default)]
    pub capabilities: Vec<PluginCapability>,
    /// QUIC address of the plugin's CSI endpoint.
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub job: Option<JobRef>,
}

/// A fingerprint report for one plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFingerprint {
    pub plugin_id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub version: String,
    pub instance: PluginInstance,
}

/// Every known instance of one plugin ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plugin {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub version: String,
    /// Controller-serving instances keyed by node.
    #[serde(default)]
    pub controllers: BTreeMap<NodeId, PluginInstance>,
    /// Node-serving instances keyed by node.
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, PluginInstance>,
}

impl Plugin {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: String::new(),
            version: String::new(),
            controllers: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn controllers_healthy(&self) -> usize {
        self.controllers.values().filter(|i| i.healthy).count()
    }

    pub fn nodes_healthy(&self) -> usize {
        self.nodes.values().filter(|i| i.healthy).count()
    }

    /// A claim can only be served with a healthy controller and node.
    pub fn is_schedulable(&self) -> bool {
        self.controllers_healthy() > 0 && self.nodes_healthy() > 0
    }

    pub fn healthy_node(&self, node_id: &NodeId) -> Option<&PluginInstance> {
        self.nodes.get(node_id).filter(|i| i.healthy)
    }

    /// Pick the controller for a claim on `node_id`.
    ///
    /// A healthy controller on the same node wins (monolith deployments),
    /// otherwise the first healthy one in node order.
    pub fn healthy_controller(&self, node_id: &NodeId) -> Option<&PluginInstance> {
        self.controllers
            .get(node_id)
            .filter(|i| i.healthy)
            .or_else(|| self.controllers.values().find(|i| i.healthy))
    }

    /// Jobs running instances of this plugin, grouped by namespace.
    pub fn jobs(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut jobs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for job in self
            .controllers
            .values()
            .chain(self.nodes.values())
            .filter_map(|i| i.job.as_ref())
        {
            jobs.entry(job.namespace.clone())
                .or_default()
                .insert(job.id.clone());
        }
        jobs
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty() && self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Plugin requests
// ---------------------------------------------------------------------------

/// Make a volume available on a node (controller side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Revoke a node's access to a volume (controller side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point shared by every claim on the node.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: PublishContext,
    /// Opaque context registered with the volume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Per-instance target path.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub publish_context: PublishContext,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}
