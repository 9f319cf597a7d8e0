//! The declarative cluster file.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use talgen_factory::{ImageFactory, schematic::Schematic};
use url::Url;

use crate::machine_config::{
    InstallExtension, KernelModule, MachineDisk, MachineFile, NetworkInterface,
};

pub const DEFAULT_TALOS_VERSION: &str = "v1.7.0";
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.30.0";
pub const DEFAULT_DOMAIN: &str = "cluster.local";
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read cluster file {path:?}"))]
    ReadClusterFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to parse cluster file {path:?}"))]
    ParseClusterFile {
        source: serde_yaml::Error,
        path: std::path::PathBuf,
    },
}

/// A whole cluster: shared settings, the role and cluster-wide patches and all nodes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub cluster_name: String,

    #[serde(default = "default_talos_version")]
    pub talos_version: String,

    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    /// URL of the Kubernetes API, e.g. `https://192.168.1.10:6443`.
    pub endpoint: Url,

    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_pod_subnets")]
    pub cluster_pod_nets: Vec<String>,

    #[serde(default = "default_service_subnets")]
    pub cluster_svc_nets: Vec<String>,

    #[serde(default)]
    pub allow_scheduling_on_control_planes: bool,

    #[serde(default)]
    pub additional_api_server_cert_sans: Vec<String>,

    #[serde(default)]
    pub additional_machine_cert_sans: Vec<String>,

    #[serde(default)]
    pub image_factory: ImageFactory,

    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Patches for every control plane node.
    #[serde(default)]
    pub control_plane: PatchSet,

    /// Patches for every worker node.
    #[serde(default)]
    pub worker: PatchSet,

    /// Patches for every node, applied last.
    #[serde(flatten)]
    pub cluster_patches: PatchSet,
}

impl ClusterSpec {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context(ReadClusterFileSnafu { path })?;
        serde_yaml::from_str(&contents).context(ParseClusterFileSnafu { path })
    }

    /// Returns the patches of the role `node` belongs to.
    pub fn role_patches(&self, node: &Node) -> &PatchSet {
        if node.control_plane {
            &self.control_plane
        } else {
            &self.worker
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub hostname: String,

    /// Address the client config uses to reach the node. Left out of it when empty.
    #[serde(default)]
    pub ip_address: String,

    #[serde(default)]
    pub control_plane: bool,

    #[serde(default)]
    pub machine_spec: MachineSpec,

    /// Installer image to use instead of one built by the image factory. Gets the Talos
    /// version appended as tag.
    #[serde(default, rename = "talosImageURL")]
    pub talos_image_url: Option<String>,

    #[serde(default)]
    pub schematic: Option<Schematic>,

    #[serde(default)]
    pub nameservers: Vec<String>,

    #[serde(default)]
    pub disable_search_domain: bool,

    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default)]
    pub install_disk: String,

    #[serde(default)]
    pub install_disk_selector: Option<BTreeMap<String, serde_yaml::Value>>,

    #[serde(default)]
    pub machine_disks: Vec<MachineDisk>,

    #[serde(default)]
    pub kernel_modules: Vec<KernelModule>,

    #[serde(default)]
    pub node_labels: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub extensions: Vec<InstallExtension>,

    #[serde(default)]
    pub machine_files: Vec<MachineFile>,

    #[serde(flatten)]
    pub patch_set: PatchSet,
}

/// Hardware the node boots on, used for boot image references.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default = "default_arch")]
    pub arch: String,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            arch: default_arch(),
        }
    }
}

/// The three kinds of patches that can be attached to a node, a role or the whole cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    /// A strategic merge patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_patch: Option<serde_json::Value>,

    /// RFC 6902 operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<json_patch::PatchOperation>,

    /// Either `@path/to/patch.yaml` or the patch text itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
}

impl PatchSet {
    pub fn is_empty(&self) -> bool {
        self.inline_patch.is_none() && self.config_patches.is_empty() && self.patches.is_empty()
    }
}

fn default_talos_version() -> String {
    DEFAULT_TALOS_VERSION.to_owned()
}

fn default_kubernetes_version() -> String {
    DEFAULT_KUBERNETES_VERSION.to_owned()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_owned()
}

fn default_pod_subnets() -> Vec<String> {
    vec![DEFAULT_POD_SUBNET.to_owned()]
}

fn default_service_subnets() -> Vec<String> {
    vec![DEFAULT_SERVICE_SUBNET.to_owned()]
}

fn default_mode() -> String {
    "metal".to_owned()
}

fn default_arch() -> String {
    "amd64".to_owned()
}
