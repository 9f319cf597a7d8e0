//! A typed subset of the Talos `v1alpha1` machine configuration.
//!
//! Only the fields this crate reads or writes are typed. Every struct carries the remaining keys
//! in a flattened, sorted [`Extra`] map, so nothing a patch adds is lost on the way through
//! [`validate_and_reencode`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub mod encode;
pub mod validation;

pub use validation::{ValidationMode, Violations};

/// Keys outside the typed subset, kept verbatim.
pub type Extra = BTreeMap<String, serde_yaml::Value>;

pub const CONFIG_VERSION: &str = "v1alpha1";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse machine config"))]
    ParseMachineConfig { source: serde_yaml::Error },

    #[snafu(display("machine config is invalid for {mode} mode: {violations}"))]
    InvalidMachineConfig {
        violations: Violations,
        mode: ValidationMode,
    },

    #[snafu(display("failed to re-encode validated machine config"))]
    Reencode { source: encode::Error },
}

/// Parses `bytes`, validates the result for `mode` and returns its canonical encoding.
///
/// Two documents that only differ in key order or formatting re-encode to the same bytes.
pub fn validate_and_reencode(bytes: &[u8], mode: ValidationMode) -> Result<Vec<u8>> {
    let config: MachineConfig = serde_yaml::from_slice(bytes).context(ParseMachineConfigSnafu)?;
    validation::validate(&config, mode)
        .map_err(|violations| Error::InvalidMachineConfig { violations, mode })?;
    encode::to_canonical_bytes(&config).context(ReencodeSnafu)
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    #[serde(rename = "controlplane")]
    ControlPlane,
    Worker,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    pub version: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub persist: bool,

    pub machine: Machine,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Cluster>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    #[serde(rename = "type")]
    pub machine_type: MachineType,

    pub token: String,

    pub ca: CertAndKey,

    #[serde(default, rename = "certSANs")]
    pub cert_sans: Vec<String>,

    pub kubelet: Kubelet,

    #[serde(default)]
    pub network: Network,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<MachineDisk>,

    #[serde(default)]
    pub install: Install,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<Kernel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MachineFile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A PEM certificate and private key, each base64 encoded. Worker documents omit the key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertAndKey {
    #[serde(default)]
    pub crt: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubelet {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_runtime_seccomp_profile_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_manifests_directory: Option<bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_search_domain: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NetworkInterface>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A network device, selected either by name or by a device selector.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<Extra>,

    /// Addresses in CIDR notation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDisk {
    pub device: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<Extra>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Install {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_selector: Option<Extra>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<InstallExtension>,

    #[serde(default)]
    pub wipe: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstallExtension {
    pub image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Kernel {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<KernelModule>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KernelModule {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MachineFile {
    pub content: String,

    /// Unix mode bits, e.g. `0o644`.
    #[serde(default)]
    pub permissions: u32,

    pub path: String,

    /// One of `create`, `append` or `overwrite`.
    pub op: String,
}

/// Opt-in machine features. Which ones are set depends on the Talos version.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_hostname: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apid_check_ext_key_usage: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_quota_support: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_prism: Option<KubePrism>,

    #[serde(default, rename = "hostDNS", skip_serializing_if = "Option::is_none")]
    pub host_dns: Option<HostDns>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KubePrism {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostDns {
    pub enabled: bool,

    #[serde(default, rename = "forwardKubeDNSToHost")]
    pub forward_kube_dns_to_host: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,

    pub secret: String,

    pub control_plane: ControlPlane,

    pub cluster_name: String,

    pub network: ClusterNetwork,

    pub token: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secretbox_encryption_secret: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aescbc_encryption_secret: String,

    pub ca: CertAndKey,

    #[serde(default, rename = "aggregatorCA", skip_serializing_if = "Option::is_none")]
    pub aggregator_ca: Option<CertAndKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<CertAndKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager: Option<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Discovery>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<Etcd>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_scheduling_on_control_planes: Option<bool>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControlPlane {
    /// URL of the Kubernetes API.
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    pub dns_domain: String,

    #[serde(default)]
    pub pod_subnets: Vec<String>,

    #[serde(default)]
    pub service_subnets: Vec<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A control plane component running as static pod.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub image: String,

    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Discovery {
    pub enabled: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Etcd {
    pub ca: CertAndKey,

    #[serde(flatten)]
    pub extra: Extra,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const WORKER: &str = indoc! {"
        version: v1alpha1
        machine:
          type: worker
          token: trustd.token
          ca:
            crt: Y2VydA==
          certSANs: []
          kubelet:
            image: ghcr.io/siderolabs/kubelet:v1.30.0
            extraArgs:
              rotate-server-certificates: 'true'
          network:
            hostname: worker-1
          install:
            disk: /dev/sda
            image: ghcr.io/siderolabs/installer:v1.7.0
          sysctls:
            vm.nr_hugepages: '1024'
        cluster:
          id: cluster-id
          secret: cluster-secret
          controlPlane:
            endpoint: https://192.168.1.10:6443
          clusterName: homelab
          network:
            dnsDomain: cluster.local
          token: abcdef.0123456789abcdef
          ca:
            crt: Y2VydA==
    "};

    #[test]
    fn untyped_keys_survive_reencoding() {
        let bytes = validate_and_reencode(WORKER.as_bytes(), ValidationMode::Metal)
            .expect("worker config is valid");
        let reparsed: MachineConfig = serde_yaml::from_slice(&bytes).expect("output parses");

        assert_eq!(
            reparsed.machine.extra.get("sysctls"),
            Some(&serde_yaml::from_str("vm.nr_hugepages: '1024'").unwrap())
        );
        assert!(reparsed.machine.kubelet.extra.contains_key("extraArgs"));
    }

    #[test]
    fn reencoding_is_independent_of_key_order() {
        let reordered = indoc! {"
            cluster:
              token: abcdef.0123456789abcdef
              clusterName: homelab
              ca:
                crt: Y2VydA==
              id: cluster-id
              network:
                dnsDomain: cluster.local
              secret: cluster-secret
              controlPlane:
                endpoint: https://192.168.1.10:6443
            machine:
              install:
                image: ghcr.io/siderolabs/installer:v1.7.0
                disk: /dev/sda
              sysctls:
                vm.nr_hugepages: '1024'
              network:
                hostname: worker-1
              kubelet:
                extraArgs:
                  rotate-server-certificates: 'true'
                image: ghcr.io/siderolabs/kubelet:v1.30.0
              ca:
                crt: Y2VydA==
              token: trustd.token
              type: worker
            version: v1alpha1
        "};

        let first = validate_and_reencode(WORKER.as_bytes(), ValidationMode::Metal).unwrap();
        let second = validate_and_reencode(reordered.as_bytes(), ValidationMode::Metal).unwrap();

        assert_eq!(
            String::from_utf8(first).unwrap(),
            String::from_utf8(second).unwrap()
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = validate_and_reencode(b"machine: [", ValidationMode::Metal).unwrap_err();
        assert!(matches!(err, Error::ParseMachineConfig { .. }));
    }

    #[test]
    fn violations_are_reported_with_the_mode() {
        let invalid = WORKER.replace("hostname: worker-1", "hostname: Not_A_Host");

        let err = validate_and_reencode(invalid.as_bytes(), ValidationMode::Metal).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("metal mode"), "{message}");
        assert!(message.contains("Not_A_Host"), "{message}");
    }
}
