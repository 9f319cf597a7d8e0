//! Cluster-wide input shared by every node: versions, secrets and generation options.

use std::{collections::BTreeMap, fmt::Display};

use semver::Version;
use snafu::{ResultExt, Snafu};
use tracing::debug;
use url::Url;

use crate::{
    cluster::ClusterSpec,
    machine_config::{
        CONFIG_VERSION, CertAndKey, Cluster, ClusterNetwork, Component, ControlPlane, Discovery,
        Etcd, Features, HostDns, Install, KubePrism, Kubelet, Machine, MachineConfig,
        MachineType, Network,
    },
    secrets::SecretsBundle,
};

pub const INSTALLER_IMAGE: &str = "ghcr.io/siderolabs/installer";
pub const KUBELET_IMAGE: &str = "ghcr.io/siderolabs/kubelet";
pub const KUBERNETES_REGISTRY: &str = "registry.k8s.io";
pub const DEFAULT_INSTALL_DISK: &str = "/dev/sda";
pub const KUBE_PRISM_PORT: u16 = 7445;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse {input:?} as Talos version"))]
    ParseTalosVersion {
        source: semver::Error,
        input: String,
    },
}

/// Which machine config features a Talos version understands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionContract {
    version: Version,
}

impl VersionContract {
    /// Parses a version tag such as `v1.7.0` or `v1.7`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim().trim_start_matches('v');
        let normalized = match trimmed.matches('.').count() {
            1 => format!("{trimmed}.0"),
            _ => trimmed.to_owned(),
        };
        let version = Version::parse(&normalized).context(ParseTalosVersionSnafu { input })?;
        Ok(Self { version })
    }

    fn at_least(&self, major: u64, minor: u64) -> bool {
        (self.version.major, self.version.minor) >= (major, minor)
    }

    pub fn secretbox_encryption_supported(&self) -> bool {
        self.at_least(0, 13)
    }

    pub fn cluster_discovery_enabled(&self) -> bool {
        self.at_least(0, 14)
    }

    pub fn kubelet_default_runtime_seccomp_profile_enabled(&self) -> bool {
        self.at_least(1, 2)
    }

    pub fn kubelet_manifests_directory_disabled(&self) -> bool {
        self.at_least(1, 2)
    }

    pub fn apid_ext_key_usage_check_enabled(&self) -> bool {
        self.at_least(1, 3)
    }

    pub fn stable_hostname_enabled(&self) -> bool {
        self.at_least(1, 5)
    }

    pub fn disk_quota_support_enabled(&self) -> bool {
        self.at_least(1, 5)
    }

    pub fn kube_prism_enabled(&self) -> bool {
        self.at_least(1, 6)
    }

    pub fn host_dns_enabled(&self) -> bool {
        self.at_least(1, 7)
    }
}

impl Display for VersionContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.version.major, self.version.minor)
    }
}

/// Everything needed to produce the base document of any node in the cluster.
///
/// Built once per run and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct GenerationInput {
    pub cluster_name: String,
    pub endpoint: Url,
    pub talos_version: String,
    pub kubernetes_version: String,
    pub dns_domain: String,
    pub pod_subnets: Vec<String>,
    pub service_subnets: Vec<String>,
    pub allow_scheduling_on_control_planes: bool,
    pub additional_api_server_cert_sans: Vec<String>,
    pub additional_machine_cert_sans: Vec<String>,
    pub version_contract: VersionContract,
    pub secrets: SecretsBundle,
}

impl GenerationInput {
    pub fn new(cluster: &ClusterSpec, secrets: SecretsBundle) -> Result<Self> {
        let version_contract = VersionContract::parse(&cluster.talos_version)?;
        debug!(
            %version_contract,
            talos.version = %cluster.talos_version,
            "resolved version contract"
        );

        Ok(Self {
            cluster_name: cluster.cluster_name.clone(),
            endpoint: cluster.endpoint.clone(),
            talos_version: cluster.talos_version.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            dns_domain: cluster.domain.clone(),
            pod_subnets: cluster.cluster_pod_nets.clone(),
            service_subnets: cluster.cluster_svc_nets.clone(),
            allow_scheduling_on_control_planes: cluster.allow_scheduling_on_control_planes,
            additional_api_server_cert_sans: cluster.additional_api_server_cert_sans.clone(),
            additional_machine_cert_sans: cluster.additional_machine_cert_sans.clone(),
            version_contract,
            secrets,
        })
    }

    /// Kubernetes version as image tag, always with a leading `v`.
    fn kubernetes_tag(&self) -> String {
        format!("v{}", self.kubernetes_version.trim_start_matches('v'))
    }

    fn kubernetes_image(&self, component: &str) -> String {
        format!(
            "{KUBERNETES_REGISTRY}/{component}:{tag}",
            tag = self.kubernetes_tag()
        )
    }

    /// The default document for a node of the given type, before any node settings are applied.
    pub fn base_config(&self, machine_type: MachineType) -> MachineConfig {
        let contract = &self.version_contract;
        let certs = &self.secrets.certs;
        let is_control_plane = machine_type == MachineType::ControlPlane;

        let machine = Machine {
            machine_type,
            token: self.secrets.trustd_info.token.clone(),
            ca: ca_for(&certs.os, is_control_plane),
            cert_sans: self.additional_machine_cert_sans.clone(),
            kubelet: Kubelet {
                image: format!("{KUBELET_IMAGE}:{tag}", tag = self.kubernetes_tag()),
                default_runtime_seccomp_profile_enabled: contract
                    .kubelet_default_runtime_seccomp_profile_enabled()
                    .then_some(true),
                disable_manifests_directory: contract
                    .kubelet_manifests_directory_disabled()
                    .then_some(true),
                extra: BTreeMap::new(),
            },
            network: Network::default(),
            disks: Vec::new(),
            install: Install {
                disk: DEFAULT_INSTALL_DISK.to_owned(),
                image: format!("{INSTALLER_IMAGE}:{version}", version = self.talos_version),
                ..Install::default()
            },
            kernel: None,
            files: Vec::new(),
            node_labels: None,
            features: Some(self.features()),
            extra: BTreeMap::new(),
        };

        MachineConfig {
            version: CONFIG_VERSION.to_owned(),
            debug: false,
            persist: true,
            machine,
            cluster: Some(self.cluster_config(is_control_plane)),
            extra: BTreeMap::new(),
        }
    }

    fn features(&self) -> Features {
        let contract = &self.version_contract;
        Features {
            rbac: Some(true),
            stable_hostname: contract.stable_hostname_enabled().then_some(true),
            apid_check_ext_key_usage: contract.apid_ext_key_usage_check_enabled().then_some(true),
            disk_quota_support: contract.disk_quota_support_enabled().then_some(true),
            kube_prism: contract.kube_prism_enabled().then_some(KubePrism {
                enabled: true,
                port: KUBE_PRISM_PORT,
            }),
            host_dns: contract.host_dns_enabled().then_some(HostDns {
                enabled: true,
                forward_kube_dns_to_host: true,
            }),
            extra: BTreeMap::new(),
        }
    }

    fn cluster_config(&self, is_control_plane: bool) -> Cluster {
        let contract = &self.version_contract;
        let secrets = &self.secrets;
        let certs = &secrets.certs;

        let mut cluster = Cluster {
            id: secrets.cluster.id.clone(),
            secret: secrets.cluster.secret.clone(),
            control_plane: ControlPlane {
                endpoint: self.endpoint.as_str().trim_end_matches('/').to_owned(),
            },
            cluster_name: self.cluster_name.clone(),
            network: ClusterNetwork {
                dns_domain: self.dns_domain.clone(),
                pod_subnets: self.pod_subnets.clone(),
                service_subnets: self.service_subnets.clone(),
                extra: BTreeMap::new(),
            },
            token: secrets.secrets.bootstrap_token.clone(),
            secretbox_encryption_secret: String::new(),
            aescbc_encryption_secret: String::new(),
            ca: ca_for(&certs.k8s, is_control_plane),
            aggregator_ca: None,
            service_account: None,
            api_server: None,
            controller_manager: None,
            scheduler: None,
            discovery: contract.cluster_discovery_enabled().then(|| Discovery {
                enabled: true,
                extra: BTreeMap::new(),
            }),
            etcd: None,
            allow_scheduling_on_control_planes: None,
            extra: BTreeMap::new(),
        };

        if is_control_plane {
            if contract.secretbox_encryption_supported() {
                cluster
                    .secretbox_encryption_secret
                    .clone_from(&secrets.secrets.secretbox_encryption_secret);
            } else {
                cluster
                    .aescbc_encryption_secret
                    .clone_from(&secrets.secrets.aescbc_encryption_secret);
            }
            cluster.aggregator_ca = Some(certs.k8s_aggregator.clone());
            cluster.service_account = Some(CertAndKey {
                crt: String::new(),
                key: certs.k8s_service_account.key.clone(),
            });
            cluster.api_server = Some(Component {
                image: self.kubernetes_image("kube-apiserver"),
                cert_sans: self.api_server_cert_sans(),
                extra: BTreeMap::new(),
            });
            cluster.controller_manager = Some(Component {
                image: self.kubernetes_image("kube-controller-manager"),
                ..Component::default()
            });
            cluster.scheduler = Some(Component {
                image: self.kubernetes_image("kube-scheduler"),
                ..Component::default()
            });
            cluster.etcd = Some(Etcd {
                ca: certs.etcd.clone(),
                extra: BTreeMap::new(),
            });
            cluster.allow_scheduling_on_control_planes = self
                .allow_scheduling_on_control_planes
                .then_some(true);
        }

        cluster
    }

    /// The endpoint host followed by the additional SANs, without duplicates.
    fn api_server_cert_sans(&self) -> Vec<String> {
        let mut sans: Vec<String> = self
            .endpoint
            .host_str()
            .map(str::to_owned)
            .into_iter()
            .collect();
        for san in &self.additional_api_server_cert_sans {
            if !sans.contains(san) {
                sans.push(san.clone());
            }
        }
        sans
    }
}

/// Control plane nodes get the full CA, workers only its certificate.
fn ca_for(ca: &CertAndKey, with_key: bool) -> CertAndKey {
    CertAndKey {
        crt: ca.crt.clone(),
        key: if with_key { ca.key.clone() } else { String::new() },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rstest::rstest;

    use super::*;
    use crate::secrets::{Certs, ClusterIdentity, Secrets, TrustdInfo};

    pub(crate) fn secrets_bundle() -> SecretsBundle {
        let pair = |name: &str| CertAndKey {
            crt: format!("{name}-crt"),
            key: format!("{name}-key"),
        };
        SecretsBundle {
            cluster: ClusterIdentity {
                id: "cluster-id".to_owned(),
                secret: "cluster-secret".to_owned(),
            },
            secrets: Secrets {
                bootstrap_token: "abcdef.0123456789abcdef".to_owned(),
                secretbox_encryption_secret: "secretbox".to_owned(),
                aescbc_encryption_secret: String::new(),
            },
            trustd_info: TrustdInfo {
                token: "trustd.0123456789abcdef".to_owned(),
            },
            certs: Certs {
                etcd: pair("etcd"),
                k8s: pair("k8s"),
                k8s_aggregator: pair("aggregator"),
                k8s_service_account: CertAndKey {
                    crt: String::new(),
                    key: "sa-key".to_owned(),
                },
                os: pair("os"),
            },
        }
    }

    pub(crate) fn generation_input(talos_version: &str) -> GenerationInput {
        let cluster: ClusterSpec = serde_yaml::from_str(&format!(
            "clusterName: homelab\nendpoint: https://192.168.1.10:6443\ntalosVersion: {talos_version}\n"
        ))
        .expect("test YAML is valid");
        GenerationInput::new(&cluster, secrets_bundle()).expect("version is valid")
    }

    #[rstest]
    #[case("v1.7.0", "v1.7")]
    #[case("v1.6", "v1.6")]
    #[case("1.5.3", "v1.5")]
    #[case("v1.8.0-alpha.1", "v1.8")]
    fn parses_version_tags(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(VersionContract::parse(input).unwrap().to_string(), expected);
    }

    #[test]
    fn rejects_garbage_versions() {
        assert!(VersionContract::parse("latest").is_err());
    }

    #[rstest]
    #[case("v0.12", false, false, false)]
    #[case("v0.14", true, false, false)]
    #[case("v1.6", true, true, false)]
    #[case("v1.7", true, true, true)]
    fn feature_flags_follow_version(
        #[case] version: &str,
        #[case] secretbox: bool,
        #[case] kube_prism: bool,
        #[case] host_dns: bool,
    ) {
        let contract = VersionContract::parse(version).unwrap();

        assert_eq!(contract.secretbox_encryption_supported(), secretbox);
        assert_eq!(contract.kube_prism_enabled(), kube_prism);
        assert_eq!(contract.host_dns_enabled(), host_dns);
    }

    #[test]
    fn worker_base_config_carries_no_keys() {
        let config = generation_input("v1.7.0").base_config(MachineType::Worker);
        let cluster = config.cluster.expect("cluster section is set");

        assert_eq!(config.machine.ca.key, "");
        assert_eq!(cluster.ca.key, "");
        assert!(cluster.aggregator_ca.is_none());
        assert!(cluster.api_server.is_none());
        assert_eq!(cluster.secretbox_encryption_secret, "");
        assert_eq!(
            config.machine.install.image,
            "ghcr.io/siderolabs/installer:v1.7.0"
        );
    }

    #[test]
    fn control_plane_base_config_carries_keys_and_images() {
        let config = generation_input("v1.6.0").base_config(MachineType::ControlPlane);
        let cluster = config.cluster.expect("cluster section is set");

        assert_eq!(config.machine.ca.key, "os-key");
        assert_eq!(cluster.ca.key, "k8s-key");
        assert_eq!(cluster.secretbox_encryption_secret, "secretbox");
        assert_eq!(
            cluster.api_server.map(|c| (c.image, c.cert_sans)),
            Some((
                "registry.k8s.io/kube-apiserver:v1.30.0".to_owned(),
                vec!["192.168.1.10".to_owned()]
            ))
        );
        assert_eq!(
            config.machine.features.and_then(|f| f.kube_prism),
            Some(KubePrism {
                enabled: true,
                port: KUBE_PRISM_PORT
            })
        );
    }
}
