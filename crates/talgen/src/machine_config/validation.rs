//! Validation of a [`MachineConfig`] before it is written.
//!
//! All rules are checked and every violation is reported, so one run shows everything that needs
//! fixing.

use std::{fmt::Display, net::IpAddr, sync::LazyLock};

use const_format::concatcp;
use regex::Regex;
use snafu::Snafu;
use url::Url;

use super::{CONFIG_VERSION, Cluster, MachineConfig, MachineType, NetworkInterface};

/// This is a subdomain's max length in DNS (RFC 1123)
const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const RFC_1123_SUBDOMAIN_ERROR_MSG: &str = "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character";

const DOMAIN_MAX_LENGTH: usize = RFC_1123_SUBDOMAIN_MAX_LENGTH;
/// Same as [`RFC_1123_SUBDOMAIN_FMT`], but allows a trailing dot
const DOMAIN_FMT: &str = concatcp!(RFC_1123_SUBDOMAIN_FMT, "\\.?");
const DOMAIN_ERROR_MSG: &str = "a domain must consist of lower case alphanumeric characters, '-' or '.', and must start with an alphanumeric character and end with an alphanumeric character or '.'";

const FILE_OPS: &[&str] = &["create", "append", "overwrite"];

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{DOMAIN_FMT}$")).expect("failed to compile domain regex")
});

/// How strictly a config is checked, matching the platform it is generated for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum ValidationMode {
    /// Bare metal: the node installs itself, so an install disk and image are required.
    #[default]
    Metal,

    /// Cloud images come preinstalled, install settings are not checked.
    Cloud,

    /// Containers have neither install settings nor disks.
    Container,
}

impl ValidationMode {
    fn requires_install(self) -> bool {
        matches!(self, Self::Metal)
    }

    fn checks_disks(self) -> bool {
        !matches!(self, Self::Container)
    }
}

impl Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Metal => "metal",
            Self::Cloud => "cloud",
            Self::Container => "container",
        })
    }
}

/// A collection of violations discovered during validation.
#[derive(Debug)]
pub struct Violations(Vec<Violation>);

impl Violations {
    pub fn iter(&self) -> std::slice::Iter<'_, Violation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Violations {
    type IntoIter = std::slice::Iter<'a, Violation>;
    type Item = &'a Violation;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for Violations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            let prefix = match i {
                0 => "",
                _ => ", ",
            };
            write!(f, "{prefix}{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

/// A single broken rule.
#[derive(Debug, Snafu)]
pub enum Violation {
    #[snafu(display("unsupported config version {version:?}, expected {CONFIG_VERSION:?}"))]
    UnsupportedVersion { version: String },

    #[snafu(display("{field} {value:?} is {length} bytes long but must be no more than {max_length}"))]
    TooLong {
        field: &'static str,
        value: String,
        length: usize,
        max_length: usize,
    },

    #[snafu(display("{field} {value:?} is invalid: {msg} (regex used for validation is {regex:?})"))]
    Regex {
        field: &'static str,
        value: String,
        msg: &'static str,
        regex: &'static str,
    },

    #[snafu(display("nameserver {value:?} is not an IP address"))]
    InvalidNameserver { value: String },

    #[snafu(display("interface #{index} must set exactly one of interface and deviceSelector"))]
    AmbiguousInterface { index: usize },

    #[snafu(display("address {value:?} of interface #{index} is not in CIDR notation"))]
    InvalidInterfaceAddress { index: usize, value: String },

    #[snafu(display("file path {path:?} is not absolute"))]
    RelativeFilePath { path: String },

    #[snafu(display("file {path:?} has unsupported op {op:?}, expected one of {FILE_OPS:?}"))]
    UnsupportedFileOp { path: String, op: String },

    #[snafu(display("kernel module #{index} has no name"))]
    UnnamedKernelModule { index: usize },

    #[snafu(display("disk device {device:?} is not an absolute path"))]
    RelativeDiskDevice { device: String },

    #[snafu(display("install disk or install disk selector is required"))]
    MissingInstallDisk,

    #[snafu(display("install image is required"))]
    MissingInstallImage,

    #[snafu(display("cluster section is required"))]
    MissingCluster,

    #[snafu(display("cluster name is required"))]
    MissingClusterName,

    #[snafu(display("control plane endpoint {endpoint:?} is not a valid http(s) URL"))]
    InvalidEndpoint { endpoint: String },

    #[snafu(display("control plane config must carry the cluster CA key"))]
    MissingClusterCaKey,
}

/// Returns [`Ok`] if `config` satisfies every rule of `mode`, otherwise all violations.
pub fn validate(config: &MachineConfig, mode: ValidationMode) -> Result<(), Violations> {
    let mut violations = Vec::new();
    let machine = &config.machine;

    if config.version != CONFIG_VERSION {
        violations.push(Violation::UnsupportedVersion {
            version: config.version.clone(),
        });
    }

    let network = &machine.network;
    if !network.hostname.is_empty() {
        violations.extend(validate_name(
            "hostname",
            &network.hostname,
            RFC_1123_SUBDOMAIN_MAX_LENGTH,
            &RFC_1123_SUBDOMAIN_REGEX,
            RFC_1123_SUBDOMAIN_ERROR_MSG,
        ));
    }
    for nameserver in &network.nameservers {
        if nameserver.parse::<IpAddr>().is_err() {
            violations.push(Violation::InvalidNameserver {
                value: nameserver.clone(),
            });
        }
    }
    for (index, interface) in network.interfaces.iter().enumerate() {
        validate_interface(index, interface, &mut violations);
    }

    for file in &machine.files {
        if !file.path.starts_with('/') {
            violations.push(Violation::RelativeFilePath {
                path: file.path.clone(),
            });
        }
        if !FILE_OPS.contains(&file.op.as_str()) {
            violations.push(Violation::UnsupportedFileOp {
                path: file.path.clone(),
                op: file.op.clone(),
            });
        }
    }

    if let Some(kernel) = &machine.kernel {
        for (index, module) in kernel.modules.iter().enumerate() {
            if module.name.trim().is_empty() {
                violations.push(Violation::UnnamedKernelModule { index });
            }
        }
    }

    if mode.checks_disks() {
        for disk in &machine.disks {
            if !disk.device.starts_with('/') {
                violations.push(Violation::RelativeDiskDevice {
                    device: disk.device.clone(),
                });
            }
        }
    }

    if mode.requires_install() {
        let install = &machine.install;
        if install.disk.is_empty() && install.disk_selector.is_none() {
            violations.push(Violation::MissingInstallDisk);
        }
        if install.image.is_empty() {
            violations.push(Violation::MissingInstallImage);
        }
    }

    match &config.cluster {
        Some(cluster) => validate_cluster(cluster, machine.machine_type, &mut violations),
        None => violations.push(Violation::MissingCluster),
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Violations(violations))
    }
}

fn validate_cluster(cluster: &Cluster, machine_type: MachineType, violations: &mut Vec<Violation>) {
    if cluster.cluster_name.is_empty() {
        violations.push(Violation::MissingClusterName);
    }
    violations.extend(validate_name(
        "DNS domain",
        &cluster.network.dns_domain,
        DOMAIN_MAX_LENGTH,
        &DOMAIN_REGEX,
        DOMAIN_ERROR_MSG,
    ));
    if !is_http_url(&cluster.control_plane.endpoint) {
        violations.push(Violation::InvalidEndpoint {
            endpoint: cluster.control_plane.endpoint.clone(),
        });
    }
    if machine_type == MachineType::ControlPlane && cluster.ca.key.is_empty() {
        violations.push(Violation::MissingClusterCaKey);
    }
}

fn validate_interface(index: usize, interface: &NetworkInterface, violations: &mut Vec<Violation>) {
    if interface.interface.is_some() == interface.device_selector.is_some() {
        violations.push(Violation::AmbiguousInterface { index });
    }
    for address in &interface.addresses {
        if !is_cidr(address) {
            violations.push(Violation::InvalidInterfaceAddress {
                index,
                value: address.clone(),
            });
        }
    }
}

/// Checks length and format of a DNS name, reporting both if both are off.
fn validate_name(
    field: &'static str,
    value: &str,
    max_length: usize,
    regex: &'static Regex,
    msg: &'static str,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    if value.len() > max_length {
        violations.push(Violation::TooLong {
            field,
            value: value.to_owned(),
            length: value.len(),
            max_length,
        });
    }
    if !regex.is_match(value) {
        violations.push(Violation::Regex {
            field,
            value: value.to_owned(),
            msg,
            regex: regex
                .as_str()
                // Clean up start/end-of-line markers
                .trim_start_matches('^')
                .trim_end_matches('$'),
        });
    }
    violations
}

fn is_cidr(value: &str) -> bool {
    let Some((address, prefix)) = value.split_once('/') else {
        return false;
    };
    let (Ok(address), Ok(prefix)) = (address.parse::<IpAddr>(), prefix.parse::<u8>()) else {
        return false;
    };
    match address {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

fn is_http_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;
    use crate::machine_config::{
        CertAndKey, ClusterNetwork, ControlPlane, Install, Kubelet, Machine, MachineDisk,
        MachineFile,
    };

    fn control_plane() -> MachineConfig {
        MachineConfig {
            version: CONFIG_VERSION.to_owned(),
            debug: false,
            persist: true,
            machine: Machine {
                machine_type: MachineType::ControlPlane,
                token: "trustd".to_owned(),
                ca: CertAndKey::default(),
                cert_sans: Vec::new(),
                kubelet: Kubelet::default(),
                network: Default::default(),
                disks: Vec::new(),
                install: Install {
                    disk: "/dev/sda".to_owned(),
                    image: "ghcr.io/siderolabs/installer:v1.7.0".to_owned(),
                    ..Install::default()
                },
                kernel: None,
                files: Vec::new(),
                node_labels: None,
                features: None,
                extra: BTreeMap::new(),
            },
            cluster: Some(Cluster {
                id: "id".to_owned(),
                secret: "secret".to_owned(),
                control_plane: ControlPlane {
                    endpoint: "https://192.168.1.10:6443".to_owned(),
                },
                cluster_name: "homelab".to_owned(),
                network: ClusterNetwork {
                    dns_domain: "cluster.local".to_owned(),
                    ..ClusterNetwork::default()
                },
                token: "token".to_owned(),
                secretbox_encryption_secret: String::new(),
                aescbc_encryption_secret: String::new(),
                ca: CertAndKey {
                    crt: "crt".to_owned(),
                    key: "key".to_owned(),
                },
                aggregator_ca: None,
                service_account: None,
                api_server: None,
                controller_manager: None,
                scheduler: None,
                discovery: None,
                etcd: None,
                allow_scheduling_on_control_planes: None,
                extra: BTreeMap::new(),
            }),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_config_passes() {
        validate(&control_plane(), ValidationMode::Metal).expect("config is valid");
    }

    #[rstest]
    #[case("cp-1", true)]
    #[case("cp-1.homelab.example.com", true)]
    #[case("CP-1", false)]
    #[case("cp_1", false)]
    #[case("-cp", false)]
    fn hostnames(#[case] hostname: &str, #[case] valid: bool) {
        let mut config = control_plane();
        config.machine.network.hostname = hostname.to_owned();

        assert_eq!(validate(&config, ValidationMode::Metal).is_ok(), valid);
    }

    #[rstest]
    #[case("192.168.1.20/24", true)]
    #[case("fd00::20/64", true)]
    #[case("192.168.1.20", false)]
    #[case("192.168.1.20/33", false)]
    #[case("eth0/24", false)]
    fn cidr_addresses(#[case] address: &str, #[case] valid: bool) {
        assert_eq!(is_cidr(address), valid);
    }

    #[test]
    fn all_violations_are_collected() {
        let mut config = control_plane();
        config.version = "v1alpha2".to_owned();
        config.machine.network.nameservers = vec!["1.1.1.1".to_owned(), "dns.local".to_owned()];
        config.machine.network.interfaces = vec![NetworkInterface::default()];
        config.machine.files = vec![MachineFile {
            content: "x".to_owned(),
            permissions: 0o644,
            path: "etc/motd".to_owned(),
            op: "replace".to_owned(),
        }];
        if let Some(cluster) = config.cluster.as_mut() {
            cluster.ca.key = String::new();
            cluster.control_plane.endpoint = "192.168.1.10:6443".to_owned();
        }

        let violations = validate(&config, ValidationMode::Metal).unwrap_err();

        assert!(matches!(
            violations.iter().collect::<Vec<_>>()[..],
            [
                Violation::UnsupportedVersion { .. },
                Violation::InvalidNameserver { .. },
                Violation::AmbiguousInterface { index: 0 },
                Violation::RelativeFilePath { .. },
                Violation::UnsupportedFileOp { .. },
                Violation::InvalidEndpoint { .. },
                Violation::MissingClusterCaKey,
            ]
        ));
        assert_eq!(violations.len(), 7);
    }

    #[rstest]
    #[case(ValidationMode::Metal, 3)]
    #[case(ValidationMode::Cloud, 1)]
    #[case(ValidationMode::Container, 0)]
    fn modes_relax_install_and_disk_checks(#[case] mode: ValidationMode, #[case] expected: usize) {
        let mut config = control_plane();
        config.machine.install = Install::default();
        config.machine.disks = vec![MachineDisk {
            device: "sdb".to_owned(),
            ..MachineDisk::default()
        }];

        let found = validate(&config, mode).err().map_or(0, |violations| violations.len());

        assert_eq!(found, expected);
    }

    #[test]
    fn violations_display_as_list() {
        let mut config = control_plane();
        config.machine.network.nameservers = vec!["a".to_owned(), "b".to_owned()];

        let violations = validate(&config, ValidationMode::Metal).unwrap_err();

        assert_eq!(
            violations.to_string(),
            "nameserver \"a\" is not an IP address, nameserver \"b\" is not an IP address"
        );
    }
}
