//! The cluster secrets bundle, in the layout of a Talos `secrets.yaml`.
//!
//! Certificates and keys are stored as base64 encoded PEM, exactly as they end up in the machine
//! configs.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::machine_config::CertAndKey;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read secrets bundle {path:?}"))]
    ReadSecretsFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to parse secrets bundle {path:?}"))]
    ParseSecretsFile {
        source: serde_yaml::Error,
        path: std::path::PathBuf,
    },
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SecretsBundle {
    pub cluster: ClusterIdentity,
    pub secrets: Secrets,
    #[serde(rename = "trustdinfo")]
    pub trustd_info: TrustdInfo,
    pub certs: Certs,
}

impl SecretsBundle {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context(ReadSecretsFileSnafu { path })?;
        serde_yaml::from_str(&contents).context(ParseSecretsFileSnafu { path })
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterIdentity {
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Secrets {
    #[serde(rename = "bootstraptoken")]
    pub bootstrap_token: String,

    #[serde(default, rename = "secretboxencryptionsecret")]
    pub secretbox_encryption_secret: String,

    /// Only present in bundles created by Talos versions before secretbox encryption.
    #[serde(
        default,
        rename = "aescbcencryptionsecret",
        skip_serializing_if = "String::is_empty"
    )]
    pub aescbc_encryption_secret: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrustdInfo {
    pub token: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Certs {
    pub etcd: CertAndKey,
    pub k8s: CertAndKey,
    #[serde(rename = "k8saggregator")]
    pub k8s_aggregator: CertAndKey,
    #[serde(rename = "k8sserviceaccount")]
    pub k8s_service_account: CertAndKey,
    pub os: CertAndKey,
}
