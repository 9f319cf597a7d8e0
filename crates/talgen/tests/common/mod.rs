use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::{
    SigningKey,
    pkcs8::{EncodePrivateKey as _, EncodePublicKey as _},
};
use indoc::formatdoc;
use talgen::{cluster::ClusterSpec, generate::GenerateOptions, machine_config::ValidationMode};
use tempfile::TempDir;
use x509_cert::{
    builder::{Builder as _, CertificateBuilder, Profile},
    der::{
        DecodePem as _, EncodePem as _,
        pem::{self, LineEnding},
    },
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

const TEN_YEARS: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A secrets bundle whose OS CA is a real, self-signed Ed25519 CA.
pub fn secrets_yaml() -> String {
    let key = SigningKey::from_bytes(&[42u8; 32]);
    let spki_pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes()).unwrap();
    let certificate = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(1u64),
        Validity::from_now(TEN_YEARS).unwrap(),
        "O=talos".parse().unwrap(),
        spki,
        &key,
    )
    .unwrap()
    .build::<ed25519_dalek::Signature>()
    .unwrap();
    let key_der = key.to_pkcs8_der().unwrap();
    let key_pem =
        pem::encode_string("ED25519 PRIVATE KEY", LineEnding::LF, key_der.as_bytes()).unwrap();

    let os_crt = STANDARD.encode(certificate.to_pem(LineEnding::LF).unwrap());
    let os_key = STANDARD.encode(key_pem);
    formatdoc! {"
        cluster:
          id: Y2x1c3Rlci1pZA==
          secret: Y2x1c3Rlci1zZWNyZXQ=
        secrets:
          bootstraptoken: abcdef.0123456789abcdef
          secretboxencryptionsecret: c2VjcmV0Ym94LXNlY3JldA==
        trustdinfo:
          token: trustd.0123456789abcdef
        certs:
          etcd:
            crt: ZXRjZC1jcnQ=
            key: ZXRjZC1rZXk=
          k8s:
            crt: azhzLWNydA==
            key: azhzLWtleQ==
          k8saggregator:
            crt: YWdnLWNydA==
            key: YWdnLWtleQ==
          k8sserviceaccount:
            key: c2Eta2V5
          os:
            crt: {os_crt}
            key: {os_key}
    "}
}

pub fn cluster(yaml: &str) -> ClusterSpec {
    serde_yaml::from_str(yaml).expect("test cluster YAML is valid")
}

pub fn secrets() -> talgen::secrets::SecretsBundle {
    serde_yaml::from_str(&secrets_yaml()).expect("test secrets YAML is valid")
}

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temporary directory"),
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("clusterconfig")
    }

    pub fn options(&self, dry_run: bool) -> GenerateOptions {
        GenerateOptions {
            out_dir: self.out_dir(),
            dry_run,
            mode: ValidationMode::Metal,
            offline: true,
        }
    }

    pub fn node_file(&self, name: &str) -> PathBuf {
        self.out_dir().join(name)
    }
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}
