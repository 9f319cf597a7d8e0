//! The `talosconfig` client configuration, with an admin certificate signed by the OS CA.

use std::{collections::BTreeMap, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use const_oid::db::rfc5280::ID_KP_CLIENT_AUTH;
use ed25519_dalek::{
    SignatureError, SigningKey, VerifyingKey,
    ed25519::signature::{Keypair, Signer},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        self, DecodePem, EncodePem,
        asn1::BitString,
        pem::{self, LineEnding},
    },
    ext::pkix::ExtendedKeyUsage,
    name::Name,
    serial_number::SerialNumber,
    spki::{
        AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, SignatureBitStringEncoding,
        SubjectPublicKeyInfoOwned,
    },
    time::Validity,
};

use crate::{cluster::ClusterSpec, machine_config::CertAndKey};

pub const ADMIN_SUBJECT: &str = "O=os:admin";
pub const ADMIN_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const PRIVATE_KEY_PEM_LABEL: &str = "ED25519 PRIVATE KEY";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode base64 encoded {what} of the OS CA"))]
    DecodeBase64 {
        source: base64::DecodeError,
        what: &'static str,
    },

    #[snafu(display("failed to parse OS CA certificate"))]
    ParseCaCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to decode OS CA key PEM"))]
    DecodeCaKeyPem { source: pem::Error },

    #[snafu(display("failed to parse OS CA key, only Ed25519 keys are supported"))]
    ParseCaKey { source: ed25519_dalek::pkcs8::Error },

    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: &'static str,
    },

    #[snafu(display(
        "the admin certificate would outlive the OS CA, CA notAfter {ca_not_after:?}, \
        cert notAfter {cert_not_after:?}"
    ))]
    CertOutlivesCa {
        ca_not_after: std::time::SystemTime,
        cert_not_after: std::time::SystemTime,
    },

    #[snafu(display("failed to serialize public key as PEM"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from PEM"))]
    DecodeSpkiFromPem { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to encode admin certificate as PEM"))]
    EncodeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to encode admin key"))]
    EncodeKey { source: ed25519_dalek::pkcs8::Error },

    #[snafu(display("failed to encode admin key as PEM"))]
    EncodeKeyPem { source: pem::Error },

    #[snafu(display("failed to serialize client config"))]
    SerializeClientConfig { source: serde_yaml::Error },
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TalosConfig {
    pub context: String,
    pub contexts: BTreeMap<String, Context>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Context {
    pub endpoints: Vec<String>,
    pub nodes: Vec<String>,
    pub ca: String,
    pub crt: String,
    pub key: String,
}

impl TalosConfig {
    /// Creates the client config for `cluster`, with a fresh admin certificate signed by `os_ca`.
    #[instrument(skip_all, fields(cluster.name = %cluster.cluster_name))]
    pub fn generate(cluster: &ClusterSpec, os_ca: &CertAndKey) -> Result<Self> {
        let admin = AdminCredentials::issue(os_ca)?;

        let endpoints = cluster
            .nodes
            .iter()
            .filter(|node| node.control_plane && !node.ip_address.is_empty())
            .map(|node| node.ip_address.clone())
            .collect();
        let nodes = cluster
            .nodes
            .iter()
            .filter(|node| !node.ip_address.is_empty())
            .map(|node| node.ip_address.clone())
            .collect();

        let context = Context {
            endpoints,
            nodes,
            ca: os_ca.crt.clone(),
            crt: STANDARD.encode(admin.certificate_pem),
            key: STANDARD.encode(admin.key_pem),
        };

        Ok(Self {
            context: cluster.cluster_name.clone(),
            contexts: BTreeMap::from([(cluster.cluster_name.clone(), context)]),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context(SerializeClientConfigSnafu)
    }
}

/// An Ed25519 signature, in the form a certificate carries it.
#[derive(Clone, Debug)]
struct CertificateSignature(ed25519_dalek::Signature);

impl SignatureBitStringEncoding for CertificateSignature {
    fn to_bitstring(&self) -> der::Result<BitString> {
        BitString::from_bytes(&self.0.to_bytes())
    }
}

/// Signs certificates with an Ed25519 CA key.
struct CaSigner(SigningKey);

impl Keypair for CaSigner {
    type VerifyingKey = VerifyingKey;

    fn verifying_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

impl DynSignatureAlgorithmIdentifier for CaSigner {
    fn signature_algorithm_identifier(&self) -> x509_cert::spki::Result<AlgorithmIdentifierOwned> {
        self.0.signature_algorithm_identifier()
    }
}

impl Signer<CertificateSignature> for CaSigner {
    fn try_sign(&self, message: &[u8]) -> Result<CertificateSignature, SignatureError> {
        self.0.try_sign(message).map(CertificateSignature)
    }
}

struct AdminCredentials {
    certificate_pem: String,
    key_pem: String,
}

impl AdminCredentials {
    fn issue(os_ca: &CertAndKey) -> Result<Self> {
        let ca_cert_pem = STANDARD
            .decode(&os_ca.crt)
            .context(DecodeBase64Snafu { what: "certificate" })?;
        let ca_cert = Certificate::from_pem(&ca_cert_pem).context(ParseCaCertificateSnafu)?;

        let ca_key_pem = STANDARD
            .decode(&os_ca.key)
            .context(DecodeBase64Snafu { what: "key" })?;
        // Talos labels the PKCS#8 document "ED25519 PRIVATE KEY", so the label is not checked.
        let (_label, ca_key_der) = pem::decode_vec(&ca_key_pem).context(DecodeCaKeyPemSnafu)?;
        let ca_key =
            CaSigner(SigningKey::from_pkcs8_der(&ca_key_der).context(ParseCaKeySnafu)?);

        let validity =
            Validity::from_now(ADMIN_CERTIFICATE_VALIDITY).context(ParseValiditySnafu)?;
        let ca_not_after = ca_cert
            .tbs_certificate
            .validity
            .not_after
            .to_system_time();
        let cert_not_after = validity.not_after.to_system_time();
        ensure!(ca_not_after > cert_not_after, CertOutlivesCaSnafu {
            ca_not_after,
            cert_not_after,
        });

        let subject: Name = ADMIN_SUBJECT.parse().context(ParseSubjectSnafu {
            subject: ADMIN_SUBJECT,
        })?;
        let key = SigningKey::generate(&mut OsRng);
        let spki_pem = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .context(SerializePublicKeySnafu)?;
        let spki = SubjectPublicKeyInfoOwned::from_pem(spki_pem.as_bytes())
            .context(DecodeSpkiFromPemSnafu)?;

        let serial_number = SerialNumber::from(rand::random::<u64>());
        debug!(
            certificate.subject = %subject,
            certificate.not_after = %validity.not_after,
            certificate.serial = %serial_number,
            certificate.signed_by.issuer = %ca_cert.tbs_certificate.subject,
            "creating and signing admin certificate"
        );

        let mut builder = CertificateBuilder::new(
            Profile::Leaf {
                issuer: ca_cert.tbs_certificate.subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            serial_number,
            validity,
            subject,
            spki,
            &ca_key,
        )
        .context(CreateCertificateBuilderSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_CLIENT_AUTH]))
            .context(AddCertificateExtensionSnafu)?;
        let certificate = builder
            .build::<CertificateSignature>()
            .context(BuildCertificateSnafu)?;

        let certificate_pem = certificate
            .to_pem(LineEnding::LF)
            .context(EncodeCertificateSnafu)?;
        let key_der = key.to_pkcs8_der().context(EncodeKeySnafu)?;
        let key_pem = pem::encode_string(PRIVATE_KEY_PEM_LABEL, LineEnding::LF, key_der.as_bytes())
            .context(EncodeKeyPemSnafu)?;

        Ok(Self {
            certificate_pem,
            key_pem,
        })
    }
}
