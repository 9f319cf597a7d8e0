//! The feature descriptor ("schematic") submitted to an image factory.
//!
//! A schematic is identified by the SHA-256 of its canonical YAML encoding. The encoding
//! produced by [`Schematic::to_canonical_yaml`] matches the one the image factory itself uses,
//! so an ID computed offline is the same ID the factory would hand out for the same content.
//! Unknown keys are rejected, as they would silently be left out of the ID.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::yaml;

/// Requested customizations of an installer or boot image.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Schematic {
    /// Board specific overlay, used for single board computers.
    #[serde(default, skip_serializing_if = "Overlay::is_empty")]
    pub overlay: Overlay,

    #[serde(default)]
    pub customization: Customization,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Overlay {
    /// Overlay image, e.g. `siderolabs/sbc-raspberrypi`.
    #[serde(default)]
    pub image: String,

    /// Overlay name, e.g. `rpi_generic`.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl Overlay {
    pub fn is_empty(&self) -> bool {
        self.image.is_empty() && self.name.is_empty() && self.options.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Customization {
    /// Kernel arguments appended to the default kernel command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,

    /// Initial values of the META partition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<MetaValue>,

    #[serde(default, skip_serializing_if = "SystemExtensions::is_empty")]
    pub system_extensions: SystemExtensions,

    #[serde(
        default,
        rename = "secureboot",
        skip_serializing_if = "SecureBoot::is_empty"
    )]
    pub secure_boot: SecureBoot,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemExtensions {
    /// Names of official system extensions, e.g. `siderolabs/intel-ucode`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub official_extensions: Vec<String>,
}

impl SystemExtensions {
    pub fn is_empty(&self) -> bool {
        self.official_extensions.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecureBoot {
    /// Also trust the well-known UEFI certificates when enrolling keys.
    #[serde(default)]
    pub include_well_known_certificates: bool,
}

impl SecureBoot {
    pub fn is_empty(&self) -> bool {
        !self.include_well_known_certificates
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetaValue {
    pub key: u8,
    pub value: String,
}

impl Schematic {
    /// Returns the content-derived identifier of this schematic.
    ///
    /// The empty schematic yields
    /// `376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba`.
    pub fn id(&self) -> String {
        hex::encode(Sha256::digest(self.to_canonical_yaml().as_bytes()))
    }

    /// Encodes the schematic in the canonical form used for hashing and for submission.
    ///
    /// Fields keep their declaration order, empty sections are omitted except `customization`,
    /// and overlay options are sorted.
    pub fn to_canonical_yaml(&self) -> String {
        yaml::to_string(&self.to_value())
    }

    fn to_value(&self) -> Value {
        let mut root = Mapping::new();
        if !self.overlay.is_empty() {
            root.insert("overlay".into(), self.overlay.to_value());
        }
        root.insert("customization".into(), self.customization.to_value());
        Value::Mapping(root)
    }
}

impl Overlay {
    fn to_value(&self) -> Value {
        let mut overlay = Mapping::new();
        overlay.insert("image".into(), self.image.as_str().into());
        overlay.insert("name".into(), self.name.as_str().into());
        if !self.options.is_empty() {
            let options = self
                .options
                .iter()
                .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
                .collect();
            overlay.insert("options".into(), sorted(Value::Mapping(options)));
        }
        Value::Mapping(overlay)
    }
}

impl Customization {
    fn to_value(&self) -> Value {
        let mut customization = Mapping::new();
        if !self.extra_kernel_args.is_empty() {
            customization.insert("extraKernelArgs".into(), strings(&self.extra_kernel_args));
        }
        if !self.meta.is_empty() {
            let meta = self
                .meta
                .iter()
                .map(|meta| {
                    let mut item = Mapping::new();
                    item.insert("key".into(), meta.key.into());
                    item.insert("value".into(), meta.value.as_str().into());
                    Value::Mapping(item)
                })
                .collect();
            customization.insert("meta".into(), Value::Sequence(meta));
        }
        if !self.system_extensions.is_empty() {
            let mut extensions = Mapping::new();
            extensions.insert(
                "officialExtensions".into(),
                strings(&self.system_extensions.official_extensions),
            );
            customization.insert("systemExtensions".into(), Value::Mapping(extensions));
        }
        if !self.secure_boot.is_empty() {
            let mut secure_boot = Mapping::new();
            secure_boot.insert("includeWellKnownCertificates".into(), true.into());
            customization.insert("secureboot".into(), Value::Mapping(secure_boot));
        }
        Value::Mapping(customization)
    }
}

fn strings(items: &[String]) -> Value {
    Value::Sequence(items.iter().map(|item| item.as_str().into()).collect())
}

/// Sorts the keys of every mapping in `value`, the way free-form maps are encoded.
fn sorted(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(Value, Value)> = mapping
                .into_iter()
                .map(|(key, value)| (key, sorted(value)))
                .collect();
            entries.sort_by(|(left, _), (right, _)| match (left, right) {
                (Value::String(left), Value::String(right)) => yaml::compare_keys(left, right),
                _ => std::cmp::Ordering::Equal,
            });
            Value::Mapping(entries.into_iter().collect())
        }
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
