//! The layered patch pipeline.
//!
//! Patches are applied per scope, most specific first: node, then role (control plane or
//! worker), then cluster. Within a scope the inline patch comes first, then the config patches,
//! then the patch files. Every patch sees the result of all patches before it, so the cluster
//! scope has the last word.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use json_patch::PatchOperation;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    cluster::{ClusterSpec, Node, PatchSet},
    machine_config::MachineConfig,
};

pub mod merge;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to convert machine config into a patchable document"))]
    ConvertConfig { source: serde_json::Error },

    #[snafu(display("failed to serialize patched document"))]
    SerializeDocument { source: serde_yaml::Error },

    #[snafu(display("failed to apply inline patch at {scope} scope"))]
    ApplyInlinePatch { source: merge::Error, scope: Scope },

    #[snafu(display("failed to apply config patch #{index} at {scope} scope"))]
    ApplyConfigPatch {
        source: json_patch::PatchError,
        scope: Scope,
        index: usize,
    },

    #[snafu(display("failed to read patch file {path:?} at {scope} scope"))]
    ReadPatchFile {
        source: std::io::Error,
        path: PathBuf,
        scope: Scope,
    },

    #[snafu(display("failed to parse patch {origin} at {scope} scope"))]
    ParsePatch {
        source: serde_yaml::Error,
        origin: String,
        scope: Scope,
    },

    #[snafu(display("failed to parse operations of patch {origin} at {scope} scope"))]
    ParsePatchOperations {
        source: serde_json::Error,
        origin: String,
        scope: Scope,
    },

    #[snafu(display(
        "patch {origin} at {scope} scope is neither a list of operations nor a mapping"
    ))]
    UnrecognizedPatch { origin: String, scope: Scope },

    #[snafu(display("failed to apply patch {origin} at {scope} scope"))]
    ApplyPatchOperations {
        source: json_patch::PatchError,
        origin: String,
        scope: Scope,
    },

    #[snafu(display("failed to merge patch {origin} at {scope} scope"))]
    MergePatch {
        source: merge::Error,
        origin: String,
        scope: Scope,
    },
}

/// One node's machine config while it is being patched.
///
/// The document is moved from patch to patch and never shared.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigDocument(Value);

impl ConfigDocument {
    pub fn from_config(config: &MachineConfig) -> Result<Self> {
        serde_json::to_value(config)
            .map(Self)
            .context(ConvertConfigSnafu)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        serde_yaml::to_string(&self.0)
            .map(String::into_bytes)
            .context(SerializeDocumentSnafu)
    }
}

impl From<Value> for ConfigDocument {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Where a set of patches comes from. Later scopes override earlier ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    Node,
    ControlPlane,
    Worker,
    Cluster,
}

impl Scope {
    pub fn role_of(node: &Node) -> Self {
        if node.control_plane {
            Self::ControlPlane
        } else {
            Self::Worker
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::ControlPlane => "control plane",
            Self::Worker => "worker",
            Self::Cluster => "cluster",
        })
    }
}

/// A single entry of a [`PatchSet`], in the order it is applied.
#[derive(Clone, Copy, Debug)]
pub enum Patch<'a> {
    /// A strategic merge patch.
    InlineOverride(&'a Value),

    /// RFC 6902 operations, applied one at a time.
    StructuredMerge(&'a [PatchOperation]),

    /// Patch files or inline patch text, each either RFC 6902 operations or a strategic merge
    /// patch.
    FileSourced(&'a [String]),
}

impl PatchSet {
    /// Lists the patches of this set in application order, leaving out empty ones.
    pub fn ordered_patches(&self) -> Vec<Patch<'_>> {
        let mut patches = Vec::with_capacity(3);
        if let Some(inline) = &self.inline_patch {
            patches.push(Patch::InlineOverride(inline));
        }
        if !self.config_patches.is_empty() {
            patches.push(Patch::StructuredMerge(&self.config_patches));
        }
        if !self.patches.is_empty() {
            patches.push(Patch::FileSourced(&self.patches));
        }
        patches
    }
}

impl Patch<'_> {
    pub fn apply(self, mut doc: ConfigDocument, scope: Scope) -> Result<ConfigDocument> {
        match self {
            Self::InlineOverride(patch) => {
                debug!(%scope, "applying inline patch");
                merge::strategic_merge(&mut doc.0, patch)
                    .context(ApplyInlinePatchSnafu { scope })?;
            }
            Self::StructuredMerge(operations) => {
                for (index, operation) in operations.iter().enumerate() {
                    debug!(%scope, index, "applying config patch");
                    json_patch::patch(&mut doc.0, std::slice::from_ref(operation))
                        .context(ApplyConfigPatchSnafu { scope, index })?;
                }
            }
            Self::FileSourced(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    doc = apply_patch_entry(doc, index, entry, scope)?;
                }
            }
        }
        Ok(doc)
    }
}

/// Applies the patches of one scope.
pub fn apply(doc: ConfigDocument, scope: Scope, patch_set: &PatchSet) -> Result<ConfigDocument> {
    patch_set
        .ordered_patches()
        .into_iter()
        .try_fold(doc, |doc, patch| patch.apply(doc, scope))
}

/// Applies the node, role and cluster patches for `node`, in that order.
#[instrument(skip_all, fields(node.hostname = %node.hostname))]
pub fn apply_layers(
    doc: ConfigDocument,
    node: &Node,
    cluster: &ClusterSpec,
) -> Result<ConfigDocument> {
    let doc = apply(doc, Scope::Node, &node.patch_set)?;
    let doc = apply(doc, Scope::role_of(node), cluster.role_patches(node))?;
    apply(doc, Scope::Cluster, &cluster.cluster_patches)
}

/// Reads an `@path` entry from disk, relative to the working directory. Any other entry is the
/// patch text itself, reported by its position in the list.
fn apply_patch_entry(
    mut doc: ConfigDocument,
    index: usize,
    entry: &str,
    scope: Scope,
) -> Result<ConfigDocument> {
    let (origin, text) = match entry.strip_prefix('@') {
        Some(path) => {
            let path = Path::new(path);
            let text = fs::read_to_string(path).context(ReadPatchFileSnafu { path, scope })?;
            (format!("{:?}", path.display()), text)
        }
        None => (format!("<inline #{index}>"), entry.to_owned()),
    };
    debug!(%scope, patch.origin = %origin, "applying patch");

    let parsed: Value = serde_yaml::from_str(&text).context(ParsePatchSnafu {
        origin: origin.as_str(),
        scope,
    })?;
    match parsed {
        Value::Array(_) => {
            let operations: Vec<PatchOperation> =
                serde_json::from_value(parsed).context(ParsePatchOperationsSnafu {
                    origin: origin.as_str(),
                    scope,
                })?;
            json_patch::patch(&mut doc.0, &operations).context(ApplyPatchOperationsSnafu {
                origin: origin.as_str(),
                scope,
            })?;
        }
        Value::Object(_) => {
            merge::strategic_merge(&mut doc.0, &parsed).context(MergePatchSnafu {
                origin: origin.as_str(),
                scope,
            })?;
        }
        _ => return UnrecognizedPatchSnafu { origin, scope }.fail(),
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use indoc::{formatdoc, indoc};
    use serde_json::json;

    use super::*;

    fn doc() -> ConfigDocument {
        ConfigDocument::from(json!({
            "machine": { "network": { "hostname": "base" }, "type": "worker" }
        }))
    }

    fn hostname(doc: &ConfigDocument) -> &str {
        doc.as_value()["machine"]["network"]["hostname"]
            .as_str()
            .unwrap_or_default()
    }

    fn patch_set(yaml: &str) -> PatchSet {
        serde_yaml::from_str(yaml).expect("test YAML is valid")
    }

    #[test]
    fn mechanisms_apply_in_fixed_order() {
        // Listed in reverse, applied inline -> config patches -> patches regardless.
        let set = patch_set(indoc! {"
            patches:
              - |
                machine:
                  network:
                    hostname: from-patches
            configPatches:
              - op: replace
                path: /machine/network/hostname
                value: from-config-patches
            inlinePatch:
              machine:
                network:
                  hostname: from-inline
        "});

        let patched = apply(doc(), Scope::Node, &set).unwrap();

        assert_eq!(hostname(&patched), "from-patches");
    }

    #[test]
    fn config_patches_see_earlier_results() {
        let set = patch_set(indoc! {"
            configPatches:
              - op: add
                path: /machine/nodeLabels
                value: {}
              - op: add
                path: /machine/nodeLabels/rack
                value: r1
        "});

        let patched = apply(doc(), Scope::Node, &set).unwrap();

        assert_eq!(patched.as_value()["machine"]["nodeLabels"], json!({ "rack": "r1" }));
    }

    #[test]
    fn failing_config_patch_names_scope_and_index() {
        let set = patch_set(indoc! {"
            configPatches:
              - op: add
                path: /machine/nodeLabels
                value: {}
              - op: remove
                path: /machine/doesNotExist
        "});

        let err = apply(doc(), Scope::Worker, &set).unwrap_err();

        assert!(matches!(err, Error::ApplyConfigPatch {
            scope: Scope::Worker,
            index: 1,
            ..
        }));
        assert_eq!(err.to_string(), "failed to apply config patch #1 at worker scope");
    }

    #[test]
    fn patch_files_are_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("create temporary file");
        file.write_all(indoc! {"
            - op: replace
              path: /machine/network/hostname
              value: from-file
        "}
        .as_bytes())
        .expect("write patch");
        let set = patch_set(&formatdoc! {"
            patches:
              - '@{path}'
        ", path = file.path().display()});

        let patched = apply(doc(), Scope::Cluster, &set).unwrap();

        assert_eq!(hostname(&patched), "from-file");
    }

    #[test]
    fn missing_patch_file_is_an_error() {
        let set = patch_set("patches: ['@does/not/exist.yaml']");

        let err = apply(doc(), Scope::Cluster, &set).unwrap_err();

        assert!(matches!(err, Error::ReadPatchFile {
            scope: Scope::Cluster,
            ..
        }));
    }

    #[test]
    fn scalar_patch_is_unrecognized() {
        let set = patch_set("patches: ['just text']");

        let err = apply(doc(), Scope::Node, &set).unwrap_err();

        assert!(matches!(err, Error::UnrecognizedPatch { .. }));
    }

    #[test]
    fn failing_inline_patch_text_names_its_position() {
        let set = patch_set(indoc! {"
            patches:
              - |
                machine:
                  network:
                    hostname: fine
              - '[not, operations]'
        "});

        let err = apply(doc(), Scope::ControlPlane, &set).unwrap_err();

        match &err {
            Error::ParsePatchOperations { origin, scope, .. } => {
                assert_eq!(origin, "<inline #1>");
                assert_eq!(*scope, Scope::ControlPlane);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "failed to parse operations of patch <inline #1> at control plane scope"
        );
    }

    #[test]
    fn broader_scopes_win() {
        let cluster: ClusterSpec = serde_yaml::from_str(indoc! {"
            clusterName: homelab
            endpoint: https://192.168.1.10:6443
            inlinePatch:
              machine:
                network:
                  hostname: from-cluster
            worker:
              inlinePatch:
                machine:
                  network:
                    hostname: from-worker
                  nodeLabels:
                    role: worker
            nodes:
              - hostname: worker-1
                inlinePatch:
                  machine:
                    network:
                      hostname: from-node
                    nodeLabels:
                      role: node
                      zone: a
        "})
        .expect("test YAML is valid");

        let patched = apply_layers(doc(), &cluster.nodes[0], &cluster).unwrap();

        assert_eq!(hostname(&patched), "from-cluster");
        assert_eq!(
            patched.as_value()["machine"]["nodeLabels"],
            json!({ "role": "worker", "zone": "a" })
        );
    }

    #[test]
    fn empty_patch_set_is_a_no_op() {
        let patched = apply(doc(), Scope::Cluster, &PatchSet::default()).unwrap();
        assert_eq!(patched, doc());
    }
}
