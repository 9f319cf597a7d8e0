//! The per-node generation loop.

use std::{io::Write, path::PathBuf};

use snafu::{ResultExt, Snafu};
use talgen_factory::InstallerResolver;
use tracing::{info, instrument};

use crate::{
    builder,
    client_config::{self, TalosConfig},
    cluster::{ClusterSpec, Node},
    input::{self, GenerationInput},
    machine_config::{self, ValidationMode},
    output,
    patch::{self, ConfigDocument},
    secrets::SecretsBundle,
};

pub const CLIENT_CONFIG_FILE_NAME: &str = "talosconfig";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to prepare generation input"))]
    PrepareInput { source: input::Error },

    #[snafu(display("failed to set up installer resolution"))]
    CreateInstallerResolver { source: talgen_factory::Error },

    #[snafu(display("failed to build config for node {hostname:?}"))]
    BuildNode {
        source: builder::Error,
        hostname: String,
    },

    #[snafu(display("failed to patch config for node {hostname:?}"))]
    PatchNode {
        source: patch::Error,
        hostname: String,
    },

    #[snafu(display("invalid config for node {hostname:?}"))]
    ValidateNode {
        source: machine_config::Error,
        hostname: String,
    },

    #[snafu(display("failed to output config for node {hostname:?}"))]
    OutputNode {
        source: output::Error,
        hostname: String,
    },

    #[snafu(display("failed to generate client config"))]
    GenerateClientConfig { source: client_config::Error },

    #[snafu(display("failed to write client config"))]
    WriteClientConfig { source: output::Error },

    #[snafu(display("failed to print result"))]
    PrintResult { source: std::io::Error },
}

#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub out_dir: PathBuf,

    /// Show diffs against the files on disk instead of writing.
    pub dry_run: bool,

    pub mode: ValidationMode,

    /// Compute schematic IDs locally instead of asking the image factory.
    pub offline: bool,
}

/// Generates the configs of all nodes of `cluster` in declared order, reporting each on `out`.
///
/// Stops at the first failing node. Files written for earlier nodes stay on disk.
#[instrument(skip_all, fields(cluster.name = %cluster.cluster_name, dry_run = options.dry_run))]
pub async fn generate_config(
    cluster: &ClusterSpec,
    secrets: SecretsBundle,
    options: &GenerateOptions,
    out: &mut impl Write,
) -> Result<()> {
    let input = GenerationInput::new(cluster, secrets).context(PrepareInputSnafu)?;
    let installers = InstallerResolver::new(cluster.image_factory.clone(), options.offline)
        .context(CreateInstallerResolverSnafu)?;

    for node in &cluster.nodes {
        let contents = render_node(node, cluster, &input, &installers, options.mode).await?;

        let path = output::node_config_path(&options.out_dir, &cluster.cluster_name, &node.hostname);
        let written = if options.dry_run {
            output::show_diff(&path, &contents, out)
        } else {
            output::write_node_config(&path, &node.hostname, &contents, out)
        };
        written.context(OutputNodeSnafu {
            hostname: node.hostname.as_str(),
        })?;
    }

    if !options.dry_run {
        let talos_config = TalosConfig::generate(cluster, &input.secrets.certs.os)
            .context(GenerateClientConfigSnafu)?;
        let contents = talos_config.to_yaml().context(GenerateClientConfigSnafu)?;
        let path = options.out_dir.join(CLIENT_CONFIG_FILE_NAME);
        output::write_private(&path, contents.as_bytes()).context(WriteClientConfigSnafu)?;
        writeln!(out, "generated client config in {}", path.display()).context(PrintResultSnafu)?;
    }

    info!(nodes = cluster.nodes.len(), "finished generating configs");
    Ok(())
}

/// Builds, patches, validates and re-encodes the config of one node.
#[instrument(skip_all, fields(node.hostname = %node.hostname))]
pub async fn render_node(
    node: &Node,
    cluster: &ClusterSpec,
    input: &GenerationInput,
    installers: &InstallerResolver,
    mode: ValidationMode,
) -> Result<Vec<u8>> {
    let hostname = node.hostname.as_str();
    let config = builder::build(node, input, installers)
        .await
        .context(BuildNodeSnafu { hostname })?;

    let document = ConfigDocument::from_config(&config).context(PatchNodeSnafu { hostname })?;
    let document =
        patch::apply_layers(document, node, cluster).context(PatchNodeSnafu { hostname })?;
    let patched = document.to_yaml().context(PatchNodeSnafu { hostname })?;

    machine_config::validate_and_reencode(&patched, mode).context(ValidateNodeSnafu { hostname })
}
