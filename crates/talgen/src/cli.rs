//! Command line interface of the `talgen` binary.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    cluster::{self, ClusterSpec},
    generate::{self, GenerateOptions},
    image_url::{self, ImageKind},
    machine_config::ValidationMode,
    secrets::{self, SecretsBundle},
};

pub const DEFAULT_CONFIG_SEARCH_PATHS: &[&str] = &["talconfig.yaml", "talconfig.yml"];
pub const DEFAULT_SECRET_SEARCH_PATHS: &[&str] = &["talsecret.yaml", "talsecret.yml"];
pub const DEFAULT_OUT_DIR: &str = "./clusterconfig";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "failed to locate a required file in any of the following locations: {search_path:?}"
    ))]
    RequiredFileMissing { search_path: Vec<PathBuf> },

    #[snafu(display("failed to load cluster config"))]
    LoadClusterConfig { source: cluster::Error },

    #[snafu(display("failed to load secrets bundle"))]
    LoadSecrets { source: secrets::Error },

    #[snafu(display("failed to generate configs"))]
    GenerateConfig { source: generate::Error },

    #[snafu(display("failed to generate image URLs"))]
    GenerateUrl { source: image_url::Error },
}

/// Generates Talos machine configs from a declarative cluster file.
#[derive(Debug, Parser)]
#[command(name = "talgen", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate the machine config of every node, plus a talosconfig.
    #[command(name = "genconfig")]
    GenConfig(GenConfigArgs),

    /// Print installer or boot ISO image URLs of the nodes.
    #[command(name = "genurl")]
    GenUrl(GenUrlArgs),
}

#[derive(Debug, Args)]
pub struct GenConfigArgs {
    /// Cluster config file. Defaults to the first of talconfig.yaml and talconfig.yml found.
    #[arg(short = 'c', long, env = "TALGEN_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Secrets bundle. Defaults to the first of talsecret.yaml and talsecret.yml found.
    #[arg(short = 's', long, env = "TALGEN_SECRET_FILE")]
    pub secret_file: Option<PathBuf>,

    #[arg(short = 'o', long, env = "TALGEN_OUT_DIR", default_value = DEFAULT_OUT_DIR)]
    pub out_dir: PathBuf,

    /// Show diffs against previously generated files instead of writing them.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Which rules the generated configs are validated against.
    #[arg(short = 'm', long, value_enum, default_value_t)]
    pub mode: ValidationMode,

    /// Compute schematic IDs locally instead of registering them with the image factory.
    #[arg(long, env = "TALGEN_OFFLINE_MODE")]
    pub offline_mode: bool,
}

#[derive(Debug, Args)]
pub struct GenUrlArgs {
    #[arg(value_enum)]
    pub kind: ImageKind,

    /// Cluster config file. Defaults to the first of talconfig.yaml and talconfig.yml found.
    #[arg(short = 'c', long, env = "TALGEN_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Only print the URL of this node.
    #[arg(long = "node", value_name = "HOSTNAME")]
    pub node: Option<String>,

    /// Compute schematic IDs locally instead of registering them with the image factory.
    #[arg(long, env = "TALGEN_OFFLINE_MODE")]
    pub offline_mode: bool,
}

impl Cli {
    /// Runs the selected command, printing its results to `out`.
    pub async fn run(self, out: &mut impl Write) -> Result<()> {
        match self.command {
            Command::GenConfig(args) => args.run(out).await,
            Command::GenUrl(args) => args.run(out).await,
        }
    }
}

impl GenConfigArgs {
    async fn run(self, out: &mut impl Write) -> Result<()> {
        let cluster = load_cluster(self.config_file.as_deref())?;
        let secrets_path = resolve_path(self.secret_file.as_deref(), DEFAULT_SECRET_SEARCH_PATHS)?;
        let secrets = SecretsBundle::from_file(secrets_path).context(LoadSecretsSnafu)?;

        let options = GenerateOptions {
            out_dir: self.out_dir,
            dry_run: self.dry_run,
            mode: self.mode,
            offline: self.offline_mode,
        };
        generate::generate_config(&cluster, secrets, &options, out)
            .await
            .context(GenerateConfigSnafu)
    }
}

impl GenUrlArgs {
    async fn run(self, out: &mut impl Write) -> Result<()> {
        let cluster = load_cluster(self.config_file.as_deref())?;
        image_url::print_image_urls(
            &cluster,
            self.kind,
            self.node.as_deref(),
            self.offline_mode,
            out,
        )
        .await
        .context(GenerateUrlSnafu)
    }
}

fn load_cluster(user_provided_path: Option<&Path>) -> Result<ClusterSpec> {
    let path = resolve_path(user_provided_path, DEFAULT_CONFIG_SEARCH_PATHS)?;
    debug!(config.path = %path.display(), "loading cluster config");
    ClusterSpec::from_file(path).context(LoadClusterConfigSnafu)
}

/// Returns the user provided path if it exists, otherwise the first existing default path.
fn resolve_path<'a>(
    user_provided_path: Option<&'a Path>,
    default_paths: &'a [impl AsRef<Path> + 'a],
) -> Result<&'a Path> {
    let search_paths = if let Some(path) = user_provided_path {
        vec![path]
    } else {
        default_paths.iter().map(AsRef::as_ref).collect()
    };
    for path in &search_paths {
        if path.exists() {
            return Ok(path);
        }
    }
    RequiredFileMissingSnafu {
        search_path: search_paths
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>(),
    }
    .fail()
}
