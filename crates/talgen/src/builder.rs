//! Builds the machine config of a single node, before any user patches are applied.

use snafu::{OptionExt, ResultExt, Snafu};
use talgen_factory::{InstallerResolver, schematic::Schematic};
use tracing::{debug, instrument};

use crate::{
    cluster::Node,
    input::GenerationInput,
    machine_config::{Kernel, MachineConfig, MachineType},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("base install image {image:?} has no version tag"))]
    MissingImageTag { image: String },

    #[snafu(display("failed to resolve installer image for node {hostname:?}"))]
    ResolveInstallerImage {
        source: talgen_factory::Error,
        hostname: String,
    },
}

/// Produces the config of `node`: the base document for its role, the node settings on top and
/// the resolved installer image.
#[instrument(skip_all, fields(node.hostname = %node.hostname))]
pub async fn build(
    node: &Node,
    input: &GenerationInput,
    installers: &InstallerResolver,
) -> Result<MachineConfig> {
    let machine_type = if node.control_plane {
        MachineType::ControlPlane
    } else {
        MachineType::Worker
    };
    let mut config = input.base_config(machine_type);

    // Bundles created before secretbox encryption still carry the old secret, which the cluster
    // keeps using.
    let aescbc_secret = &input.secrets.secrets.aescbc_encryption_secret;
    if input.version_contract.secretbox_encryption_supported() && !aescbc_secret.is_empty() {
        if let Some(cluster) = config.cluster.as_mut() {
            cluster.aescbc_encryption_secret.clone_from(aescbc_secret);
        }
    }

    let mut config = apply_node_overrides(node, config);

    let image = installer_image(node, &config, installers).await?;
    debug!(install.image = %image, "resolved installer image");
    config.machine.install.image = image;

    Ok(config)
}

/// Copies every node setting that is set onto `config`. Unset settings keep the base value.
pub fn apply_node_overrides(node: &Node, mut config: MachineConfig) -> MachineConfig {
    let machine = &mut config.machine;
    machine.network.hostname.clone_from(&node.hostname);

    if !node.nameservers.is_empty() {
        machine.network.nameservers.clone_from(&node.nameservers);
    }
    if node.disable_search_domain {
        machine.network.disable_search_domain = Some(true);
    }
    if !node.network_interfaces.is_empty() {
        machine.network.interfaces.clone_from(&node.network_interfaces);
    }
    if !node.install_disk.is_empty() {
        machine.install.disk.clone_from(&node.install_disk);
    }
    if node.install_disk_selector.is_some() {
        machine
            .install
            .disk_selector
            .clone_from(&node.install_disk_selector);
    }
    if !node.machine_disks.is_empty() {
        machine.disks.clone_from(&node.machine_disks);
    }
    if !node.kernel_modules.is_empty() {
        machine.kernel = Some(Kernel {
            modules: node.kernel_modules.clone(),
            ..Kernel::default()
        });
    }
    if node.node_labels.is_some() {
        machine.node_labels.clone_from(&node.node_labels);
    }
    if !node.extensions.is_empty() {
        machine.install.extensions.clone_from(&node.extensions);
    }
    if !node.machine_files.is_empty() {
        machine.files.clone_from(&node.machine_files);
    }
    if let Some(schematic) = &node.schematic {
        machine
            .install
            .extra_kernel_args
            .extend_from_slice(&schematic.customization.extra_kernel_args);
    }

    config
}

/// Returns the tag of an image reference, e.g. `v1.7.0` for `ghcr.io/siderolabs/installer:v1.7.0`.
///
/// Only a `:` after the last `/` starts a tag, so registry ports are not mistaken for one.
pub fn image_tag(image: &str) -> Option<&str> {
    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    let (_, tag) = image[name_start..].rsplit_once(':')?;
    (!tag.is_empty()).then_some(tag)
}

async fn installer_image(
    node: &Node,
    config: &MachineConfig,
    installers: &InstallerResolver,
) -> Result<String> {
    let base_image = &config.machine.install.image;
    let version = image_tag(base_image).context(MissingImageTagSnafu {
        image: base_image.as_str(),
    })?;

    if let Some(url) = node.talos_image_url.as_deref().filter(|url| !url.is_empty()) {
        return Ok(format!("{url}:{version}"));
    }

    let empty = Schematic::default();
    let schematic = node.schematic.as_ref().unwrap_or(&empty);
    installers
        .installer_url(schematic, version)
        .await
        .context(ResolveInstallerImageSnafu {
            hostname: node.hostname.as_str(),
        })
}
