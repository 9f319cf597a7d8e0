//! Prints the installer or boot ISO URLs of a cluster's nodes.

use std::io::Write;

use snafu::{OptionExt, ResultExt, Snafu};
use talgen_factory::{InstallerResolver, schematic::Schematic};

use crate::cluster::{ClusterSpec, MachineSpec, Node};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no node named {hostname:?} in cluster {cluster_name:?}"))]
    UnknownNode {
        hostname: String,
        cluster_name: String,
    },

    #[snafu(display("failed to set up installer resolution"))]
    CreateInstallerResolver { source: talgen_factory::Error },

    #[snafu(display("failed to resolve {kind} URL for {hostname:?}"))]
    ResolveUrl {
        source: talgen_factory::Error,
        kind: ImageKind,
        hostname: String,
    },

    #[snafu(display("failed to print result"))]
    PrintResult { source: std::io::Error },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ImageKind {
    Installer,
    Iso,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Installer => "installer",
            Self::Iso => "ISO",
        })
    }
}

/// Prints one URL per selected node, or the URL of the empty schematic if the cluster has no
/// nodes.
pub async fn print_image_urls(
    cluster: &ClusterSpec,
    kind: ImageKind,
    hostname: Option<&str>,
    offline: bool,
    out: &mut impl Write,
) -> Result<()> {
    let installers = InstallerResolver::new(cluster.image_factory.clone(), offline)
        .context(CreateInstallerResolverSnafu)?;
    let version = cluster.talos_version.as_str();

    let nodes: Vec<&Node> = match hostname {
        Some(hostname) => vec![
            cluster
                .nodes
                .iter()
                .find(|node| node.hostname == hostname)
                .context(UnknownNodeSnafu {
                    hostname,
                    cluster_name: cluster.cluster_name.as_str(),
                })?,
        ],
        None => cluster.nodes.iter().collect(),
    };

    if nodes.is_empty() {
        let url = image_url(&installers, kind, &Schematic::default(), &MachineSpec::default(), version)
            .await
            .context(ResolveUrlSnafu {
                kind,
                hostname: "",
            })?;
        return writeln!(out, "{url}").context(PrintResultSnafu);
    }

    for node in nodes {
        let url = match (kind, node.talos_image_url.as_deref()) {
            (ImageKind::Installer, Some(url)) if !url.is_empty() => format!("{url}:{version}"),
            _ => {
                let empty = Schematic::default();
                let schematic = node.schematic.as_ref().unwrap_or(&empty);
                image_url(&installers, kind, schematic, &node.machine_spec, version)
                    .await
                    .context(ResolveUrlSnafu {
                        kind,
                        hostname: node.hostname.as_str(),
                    })?
            }
        };
        writeln!(out, "{url}").context(PrintResultSnafu)?;
    }
    Ok(())
}

async fn image_url(
    installers: &InstallerResolver,
    kind: ImageKind,
    schematic: &Schematic,
    machine_spec: &MachineSpec,
    version: &str,
) -> Result<String, talgen_factory::Error> {
    match kind {
        ImageKind::Installer => installers.installer_url(schematic, version).await,
        ImageKind::Iso => {
            installers
                .iso_url(schematic, version, &machine_spec.mode, &machine_spec.arch)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    const EMPTY_SCHEMATIC_ID: &str =
        "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

    fn cluster(yaml: &str) -> ClusterSpec {
        serde_yaml::from_str(yaml).expect("test YAML is valid")
    }

    async fn printed(
        cluster: &ClusterSpec,
        kind: ImageKind,
        hostname: Option<&str>,
    ) -> Result<String> {
        let mut out = Vec::new();
        print_image_urls(cluster, kind, hostname, true, &mut out).await?;
        Ok(String::from_utf8(out).expect("output is UTF-8"))
    }

    #[rstest]
    #[case(
        ImageKind::Installer,
        format!("factory.talos.dev/installer/{EMPTY_SCHEMATIC_ID}:v1.7.0\n")
    )]
    #[case(
        ImageKind::Iso,
        format!("https://factory.talos.dev/image/{EMPTY_SCHEMATIC_ID}/v1.7.0/metal-amd64.iso\n")
    )]
    #[tokio::test]
    async fn empty_cluster_prints_empty_schematic(#[case] kind: ImageKind, #[case] expected: String) {
        let cluster = cluster("clusterName: homelab\nendpoint: https://192.168.1.10:6443\n");

        assert_eq!(printed(&cluster, kind, None).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn prints_one_line_per_node() {
        let cluster = cluster(indoc! {"
            clusterName: homelab
            endpoint: https://192.168.1.10:6443
            talosVersion: v1.6.0
            nodes:
              - hostname: cp-1
                talosImageURL: registry.example.com/installer
              - hostname: worker-1
                machineSpec:
                  arch: arm64
        "});

        let all = printed(&cluster, ImageKind::Installer, None).await.unwrap();
        let lines: Vec<&str> = all.lines().collect();
        assert_eq!(lines, vec![
            "registry.example.com/installer:v1.6.0".to_owned(),
            format!("factory.talos.dev/installer/{EMPTY_SCHEMATIC_ID}:v1.6.0"),
        ]);

        let iso = printed(&cluster, ImageKind::Iso, Some("worker-1")).await.unwrap();
        assert!(iso.trim_end().ends_with("/v1.6.0/metal-arm64.iso"));
    }

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let cluster = cluster("clusterName: homelab\nendpoint: https://192.168.1.10:6443\n");

        let err = printed(&cluster, ImageKind::Installer, Some("nope"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownNode { .. }));
    }
}
