//! Resolves installer and boot image references from a [`Schematic`].
//!
//! An image factory identifies every set of requested customizations by a *schematic ID*. That
//! ID can either be computed locally ([`OfflineResolver`]) or obtained by submitting the
//! schematic to the factory ([`FactoryClient`]). Both yield the same ID for the same schematic.
//! The ID is then rendered into the configured URL templates by an [`InstallerResolver`].
//!
//! ```no_run
//! # async fn example() -> Result<(), talgen_factory::Error> {
//! use talgen_factory::{ImageFactory, InstallerResolver, schematic::Schematic};
//!
//! let resolver = InstallerResolver::new(ImageFactory::default(), true)?;
//! let url = resolver
//!     .installer_url(&Schematic::default(), "v1.7.0")
//!     .await?;
//! assert_eq!(
//!     url,
//!     "factory.talos.dev/installer/376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba:v1.7.0"
//! );
//! # Ok(())
//! # }
//! ```

use snafu::{ResultExt, Snafu};
use tracing::instrument;
use url::Url;

pub mod resolver;
pub mod schematic;
mod settings;
pub mod template;
mod yaml;

pub use resolver::{FactoryClient, OfflineResolver, SchematicIdResolver};
pub use settings::*;

use crate::schematic::Schematic;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid image factory settings"))]
    ParseSchematicUrl { source: ParseSchematicUrlError },

    #[snafu(display("failed to build HTTP client for the image factory"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("failed to submit schematic to {url}"))]
    SendSchematic { source: reqwest::Error, url: Url },

    #[snafu(display("image factory at {url} did not reply with 201 Created, got {status}"))]
    RemoteResolution {
        url: Url,
        status: reqwest::StatusCode,
    },

    #[snafu(display("failed to decode schematic ID returned by {url}"))]
    DecodeFactoryResponse { source: reqwest::Error, url: Url },

    #[snafu(display("failed to render {kind} URL template"))]
    RenderTemplate {
        source: template::Error,
        kind: &'static str,
    },
}

/// Turns schematics into image references using the URL templates of an [`ImageFactory`].
pub struct InstallerResolver {
    settings: ImageFactory,
    ids: Box<dyn SchematicIdResolver>,
}

impl std::fmt::Debug for InstallerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallerResolver")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl InstallerResolver {
    /// Creates a resolver that hashes locally when `offline` is set and asks the factory
    /// otherwise.
    pub fn new(settings: ImageFactory, offline: bool) -> Result<Self> {
        let ids: Box<dyn SchematicIdResolver> = if offline {
            Box::new(OfflineResolver)
        } else {
            Box::new(FactoryClient::new(&settings)?)
        };
        Ok(Self { settings, ids })
    }

    pub fn with_id_resolver(settings: ImageFactory, ids: Box<dyn SchematicIdResolver>) -> Self {
        Self { settings, ids }
    }

    pub fn settings(&self) -> &ImageFactory {
        &self.settings
    }

    /// Returns the installer image reference for `schematic` at `version`.
    #[instrument(skip(self, schematic))]
    pub async fn installer_url(&self, schematic: &Schematic, version: &str) -> Result<String> {
        let id = self.ids.schematic_id(schematic).await?;
        template::render(
            "installer",
            &self.settings.installer_url_template,
            &[
                ("RegistryURL", &self.settings.registry_url),
                ("ID", &id),
                ("Version", version),
            ],
        )
        .context(RenderTemplateSnafu { kind: "installer" })
    }

    /// Returns the boot ISO URL for `schematic` at `version`, for the given boot `mode` (e.g.
    /// `metal`) and CPU `arch`.
    #[instrument(skip(self, schematic))]
    pub async fn iso_url(
        &self,
        schematic: &Schematic,
        version: &str,
        mode: &str,
        arch: &str,
    ) -> Result<String> {
        let id = self.ids.schematic_id(schematic).await?;
        template::render(
            "iso",
            &self.settings.iso_url_template,
            &[
                ("Protocol", &self.settings.protocol),
                ("RegistryURL", &self.settings.registry_url),
                ("ID", &id),
                ("Version", version),
                ("Mode", mode),
                ("Arch", arch),
            ],
        )
        .context(RenderTemplateSnafu { kind: "ISO" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SCHEMATIC_ID: &str =
        "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

    #[tokio::test]
    async fn offline_installer_url_uses_default_template() {
        let resolver = InstallerResolver::new(ImageFactory::default(), true).unwrap();

        let url = resolver
            .installer_url(&Schematic::default(), "v1.6.0")
            .await
            .unwrap();

        assert_eq!(
            url,
            format!("factory.talos.dev/installer/{EMPTY_SCHEMATIC_ID}:v1.6.0")
        );
    }

    #[tokio::test]
    async fn offline_iso_url_carries_mode_and_arch() {
        let resolver = InstallerResolver::new(ImageFactory::default(), true).unwrap();

        let url = resolver
            .iso_url(&Schematic::default(), "v1.6.0", "metal", "arm64")
            .await
            .unwrap();

        assert_eq!(
            url,
            format!("https://factory.talos.dev/image/{EMPTY_SCHEMATIC_ID}/v1.6.0/metal-arm64.iso")
        );
    }

    #[tokio::test]
    async fn custom_template_errors_are_reported() {
        let settings = ImageFactory {
            installer_url_template: "{{.Registry}}/{{.ID}}".to_owned(),
            ..ImageFactory::default()
        };
        let resolver = InstallerResolver::new(settings, true).unwrap();

        let err = resolver
            .installer_url(&Schematic::default(), "v1.6.0")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RenderTemplate {
            source: template::Error::UnknownField { .. },
            kind: "installer",
        }));
    }

    #[test]
    fn invalid_settings_fail_only_when_online() {
        let settings = ImageFactory {
            protocol: String::new(),
            ..ImageFactory::default()
        };

        assert!(InstallerResolver::new(settings.clone(), true).is_ok());
        assert!(matches!(
            InstallerResolver::new(settings, false),
            Err(Error::ParseSchematicUrl { .. })
        ));
    }
}
