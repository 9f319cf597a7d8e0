use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use url::Url;

pub const DEFAULT_REGISTRY_URL: &str = "factory.talos.dev";
pub const DEFAULT_SCHEMATIC_ENDPOINT: &str = "/schematics";
pub const DEFAULT_PROTOCOL: &str = "https";
pub const DEFAULT_INSTALLER_URL_TEMPLATE: &str = "{{.RegistryURL}}/installer/{{.ID}}:{{.Version}}";
pub const DEFAULT_ISO_URL_TEMPLATE: &str =
    "{{.Protocol}}://{{.RegistryURL}}/image/{{.ID}}/{{.Version}}/{{.Mode}}-{{.Arch}}.iso";

#[derive(Debug, Snafu)]
#[snafu(display("failed to parse {input:?} as schematic endpoint URL"))]
pub struct ParseSchematicUrlError {
    source: url::ParseError,
    input: String,
}

/// Connection settings of the image factory, as given in the cluster file.
///
/// Every field falls back to the public factory when left out.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFactory {
    /// Host (and optional port) of the factory registry, without protocol.
    #[serde(default = "default_registry_url", rename = "registryURL")]
    pub registry_url: String,

    /// Path the schematic is POSTed to.
    #[serde(default = "default_schematic_endpoint")]
    pub schematic_endpoint: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_installer_url_template", rename = "installerURLTmpl")]
    pub installer_url_template: String,

    #[serde(default = "default_iso_url_template", rename = "ISOURLTmpl")]
    pub iso_url_template: String,
}

impl Default for ImageFactory {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            schematic_endpoint: default_schematic_endpoint(),
            protocol: default_protocol(),
            installer_url_template: default_installer_url_template(),
            iso_url_template: default_iso_url_template(),
        }
    }
}

impl ImageFactory {
    /// The URL schematics are submitted to: `{protocol}://{registry_url}{schematic_endpoint}`.
    pub fn schematic_url(&self) -> Result<Url, ParseSchematicUrlError> {
        let input = format!(
            "{protocol}://{registry}{endpoint}",
            protocol = self.protocol,
            registry = self.registry_url,
            endpoint = self.schematic_endpoint
        );
        Url::parse(&input).context(ParseSchematicUrlSnafu { input })
    }
}

fn default_registry_url() -> String {
    DEFAULT_REGISTRY_URL.to_owned()
}

fn default_schematic_endpoint() -> String {
    DEFAULT_SCHEMATIC_ENDPOINT.to_owned()
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_owned()
}

fn default_installer_url_template() -> String {
    DEFAULT_INSTALLER_URL_TEMPLATE.to_owned()
}

fn default_iso_url_template() -> String {
    DEFAULT_ISO_URL_TEMPLATE.to_owned()
}
