//! Canonical YAML encoding of machine configs.

use serde::Serialize;
use snafu::{ResultExt, Snafu};

use super::MachineConfig;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },
}

/// Encodes `config` with typed fields in declaration order and all other keys sorted.
pub fn to_canonical_bytes(config: &MachineConfig) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut serializer = serde_yaml::Serializer::new(&mut buffer);
    config
        .serialize(&mut serializer)
        .context(SerializeYamlSnafu)?;
    Ok(buffer)
}
