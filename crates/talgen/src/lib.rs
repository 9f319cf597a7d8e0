//! Generates Talos machine configuration files for every node of a cluster.
//!
//! Each node goes through the same stages: [`builder`] derives the base config, [`patch`] applies
//! the node, role and cluster patches, [`machine_config`] validates and canonically re-encodes the
//! result and [`output`] writes it or shows a diff. [`generate`] drives the loop and finishes with
//! the [`client_config`].

pub mod builder;
pub mod cli;
pub mod client_config;
pub mod cluster;
pub mod generate;
pub mod image_url;
pub mod input;
pub mod logging;
pub mod machine_config;
pub mod output;
pub mod patch;
pub mod secrets;

// External re-exports
pub use talgen_factory as factory;
