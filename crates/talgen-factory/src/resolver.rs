//! Ways of obtaining the ID of a [`Schematic`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    BuildHttpClientSnafu, DecodeFactoryResponseSnafu, ImageFactory, ParseSchematicUrlSnafu,
    RemoteResolutionSnafu, Result, SendSchematicSnafu, schematic::Schematic,
};

/// Assigns a stable identifier to a schematic.
#[async_trait]
pub trait SchematicIdResolver: Send + Sync {
    async fn schematic_id(&self, schematic: &Schematic) -> Result<String>;
}

/// Computes the ID locally by hashing the canonical encoding. Never touches the network.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineResolver;

#[async_trait]
impl SchematicIdResolver for OfflineResolver {
    async fn schematic_id(&self, schematic: &Schematic) -> Result<String> {
        let id = schematic.id();
        debug!(schematic.id = %id, "computed schematic ID offline");
        Ok(id)
    }
}

/// Response body of a successful schematic submission.
#[derive(Debug, Deserialize)]
struct SchematicCreated {
    id: String,
}

/// Submits the schematic to an image factory, which answers with its ID.
#[derive(Clone, Debug)]
pub struct FactoryClient {
    http: reqwest::Client,
    schematic_url: Url,
}

impl FactoryClient {
    pub fn new(settings: &ImageFactory) -> Result<Self> {
        let schematic_url = settings.schematic_url().context(ParseSchematicUrlSnafu)?;
        let http = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu)?;

        Ok(Self {
            http,
            schematic_url,
        })
    }

    pub fn schematic_url(&self) -> &Url {
        &self.schematic_url
    }
}

#[async_trait]
impl SchematicIdResolver for FactoryClient {
    #[instrument(name = "submit_schematic", skip_all, fields(url = %self.schematic_url))]
    async fn schematic_id(&self, schematic: &Schematic) -> Result<String> {
        let url = &self.schematic_url;
        let response = self
            .http
            .post(url.clone())
            .body(schematic.to_canonical_yaml())
            .send()
            .await
            .context(SendSchematicSnafu { url: url.clone() })?;

        let status = response.status();
        ensure!(status == StatusCode::CREATED, RemoteResolutionSnafu {
            url: url.clone(),
            status,
        });

        let created: SchematicCreated = response
            .json()
            .await
            .context(DecodeFactoryResponseSnafu { url: url.clone() })?;
        debug!(schematic.id = %created.id, "image factory assigned schematic ID");

        Ok(created.id)
    }
}
