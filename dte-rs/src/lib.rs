//! High-level facade over [`dte_core`]: build a document, stamp and sign it
//! into an envelope, and deliver it through the authority protocol in one
//! call.
use std::sync::Arc;

use tracing::info;

pub use dte_core::{
    config::{Config, Environment},
    document::{DocumentKind, DteBuilder, LineItem, Party, TaxDocument},
    envelope::{EnvelopeAssembler, Resolution, SignedEnvelope},
    identity::SigningIdentity,
    sii::{SiiClient, StatusResult, SubmissionResult},
    ted::Caf,
    Error,
};

/// One-stop service bound to an identity, an environment and the emitter's
/// authority resolution.
#[derive(Debug)]
pub struct DteService {
    assembler: EnvelopeAssembler,
    client: SiiClient,
    resolution: Resolution,
}

impl DteService {
    /// # Errors
    /// Returns [`Error`] if the HTTP client cannot be built.
    pub fn new(
        config: Config,
        identity: Arc<SigningIdentity>,
        resolution: Resolution,
    ) -> Result<Self, Error> {
        let client = SiiClient::new(&config, Arc::clone(&identity))?;
        Ok(Self {
            assembler: EnvelopeAssembler::new(config, identity),
            client,
            resolution,
        })
    }

    /// Stamp and sign `document` into an envelope, then run the full
    /// seed → token → submit handshake. The token is acquired fresh for
    /// this submission and not retained.
    ///
    /// # Errors
    /// Returns [`Error`] for stamping, signing or protocol failures; the
    /// envelope is not submitted partially.
    pub async fn submit_for_signing_and_delivery(
        &self,
        document: TaxDocument,
        caf: &Caf,
    ) -> Result<(SignedEnvelope, SubmissionResult), Error> {
        let envelope = self
            .assembler
            .assemble_single(document, caf, &self.resolution)?;
        let seed = self.client.request_seed().await?;
        let token = self.client.acquire_token(&seed).await?;
        let result = self.client.submit(&envelope, &token).await?;
        info!(track_id = %result.track_id(), "document delivered");
        Ok((envelope, result))
    }

    /// Query the processing state of an earlier submission.
    ///
    /// # Errors
    /// Returns [`Error`] for transport or protocol failures.
    pub async fn query_delivery_status(&self, track_id: &str) -> Result<StatusResult, Error> {
        Ok(self.client.query_status(track_id).await?)
    }

    /// The underlying assembler, for batch flows.
    pub fn assembler(&self) -> &EnvelopeAssembler {
        &self.assembler
    }

    /// The underlying protocol client.
    pub fn client(&self) -> &SiiClient {
        &self.client
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }
}
