//! SII protocol client: seed, token, submission and status queries.
//!
//! The handshake is strictly staged: a seed is requested, signed, exchanged
//! for a token, and the token accompanies exactly one submission. Tokens are
//! never cached; every submission re-runs the handshake. Every error carries
//! the stage it happened in.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::envelope::SignedEnvelope;
use crate::identity::SigningIdentity;
use crate::xmldsig::{SignatureEngine, SigningError};

/// Environment variable overriding the protocol base URL, for tests.
pub const BASE_URL_ENV: &str = "DTE_SII_BASE_URL";

const STATUS_OK: &str = "00";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SEED_PATH: &str = "/DTEWS/CrSeed.jws";
const TOKEN_PATH: &str = "/DTEWS/GetTokenFromSeed.jws";
const SUBMIT_PATH: &str = "/DTEWS/RecepcionDTE.jws";
const STATUS_PATH: &str = "/DTEWS/QueryEstDte.jws";

/// Protocol stage, attached to every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Seed,
    Token,
    Submission,
    Status,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Seed => "seed",
            Stage::Token => "token",
            Stage::Submission => "submission",
            Stage::Status => "status",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the protocol client.
#[derive(Debug, Error)]
pub enum SiiError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport failure during {stage}: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: reqwest::Error,
    },
    #[error("protocol error during {stage}: {message}")]
    Protocol { stage: Stage, message: String },
    #[error("authentication rejected ({code}): {message}")]
    Authentication { code: String, message: String },
    #[error("submission rejected ({code}): {message}")]
    SubmissionRejected { code: String, message: String },
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Receipt for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionResult {
    track_id: String,
    status: String,
    message: String,
}

impl SubmissionResult {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Processing state of a previously submitted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    track_id: String,
    status: String,
    message: String,
}

impl StatusResult {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// SII protocol client. Stateless between calls; no retries.
#[derive(Debug, Clone)]
pub struct SiiClient {
    http: Client,
    base_url: String,
    engine: SignatureEngine,
}

impl SiiClient {
    /// Create a client for the configured environment.
    ///
    /// The base URL can be overridden with the `DTE_SII_BASE_URL`
    /// environment variable so tests can point at a mock server.
    ///
    /// # Errors
    /// Returns [`SiiError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &Config, identity: Arc<SigningIdentity>) -> Result<Self, SiiError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(SiiError::Http)?;
        let base_url = std::env::var(BASE_URL_ENV)
            .ok()
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| config.env().endpoint_url().to_string());

        Ok(Self {
            http,
            base_url,
            engine: SignatureEngine::new(identity),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request a fresh seed challenge.
    ///
    /// # Errors
    /// Returns [`SiiError`] for transport failures, unparseable responses
    /// or a non-`00` authority status.
    pub async fn request_seed(&self) -> Result<String, SiiError> {
        let body = format!(
            "{SOAP_PREAMBLE}<ns1:getSeed/>{SOAP_EPILOGUE}"
        );
        let response = self.post(Stage::Seed, SEED_PATH, body).await?;
        let seed = parse_wrapped(Stage::Seed, &response, "getSeedReturn", "SEMILLA")?;
        debug!(seed = %seed, "seed acquired");
        Ok(seed)
    }

    /// Sign the seed and exchange it for a session token.
    ///
    /// The seed string is signed as raw bytes; no canonicalization applies.
    ///
    /// # Errors
    /// Returns [`SiiError::Authentication`] when the authority rejects the
    /// signed seed, and other [`SiiError`] variants for transport and
    /// protocol failures.
    pub async fn acquire_token(&self, seed: &str) -> Result<String, SiiError> {
        let signature = Base64::encode_string(&self.engine.sign_raw(seed.as_bytes())?);
        let body = format!(
            "{SOAP_PREAMBLE}<ns1:getToken><ns1:seed>{}</ns1:seed><ns1:signature>{signature}</ns1:signature></ns1:getToken>{SOAP_EPILOGUE}",
            escape(seed),
        );
        let response = self.post(Stage::Token, TOKEN_PATH, body).await?;
        let token = parse_wrapped(Stage::Token, &response, "getTokenReturn", "TOKEN")?;
        info!("authentication token acquired");
        Ok(token)
    }

    /// Submit a signed envelope under a previously acquired token.
    ///
    /// # Errors
    /// Returns [`SiiError::SubmissionRejected`] when the authority answers
    /// with a non-`00` status, and other [`SiiError`] variants for transport
    /// and protocol failures.
    pub async fn submit(
        &self,
        envelope: &SignedEnvelope,
        token: &str,
    ) -> Result<SubmissionResult, SiiError> {
        let body = format!(
            "{SOAP_PREAMBLE}<ns1:sendDTE><ns1:token>{}</ns1:token><ns1:xml>{}</ns1:xml></ns1:sendDTE>{SOAP_EPILOGUE}",
            escape(token),
            escape(envelope.to_xml()),
        );
        let response = self.post(Stage::Submission, SUBMIT_PATH, body).await?;

        let status = element_text(&response, "estado").ok_or_else(|| SiiError::Protocol {
            stage: Stage::Submission,
            message: "response carries no estado".into(),
        })?;
        let message = element_text(&response, "glosa").unwrap_or_default();
        if status != STATUS_OK {
            return Err(SiiError::SubmissionRejected {
                code: status,
                message,
            });
        }
        let track_id = element_text(&response, "trackid").ok_or_else(|| SiiError::Protocol {
            stage: Stage::Submission,
            message: "accepted submission carries no trackid".into(),
        })?;
        info!(track_id = %track_id, "envelope accepted for processing");
        Ok(SubmissionResult {
            track_id,
            status,
            message,
        })
    }

    /// Query the processing state of a submission by track id.
    ///
    /// # Errors
    /// Returns [`SiiError`] for transport failures or unparseable responses.
    pub async fn query_status(&self, track_id: &str) -> Result<StatusResult, SiiError> {
        let body = format!(
            "{SOAP_PREAMBLE}<ns1:getEstDte><ns1:trackid>{}</ns1:trackid></ns1:getEstDte>{SOAP_EPILOGUE}",
            escape(track_id),
        );
        let response = self.post(Stage::Status, STATUS_PATH, body).await?;

        let status = element_text(&response, "estado").ok_or_else(|| SiiError::Protocol {
            stage: Stage::Status,
            message: "response carries no estado".into(),
        })?;
        let message = element_text(&response, "glosa").unwrap_or_default();
        let track_id = element_text(&response, "trackid").unwrap_or_else(|| track_id.to_string());
        Ok(StatusResult {
            track_id,
            status,
            message,
        })
    }

    async fn post(&self, stage: Stage, path: &str, body: String) -> Result<String, SiiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%stage, %url, "protocol request");
        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml;charset=UTF-8")
            .header("SOAPAction", "")
            .body(body)
            .send()
            .await
            .map_err(|source| SiiError::Transport { stage, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiiError::Protocol {
                stage,
                message: format!("HTTP status {status}"),
            });
        }
        response
            .text()
            .await
            .map_err(|source| SiiError::Transport { stage, source })
    }
}

const SOAP_PREAMBLE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<SOAP-ENV:Envelope xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\" \
xmlns:ns1=\"http://DefaultNamespace\"><SOAP-ENV:Body>";
const SOAP_EPILOGUE: &str = "</SOAP-ENV:Body></SOAP-ENV:Envelope>";

/// Unwrap a double-wrapped authority response: the SOAP body holds a string
/// element (`return_tag`) whose unescaped content is itself an XML document
/// with a `RESP_HDR{ESTADO,GLOSA}` header and the payload element.
///
/// Only the token exchange authenticates; a non-`00` header status maps to
/// [`SiiError::Authentication`] for [`Stage::Token`] and to
/// [`SiiError::Protocol`] for every other stage.
fn parse_wrapped(
    stage: Stage,
    body: &str,
    return_tag: &str,
    payload_tag: &str,
) -> Result<String, SiiError> {
    let inner = element_text(body, return_tag).ok_or_else(|| SiiError::Protocol {
        stage,
        message: format!("response carries no {return_tag}"),
    })?;
    let status = element_text(&inner, "ESTADO").ok_or_else(|| SiiError::Protocol {
        stage,
        message: "authority response carries no ESTADO".into(),
    })?;
    let message = element_text(&inner, "GLOSA").unwrap_or_default();
    if status != STATUS_OK {
        return Err(match stage {
            Stage::Token => SiiError::Authentication {
                code: status,
                message,
            },
            _ => SiiError::Protocol {
                stage,
                message: format!("authority status {status}: {message}"),
            },
        });
    }
    element_text(&inner, payload_tag).ok_or_else(|| SiiError::Protocol {
        stage,
        message: format!("authority response carries no {payload_tag}"),
    })
}

/// Text content of the first element with the given local name, prefix and
/// namespace agnostic. Entity references in the content are resolved, which
/// unwraps the escaped inner documents the authority returns.
fn element_text(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == name.as_bytes() => {
                let mut content = String::new();
                loop {
                    match reader.read_event() {
                        Ok(Event::Text(text)) => content.push_str(&text.unescape().ok()?),
                        Ok(Event::End(end)) if end.local_name().as_ref() == name.as_bytes() => {
                            return Some(content);
                        }
                        Ok(Event::Eof) | Err(_) => return None,
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}
