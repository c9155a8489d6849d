//! TED stamp generation from CAF folio authorizations.
//!
//! The CAF is the authority-issued grant of a folio range for one document
//! type. It is parsed from the file the authority delivers and embedded
//! verbatim inside every stamp; nothing here ever fabricates one.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::canonical::DigestAlgorithm;
use crate::document::TaxDocument;
use crate::identity::SigningIdentity;
use crate::xmldsig::{SignatureEngine, SigningError};
use std::sync::Arc;

/// Signature algorithm label the schema expects on FRMA/FRMT elements.
pub const STAMP_ALGORITHM: &str = "SHA1withRSA";

const CAF_VERSION: &str = "1.0";
const MAX_ITEM_NAME_LEN: usize = 40;

/// Errors returned while parsing a CAF or generating a stamp.
#[derive(Debug, Error)]
pub enum StampError {
    #[error("CAF parse error: {0}")]
    CafParse(String),
    #[error("invalid CAF: {0}")]
    InvalidCaf(String),
    #[error("folio {folio} outside authorized range [{lower}, {upper}]")]
    FolioOutOfRange { folio: u32, lower: u32, upper: u32 },
    #[error("stamp serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RngXml {
    #[serde(rename = "D")]
    pub lower: u32,
    #[serde(rename = "H")]
    pub upper: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RsapkXml {
    #[serde(rename = "M")]
    pub modulus: String,
    #[serde(rename = "E")]
    pub exponent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DaXml {
    #[serde(rename = "RE")]
    pub emitter_rut: String,
    #[serde(rename = "RS")]
    pub emitter_name: String,
    #[serde(rename = "TD")]
    pub type_code: u16,
    #[serde(rename = "RNG")]
    pub range: RngXml,
    #[serde(rename = "FA")]
    pub authorized_at: String,
    #[serde(rename = "RSAPK")]
    pub public_key: RsapkXml,
    #[serde(rename = "IDK")]
    pub key_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FrmaXml {
    #[serde(rename = "@algoritmo")]
    pub algorithm: String,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "CAF")]
pub(crate) struct CafXml {
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "DA")]
    pub da: DaXml,
    #[serde(rename = "FRMA")]
    pub frma: FrmaXml,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "AUTORIZACION")]
struct AutorizacionXml {
    #[serde(rename = "CAF")]
    caf: CafXml,
}

/// A parsed folio authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caf {
    xml: CafXml,
    authorized_at: NaiveDate,
}

impl Caf {
    /// Parse the authorization file the authority delivers
    /// (`<AUTORIZACION><CAF version="1.0">…`).
    ///
    /// # Errors
    /// Returns [`StampError`] when the XML cannot be parsed or fails the
    /// structural checks (version, date format).
    pub fn parse(xml: &str) -> Result<Self, StampError> {
        let autorizacion: AutorizacionXml =
            quick_xml::de::from_str(xml).map_err(|e| StampError::CafParse(format!("{e:?}")))?;
        let caf = autorizacion.caf;
        if caf.version != CAF_VERSION {
            return Err(StampError::InvalidCaf(format!(
                "unsupported CAF version {}",
                caf.version
            )));
        }
        let authorized_at = NaiveDate::parse_from_str(&caf.da.authorized_at, "%Y-%m-%d")
            .map_err(|e| {
                StampError::InvalidCaf(format!(
                    "authorization date '{}': {e}",
                    caf.da.authorized_at
                ))
            })?;
        Ok(Self {
            xml: caf,
            authorized_at,
        })
    }

    pub fn emitter_rut(&self) -> &str {
        &self.xml.da.emitter_rut
    }

    pub fn emitter_name(&self) -> &str {
        &self.xml.da.emitter_name
    }

    pub fn type_code(&self) -> u16 {
        self.xml.da.type_code
    }

    /// Inclusive authorized folio range.
    pub fn folio_range(&self) -> (u32, u32) {
        (self.xml.da.range.lower, self.xml.da.range.upper)
    }

    pub fn authorized_at(&self) -> NaiveDate {
        self.authorized_at
    }

    pub fn contains(&self, folio: u32) -> bool {
        folio >= self.xml.da.range.lower && folio <= self.xml.da.range.upper
    }

    pub(crate) fn xml(&self) -> &CafXml {
        &self.xml
    }

    /// Check the CAF against the document it is about to stamp: emitter RUT
    /// must match and the authorization date must not lie in the future.
    ///
    /// # Errors
    /// Returns [`StampError::InvalidCaf`] on any mismatch.
    pub fn validate_for(&self, emitter_rut: &str, today: NaiveDate) -> Result<(), StampError> {
        if strip_hyphens(self.emitter_rut()) != strip_hyphens(emitter_rut) {
            return Err(StampError::InvalidCaf(format!(
                "CAF emitter {} does not match document emitter {emitter_rut}",
                self.emitter_rut()
            )));
        }
        if self.authorized_at > today {
            return Err(StampError::InvalidCaf(format!(
                "authorization date {} lies in the future",
                self.authorized_at
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "DD")]
pub(crate) struct DdXml {
    #[serde(rename = "RE")]
    pub emitter_rut: String,
    #[serde(rename = "TD")]
    pub type_code: u16,
    #[serde(rename = "F")]
    pub folio: String,
    #[serde(rename = "FE")]
    pub issued_at: String,
    #[serde(rename = "RR")]
    pub receiver_rut: String,
    #[serde(rename = "RSR")]
    pub receiver_name: String,
    #[serde(rename = "MNT")]
    pub total: String,
    #[serde(rename = "IT1")]
    pub first_item: String,
    #[serde(rename = "CAF")]
    pub caf: CafXml,
    #[serde(rename = "TSTED")]
    pub stamped_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "TED")]
pub(crate) struct TedXml {
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "DD")]
    pub dd: DdXml,
    #[serde(rename = "FRMT")]
    pub frmt: FrmaXml,
}

/// The electronic stamp embedded in every document before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct Ted {
    xml: TedXml,
}

impl Ted {
    /// Generate a stamp for `document` from `caf`, signing the DD block with
    /// `identity`. Fails before producing anything when the folio is outside
    /// the authorized range or the CAF does not belong to the emitter.
    ///
    /// # Errors
    /// Returns [`StampError`] and leaves no partial stamp behind.
    pub fn generate(
        document: &TaxDocument,
        caf: &Caf,
        identity: &Arc<SigningIdentity>,
        now: DateTime<Utc>,
    ) -> Result<Self, StampError> {
        caf.validate_for(document.emitter().rut(), now.date_naive())?;
        if !caf.contains(document.folio()) {
            let (lower, upper) = caf.folio_range();
            return Err(StampError::FolioOutOfRange {
                folio: document.folio(),
                lower,
                upper,
            });
        }

        let receiver_rut = match document.receiver() {
            Some(receiver) => strip_hyphens(receiver.rut()),
            None => document.receiver_rut().to_string(),
        };
        let first_item = document
            .items()
            .first()
            .map(|item| truncate_chars(item.name(), MAX_ITEM_NAME_LEN))
            .unwrap_or_default();

        let dd = DdXml {
            emitter_rut: strip_hyphens(document.emitter().rut()),
            type_code: document.kind().code(),
            folio: document.folio().to_string(),
            issued_at: document.issued_at().format("%Y-%m-%d").to_string(),
            receiver_rut,
            receiver_name: document.receiver_name().to_string(),
            total: document.totals().total().to_string(),
            first_item,
            caf: caf.xml().clone(),
            stamped_at: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        };

        let dd_xml = quick_xml::se::to_string(&dd)
            .map_err(|e| StampError::Serialization(format!("{e:?}")))?;
        let engine = SignatureEngine::new(Arc::clone(identity)).with_algorithm(DigestAlgorithm::Sha1);
        let signature = engine.sign_raw(dd_xml.as_bytes())?;
        debug!(folio = document.folio(), "generated TED stamp");

        Ok(Self {
            xml: TedXml {
                version: "1.0".to_string(),
                dd,
                frmt: FrmaXml {
                    algorithm: STAMP_ALGORITHM.to_string(),
                    value: Base64::encode_string(&signature),
                },
            },
        })
    }

    /// Render the stamp as an XML element.
    ///
    /// # Errors
    /// Returns [`StampError::Serialization`] when serialization fails.
    pub fn to_xml(&self) -> Result<String, StampError> {
        quick_xml::se::to_string(&self.xml).map_err(|e| StampError::Serialization(format!("{e:?}")))
    }

    /// Verify the FRMT signature against the stamping identity's public key.
    ///
    /// # Errors
    /// Returns [`StampError`] when the DD cannot be re-serialized or the
    /// signature does not match.
    pub fn verify(&self, identity: &SigningIdentity) -> Result<(), StampError> {
        let dd_xml = quick_xml::se::to_string(&self.xml.dd)
            .map_err(|e| StampError::Serialization(format!("{e:?}")))?;
        let digest = crate::canonical::digest(dd_xml.as_bytes(), DigestAlgorithm::Sha1);
        let signature = Base64::decode_vec(&self.xml.frmt.value)
            .map_err(|e| StampError::Serialization(format!("{e:?}")))?;
        identity
            .public_key()
            .verify(rsa::Pkcs1v15Sign::new::<sha1::Sha1>(), &digest, &signature)
            .map_err(|e| StampError::Signing(SigningError::Key(format!("{e:?}"))))
    }

    pub fn folio(&self) -> &str {
        &self.xml.dd.folio
    }

    pub fn total(&self) -> &str {
        &self.xml.dd.total
    }

    pub fn receiver_rut(&self) -> &str {
        &self.xml.dd.receiver_rut
    }

    pub(crate) fn xml(&self) -> &TedXml {
        &self.xml
    }
}

pub(crate) fn strip_hyphens(rut: &str) -> String {
    rut.replace('-', "")
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
