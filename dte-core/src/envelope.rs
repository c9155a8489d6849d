//! Envelope assembly: document rendering, stamping, signing and the
//! carátula header.
//!
//! Assembly is two-phase: an [`Envelope`] is immutable unsigned data, and
//! [`Envelope::sign`] consumes it into a [`SignedEnvelope`] that stores the
//! final XML. There is no re-signing path; repeated serialization returns
//! the stored bytes unchanged.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::document::{DocumentKind, Party, TaxDocument};
use crate::identity::SigningIdentity;
use crate::ted::{strip_hyphens, Caf, StampError, Ted, TedXml};
use crate::xmldsig::{SignatureEngine, SigningError};

/// Reference id of the document set inside the envelope.
pub const SET_DOC_ID: &str = "SetDoc";

const SII_DTE_NS: &str = "http://www.sii.cl/SiiDte";
const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Errors returned while assembling or signing an envelope.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("cannot assemble an empty batch")]
    EmptyBatch,
    #[error("heterogeneous batch: {0}")]
    HeterogeneousBatch(String),
    #[error(transparent)]
    Stamp(#[from] StampError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("envelope serialization error: {0}")]
    Serialization(String),
}

/// The authority resolution that enabled the emitter to issue documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    date: NaiveDate,
    number: u32,
}

impl Resolution {
    pub fn new(date: NaiveDate, number: u32) -> Self {
        Self { date, number }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

#[derive(Debug, Serialize)]
struct IdDocXml {
    #[serde(rename = "TipoDTE")]
    type_code: u16,
    #[serde(rename = "Folio")]
    folio: u32,
    #[serde(rename = "FchEmis")]
    issued_at: String,
    #[serde(rename = "FchVenc", skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmisorXml {
    #[serde(rename = "RUTEmisor")]
    rut: String,
    #[serde(rename = "RznSoc")]
    name: String,
    #[serde(rename = "GiroEmis")]
    activity: String,
    #[serde(rename = "DirOrigen")]
    address: String,
    #[serde(rename = "CmnaOrigen")]
    municipality: String,
    #[serde(rename = "CiudadOrigen")]
    city: String,
}

#[derive(Debug, Serialize)]
struct ReceptorXml {
    #[serde(rename = "RUTRecep")]
    rut: String,
    #[serde(rename = "RznSocRecep")]
    name: String,
    #[serde(rename = "GiroRecep")]
    activity: String,
    #[serde(rename = "DirRecep")]
    address: String,
    #[serde(rename = "CmnaRecep")]
    municipality: String,
    #[serde(rename = "CiudadRecep")]
    city: String,
}

impl From<&Party> for ReceptorXml {
    fn from(party: &Party) -> Self {
        Self {
            rut: party.rut().to_string(),
            name: party.name().to_string(),
            activity: party.activity().to_string(),
            address: party.address().to_string(),
            municipality: party.municipality().to_string(),
            city: party.city().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TotalesXml {
    #[serde(rename = "MntNeto", skip_serializing_if = "Option::is_none")]
    net: Option<i64>,
    #[serde(rename = "MntExe", skip_serializing_if = "Option::is_none")]
    exempt: Option<i64>,
    #[serde(rename = "TasaIVA", skip_serializing_if = "Option::is_none")]
    tax_rate: Option<f64>,
    #[serde(rename = "IVA", skip_serializing_if = "Option::is_none")]
    tax: Option<i64>,
    #[serde(rename = "MntTotal")]
    total: i64,
}

#[derive(Debug, Serialize)]
struct EncabezadoXml {
    #[serde(rename = "IdDoc")]
    id_doc: IdDocXml,
    #[serde(rename = "Emisor")]
    emitter: EmisorXml,
    #[serde(rename = "Receptor", skip_serializing_if = "Option::is_none")]
    receiver: Option<ReceptorXml>,
    #[serde(rename = "Totales")]
    totals: TotalesXml,
}

#[derive(Debug, Serialize)]
struct CdgItemXml {
    #[serde(rename = "TpoCodigo")]
    kind: String,
    #[serde(rename = "VlrCodigo")]
    value: String,
}

#[derive(Debug, Serialize)]
struct DetalleXml {
    #[serde(rename = "NroLinDet")]
    line: usize,
    #[serde(rename = "CdgItem", skip_serializing_if = "Option::is_none")]
    product_code: Option<CdgItemXml>,
    #[serde(rename = "IndExe", skip_serializing_if = "Option::is_none")]
    exempt: Option<u8>,
    #[serde(rename = "NmbItem")]
    name: String,
    #[serde(rename = "QtyItem")]
    quantity: f64,
    #[serde(rename = "PrcItem")]
    unit_price: i64,
    #[serde(rename = "DescuentoMonto", skip_serializing_if = "Option::is_none")]
    discount: Option<i64>,
    #[serde(rename = "MontoItem")]
    amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename = "Documento")]
struct DocumentoXml {
    #[serde(rename = "@ID")]
    id: String,
    #[serde(rename = "Encabezado")]
    header: EncabezadoXml,
    #[serde(rename = "Detalle")]
    details: Vec<DetalleXml>,
    #[serde(rename = "TED")]
    ted: TedXml,
    #[serde(rename = "TmstFirma")]
    signed_at: String,
}

impl DocumentoXml {
    fn build(document: &TaxDocument, ted: TedXml, now: DateTime<Utc>) -> Self {
        let totals = document.totals();
        let details = document
            .items()
            .iter()
            .enumerate()
            .map(|(index, item)| DetalleXml {
                line: index + 1,
                product_code: item.product_code().map(|code| CdgItemXml {
                    kind: "INT1".to_string(),
                    value: code.to_string(),
                }),
                exempt: item.is_exempt().then_some(1),
                name: item.name().to_string(),
                quantity: item.quantity(),
                unit_price: item.unit_price(),
                discount: (item.discount() > 0).then_some(item.discount()),
                amount: item.amount(),
            })
            .collect();

        Self {
            id: document.reference_id(),
            header: EncabezadoXml {
                id_doc: IdDocXml {
                    type_code: document.kind().code(),
                    folio: document.folio(),
                    issued_at: document.issued_at().format("%Y-%m-%d").to_string(),
                    due_date: document
                        .due_date()
                        .map(|date| date.format("%Y-%m-%d").to_string()),
                },
                emitter: EmisorXml {
                    rut: document.emitter().rut().to_string(),
                    name: document.emitter().name().to_string(),
                    activity: document.emitter().activity().to_string(),
                    address: document.emitter().address().to_string(),
                    municipality: document.emitter().municipality().to_string(),
                    city: document.emitter().city().to_string(),
                },
                receiver: document.receiver().map(ReceptorXml::from),
                totals: TotalesXml {
                    net: (totals.net() > 0).then_some(totals.net()),
                    exempt: (totals.exempt() > 0).then_some(totals.exempt()),
                    tax_rate: (totals.tax() > 0).then_some(crate::document::IVA_RATE_PERCENT),
                    tax: (totals.tax() > 0).then_some(totals.tax()),
                    total: totals.total(),
                },
            },
            details,
            ted,
            signed_at: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubTotDteXml {
    #[serde(rename = "TpoDTE")]
    type_code: u16,
    #[serde(rename = "NroDTE")]
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename = "Caratula")]
struct CaratulaXml {
    #[serde(rename = "@version")]
    version: String,
    #[serde(rename = "RutEmisor")]
    emitter_rut: String,
    #[serde(rename = "RutEnvia")]
    sender_rut: String,
    #[serde(rename = "RutReceptor")]
    receiver_rut: String,
    #[serde(rename = "FchResol")]
    resolution_date: String,
    #[serde(rename = "NroResol")]
    resolution_number: u32,
    #[serde(rename = "TmstFirmaEnv")]
    signed_at: String,
    #[serde(rename = "SubTotDTE")]
    subtotals: Vec<SubTotDteXml>,
}

/// A stamped and signed document, ready for the envelope.
#[derive(Debug, Clone)]
pub struct SignedDocument {
    xml: String,
    kind: DocumentKind,
    folio: u32,
}

impl SignedDocument {
    pub fn to_xml(&self) -> &str {
        &self.xml
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn folio(&self) -> u32 {
        self.folio
    }
}

/// Unsigned envelope data. Immutable; [`Envelope::sign`] is the only way
/// forward.
#[derive(Debug)]
pub struct Envelope {
    caratula: CaratulaXml,
    documents: Vec<SignedDocument>,
}

impl Envelope {
    pub fn documents(&self) -> &[SignedDocument] {
        &self.documents
    }

    /// Sign the `SetDTE` subtree and freeze the envelope into its final XML.
    ///
    /// # Errors
    /// Returns [`AssemblyError`] when serialization or signing fails.
    pub fn sign(self, engine: &SignatureEngine) -> Result<SignedEnvelope, AssemblyError> {
        let caratula = quick_xml::se::to_string(&self.caratula)
            .map_err(|e| AssemblyError::Serialization(format!("{e:?}")))?;

        let mut set = String::new();
        set.push_str(&format!("<SetDTE ID=\"{SET_DOC_ID}\">"));
        set.push_str(&caratula);
        for document in &self.documents {
            set.push_str(document.to_xml());
        }
        set.push_str("</SetDTE>");

        let signature = engine.sign_reference(&set, SET_DOC_ID)?.to_xml()?;
        let xml = format!(
            "{XML_DECLARATION}\n<EnvioDTE xmlns=\"{SII_DTE_NS}\" version=\"1.0\">{set}{signature}</EnvioDTE>"
        );
        info!(documents = self.documents.len(), "envelope signed");
        Ok(SignedEnvelope {
            documents: self.documents,
            xml,
        })
    }
}

/// A signed envelope. The XML is fixed at signing time; [`to_xml`] returns
/// the same bytes on every call.
///
/// [`to_xml`]: SignedEnvelope::to_xml
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    documents: Vec<SignedDocument>,
    xml: String,
}

impl SignedEnvelope {
    pub fn to_xml(&self) -> &str {
        &self.xml
    }

    pub fn documents(&self) -> &[SignedDocument] {
        &self.documents
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

/// Builds signed envelopes out of documents, a CAF and a resolution.
#[derive(Debug, Clone)]
pub struct EnvelopeAssembler {
    config: Config,
    engine: SignatureEngine,
}

impl EnvelopeAssembler {
    pub fn new(config: Config, identity: Arc<SigningIdentity>) -> Self {
        Self {
            config,
            engine: SignatureEngine::new(identity),
        }
    }

    pub fn engine(&self) -> &SignatureEngine {
        &self.engine
    }

    /// Assemble and sign an envelope around a single document.
    ///
    /// # Errors
    /// Returns [`AssemblyError`] when stamping, signing or serialization
    /// fails.
    pub fn assemble_single(
        &self,
        document: TaxDocument,
        caf: &Caf,
        resolution: &Resolution,
    ) -> Result<SignedEnvelope, AssemblyError> {
        self.assemble_batch(vec![document], caf, resolution)
    }

    /// Assemble and sign an envelope around a homogeneous batch.
    ///
    /// Mixed document types or mixed emitters are rejected before any
    /// signing happens.
    ///
    /// # Errors
    /// Returns [`AssemblyError::HeterogeneousBatch`] on mixed batches, and
    /// other [`AssemblyError`] variants for stamping and signing failures.
    pub fn assemble_batch(
        &self,
        documents: Vec<TaxDocument>,
        caf: &Caf,
        resolution: &Resolution,
    ) -> Result<SignedEnvelope, AssemblyError> {
        let first = documents.first().ok_or(AssemblyError::EmptyBatch)?;
        let kind = first.kind();
        let emitter = first.emitter().clone();

        for document in &documents {
            if document.kind() != kind {
                return Err(AssemblyError::HeterogeneousBatch(format!(
                    "type {} mixed with type {}",
                    kind.code(),
                    document.kind().code()
                )));
            }
            if document.emitter().rut() != emitter.rut() {
                return Err(AssemblyError::HeterogeneousBatch(format!(
                    "emitter {} mixed with emitter {}",
                    emitter.rut(),
                    document.emitter().rut()
                )));
            }
        }

        let identity_rut = self.engine.identity().rut().to_string();
        if strip_hyphens(&identity_rut) != strip_hyphens(emitter.rut()) {
            return Err(AssemblyError::Signing(SigningError::RutMismatch {
                identity: identity_rut,
                document: emitter.rut().to_string(),
            }));
        }

        let now = Utc::now();
        let signed_documents = documents
            .iter()
            .map(|document| self.sign_document(document, caf, now))
            .collect::<Result<Vec<_>, _>>()?;

        let receiver_rut = if kind.is_boleta() {
            self.config.authority_rut().to_string()
        } else {
            // non-boleta documents always carry a receiver
            first
                .receiver()
                .map(|party| party.rut().to_string())
                .unwrap_or_else(|| self.config.authority_rut().to_string())
        };

        let caratula = CaratulaXml {
            version: "1.0".to_string(),
            emitter_rut: emitter.rut().to_string(),
            sender_rut: identity_rut,
            receiver_rut,
            resolution_date: resolution.date().format("%Y-%m-%d").to_string(),
            resolution_number: resolution.number(),
            signed_at: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            subtotals: count_subtotals(&documents),
        };

        Envelope {
            caratula,
            documents: signed_documents,
        }
        .sign(&self.engine)
    }

    fn sign_document(
        &self,
        document: &TaxDocument,
        caf: &Caf,
        now: DateTime<Utc>,
    ) -> Result<SignedDocument, AssemblyError> {
        // the stamp goes in before the signature so the digest covers it
        let ted = Ted::generate(document, caf, self.engine.identity(), now)?;
        let documento = quick_xml::se::to_string(&DocumentoXml::build(
            document,
            ted.xml().clone(),
            now,
        ))
        .map_err(|e| AssemblyError::Serialization(format!("{e:?}")))?;

        let signature = self
            .engine
            .sign_reference(&documento, &document.reference_id())?
            .to_xml()?;
        debug!(folio = document.folio(), "document signed");

        Ok(SignedDocument {
            xml: format!("<DTE version=\"1.0\">{documento}{signature}</DTE>"),
            kind: document.kind(),
            folio: document.folio(),
        })
    }
}

fn count_subtotals(documents: &[TaxDocument]) -> Vec<SubTotDteXml> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for document in documents {
        *counts.entry(document.kind().code()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(type_code, count)| SubTotDteXml { type_code, count })
        .collect()
}
