//! Enveloped XML-DSIG signature engine.
//!
//! One engine signs everything the crate emits: document subtrees, envelope
//! subtrees and the raw seed challenge of the authentication handshake. The
//! signature block carries the signer's RSA key parameters and certificate so
//! that receivers can verify without out-of-band key exchange.
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use quick_xml::events::Event;
use quick_xml::Reader;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use x509_cert::{
    der::{Decode, Encode},
    Certificate,
};

use crate::canonical::{canonicalize, digest, CanonicalError, DigestAlgorithm};
use crate::identity::{IdentityError, SigningIdentity};

pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const C14N_METHOD: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const ENVELOPED_TRANSFORM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Errors returned while producing signatures.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("Signature serialization error: {0}")]
    Serialization(String),
    #[error("RSA signing error: {0}")]
    Key(String),
    #[error("signer RUT {identity} does not match document emitter {document}")]
    RutMismatch { identity: String, document: String },
}

/// Errors returned while verifying a signed document.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("no signature element present")]
    MissingSignature,
    #[error("Malformed signature: {0}")]
    Malformed(String),
    #[error("digest mismatch for reference {uri}")]
    DigestMismatch { uri: String },
    #[error("signature value does not verify against the embedded certificate")]
    SignatureInvalid,
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlgorithmAttr {
    #[serde(rename = "@Algorithm")]
    algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transforms {
    #[serde(rename = "Transform")]
    transform: AlgorithmAttr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reference {
    #[serde(rename = "@URI")]
    uri: String,
    #[serde(rename = "Transforms")]
    transforms: Transforms,
    #[serde(rename = "DigestMethod")]
    digest_method: AlgorithmAttr,
    #[serde(rename = "DigestValue")]
    digest_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedInfo {
    #[serde(rename = "CanonicalizationMethod")]
    canonicalization_method: AlgorithmAttr,
    #[serde(rename = "SignatureMethod")]
    signature_method: AlgorithmAttr,
    #[serde(rename = "Reference")]
    reference: Reference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RsaKeyValue {
    #[serde(rename = "Modulus")]
    modulus: String,
    #[serde(rename = "Exponent")]
    exponent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyValue {
    #[serde(rename = "RSAKeyValue")]
    rsa_key_value: RsaKeyValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct X509Data {
    #[serde(rename = "X509Certificate")]
    certificate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyInfo {
    #[serde(rename = "KeyValue")]
    key_value: KeyValue,
    #[serde(rename = "X509Data")]
    x509_data: X509Data,
}

/// An enveloped XML-DSIG signature over a single reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "Signature")]
pub struct SignatureBlock {
    #[serde(rename = "@xmlns")]
    xmlns: String,
    #[serde(rename = "SignedInfo")]
    signed_info: SignedInfo,
    #[serde(rename = "SignatureValue")]
    signature_value: String,
    #[serde(rename = "KeyInfo")]
    key_info: KeyInfo,
}

impl SignatureBlock {
    /// Render the signature as an XML element.
    ///
    /// # Errors
    /// Returns [`SigningError::Serialization`] when serialization fails.
    pub fn to_xml(&self) -> Result<String, SigningError> {
        quick_xml::se::to_string(self).map_err(|e| SigningError::Serialization(format!("{e:?}")))
    }

    pub fn reference_uri(&self) -> &str {
        &self.signed_info.reference.uri
    }

    pub fn digest_value(&self) -> &str {
        &self.signed_info.reference.digest_value
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }
}

/// Signature engine bound to one [`SigningIdentity`].
#[derive(Debug, Clone)]
pub struct SignatureEngine {
    identity: Arc<SigningIdentity>,
    algorithm: DigestAlgorithm,
}

impl SignatureEngine {
    pub fn new(identity: Arc<SigningIdentity>) -> Self {
        Self {
            identity,
            algorithm: DigestAlgorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn identity(&self) -> &Arc<SigningIdentity> {
        &self.identity
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Sign an XML subtree, producing an enveloped signature block whose
    /// reference points at `#reference_id`.
    ///
    /// # Errors
    /// Returns [`SigningError`] when the subtree is not well-formed XML or
    /// the RSA operation fails.
    pub fn sign_reference(
        &self,
        xml: &str,
        reference_id: &str,
    ) -> Result<SignatureBlock, SigningError> {
        let canonical = canonicalize(xml)?;
        let digest_bytes = digest(&canonical, self.algorithm);
        let signature = self.sign_digest(&digest_bytes)?;
        debug!(reference_id, "signed XML reference");

        Ok(SignatureBlock {
            xmlns: XMLDSIG_NS.to_string(),
            signed_info: SignedInfo {
                canonicalization_method: AlgorithmAttr {
                    algorithm: C14N_METHOD.to_string(),
                },
                signature_method: AlgorithmAttr {
                    algorithm: self.algorithm.signature_method_uri().to_string(),
                },
                reference: Reference {
                    uri: format!("#{reference_id}"),
                    transforms: Transforms {
                        transform: AlgorithmAttr {
                            algorithm: ENVELOPED_TRANSFORM.to_string(),
                        },
                    },
                    digest_method: AlgorithmAttr {
                        algorithm: self.algorithm.digest_method_uri().to_string(),
                    },
                    digest_value: Base64::encode_string(&digest_bytes),
                },
            },
            signature_value: Base64::encode_string(&signature),
            key_info: KeyInfo {
                key_value: KeyValue {
                    rsa_key_value: RsaKeyValue {
                        modulus: self.identity.modulus_base64(),
                        exponent: self.identity.exponent_base64(),
                    },
                },
                x509_data: X509Data {
                    certificate: self.identity.certificate_base64()?,
                },
            },
        })
    }

    /// Sign raw bytes without canonicalization. Used for the seed challenge,
    /// which is a plain string rather than a document subtree.
    ///
    /// # Errors
    /// Returns [`SigningError::Key`] when the RSA operation fails.
    pub fn sign_raw(&self, bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
        let digest_bytes = digest(bytes, self.algorithm);
        self.sign_digest(&digest_bytes)
    }

    fn sign_digest(&self, digest_bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
        let padding = pkcs1v15_padding(self.algorithm);
        self.identity
            .private_key()
            .sign(padding, digest_bytes)
            .map_err(|e| SigningError::Key(format!("{e:?}")))
    }
}

fn pkcs1v15_padding(algorithm: DigestAlgorithm) -> Pkcs1v15Sign {
    match algorithm {
        DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
    }
}

/// Verify the last enveloped signature in `signed_xml` against the
/// certificate it embeds.
///
/// The check distinguishes three failure causes: no signature present, the
/// referenced content no longer matching its digest, and a signature value
/// that does not verify against the embedded key.
///
/// # Errors
/// Returns [`VerificationError`] describing which check failed.
pub fn verify(signed_xml: &str) -> Result<(), VerificationError> {
    let (sig_start, sig_end) =
        find_signature_span(signed_xml).ok_or(VerificationError::MissingSignature)?;
    let block: SignatureBlock = quick_xml::de::from_str(&signed_xml[sig_start..sig_end])
        .map_err(|e| VerificationError::Malformed(format!("{e:?}")))?;

    let uri = block.signed_info.reference.uri.clone();
    let reference_id = uri
        .strip_prefix('#')
        .ok_or_else(|| VerificationError::Malformed(format!("unsupported reference URI {uri}")))?;

    let mut remainder = String::with_capacity(signed_xml.len());
    remainder.push_str(&signed_xml[..sig_start]);
    remainder.push_str(&signed_xml[sig_end..]);

    let (target_start, target_end) = element_span_by_id(&remainder, reference_id)
        .ok_or_else(|| VerificationError::Malformed(format!("reference target {uri} not found")))?;

    let algorithm =
        DigestAlgorithm::from_digest_method_uri(&block.signed_info.reference.digest_method.algorithm)
            .ok_or_else(|| {
                VerificationError::Malformed(format!(
                    "unsupported digest method {}",
                    block.signed_info.reference.digest_method.algorithm
                ))
            })?;

    let canonical = canonicalize(&remainder[target_start..target_end])?;
    let computed = digest(&canonical, algorithm);
    let declared = Base64::decode_vec(&block.signed_info.reference.digest_value)
        .map_err(|e| VerificationError::Malformed(format!("digest value base64: {e:?}")))?;
    if computed != declared {
        return Err(VerificationError::DigestMismatch { uri });
    }

    let cert_der = Base64::decode_vec(&block.key_info.x509_data.certificate)
        .map_err(|e| VerificationError::Malformed(format!("certificate base64: {e:?}")))?;
    let certificate = Certificate::from_der(&cert_der)
        .map_err(|e| VerificationError::Malformed(format!("certificate parse: {e:?}")))?;
    let spki_der = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| VerificationError::Malformed(format!("public key encode: {e:?}")))?;
    let public_key = RsaPublicKey::from_public_key_der(&spki_der)
        .map_err(|e| VerificationError::Malformed(format!("public key parse: {e:?}")))?;

    let signature = Base64::decode_vec(&block.signature_value)
        .map_err(|e| VerificationError::Malformed(format!("signature value base64: {e:?}")))?;
    public_key
        .verify(pkcs1v15_padding(algorithm), &computed, &signature)
        .map_err(|_| VerificationError::SignatureInvalid)
}

/// Byte span of the last `<Signature …>…</Signature>` element.
fn find_signature_span(xml: &str) -> Option<(usize, usize)> {
    let start = xml
        .match_indices("<Signature")
        .filter(|(i, _)| {
            matches!(
                xml.as_bytes().get(i + "<Signature".len()),
                Some(b' ') | Some(b'>')
            )
        })
        .map(|(i, _)| i)
        .last()?;
    let end_tag = "</Signature>";
    let end = xml[start..].find(end_tag)? + start + end_tag.len();
    Some((start, end))
}

/// Byte span of the element carrying `ID="id"`, including its tags.
fn element_span_by_id(xml: &str, id: &str) -> Option<(usize, usize)> {
    let mut reader = Reader::from_str(xml);
    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event().ok()? {
            Event::Start(e) => {
                let matched = e.attributes().flatten().any(|a| {
                    a.key.as_ref() == b"ID"
                        && a.unescape_value().map(|v| v == id).unwrap_or(false)
                });
                if !matched {
                    continue;
                }
                let name = e.name().as_ref().to_vec();
                let mut depth = 0usize;
                loop {
                    match reader.read_event().ok()? {
                        Event::Start(s) if s.name().as_ref() == name.as_slice() => depth += 1,
                        Event::End(s) if s.name().as_ref() == name.as_slice() => {
                            if depth == 0 {
                                return Some((before, reader.buffer_position() as usize));
                            }
                            depth -= 1;
                        }
                        Event::Eof => return None,
                        _ => {}
                    }
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_without_signature_is_missing() {
        let err = verify(r#"<Documento ID="F1T39"><Folio>1</Folio></Documento>"#)
            .expect_err("no signature");
        assert!(matches!(err, VerificationError::MissingSignature));
    }

    #[test]
    fn verify_rejects_malformed_signature_block() {
        let xml = r#"<Documento ID="F1T39"><Signature xmlns="x"><Broken/></Signature></Documento>"#;
        let err = verify(xml).expect_err("malformed block");
        assert!(matches!(err, VerificationError::Malformed(_)));
    }

    #[test]
    fn signature_value_element_is_not_a_signature_span() {
        let xml = r#"<a><SignatureValue>zzz</SignatureValue></a>"#;
        assert!(find_signature_span(xml).is_none());
    }

    #[test]
    fn element_span_finds_identified_subtree() {
        let xml = r#"<DTE><Documento ID="F7T39"><Folio>7</Folio></Documento></DTE>"#;
        let (start, end) = element_span_by_id(xml, "F7T39").expect("span");
        assert_eq!(
            &xml[start..end],
            r#"<Documento ID="F7T39"><Folio>7</Folio></Documento>"#
        );
    }

    #[test]
    fn element_span_handles_nested_same_name() {
        let xml = r#"<a><b ID="x"><b>inner</b></b></a>"#;
        let (start, end) = element_span_by_id(xml, "x").expect("span");
        assert_eq!(&xml[start..end], r#"<b ID="x"><b>inner</b></b>"#);
    }

    #[test]
    fn element_span_missing_id_is_none() {
        assert!(element_span_by_id("<a><b>1</b></a>", "nope").is_none());
    }
}
