//! Deterministic XML canonicalization and digests.
//!
//! Produces a stable byte form for signing and verification: attributes
//! sorted by name, empty elements expanded, XML declaration, comments and
//! processing instructions dropped, text re-escaped with the standard
//! entities. Whitespace between elements is preserved as-is, so the same
//! input always canonicalizes to the same bytes.
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors returned while canonicalizing XML.
#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("XML parse error: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("XML attribute error: {0}")]
    Attribute(#[from] AttrError),
}

/// Digest algorithm used for references and signatures.
///
/// SII schemas predate SHA-2, so SHA-1 stays the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn digest_method_uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    pub fn signature_method_uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
        }
    }

    pub(crate) fn from_digest_method_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(DigestAlgorithm::Sha1),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Digest `bytes` with the given algorithm.
pub fn digest(bytes: &[u8], algorithm: DigestAlgorithm) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Sha1 => Sha1::digest(bytes).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
    }
}

/// Canonicalize an XML fragment or document into its deterministic byte form.
///
/// # Errors
/// Returns [`CanonicalError`] when the input is not well-formed XML.
pub fn canonicalize(xml: &str) -> Result<Vec<u8>, CanonicalError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::with_capacity(xml.len());
    loop {
        match reader.read_event()? {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Start(e) => write_open_tag(&mut out, &e)?,
            Event::Empty(e) => {
                write_open_tag(&mut out, &e)?;
                out.extend_from_slice(b"</");
                out.extend_from_slice(e.name().as_ref());
                out.push(b'>');
            }
            Event::End(e) => {
                out.extend_from_slice(b"</");
                out.extend_from_slice(e.name().as_ref());
                out.push(b'>');
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                push_escaped(&mut out, &text, false);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                let text = String::from_utf8_lossy(&raw);
                push_escaped(&mut out, &text, false);
            }
            Event::Eof => break,
        }
    }
    Ok(out)
}

fn write_open_tag(out: &mut Vec<u8>, e: &BytesStart<'_>) -> Result<(), CanonicalError> {
    out.push(b'<');
    out.extend_from_slice(e.name().as_ref());

    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref().to_vec();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    attrs.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in attrs {
        out.push(b' ');
        out.extend_from_slice(&key);
        out.extend_from_slice(b"=\"");
        push_escaped(out, &value, true);
        out.push(b'"');
    }
    out.push(b'>');
    Ok(())
}

fn push_escaped(out: &mut Vec<u8>, text: &str, in_attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            '"' if in_attribute => out.extend_from_slice(b"&quot;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}
