//! Chilean SII electronic tax document (DTE) toolkit: TED stamping,
//! XML-DSIG signing, envelope assembly and the seed/token/submit protocol.
//!
//! # Examples
//! ```rust
//! use dte_core::config::{Config, Environment};
//!
//! let config = Config::new(Environment::Certification);
//! # let _ = config;
//! ```
pub mod canonical;
pub mod config;
pub mod document;
pub mod envelope;
pub mod identity;
pub mod sii;
pub mod ted;
pub mod xmldsig;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Identity(#[from] identity::IdentityError),
    #[error(transparent)]
    Canonical(#[from] canonical::CanonicalError),
    #[error(transparent)]
    Signing(#[from] xmldsig::SigningError),
    #[error(transparent)]
    Verification(#[from] xmldsig::VerificationError),
    #[error(transparent)]
    Document(#[from] document::DocumentError),
    #[error(transparent)]
    Stamp(#[from] ted::StampError),
    #[error(transparent)]
    Assembly(#[from] envelope::AssemblyError),
    #[error(transparent)]
    Sii(#[from] sii::SiiError),
}
