use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dte_core::document::{DocumentKind, DteBuilder, LineItem, Party, TaxDocument};
use dte_core::envelope::Resolution;
use dte_core::identity::SigningIdentity;
use dte_core::ted::Caf;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::EncodePem;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate;

#[allow(dead_code)]
pub const EMITTER_RUT: &str = "76543210-K";

/// Self-signed identity with a freshly generated RSA key.
pub fn test_identity() -> Arc<SigningIdentity> {
    test_identity_with_rut(EMITTER_RUT)
}

#[allow(dead_code)]
pub fn test_identity_with_rut(rut: &str) -> Arc<SigningIdentity> {
    let (private_key, certificate) = test_key_and_certificate(rut);
    let cert_pem = certificate.to_pem(LineEnding::LF).expect("certificate pem");
    let key_pem = private_key.to_pkcs8_pem(LineEnding::LF).expect("key pem");
    Arc::new(SigningIdentity::from_pem(&cert_pem, &key_pem, rut).expect("identity"))
}

/// Fresh RSA key plus a self-signed certificate for it.
#[allow(dead_code)]
pub fn test_key_and_certificate(rut: &str) -> (RsaPrivateKey, Certificate) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());

    let public_key_der = private_key
        .to_public_key()
        .to_public_key_der()
        .expect("public key der");
    let spki =
        SubjectPublicKeyInfoOwned::try_from(public_key_der.as_bytes()).expect("public key info");
    let subject = Name::from_str(&format!("CN={rut},O=Comercial Prueba SpA")).expect("subject");
    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(1u32),
        Validity::from_now(Duration::from_secs(365 * 24 * 3600)).expect("validity"),
        subject,
        spki,
        &signer,
    )
    .expect("certificate builder");
    let certificate = builder
        .build::<rsa::pkcs1v15::Signature>()
        .expect("build certificate");
    (private_key, certificate)
}

#[allow(dead_code)]
pub fn caf_xml(rut: &str, type_code: u16, lower: u32, upper: u32) -> String {
    format!(
        r#"<AUTORIZACION><CAF version="1.0"><DA><RE>{rut}</RE><RS>Comercial Prueba SpA</RS><TD>{type_code}</TD><RNG><D>{lower}</D><H>{upper}</H></RNG><FA>2026-01-15</FA><RSAPK><M>MDEyMzQ1Njc4OQ==</M><E>AQAB</E></RSAPK><IDK>100</IDK></DA><FRMA algoritmo="SHA1withRSA">c2lnbmF0dXJl</FRMA></CAF></AUTORIZACION>"#
    )
}

/// Boleta CAF for folios `[1, 100]`.
#[allow(dead_code)]
pub fn test_caf() -> Caf {
    Caf::parse(&caf_xml(EMITTER_RUT, 39, 1, 100)).expect("caf")
}

#[allow(dead_code)]
pub fn emitter() -> Party {
    Party::new(
        EMITTER_RUT,
        "Comercial Prueba SpA",
        "Venta al por menor",
        "Av. Siempre Viva 742",
        "Santiago",
        "Santiago",
    )
}

#[allow(dead_code)]
pub fn receiver() -> Party {
    Party::new(
        "12345678-5",
        "Cliente Ejemplo Ltda",
        "Servicios informáticos",
        "Moneda 975",
        "Santiago",
        "Santiago",
    )
}

#[allow(dead_code)]
pub fn boleta(folio: u32) -> TaxDocument {
    DteBuilder::new(
        DocumentKind::Boleta,
        folio,
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        emitter(),
    )
    .item(LineItem::new("Pan", 2.0, 1500))
    .build()
    .expect("boleta")
}

/// Boleta whose grand total is exactly 10000 (single exempt line).
#[allow(dead_code)]
pub fn boleta_totaling_10000(folio: u32) -> TaxDocument {
    DteBuilder::new(
        DocumentKind::Boleta,
        folio,
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        emitter(),
    )
    .item(LineItem::new("Libro", 1.0, 10000).exempt())
    .build()
    .expect("boleta")
}

#[allow(dead_code)]
pub fn resolution() -> Resolution {
    Resolution::new(NaiveDate::from_ymd_opt(2026, 1, 2).expect("date"), 0)
}
