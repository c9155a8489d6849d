use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dte_rs::{Caf, DocumentKind, DteBuilder, LineItem, Party, Resolution, SigningIdentity, TaxDocument};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::EncodePem;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

pub const EMITTER_RUT: &str = "76543210-K";

pub fn test_identity() -> Arc<SigningIdentity> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());

    let public_key_der = private_key
        .to_public_key()
        .to_public_key_der()
        .expect("public key der");
    let spki =
        SubjectPublicKeyInfoOwned::try_from(public_key_der.as_bytes()).expect("public key info");
    let subject =
        Name::from_str(&format!("CN={EMITTER_RUT},O=Comercial Prueba SpA")).expect("subject");
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

    let cert_pem = certificate.to_pem(LineEnding::LF).expect("certificate pem");
    let key_pem = private_key.to_pkcs8_pem(LineEnding::LF).expect("key pem");
    Arc::new(SigningIdentity::from_pem(&cert_pem, &key_pem, EMITTER_RUT).expect("identity"))
}

pub fn test_caf() -> Caf {
    Caf::parse(&format!(
        r#"<AUTORIZACION><CAF version="1.0"><DA><RE>{EMITTER_RUT}</RE><RS>Comercial Prueba SpA</RS><TD>39</TD><RNG><D>1</D><H>100</H></RNG><FA>2026-01-15</FA><RSAPK><M>MDEyMzQ1Njc4OQ==</M><E>AQAB</E></RSAPK><IDK>100</IDK></DA><FRMA algoritmo="SHA1withRSA">c2lnbmF0dXJl</FRMA></CAF></AUTORIZACION>"#
    ))
    .expect("caf")
}

pub fn boleta(folio: u32) -> TaxDocument {
    DteBuilder::new(
        DocumentKind::Boleta,
        folio,
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        Party::new(
            EMITTER_RUT,
            "Comercial Prueba SpA",
            "Venta al por menor",
            "Av. Siempre Viva 742",
            "Santiago",
            "Santiago",
        ),
    )
    .item(LineItem::new("Pan", 2.0, 1500))
    .build()
    .expect("boleta")
}

pub fn resolution() -> Resolution {
    Resolution::new(NaiveDate::from_ymd_opt(2026, 1, 2).expect("date"), 0)
}
