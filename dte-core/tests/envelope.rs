mod common;

use dte_core::config::{Config, Environment, SII_RUT};
use dte_core::envelope::{AssemblyError, EnvelopeAssembler, SET_DOC_ID};
use dte_core::xmldsig::{verify, SigningError};

fn assembler() -> EnvelopeAssembler {
    EnvelopeAssembler::new(Config::new(Environment::Certification), common::test_identity())
}

#[test]
fn single_boleta_envelope_addresses_the_authority() {
    let envelope = assembler()
        .assemble_single(common::boleta_totaling_10000(1), &common::test_caf(), &common::resolution())
        .expect("assemble");

    let xml = envelope.to_xml();
    assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(xml.contains("<EnvioDTE xmlns=\"http://www.sii.cl/SiiDte\" version=\"1.0\">"));
    assert!(xml.contains(&format!("<SetDTE ID=\"{SET_DOC_ID}\">")));
    assert!(xml.contains(&format!("<RutReceptor>{SII_RUT}</RutReceptor>")));
    assert!(xml.contains("<RutEmisor>76543210-K</RutEmisor>"));
    assert!(xml.contains("<FchResol>2026-01-02</FchResol>"));
    assert!(xml.contains("<TpoDTE>39</TpoDTE><NroDTE>1</NroDTE>"));
    // the stamp rides inside the signed document
    assert!(xml.contains("<F>1</F>"));
    assert!(xml.contains("<MNT>10000</MNT>"));
    assert_eq!(envelope.document_count(), 1);
}

#[test]
fn envelope_signature_verifies() {
    let envelope = assembler()
        .assemble_single(common::boleta(1), &common::test_caf(), &common::resolution())
        .expect("assemble");
    verify(envelope.to_xml()).expect("envelope signature verifies");
}

#[test]
fn each_document_inside_the_envelope_verifies() {
    let envelope = assembler()
        .assemble_batch(
            vec![common::boleta(1), common::boleta(2)],
            &common::test_caf(),
            &common::resolution(),
        )
        .expect("assemble");

    assert_eq!(envelope.document_count(), 2);
    for document in envelope.documents() {
        verify(document.to_xml()).expect("document signature verifies");
    }
}

#[test]
fn serialization_is_idempotent() {
    let envelope = assembler()
        .assemble_single(common::boleta(1), &common::test_caf(), &common::resolution())
        .expect("assemble");
    let first = envelope.to_xml().to_string();
    assert_eq!(first, envelope.to_xml());
    assert_eq!(first, envelope.to_xml());
}

#[test]
fn batch_counts_documents_per_type() {
    let envelope = assembler()
        .assemble_batch(
            vec![common::boleta(1), common::boleta(2), common::boleta(3)],
            &common::test_caf(),
            &common::resolution(),
        )
        .expect("assemble");
    assert!(envelope.to_xml().contains("<TpoDTE>39</TpoDTE><NroDTE>3</NroDTE>"));
    assert_eq!(envelope.document_count(), 3);
}

#[test]
fn empty_batches_are_rejected() {
    let err = assembler()
        .assemble_batch(Vec::new(), &common::test_caf(), &common::resolution())
        .expect_err("empty batch");
    assert!(matches!(err, AssemblyError::EmptyBatch));
}

#[test]
fn mixed_document_types_are_rejected_before_signing() {
    let factura = dte_core::document::DteBuilder::new(
        dte_core::document::DocumentKind::Factura,
        10,
        chrono::NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        common::emitter(),
    )
    .receiver(common::receiver())
    .item(dte_core::document::LineItem::new("Servicio", 1.0, 100000))
    .build()
    .expect("factura");

    let err = assembler()
        .assemble_batch(
            vec![common::boleta(1), factura],
            &common::test_caf(),
            &common::resolution(),
        )
        .expect_err("mixed types");
    assert!(matches!(err, AssemblyError::HeterogeneousBatch(_)), "unexpected error: {err:?}");
}

#[test]
fn identity_must_match_the_emitter() {
    let other = common::test_identity_with_rut("11111111-1");
    let assembler = EnvelopeAssembler::new(Config::new(Environment::Certification), other);

    let err = assembler
        .assemble_single(common::boleta(1), &common::test_caf(), &common::resolution())
        .expect_err("foreign identity");
    assert!(
        matches!(err, AssemblyError::Signing(SigningError::RutMismatch { .. })),
        "unexpected error: {err:?}"
    );
}

#[test]
fn factura_envelope_is_addressed_to_its_receiver() {
    let factura = dte_core::document::DteBuilder::new(
        dte_core::document::DocumentKind::Factura,
        10,
        chrono::NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        common::emitter(),
    )
    .receiver(common::receiver())
    .item(dte_core::document::LineItem::new("Servicio", 1.0, 100000))
    .build()
    .expect("factura");
    let caf = dte_core::ted::Caf::parse(&common::caf_xml(common::EMITTER_RUT, 33, 1, 100)).expect("caf");

    let envelope = assembler()
        .assemble_single(factura, &caf, &common::resolution())
        .expect("assemble");
    let xml = envelope.to_xml();
    assert!(xml.contains("<RutReceptor>12345678-5</RutReceptor>"));
    assert!(xml.contains("<TpoDTE>33</TpoDTE><NroDTE>1</NroDTE>"));
    assert!(xml.contains("<RUTRecep>12345678-5</RUTRecep>"));
}
