mod common;

use chrono::{TimeZone, Utc};
use dte_core::ted::{Caf, StampError, Ted};

fn stamp_time() -> chrono::DateTime<chrono::Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).single().expect("timestamp")
}

#[test]
fn stamps_a_boleta_within_the_authorized_range() {
    let identity = common::test_identity();
    let caf = common::test_caf();
    let document = common::boleta_totaling_10000(1);

    let ted = Ted::generate(&document, &caf, &identity, stamp_time()).expect("stamp");
    assert_eq!(ted.folio(), "1");
    assert_eq!(ted.total(), "10000");
    assert_eq!(ted.receiver_rut(), "66666666-6");
    ted.verify(&identity).expect("stamp verifies");
}

#[test]
fn stamp_xml_embeds_the_caf_verbatim() {
    let identity = common::test_identity();
    let caf = common::test_caf();
    let document = common::boleta(7);

    let ted = Ted::generate(&document, &caf, &identity, stamp_time()).expect("stamp");
    let xml = ted.to_xml().expect("serialize");

    assert!(xml.starts_with("<TED version=\"1.0\"><DD>"));
    // emitter RUT is hyphen-stripped in DD but untouched inside the CAF
    assert!(xml.contains("<RE>76543210K</RE>"));
    assert!(xml.contains("<CAF version=\"1.0\"><DA><RE>76543210-K</RE>"));
    assert!(xml.contains("<M>MDEyMzQ1Njc4OQ==</M>"));
    assert!(xml.contains("<FRMT algoritmo=\"SHA1withRSA\">"));
    assert!(xml.contains("<TSTED>2026-03-14T10:00:00</TSTED>"));
}

#[test]
fn folio_outside_the_range_is_rejected_before_signing() {
    let identity = common::test_identity();
    let caf = common::test_caf();
    let document = common::boleta(101);

    let err = Ted::generate(&document, &caf, &identity, stamp_time()).expect_err("out of range");
    assert!(
        matches!(
            err,
            StampError::FolioOutOfRange {
                folio: 101,
                lower: 1,
                upper: 100,
            }
        ),
        "unexpected error: {err:?}"
    );
}

#[test]
fn caf_for_another_emitter_is_rejected() {
    let identity = common::test_identity();
    let caf = Caf::parse(&common::caf_xml("11111111-1", 39, 1, 100)).expect("caf");
    let document = common::boleta(1);

    let err = Ted::generate(&document, &caf, &identity, stamp_time()).expect_err("wrong emitter");
    assert!(matches!(err, StampError::InvalidCaf(_)), "unexpected error: {err:?}");
}

#[test]
fn long_item_names_are_truncated_in_the_stamp() {
    let identity = common::test_identity();
    let caf = common::test_caf();
    let long_name = "Caja de vino tinto reserva del valle central cosecha 2024";
    let document = dte_core::document::DteBuilder::new(
        dte_core::document::DocumentKind::Boleta,
        2,
        chrono::NaiveDate::from_ymd_opt(2026, 3, 14).expect("date"),
        common::emitter(),
    )
    .item(dte_core::document::LineItem::new(long_name, 1.0, 9990))
    .build()
    .expect("boleta");

    let ted = Ted::generate(&document, &caf, &identity, stamp_time()).expect("stamp");
    let xml = ted.to_xml().expect("serialize");
    let expected: String = long_name.chars().take(40).collect();
    assert!(xml.contains(&format!("<IT1>{expected}</IT1>")));
}

#[test]
fn stamp_does_not_verify_against_another_identity() {
    let identity = common::test_identity();
    let other = common::test_identity_with_rut(common::EMITTER_RUT);
    let caf = common::test_caf();
    let document = common::boleta(1);

    let ted = Ted::generate(&document, &caf, &identity, stamp_time()).expect("stamp");
    ted.verify(&identity).expect("verifies against the stamping key");
    ted.verify(&other).expect_err("different key must not verify");
}
