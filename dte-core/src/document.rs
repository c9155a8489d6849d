//! Tax document model: builder, immutable document, computed totals.
use chrono::NaiveDate;
use thiserror::Error;

/// VAT rate applied to the affected net amount, in percent.
pub const IVA_RATE_PERCENT: f64 = 19.0;

/// Placeholder receiver for boletas issued to anonymous consumers.
pub const GENERIC_CONSUMER_RUT: &str = "66666666-6";
pub const GENERIC_CONSUMER_NAME: &str = "Consumidor Final";

/// Document types the authority accepts, keyed by their numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Factura,
    Boleta,
    GuiaDespacho,
    NotaDebito,
    NotaCredito,
}

impl DocumentKind {
    pub fn code(&self) -> u16 {
        match self {
            DocumentKind::Factura => 33,
            DocumentKind::Boleta => 39,
            DocumentKind::GuiaDespacho => 52,
            DocumentKind::NotaDebito => 56,
            DocumentKind::NotaCredito => 61,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            33 => Some(DocumentKind::Factura),
            39 => Some(DocumentKind::Boleta),
            52 => Some(DocumentKind::GuiaDespacho),
            56 => Some(DocumentKind::NotaDebito),
            61 => Some(DocumentKind::NotaCredito),
            _ => None,
        }
    }

    /// Boletas go to anonymous consumers; the receiver is optional and the
    /// envelope is addressed to the authority instead of the customer.
    pub fn is_boleta(&self) -> bool {
        matches!(self, DocumentKind::Boleta)
    }
}

/// Errors returned while building a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("a document requires at least one line item")]
    NoItems,
    #[error("document type {code} requires a receiver")]
    MissingReceiver { code: u16 },
}

/// A party to the transaction: the emitter or the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    rut: String,
    name: String,
    activity: String,
    address: String,
    municipality: String,
    city: String,
}

impl Party {
    pub fn new(
        rut: impl Into<String>,
        name: impl Into<String>,
        activity: impl Into<String>,
        address: impl Into<String>,
        municipality: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            rut: rut.into(),
            name: name.into(),
            activity: activity.into(),
            address: address.into(),
            municipality: municipality.into(),
            city: city.into(),
        }
    }

    pub fn rut(&self) -> &str {
        &self.rut
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn municipality(&self) -> &str {
        &self.municipality
    }

    pub fn city(&self) -> &str {
        &self.city
    }
}

/// One detail line. Amounts are integer Chilean pesos.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    name: String,
    quantity: f64,
    unit_price: i64,
    product_code: Option<String>,
    discount: i64,
    exempt: bool,
}

impl LineItem {
    pub fn new(name: impl Into<String>, quantity: f64, unit_price: i64) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_price,
            product_code: None,
            discount: 0,
            exempt: false,
        }
    }

    pub fn with_product_code(mut self, code: impl Into<String>) -> Self {
        self.product_code = Some(code.into());
        self
    }

    pub fn with_discount(mut self, discount: i64) -> Self {
        self.discount = discount;
        self
    }

    /// Mark the line as VAT-exempt.
    pub fn exempt(mut self) -> Self {
        self.exempt = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn unit_price(&self) -> i64 {
        self.unit_price
    }

    pub fn product_code(&self) -> Option<&str> {
        self.product_code.as_deref()
    }

    pub fn discount(&self) -> i64 {
        self.discount
    }

    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    /// Line amount after discount, rounded to whole pesos.
    pub fn amount(&self) -> i64 {
        let gross = (self.quantity * self.unit_price as f64).round() as i64;
        (gross - self.discount).max(0)
    }
}

/// Totals computed from the line items at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    net: i64,
    exempt: i64,
    tax: i64,
    total: i64,
}

impl Totals {
    fn from_items(items: &[LineItem]) -> Self {
        let net: i64 = items
            .iter()
            .filter(|item| !item.is_exempt())
            .map(LineItem::amount)
            .sum();
        let exempt: i64 = items
            .iter()
            .filter(|item| item.is_exempt())
            .map(LineItem::amount)
            .sum();
        let tax = (net as f64 * IVA_RATE_PERCENT / 100.0).round() as i64;
        Self {
            net,
            exempt,
            tax,
            total: net + exempt + tax,
        }
    }

    pub fn net(&self) -> i64 {
        self.net
    }

    pub fn exempt(&self) -> i64 {
        self.exempt
    }

    pub fn tax(&self) -> i64 {
        self.tax
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

/// An immutable tax document, ready for stamping and signing.
#[derive(Debug, Clone)]
pub struct TaxDocument {
    kind: DocumentKind,
    folio: u32,
    issued_at: NaiveDate,
    due_date: Option<NaiveDate>,
    emitter: Party,
    receiver: Option<Party>,
    items: Vec<LineItem>,
    totals: Totals,
}

impl TaxDocument {
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn folio(&self) -> u32 {
        self.folio
    }

    pub fn issued_at(&self) -> NaiveDate {
        self.issued_at
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn emitter(&self) -> &Party {
        &self.emitter
    }

    pub fn receiver(&self) -> Option<&Party> {
        self.receiver.as_ref()
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    /// Signature reference id, e.g. `F42T39` for boleta folio 42.
    pub fn reference_id(&self) -> String {
        format!("F{}T{}", self.folio, self.kind.code())
    }

    /// RUT the stamp names as receiver, falling back to the generic consumer.
    pub fn receiver_rut(&self) -> &str {
        self.receiver
            .as_ref()
            .map(|party| party.rut())
            .unwrap_or(GENERIC_CONSUMER_RUT)
    }

    pub fn receiver_name(&self) -> &str {
        self.receiver
            .as_ref()
            .map(|party| party.name())
            .unwrap_or(GENERIC_CONSUMER_NAME)
    }
}

/// Builder for [`TaxDocument`].
#[derive(Debug, Clone)]
pub struct DteBuilder {
    kind: DocumentKind,
    folio: u32,
    issued_at: NaiveDate,
    due_date: Option<NaiveDate>,
    emitter: Party,
    receiver: Option<Party>,
    items: Vec<LineItem>,
}

impl DteBuilder {
    pub fn new(kind: DocumentKind, folio: u32, issued_at: NaiveDate, emitter: Party) -> Self {
        Self {
            kind,
            folio,
            issued_at,
            due_date: None,
            emitter,
            receiver: None,
            items: Vec::new(),
        }
    }

    pub fn receiver(mut self, receiver: Party) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn due_date(mut self, due_date: NaiveDate) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn item(mut self, item: LineItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn items(mut self, items: impl IntoIterator<Item = LineItem>) -> Self {
        self.items.extend(items);
        self
    }

    /// Finalize the document, computing totals.
    ///
    /// # Errors
    /// Returns [`DocumentError`] when no items are present or a non-boleta
    /// document has no receiver.
    pub fn build(self) -> Result<TaxDocument, DocumentError> {
        if self.items.is_empty() {
            return Err(DocumentError::NoItems);
        }
        if self.receiver.is_none() && !self.kind.is_boleta() {
            return Err(DocumentError::MissingReceiver {
                code: self.kind.code(),
            });
        }
        let totals = Totals::from_items(&self.items);
        Ok(TaxDocument {
            kind: self.kind,
            folio: self.folio,
            issued_at: self.issued_at,
            due_date: self.due_date,
            emitter: self.emitter,
            receiver: self.receiver,
            items: self.items,
            totals,
        })
    }
}
