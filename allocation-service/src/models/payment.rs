//! Payment model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Money received from a representative.
///
/// `is_allocated` and `invoice_id` are the legacy allocation signal; the ledger of
/// [`AllocationRecord`](super::AllocationRecord)s is authoritative. `amount` is never
/// changed after insert: a partially consumed payment is split by inserting a
/// remainder payment whose `parent_payment_id` points back here.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub representative_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub is_allocated: bool,
    pub invoice_id: Option<Uuid>,
    pub parent_payment_id: Option<Uuid>,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Payment {
    /// True when this payment was split off another payment.
    pub fn is_remainder(&self) -> bool {
        self.parent_payment_id.is_some()
    }
}

/// Input for inserting a payment.
///
/// Upstream importers may insert historical payments with `is_allocated = true`;
/// those carry no ledger rows and show up as drift until backfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub representative_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub is_allocated: bool,
    pub invoice_id: Option<Uuid>,
    pub parent_payment_id: Option<Uuid>,
    pub description: Option<String>,
}

impl NewPayment {
    /// A fresh unallocated payment.
    pub fn received(representative_id: Uuid, amount: Decimal, payment_date: NaiveDate) -> Self {
        Self {
            representative_id,
            amount,
            payment_date,
            is_allocated: false,
            invoice_id: None,
            parent_payment_id: None,
            description: None,
        }
    }

    /// The unconsumed part of `parent` after an allocation.
    pub fn remainder_of(parent: &Payment, amount: Decimal) -> Self {
        Self {
            representative_id: parent.representative_id,
            amount,
            payment_date: parent.payment_date,
            is_allocated: false,
            invoice_id: None,
            parent_payment_id: Some(parent.payment_id),
            description: Some(format!("Remainder of payment {}", parent.payment_id)),
        }
    }
}
