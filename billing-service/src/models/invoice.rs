//! Invoice, invoice item and payment models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Invoice status. Transitions are UNPAID -> PAID and UNPAID -> CANCELLED only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Unpaid,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "UNPAID",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "UNPAID" => Some(InvoiceStatus::Unpaid),
            "PAID" => Some(InvoiceStatus::Paid),
            "CANCELLED" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }
}

/// Invoice item type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceItemType {
    /// Renewal of the service referenced by `item_id`.
    Service,
    /// Free-form entry such as a setup fee.
    None,
}

impl InvoiceItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceItemType::Service => "service",
            InvoiceItemType::None => "",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "service" => InvoiceItemType::Service,
            _ => InvoiceItemType::None,
        }
    }
}

/// A billable obligation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: i32,
    pub user_id: i32,
    pub status: String,
    pub amount: Decimal,
    pub due_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> Option<InvoiceStatus> {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn is_unpaid(&self) -> bool {
        self.status() == Some(InvoiceStatus::Unpaid)
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

/// A line entry on an invoice. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub id: i32,
    pub invoice_id: i32,
    pub description: String,
    pub amount: Decimal,
    pub item_type: String,
    pub item_id: Option<i32>,
}

impl InvoiceItem {
    /// The service this item renews, if it is a service item with a target.
    pub fn service_id(&self) -> Option<i32> {
        match InvoiceItemType::from_string(&self.item_type) {
            InvoiceItemType::Service => self.item_id,
            InvoiceItemType::None => None,
        }
    }
}

/// Money received against an invoice. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i32,
    pub invoice_id: i32,
    pub description: String,
    pub amount: Decimal,
    pub reference_id: String,
    pub gateway: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub user_id: i32,
    pub amount: Decimal,
    pub due_at: DateTime<Utc>,
}

/// Input for creating an invoice item.
#[derive(Debug, Clone)]
pub struct CreateInvoiceItem {
    pub invoice_id: i32,
    pub description: String,
    pub amount: Decimal,
    pub item_type: InvoiceItemType,
    pub item_id: Option<i32>,
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub invoice_id: i32,
    pub description: String,
    pub amount: Decimal,
    pub reference_id: String,
    pub gateway: String,
}
