use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Income,
    Expense,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Income => "income",
            EntryType::Expense => "expense",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw {
            "income" => Ok(EntryType::Income),
            "expense" => Ok(EntryType::Expense),
            other => Err(DomainError::Validation(format!(
                "unknown entry type: {other}"
            ))),
        }
    }
}

/// A single immutable ledger entry. `entry_date` is the business instant the
/// movement belongs to and may be backdated; `created_at` is when the row was
/// recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub entry_date: DateTime<Utc>,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub description: String,
    pub category: Option<String>,
    pub product_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub quantity: Option<i32>,
    pub supplier: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-day register state, keyed by the local calendar date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashSession {
    pub id: Uuid,
    pub date_key: String,
    pub opening_balance: Decimal,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price: Decimal,
    pub supplier: Option<String>,
    pub barcode: Option<String>,
    pub category: Option<String>,
    pub min_stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Diagnosis,
    InRepair,
    Ready,
    Delivered,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Diagnosis => "diagnosis",
            DeviceStatus::InRepair => "in_repair",
            DeviceStatus::Ready => "ready",
            DeviceStatus::Delivered => "delivered",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw {
            "diagnosis" => Ok(DeviceStatus::Diagnosis),
            "in_repair" => Ok(DeviceStatus::InRepair),
            "ready" => Ok(DeviceStatus::Ready),
            "delivered" => Ok(DeviceStatus::Delivered),
            other => Err(DomainError::Validation(format!(
                "unknown device status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_round_trips_through_its_wire_form() {
        assert_eq!(EntryType::parse("income").unwrap(), EntryType::Income);
        assert_eq!(EntryType::parse("expense").unwrap(), EntryType::Expense);
        assert_eq!(EntryType::Income.as_str(), "income");
        assert!(EntryType::parse("transfer").is_err());
    }

    #[test]
    fn device_status_rejects_unknown_values() {
        assert_eq!(
            DeviceStatus::parse("in_repair").unwrap(),
            DeviceStatus::InRepair
        );
        assert!(DeviceStatus::parse("repaired").is_err());
        assert_eq!(DeviceStatus::default(), DeviceStatus::Diagnosis);
    }
}
