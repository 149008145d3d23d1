use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use taller_core::{Clock, EntryType, LedgerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Lenient by contract: anything other than `week` or `month` rolls up
    /// by day.
    pub fn parse(raw: Option<&str>) -> Granularity {
        match raw {
            Some("week") => Granularity::Week,
            Some("month") => Granularity::Month,
            _ => Granularity::Day,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

/// Bucket key for a local calendar date. Keys are zero-padded so that
/// lexicographic order is chronological order within a granularity.
pub fn bucket_key(date: NaiveDate, granularity: Granularity) -> String {
    match granularity {
        Granularity::Day => date.format("%Y-%m-%d").to_string(),
        Granularity::Week => {
            let week = date.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        Granularity::Month => date.format("%Y-%m").to_string(),
    }
}

/// One day's reconciliation: totals over the day's entries plus the cash
/// session's opening balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySummary {
    pub income: Decimal,
    pub expense: Decimal,
    pub net: Decimal,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
}

pub fn daily_summary(entries: &[LedgerEntry], opening_balance: Decimal) -> DailySummary {
    let mut income = Decimal::ZERO;
    let mut expense = Decimal::ZERO;
    for entry in entries {
        match entry.entry_type {
            EntryType::Income => income += entry.amount,
            EntryType::Expense => expense += entry.amount,
        }
    }
    let net = income - expense;
    DailySummary {
        income,
        expense,
        net,
        opening_balance,
        closing_balance: opening_balance + net,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DayRow {
    pub date: NaiveDate,
    pub income: Decimal,
    pub expense: Decimal,
    pub net: Decimal,
}

/// Per-local-day totals over raw ledger entries. Days without entries are
/// omitted; rows ascend by date. This is the cash view: mirrored invoice
/// income stays in, because it is money that moved through the register.
pub fn day_rows(entries: &[LedgerEntry], clock: &dyn Clock) -> Vec<DayRow> {
    let mut buckets: BTreeMap<NaiveDate, (Decimal, Decimal)> = BTreeMap::new();
    for entry in entries {
        let slot = buckets.entry(clock.local_date(entry.entry_date)).or_default();
        match entry.entry_type {
            EntryType::Income => slot.0 += entry.amount,
            EntryType::Expense => slot.1 += entry.amount,
        }
    }
    buckets
        .into_iter()
        .map(|(date, (income, expense))| DayRow {
            date,
            income,
            expense,
            net: income - expense,
        })
        .collect()
}

/// An invoice reduced to what period reporting needs.
#[derive(Debug, Clone)]
pub struct InvoiceTotal {
    pub created_at: DateTime<Utc>,
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeriodRow {
    pub bucket: String,
    pub income: Decimal,
    pub expense: Decimal,
    pub net: Decimal,
}

/// Folds invoice totals and ledger entries into per-bucket rows, ascending
/// by bucket key.
///
/// Invoiced sales are counted from the invoice side. An income entry that
/// carries an `invoice_id` is a mirror of an invoice already counted, so it
/// is skipped; every other entry folds in normally. Expenses only ever live
/// in the ledger.
pub fn period_summary(
    invoices: &[InvoiceTotal],
    entries: &[LedgerEntry],
    granularity: Granularity,
    clock: &dyn Clock,
) -> Vec<PeriodRow> {
    let mut buckets: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
    for invoice in invoices {
        let key = bucket_key(clock.local_date(invoice.created_at), granularity);
        buckets.entry(key).or_default().0 += invoice.total;
    }
    for entry in entries {
        if entry.entry_type == EntryType::Income && entry.invoice_id.is_some() {
            continue;
        }
        let key = bucket_key(clock.local_date(entry.entry_date), granularity);
        let slot = buckets.entry(key).or_default();
        match entry.entry_type {
            EntryType::Income => slot.0 += entry.amount,
            EntryType::Expense => slot.1 += entry.amount,
        }
    }
    buckets
        .into_iter()
        .map(|(bucket, (income, expense))| PeriodRow {
            bucket,
            income,
            expense,
            net: income - expense,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use uuid::Uuid;

    use taller_core::FixedClock;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn entry(date: &str, entry_type: EntryType, amount: &str) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            entry_date: utc(date),
            entry_type,
            amount: dec(amount),
            description: "entry".to_string(),
            category: None,
            product_id: None,
            invoice_id: None,
            quantity: None,
            supplier: None,
            created_at: utc(date),
        }
    }

    fn mirrored(date: &str, amount: &str) -> LedgerEntry {
        LedgerEntry {
            invoice_id: Some(Uuid::new_v4()),
            ..entry(date, EntryType::Income, amount)
        }
    }

    fn clock() -> FixedClock {
        FixedClock::new(
            utc("2024-03-20T12:00:00Z"),
            FixedOffset::west_opt(6 * 3600).unwrap(),
        )
    }

    #[test]
    fn closing_is_opening_plus_net() {
        let entries = vec![
            entry("2024-03-10T15:00:00Z", EntryType::Income, "200"),
            entry("2024-03-10T17:00:00Z", EntryType::Expense, "80"),
        ];
        let summary = daily_summary(&entries, dec("500"));
        assert_eq!(summary.income, dec("200"));
        assert_eq!(summary.expense, dec("80"));
        assert_eq!(summary.net, dec("120"));
        assert_eq!(summary.opening_balance, dec("500"));
        assert_eq!(summary.closing_balance, dec("620"));
    }

    #[test]
    fn empty_day_reconciles_to_the_opening_balance() {
        let summary = daily_summary(&[], dec("300"));
        assert_eq!(summary.net, Decimal::ZERO);
        assert_eq!(summary.closing_balance, dec("300"));
    }

    #[test]
    fn day_rows_bucket_by_local_date() {
        // 02:00 UTC on the 11th is still the 10th at UTC-6
        let entries = vec![
            entry("2024-03-10T15:00:00Z", EntryType::Income, "100"),
            entry("2024-03-11T02:00:00Z", EntryType::Income, "50"),
            entry("2024-03-11T15:00:00Z", EntryType::Expense, "30"),
        ];
        let rows = day_rows(&entries, &clock());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(rows[0].income, dec("150"));
        assert_eq!(rows[1].date, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert_eq!(rows[1].expense, dec("30"));
        assert_eq!(rows[1].net, dec("-30"));
    }

    #[test]
    fn day_rows_keep_mirrored_income() {
        let entries = vec![mirrored("2024-03-10T15:00:00Z", "150")];
        let rows = day_rows(&entries, &clock());
        assert_eq!(rows[0].income, dec("150"));
    }

    #[test]
    fn week_buckets_are_zero_padded_and_follow_the_iso_year() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(bucket_key(date, Granularity::Week), "2024-W03");
        // 2024-12-30 belongs to week 1 of ISO year 2025
        let boundary = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        assert_eq!(bucket_key(boundary, Granularity::Week), "2025-W01");
    }

    #[test]
    fn month_and_day_bucket_formats() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(bucket_key(date, Granularity::Day), "2024-03-05");
        assert_eq!(bucket_key(date, Granularity::Month), "2024-03");
    }

    #[test]
    fn granularity_parse_is_lenient() {
        assert_eq!(Granularity::parse(Some("week")), Granularity::Week);
        assert_eq!(Granularity::parse(Some("month")), Granularity::Month);
        assert_eq!(Granularity::parse(Some("fortnight")), Granularity::Day);
        assert_eq!(Granularity::parse(None), Granularity::Day);
    }

    #[test]
    fn invoiced_sales_count_once() {
        // a $150 invoice mirrored into the ledger must not become $300
        let invoices = vec![InvoiceTotal {
            created_at: utc("2024-03-10T15:00:00Z"),
            total: dec("150"),
        }];
        let entries = vec![
            mirrored("2024-03-10T15:00:00Z", "90"),
            mirrored("2024-03-10T15:00:00Z", "60"),
            entry("2024-03-10T16:00:00Z", EntryType::Expense, "40"),
        ];
        let rows = period_summary(&invoices, &entries, Granularity::Day, &clock());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket, "2024-03-10");
        assert_eq!(rows[0].income, dec("150"));
        assert_eq!(rows[0].expense, dec("40"));
        assert_eq!(rows[0].net, dec("110"));
    }

    #[test]
    fn uninvoiced_income_still_counts() {
        let entries = vec![
            entry("2024-03-10T15:00:00Z", EntryType::Income, "25"),
            mirrored("2024-03-10T15:30:00Z", "100"),
        ];
        let rows = period_summary(&[], &entries, Granularity::Day, &clock());
        assert_eq!(rows[0].income, dec("25"));
    }

    #[test]
    fn rows_ascend_by_bucket_across_weeks() {
        let invoices = vec![
            InvoiceTotal {
                created_at: utc("2024-12-31T15:00:00Z"),
                total: dec("10"),
            },
            InvoiceTotal {
                created_at: utc("2024-11-05T15:00:00Z"),
                total: dec("20"),
            },
        ];
        let rows = period_summary(&invoices, &[], Granularity::Week, &clock());
        assert_eq!(rows[0].bucket, "2024-W45");
        assert_eq!(rows[1].bucket, "2025-W01");
    }
}
