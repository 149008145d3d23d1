use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use taller_core::{EntryType, FixedClock, LedgerEntry};
use taller_ledger::{
    breakdown::{self, ItemSale, TopProductsSort},
    dates,
    summary::{self, Granularity, InvoiceTotal},
};

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn shop_clock() -> FixedClock {
    // a shop running at UTC-6, mid-afternoon on 2024-03-10
    FixedClock::new(
        utc("2024-03-10T21:00:00Z"),
        FixedOffset::west_opt(6 * 3600).unwrap(),
    )
}

fn entry(
    date: &str,
    entry_type: EntryType,
    amount: &str,
    category: Option<&str>,
    invoice_id: Option<Uuid>,
) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        entry_date: utc(date),
        entry_type,
        amount: dec(amount),
        description: "entry".to_string(),
        category: category.map(str::to_string),
        product_id: None,
        invoice_id,
        quantity: None,
        supplier: None,
        created_at: utc(date),
    }
}

/// One trading day as the register sees it: an opening float, a parts
/// purchase, a walk-in sale, and an invoiced repair mirrored into the
/// ledger. Every report over that day has to agree with itself.
#[test]
fn one_trading_day_reconciles_across_every_view() {
    let clock = shop_clock();
    let invoice_id = Uuid::new_v4();

    // local 2024-03-10 runs 06:00Z on the 10th to 06:00Z on the 11th
    let date = dates::parse_date("2024-03-10").unwrap();
    let (start, end) = dates::day_window(date, &clock);
    assert_eq!(start, utc("2024-03-10T06:00:00Z"));
    assert_eq!(end, utc("2024-03-11T06:00:00Z"));

    let day = vec![
        entry(
            "2024-03-10T14:00:00Z",
            EntryType::Expense,
            "50",
            Some("purchase"),
            None,
        ),
        entry(
            "2024-03-10T16:30:00Z",
            EntryType::Income,
            "30",
            Some("sale"),
            None,
        ),
        entry(
            "2024-03-10T18:00:00Z",
            EntryType::Income,
            "150",
            Some("sale"),
            Some(invoice_id),
        ),
    ];
    assert!(day.iter().all(|e| e.entry_date >= start && e.entry_date < end));

    // the register view counts everything that moved through the drawer
    let daily = summary::daily_summary(&day, dec("500"));
    assert_eq!(daily.income, dec("180"));
    assert_eq!(daily.expense, dec("50"));
    assert_eq!(daily.net, dec("130"));
    assert_eq!(daily.closing_balance, dec("630"));

    let rows = summary::day_rows(&day, &clock);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].date, date);
    assert_eq!(rows[0].net, daily.net);

    // the business view swaps the mirrored entry for its invoice
    let invoices = vec![InvoiceTotal {
        created_at: utc("2024-03-10T18:00:00Z"),
        total: dec("150"),
    }];
    let report = summary::period_summary(&invoices, &day, Granularity::Day, &clock);
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].bucket, "2024-03-10");
    assert_eq!(report[0].income, dec("180"));
    assert_eq!(report[0].expense, dec("50"));
    assert_eq!(report[0].net, dec("130"));
}

#[test]
fn late_evening_sales_stay_on_the_local_day() {
    let clock = shop_clock();
    // 23:30 local on the 10th is 05:30Z on the 11th
    let late = entry(
        "2024-03-11T05:30:00Z",
        EntryType::Income,
        "75",
        Some("sale"),
        None,
    );
    assert_eq!(dates::date_key(late.entry_date, &clock), "2024-03-10");

    let rows = summary::day_rows(&[late], &clock);
    assert_eq!(rows[0].date, dates::parse_date("2024-03-10").unwrap());
}

#[test]
fn month_report_splits_weeks_and_months_consistently() {
    let clock = shop_clock();
    let entries = vec![
        entry("2024-02-28T15:00:00Z", EntryType::Income, "40", None, None),
        entry("2024-03-01T15:00:00Z", EntryType::Expense, "10", None, None),
        entry("2024-03-04T15:00:00Z", EntryType::Income, "20", None, None),
    ];

    let monthly = summary::period_summary(&[], &entries, Granularity::Month, &clock);
    assert_eq!(monthly.len(), 2);
    assert_eq!(monthly[0].bucket, "2024-02");
    assert_eq!(monthly[0].income, dec("40"));
    assert_eq!(monthly[1].bucket, "2024-03");
    assert_eq!(monthly[1].net, dec("10"));

    let weekly = summary::period_summary(&[], &entries, Granularity::Week, &clock);
    // Feb 28 and Mar 1 share ISO week 9; Mar 4 opens week 10
    assert_eq!(weekly.len(), 2);
    assert_eq!(weekly[0].bucket, "2024-W09");
    assert_eq!(weekly[0].net, dec("30"));
    assert_eq!(weekly[1].bucket, "2024-W10");
}

#[test]
fn product_and_category_breakdowns_cover_the_same_day() {
    let screen = Uuid::new_v4();
    let mut names = HashMap::new();
    names.insert(screen, "OLED screen".to_string());

    let items = vec![
        ItemSale {
            product_id: Some(screen),
            description: "screen swap".to_string(),
            quantity: 2,
            unit_price: dec("10"),
        },
        ItemSale {
            product_id: Some(screen),
            description: "screen swap".to_string(),
            quantity: 1,
            unit_price: dec("10"),
        },
        ItemSale {
            product_id: None,
            description: "diagnostic fee".to_string(),
            quantity: 1,
            unit_price: dec("15"),
        },
    ];
    let top = breakdown::top_products(&items, &names, TopProductsSort::Quantity, 10);
    assert_eq!(top[0].name, "OLED screen");
    assert_eq!(top[0].quantity, 3);
    assert_eq!(top[0].value, dec("30"));

    let expenses = vec![
        entry(
            "2024-03-10T14:00:00Z",
            EntryType::Expense,
            "50",
            Some("purchase"),
            None,
        ),
        entry("2024-03-10T15:00:00Z", EntryType::Expense, "12", None, None),
    ];
    let (by_category, total) = breakdown::expenses_by_category(&expenses);
    assert_eq!(by_category[0].category, "purchase");
    assert_eq!(by_category[1].category, breakdown::UNCATEGORIZED);
    assert_eq!(total, dec("62"));
}
