use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use taller_core::{EntryType, LedgerEntry};

/// Category label for expense entries that carry none.
pub const UNCATEGORIZED: &str = "uncategorized";

/// One invoice line, the unit of product reporting.
#[derive(Debug, Clone)]
pub struct ItemSale {
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSales {
    pub product_id: Option<Uuid>,
    pub name: String,
    pub quantity: i64,
    pub value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopProductsSort {
    Quantity,
    Value,
}

impl TopProductsSort {
    /// Only `value` switches the ordering; everything else sorts by units.
    pub fn parse(raw: Option<&str>) -> TopProductsSort {
        match raw {
            Some("value") => TopProductsSort::Value,
            _ => TopProductsSort::Quantity,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TopProductsSort::Quantity => "quantity",
            TopProductsSort::Value => "value",
        }
    }
}

/// Groups invoice lines by `(product, description)`, summing units and
/// revenue. The current product name wins over the frozen line description
/// when the product still exists; ties sort by name so output is stable.
pub fn top_products(
    items: &[ItemSale],
    product_names: &HashMap<Uuid, String>,
    sort: TopProductsSort,
    limit: usize,
) -> Vec<ProductSales> {
    let mut groups: HashMap<(Option<Uuid>, String), (i64, Decimal)> = HashMap::new();
    for item in items {
        let slot = groups
            .entry((item.product_id, item.description.clone()))
            .or_default();
        slot.0 += i64::from(item.quantity);
        slot.1 += Decimal::from(item.quantity) * item.unit_price;
    }
    let mut rows: Vec<ProductSales> = groups
        .into_iter()
        .map(|((product_id, description), (quantity, value))| {
            let name = product_id
                .and_then(|id| product_names.get(&id).cloned())
                .unwrap_or(description);
            ProductSales {
                product_id,
                name,
                quantity,
                value,
            }
        })
        .collect();
    match sort {
        TopProductsSort::Quantity => {
            rows.sort_by(|a, b| b.quantity.cmp(&a.quantity).then_with(|| a.name.cmp(&b.name)));
        }
        TopProductsSort::Value => {
            rows.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
        }
    }
    rows.truncate(limit);
    rows
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CategoryExpense {
    pub category: String,
    pub total: Decimal,
}

/// Expense totals per category, largest first, plus the grand total.
/// Entries without a category land under [`UNCATEGORIZED`].
pub fn expenses_by_category(entries: &[LedgerEntry]) -> (Vec<CategoryExpense>, Decimal) {
    let mut groups: HashMap<String, Decimal> = HashMap::new();
    for entry in entries {
        if entry.entry_type != EntryType::Expense {
            continue;
        }
        let category = entry
            .category
            .clone()
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        *groups.entry(category).or_default() += entry.amount;
    }
    let mut rows: Vec<CategoryExpense> = groups
        .into_iter()
        .map(|(category, total)| CategoryExpense { category, total })
        .collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.category.cmp(&b.category)));
    let total = rows.iter().map(|row| row.total).sum();
    (rows, total)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn item(product_id: Option<Uuid>, description: &str, quantity: i32, price: &str) -> ItemSale {
        ItemSale {
            product_id,
            description: description.to_string(),
            quantity,
            unit_price: dec(price),
        }
    }

    #[test]
    fn lines_for_the_same_product_accumulate() {
        let widget = Uuid::new_v4();
        let mut names = HashMap::new();
        names.insert(widget, "Widget".to_string());
        let items = vec![
            item(Some(widget), "widget line", 2, "10"),
            item(Some(widget), "widget line", 1, "10"),
            item(None, "labor", 1, "25"),
        ];
        let rows = top_products(&items, &names, TopProductsSort::Quantity, 10);
        assert_eq!(rows[0].name, "Widget");
        assert_eq!(rows[0].quantity, 3);
        assert_eq!(rows[0].value, dec("30"));
        assert_eq!(rows[1].name, "labor");
        assert_eq!(rows[1].value, dec("25"));
    }

    #[test]
    fn sort_by_value_reorders() {
        let items = vec![
            item(None, "cheap and popular", 10, "1"),
            item(None, "one big screen", 1, "400"),
        ];
        let by_quantity = top_products(&items, &HashMap::new(), TopProductsSort::Quantity, 10);
        assert_eq!(by_quantity[0].name, "cheap and popular");
        let by_value = top_products(&items, &HashMap::new(), TopProductsSort::Value, 10);
        assert_eq!(by_value[0].name, "one big screen");
        assert_eq!(by_value[0].value, dec("400"));
    }

    #[test]
    fn deleted_products_fall_back_to_the_line_description() {
        let gone = Uuid::new_v4();
        let items = vec![item(Some(gone), "old stock battery", 2, "15")];
        let rows = top_products(&items, &HashMap::new(), TopProductsSort::Quantity, 10);
        assert_eq!(rows[0].name, "old stock battery");
    }

    #[test]
    fn limit_caps_the_row_count() {
        let items: Vec<ItemSale> = (0..5)
            .map(|i| item(None, &format!("part {i}"), i + 1, "5"))
            .collect();
        let rows = top_products(&items, &HashMap::new(), TopProductsSort::Quantity, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quantity, 5);
    }

    fn expense(category: Option<&str>, amount: &str) -> taller_core::LedgerEntry {
        let at: DateTime<Utc> = "2024-03-10T12:00:00Z".parse().unwrap();
        taller_core::LedgerEntry {
            id: Uuid::new_v4(),
            entry_date: at,
            entry_type: EntryType::Expense,
            amount: dec(amount),
            description: "expense".to_string(),
            category: category.map(str::to_string),
            product_id: None,
            invoice_id: None,
            quantity: None,
            supplier: None,
            created_at: at,
        }
    }

    #[test]
    fn categories_sum_and_sort_by_total() {
        let entries = vec![
            expense(Some("parts"), "30"),
            expense(Some("rent"), "400"),
            expense(Some("parts"), "20"),
            expense(None, "15"),
        ];
        let (rows, total) = expenses_by_category(&entries);
        assert_eq!(rows[0].category, "rent");
        assert_eq!(rows[0].total, dec("400"));
        assert_eq!(rows[1].category, "parts");
        assert_eq!(rows[1].total, dec("50"));
        assert_eq!(rows[2].category, UNCATEGORIZED);
        assert_eq!(rows[2].total, dec("15"));
        assert_eq!(total, dec("465"));
    }

    #[test]
    fn income_entries_never_leak_into_the_expense_breakdown() {
        let mut entries = vec![expense(Some("parts"), "30")];
        entries.push(taller_core::LedgerEntry {
            entry_type: EntryType::Income,
            ..expense(Some("parts"), "99")
        });
        let (rows, total) = expenses_by_category(&entries);
        assert_eq!(rows.len(), 1);
        assert_eq!(total, dec("30"));
    }
}
