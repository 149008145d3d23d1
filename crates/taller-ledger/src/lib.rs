pub mod breakdown;
pub mod dates;
pub mod summary;

pub use breakdown::{CategoryExpense, ItemSale, ProductSales, TopProductsSort, UNCATEGORIZED};
pub use dates::{date_key, day_window, parse_date, parse_instant, parse_range};
pub use summary::{DailySummary, DayRow, Granularity, InvoiceTotal, PeriodRow};
