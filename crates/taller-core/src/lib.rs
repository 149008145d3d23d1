pub mod clock;
pub mod error;
pub mod models;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::DomainError;
pub use models::{CashSession, DeviceStatus, EntryType, LedgerEntry, Product};
