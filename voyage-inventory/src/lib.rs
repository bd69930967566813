pub mod audit;
pub mod ledger;
pub mod stock;

pub use audit::AuditTrail;
pub use ledger::{Ledger, LedgerAdapter, StockMovement};
pub use stock::{BulkError, BulkReservation, BulkValidation, StockCheck, StockService, StockSummary};
