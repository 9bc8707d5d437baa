pub mod chat;
pub mod invoice;
pub mod market;

pub use chat::{EquipmentHit, SavingsTotals, ToolCallLog, VendorSummary};
pub use invoice::{EquipmentItem, FeeBreakdown, InvoiceRecord, InvoiceSummary, ParsedInvoice};
pub use market::{EquipmentMatch, ItemComparison, MarketRate, SavingsSummary};
