pub mod assistant;
pub mod invoice;
pub mod json_repair;
pub mod normalize;
pub mod rates;
pub mod savings;
pub mod tools;
pub mod vision;

pub use assistant::{AssistantService, ChatReply};
pub use invoice::{InvoiceService, InvoiceUpload, ParseOutcome};
pub use savings::SavingsService;
pub use vision::VisionClient;
