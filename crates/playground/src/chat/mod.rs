/// Ordered transcript owned by one session.
pub mod conversation;
/// JSON and plain-text transcript export.
pub mod export;
pub mod message;

pub use conversation::ConversationStore;
pub use export::{ExportError, ExportFormat};
pub use message::{Message, Role};
