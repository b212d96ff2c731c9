pub mod conversation;
pub mod profile;

pub use conversation::{Conversation, ConversationEntry, ConversationStore, SharedConversation};
pub use profile::{ProfileConfig, ProfileStore};
