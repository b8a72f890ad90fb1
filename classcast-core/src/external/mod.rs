//! Narrow interfaces over external collaborators
//!
//! Class metadata, chat persistence and the presence roster live in other
//! services; classcast consumes them through the traits in this module and
//! ships in-process implementations for development and tests.

pub mod directory;
pub mod messages;
pub mod presence;

pub use directory::{
    ClassDirectory, ClassInfo, ClassPatch, ClassStatus, MemoryDirectory, RestClassDirectory,
};
pub use messages::{ChatMessage, MemoryMessageStore, MessageStore, NewMessage};
pub use presence::{MemoryPresenceStore, Participant, PresenceStore, RedisPresenceStore};
