//! Swarmcast - Knowledge dissemination for robot swarms
//!
//! Agents share a key/value knowledge base over UDP multicast or broadcast.
//! Every update carries a logical clock and a quality stamp; receivers keep
//! the newest value per key and optionally rebroadcast what they accepted.

pub mod config;
pub mod protocol;
pub mod store;
pub mod transport;

pub use store::{KnowledgeBase, KnowledgeStore};
pub use transport::{Transport, TransportError, TransportSettings};
