//! Conversation turn orchestration
//!
//! Everything between an inbound user message and the stream of events the
//! client sees: intent classification, the authentication sub-dialog, the
//! two-phase tool protocol, and the pending-message hand-off between the
//! submit and stream endpoints.

mod auth;
mod events;
mod intent;
mod pending;
mod traits;
mod turn;

#[cfg(test)]
mod proptests;
#[cfg(test)]
pub mod testing;

pub use events::{emit, EventTx, StreamEvent};
pub use intent::{detect_auth_intent, AuthIntent};
pub use pending::{InMemoryPendingStore, PendingError, PendingStore, PENDING_TTL};
pub use traits::{
    ConversationStore, DatabaseStorage, IdentityStore, Storage, ToolDispatcher,
};
pub use turn::{TurnError, TurnOrchestrator};

use crate::email::Mailer;
use crate::llm::OpenAiClient;
use crate::tools::ToolRegistry;
use std::sync::Arc;

/// Production orchestrator with concrete implementations
pub type ProductionOrchestrator =
    TurnOrchestrator<DatabaseStorage, Arc<OpenAiClient>, Arc<ToolRegistry>, Arc<dyn Mailer>>;
