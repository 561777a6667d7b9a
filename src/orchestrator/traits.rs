//! Trait abstractions for orchestrator I/O
//!
//! These traits enable testing the turn orchestrator with mock
//! implementations.

use crate::db::{Conversation, Database, Message, MessageRole, User};
use crate::tools::{DispatchError, ToolInvocation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Storage for conversations and their transcripts
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, conv_id: &str) -> Result<Option<Conversation>, String>;

    async fn add_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> Result<Message, String>;

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String>;

    /// Mark the conversation authenticated, bind the user and retitle it
    async fn bind_user(&self, conv_id: &str, user_id: i64, title: &str) -> Result<(), String>;
}

/// Storage for user identities and verification codes
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, String>;

    /// Case-insensitive substring match on the user name
    async fn find_user_by_name(&self, fragment: &str) -> Result<Option<User>, String>;

    /// Find the holder of an unexpired verification code
    async fn find_user_by_code(&self, code: u32, now: DateTime<Utc>)
        -> Result<Option<User>, String>;

    async fn set_verification_code(
        &self,
        user_id: i64,
        code: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String>;

    async fn clear_verification_code(&self, user_id: i64) -> Result<(), String>;
}

/// Tool dispatch seam
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Typed tool declarations for the model request
    fn definitions(&self) -> Vec<crate::llm::ToolDefinition>;

    /// Execute a tool by name. Capability failures are folded into the
    /// invocation result; only unknown names and missing authentication
    /// surface as errors.
    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        caller: Option<&User>,
    ) -> Result<ToolInvocation, DispatchError>;
}

/// Combined storage trait for convenience
pub trait Storage: ConversationStore + IdentityStore {}
impl<T: ConversationStore + IdentityStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn get_conversation(&self, conv_id: &str) -> Result<Option<Conversation>, String> {
        (**self).get_conversation(conv_id).await
    }

    async fn add_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> Result<Message, String> {
        (**self).add_message(conv_id, role, content, tool_calls).await
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        (**self).get_messages(conv_id).await
    }

    async fn bind_user(&self, conv_id: &str, user_id: i64, title: &str) -> Result<(), String> {
        (**self).bind_user(conv_id, user_id, title).await
    }
}

#[async_trait]
impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, String> {
        (**self).get_user(user_id).await
    }

    async fn find_user_by_name(&self, fragment: &str) -> Result<Option<User>, String> {
        (**self).find_user_by_name(fragment).await
    }

    async fn find_user_by_code(
        &self,
        code: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, String> {
        (**self).find_user_by_code(code, now).await
    }

    async fn set_verification_code(
        &self,
        user_id: i64,
        code: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String> {
        (**self).set_verification_code(user_id, code, expires_at).await
    }

    async fn clear_verification_code(&self, user_id: i64) -> Result<(), String> {
        (**self).clear_verification_code(user_id).await
    }
}

#[async_trait]
impl<T: ToolDispatcher + ?Sized> ToolDispatcher for Arc<T> {
    fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        (**self).definitions()
    }

    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        caller: Option<&User>,
    ) -> Result<ToolInvocation, DispatchError> {
        (**self).dispatch(name, args, caller).await
    }
}

// ============================================================================
// Production adapter
// ============================================================================

/// `Storage` backed by the SQLite database
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn get_conversation(&self, conv_id: &str) -> Result<Option<Conversation>, String> {
        match self.db.get_conversation(conv_id) {
            Ok(conv) => Ok(Some(conv)),
            Err(crate::db::DbError::ConversationNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn add_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> Result<Message, String> {
        self.db
            .add_message(conv_id, role, content, tool_calls)
            .map_err(|e| e.to_string())
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        self.db.get_messages(conv_id).map_err(|e| e.to_string())
    }

    async fn bind_user(&self, conv_id: &str, user_id: i64, title: &str) -> Result<(), String> {
        self.db
            .bind_conversation_user(conv_id, user_id, title)
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl IdentityStore for DatabaseStorage {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, String> {
        match self.db.get_user(user_id) {
            Ok(user) => Ok(Some(user)),
            Err(crate::db::DbError::UserNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn find_user_by_name(&self, fragment: &str) -> Result<Option<User>, String> {
        self.db.find_user_by_name(fragment).map_err(|e| e.to_string())
    }

    async fn find_user_by_code(
        &self,
        code: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, String> {
        self.db.find_user_by_code(code, now).map_err(|e| e.to_string())
    }

    async fn set_verification_code(
        &self,
        user_id: i64,
        code: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.db
            .set_verification_code(user_id, code, expires_at)
            .map_err(|e| e.to_string())
    }

    async fn clear_verification_code(&self, user_id: i64) -> Result<(), String> {
        self.db
            .clear_verification_code(user_id)
            .map_err(|e| e.to_string())
    }
}
