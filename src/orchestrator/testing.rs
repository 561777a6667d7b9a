//! Mock implementations for orchestrator tests

use super::traits::{ConversationStore, IdentityStore, ToolDispatcher};
use crate::db::{Conversation, Message, MessageRole, User};
use crate::email::{MailError, Mailer};
use crate::llm::{
    ChatClient, ChatRequest, ChatStream, LlmError, StreamDelta, ToolCallFragment, ToolDefinition,
};
use crate::tools::{DispatchError, ToolInvocation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Shorthand for building tool-call fragments in tests
pub fn fragment(
    index: u32,
    id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) -> ToolCallFragment {
    ToolCallFragment {
        index,
        id: id.map(String::from),
        name: name.map(String::from),
        arguments: arguments.map(String::from),
    }
}

// ==================== MockChatClient ====================

type RoundScript = Result<Vec<Result<StreamDelta, LlmError>>, LlmError>;

/// Chat client that replays scripted rounds and records every request
#[derive(Clone, Default)]
pub struct MockChatClient {
    scripts: Arc<Mutex<VecDeque<RoundScript>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockChatClient {
    /// Queue a round that streams these deltas and ends cleanly
    pub fn enqueue_deltas(&self, deltas: Vec<StreamDelta>) {
        self.enqueue_script(deltas.into_iter().map(Ok).collect());
    }

    /// Queue a round whose request fails outright
    pub fn enqueue_error(&self, error: LlmError) {
        self.scripts.lock().unwrap().push_back(Err(error));
    }

    /// Queue a round item by item, including mid-stream errors
    pub fn enqueue_script(&self, items: Vec<Result<StreamDelta, LlmError>>) {
        self.scripts.lock().unwrap().push_back(Ok(items));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unknown("No scripted response queued")));
        match script {
            Ok(items) => Ok(futures::stream::iter(items).boxed()),
            Err(error) => Err(error),
        }
    }
}

// ==================== MockDispatcher ====================

/// Dispatcher with canned results per tool name; records dispatch order
#[derive(Clone, Default)]
pub struct MockDispatcher {
    results: Arc<Mutex<HashMap<String, ToolInvocation>>>,
    errors: Arc<Mutex<HashMap<String, DispatchError>>>,
    dispatched: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockDispatcher {
    pub fn set_result(&self, name: &str, invocation: ToolInvocation) {
        self.results.lock().unwrap().insert(name.to_string(), invocation);
    }

    pub fn set_error(&self, name: &str, error: DispatchError) {
        self.errors.lock().unwrap().insert(name.to_string(), error);
    }

    /// Calls that reached the dispatcher, in order
    pub fn dispatched(&self) -> Vec<(String, Value)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolDispatcher for MockDispatcher {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let results = self.results.lock().unwrap();
        results
            .keys()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("mock tool {name}"),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        _caller: Option<&User>,
    ) -> Result<ToolInvocation, DispatchError> {
        if let Some(error) = self.errors.lock().unwrap().get(name) {
            return Err(error.clone());
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((name.to_string(), args));
        self.results
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))
    }
}

// ==================== MockStorage ====================

#[derive(Default)]
struct StorageInner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    users: HashMap<i64, User>,
    next_user_id: i64,
}

/// In-memory storage double
#[derive(Clone, Default)]
pub struct MockStorage {
    inner: Arc<Mutex<StorageInner>>,
}

impl MockStorage {
    pub fn with_conversation(id: &str) -> Self {
        let storage = Self::default();
        let now = Utc::now();
        storage.inner.lock().unwrap().conversations.insert(
            id.to_string(),
            Conversation {
                id: id.to_string(),
                title: "New conversation".to_string(),
                is_authenticated: false,
                user_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        storage
    }

    pub fn add_user(&self, name: &str, email: &str, department: &str) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_user_id += 1;
        let id = inner.next_user_id;
        inner.users.insert(
            id,
            User {
                id,
                name: name.to_string(),
                email: email.to_string(),
                department: department.to_string(),
                otp: None,
                otp_expires_at: None,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn set_code(&self, user_id: i64, code: u32, expires_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.otp = Some(code);
            user.otp_expires_at = Some(expires_at);
        }
    }

    pub fn bind(&self, conv_id: &str, user_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conv) = inner.conversations.get_mut(conv_id) {
            conv.is_authenticated = true;
            conv.user_id = Some(user_id);
        }
    }

    pub fn push_message(&self, conv_id: &str, role: MessageRole, content: &str) {
        let mut inner = self.inner.lock().unwrap();
        let messages = inner.messages.entry(conv_id.to_string()).or_default();
        let sequence_id = messages.len() as i64 + 1;
        messages.push(Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv_id.to_string(),
            sequence_id,
            role,
            content: content.to_string(),
            tool_calls: None,
            created_at: Utc::now(),
        });
    }

    pub fn messages(&self, conv_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(conv_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation(&self, conv_id: &str) -> Conversation {
        self.inner.lock().unwrap().conversations[conv_id].clone()
    }

    pub fn user(&self, user_id: i64) -> User {
        self.inner.lock().unwrap().users[&user_id].clone()
    }
}

#[async_trait]
impl ConversationStore for MockStorage {
    async fn get_conversation(&self, conv_id: &str) -> Result<Option<Conversation>, String> {
        Ok(self.inner.lock().unwrap().conversations.get(conv_id).cloned())
    }

    async fn add_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> Result<Message, String> {
        let mut inner = self.inner.lock().unwrap();
        let messages = inner.messages.entry(conv_id.to_string()).or_default();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conv_id.to_string(),
            sequence_id: messages.len() as i64 + 1,
            role,
            content: content.to_string(),
            tool_calls: tool_calls.cloned(),
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        Ok(self.messages(conv_id))
    }

    async fn bind_user(&self, conv_id: &str, user_id: i64, title: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        let conv = inner
            .conversations
            .get_mut(conv_id)
            .ok_or_else(|| format!("no conversation {conv_id}"))?;
        conv.is_authenticated = true;
        conv.user_id = Some(user_id);
        conv.title = title.to_string();
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MockStorage {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, String> {
        Ok(self.inner.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn find_user_by_name(&self, fragment: &str) -> Result<Option<User>, String> {
        let needle = fragment.to_lowercase();
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.name.to_lowercase().contains(&needle))
            .cloned())
    }

    async fn find_user_by_code(
        &self,
        code: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, String> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.otp == Some(code) && u.otp_expires_at.is_some_and(|at| at > now))
            .cloned())
    }

    async fn set_verification_code(
        &self,
        user_id: i64,
        code: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.set_code(user_id, code, expires_at);
        Ok(())
    }

    async fn clear_verification_code(&self, user_id: i64) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.otp = None;
            user.otp_expires_at = None;
        }
        Ok(())
    }
}

// ==================== MockMailer ====================

#[derive(Default)]
struct MailerState {
    sent: Vec<(String, u32)>,
    fail_next: bool,
}

/// Mailer double that records (recipient, code) pairs
#[derive(Clone, Default)]
pub struct MockMailer {
    state: Arc<Mutex<MailerState>>,
}

impl MockMailer {
    pub fn sent(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_verification_code(
        &self,
        email: &str,
        _user_name: &str,
        code: u32,
        _expiration_minutes: u32,
    ) -> Result<(), MailError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next {
            state.fail_next = false;
            return Err(MailError::Status(503));
        }
        state.sent.push((email.to_string(), code));
        Ok(())
    }
}
