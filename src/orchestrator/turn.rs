//! Turn orchestrator
//!
//! Drives one conversation turn end to end: persist the inbound message,
//! short-circuit auth intents, then run the two-phase model protocol — a
//! tools-enabled round whose tool calls are dispatched sequentially, followed
//! by a tools-disabled corrective round. Every turn ends with exactly one
//! terminal event.

use super::auth;
use super::events::{emit, EventTx, StreamEvent};
use super::intent::detect_auth_intent;
use super::{Storage, ToolDispatcher};
use crate::db::{Conversation, Message, MessageRole, User};
use crate::email::Mailer;
use crate::llm::{ChatClient, ChatMessage, ChatRequest, LlmError, ToolCallBuilder};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Model request failed: {0}")]
    Model(#[from] LlmError),
}

pub struct TurnOrchestrator<S, L, T, M> {
    storage: S,
    llm: L,
    tools: T,
    mailer: M,
}

impl<S, L, T, M> TurnOrchestrator<S, L, T, M>
where
    S: Storage,
    L: ChatClient,
    T: ToolDispatcher,
    M: Mailer,
{
    pub fn new(storage: S, llm: L, tools: T, mailer: M) -> Self {
        Self {
            storage,
            llm,
            tools,
            mailer,
        }
    }

    /// Run one turn. Fatal failures become the stream's terminal `error`
    /// event; the sender is dropped afterwards, which ends the stream.
    pub async fn run(&self, conversation_id: &str, text: &str, tx: EventTx) {
        if let Err(e) = self.run_turn(conversation_id, text, &tx).await {
            match &e {
                TurnError::Model(m) => {
                    tracing::error!(conv_id = %conversation_id, kind = ?m.kind, error = %m, "Turn failed");
                }
                other => tracing::error!(conv_id = %conversation_id, error = %other, "Turn failed"),
            }
            emit(&tx, StreamEvent::Error {
                error: e.to_string(),
            })
            .await;
        }
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        text: &str,
        tx: &EventTx,
    ) -> Result<(), TurnError> {
        let conversation = self
            .storage
            .get_conversation(conversation_id)
            .await
            .map_err(TurnError::Storage)?
            .ok_or_else(|| TurnError::ConversationNotFound(conversation_id.to_string()))?;

        self.storage
            .add_message(conversation_id, MessageRole::User, text, None)
            .await
            .map_err(TurnError::Storage)?;

        // Auth turns are handled without any model round-trip
        if let Some(intent) = detect_auth_intent(text, conversation.is_authenticated) {
            return auth::handle_auth_intent(
                &self.storage,
                &self.mailer,
                conversation_id,
                intent,
                tx,
            )
            .await;
        }

        let user = match conversation.user_id.filter(|_| conversation.is_authenticated) {
            Some(user_id) => self
                .storage
                .get_user(user_id)
                .await
                .map_err(TurnError::Storage)?,
            None => None,
        };

        let history = self
            .storage
            .get_messages(conversation_id)
            .await
            .map_err(TurnError::Storage)?;
        let mut transcript = build_transcript(&conversation, user.as_ref(), &history);

        // Round one: tools enabled
        let round_one = ChatRequest {
            messages: transcript.clone(),
            tools: self.tools.definitions(),
        };
        let (content, calls) = self.stream_round(round_one, tx, true).await?;

        if calls.is_empty() {
            if !content.is_empty() {
                self.storage
                    .add_message(conversation_id, MessageRole::Assistant, &content, None)
                    .await
                    .map_err(TurnError::Storage)?;
            }
            emit(tx, StreamEvent::Done {}).await;
            return Ok(());
        }

        emit(tx, StreamEvent::ToolStart {
            tools: calls.values().map(|c| c.name.clone()).collect(),
        })
        .await;

        transcript.push(ChatMessage::assistant_tool_calls(
            content,
            tool_calls_payload(&calls),
        ));
        self.dispatch_calls(&calls, user.as_ref(), &mut transcript, tx)
            .await;

        // Round two: tools disabled, correct the answer with the results
        let round_two = ChatRequest {
            messages: transcript,
            tools: Vec::new(),
        };
        let (final_content, _) = self.stream_round(round_two, tx, false).await?;

        if !final_content.is_empty() {
            self.storage
                .add_message(conversation_id, MessageRole::Assistant, &final_content, None)
                .await
                .map_err(TurnError::Storage)?;
        }
        emit(tx, StreamEvent::Done {}).await;
        Ok(())
    }

    /// One model round-trip: forward content fragments, accumulate tool-call
    /// fragments per index. Upstream and mid-stream failures are fatal.
    async fn stream_round(
        &self,
        request: ChatRequest,
        tx: &EventTx,
        collect_tools: bool,
    ) -> Result<(String, BTreeMap<u32, ToolCallBuilder>), TurnError> {
        let mut stream = self.llm.stream_chat(request).await?;
        let mut content = String::new();
        let mut calls: BTreeMap<u32, ToolCallBuilder> = BTreeMap::new();

        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if let Some(text) = delta.content {
                content.push_str(&text);
                emit(tx, StreamEvent::Content { content: text }).await;
            }
            if collect_tools {
                for fragment in &delta.tool_calls {
                    calls.entry(fragment.index).or_default().apply(fragment);
                }
            }
        }

        Ok((content, calls))
    }

    /// Dispatch the accumulated calls sequentially, in index order. Failures
    /// become `tool_error` events plus synthetic tool transcript entries; the
    /// loop always continues.
    async fn dispatch_calls(
        &self,
        calls: &BTreeMap<u32, ToolCallBuilder>,
        caller: Option<&User>,
        transcript: &mut Vec<ChatMessage>,
        tx: &EventTx,
    ) {
        for call in calls.values() {
            let args: Value = match serde_json::from_str(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    let error = format!("Invalid tool arguments: {e}");
                    emit(tx, StreamEvent::ToolError {
                        name: call.name.clone(),
                        error: error.clone(),
                    })
                    .await;
                    transcript.push(ChatMessage::tool(
                        call.id.clone(),
                        json!({ "error": error }).to_string(),
                    ));
                    continue;
                }
            };

            match self.tools.dispatch(&call.name, args, caller).await {
                Ok(invocation) => {
                    transcript.push(ChatMessage::tool(
                        call.id.clone(),
                        invocation.result.to_string(),
                    ));
                    emit(tx, StreamEvent::ToolResult {
                        name: call.name.clone(),
                        result: invocation.result,
                        trace: invocation.trace,
                    })
                    .await;
                }
                Err(e) => {
                    emit(tx, StreamEvent::ToolError {
                        name: call.name.clone(),
                        error: e.to_string(),
                    })
                    .await;
                    transcript.push(ChatMessage::tool(
                        call.id.clone(),
                        json!({ "error": e.to_string() }).to_string(),
                    ));
                }
            }
        }
    }
}

/// Assistant tool-call payload in the chat wire shape
fn tool_calls_payload(calls: &BTreeMap<u32, ToolCallBuilder>) -> Value {
    Value::Array(
        calls
            .values()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect(),
    )
}

/// System preamble plus prior turns. Tool-role rows never re-enter the
/// transcript; they only exist inside the turn that produced them.
fn build_transcript(
    conversation: &Conversation,
    user: Option<&User>,
    history: &[Message],
) -> Vec<ChatMessage> {
    let preamble = match user {
        Some(user) => format!(
            "You are a procurement assistant for internal purchasing. You are talking to {} \
             ({}) from the {} department, a verified user. Use the available tools to create \
             purchase requests, review their request history, and search the knowledge base \
             for purchasing policies.",
            user.name, user.email, user.department
        ),
        None => format!(
            "You are a procurement assistant for internal purchasing. The user of conversation \
             \"{}\" is not verified yet. They can ask general questions and search the knowledge \
             base, but purchase tools require verification: invite them to introduce themselves \
             (for example \"my name is Ana\") and then enter the six-digit code sent to their \
             email.",
            conversation.title
        ),
    };

    let mut messages = vec![ChatMessage::system(preamble)];
    for message in history {
        match message.role {
            MessageRole::User => messages.push(ChatMessage::user(message.content.clone())),
            MessageRole::Assistant => {
                messages.push(ChatMessage::assistant(message.content.clone()));
            }
            MessageRole::Tool => {}
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PublicUser;
    use crate::llm::StreamDelta;
    use crate::orchestrator::testing::{
        fragment, MockChatClient, MockDispatcher, MockMailer, MockStorage,
    };
    use crate::tools::{DispatchError, ToolInvocation};
    use tokio::sync::mpsc;

    type TestOrchestrator = TurnOrchestrator<MockStorage, MockChatClient, MockDispatcher, MockMailer>;

    fn orchestrator(
        storage: MockStorage,
        llm: MockChatClient,
        tools: MockDispatcher,
    ) -> (TestOrchestrator, MockMailer) {
        let mailer = MockMailer::default();
        (
            TurnOrchestrator::new(storage, llm, tools, mailer.clone()),
            mailer,
        )
    }

    async fn collect_events(orch: &TestOrchestrator, conv_id: &str, text: &str) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        orch.run(conv_id, text, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn content_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Content { content } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_turn_is_one_round_trip() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![
            StreamDelta::content("Hel"),
            StreamDelta::content("lo!"),
        ]);

        let (orch, _) = orchestrator(storage.clone(), llm.clone(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "hi there").await;

        assert_eq!(content_text(&events), "Hello!");
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
        assert_eq!(llm.request_count(), 1);

        // User message and assistant reply both persisted
        let messages = storage.messages("conv-1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "Hello!");
    }

    #[tokio::test]
    async fn empty_response_is_not_persisted() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![]);

        let (orch, _) = orchestrator(storage.clone(), llm, MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "hi").await;

        assert_eq!(events, vec![StreamEvent::Done {}]);
        assert_eq!(storage.messages("conv-1").len(), 1); // just the user turn
    }

    #[tokio::test]
    async fn tool_turn_runs_two_rounds_in_order() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        // Round one: some content, then a call whose arguments arrive split
        llm.enqueue_deltas(vec![
            StreamDelta::content("Looking that up. "),
            StreamDelta {
                content: None,
                tool_calls: vec![fragment(0, Some("call_1"), Some("search_knowledge_base"), Some("{\"que"))],
            },
            StreamDelta {
                content: None,
                tool_calls: vec![fragment(0, None, None, Some("ry\":\"vpn\"}"))],
            },
        ]);
        // Round two: corrective answer
        llm.enqueue_deltas(vec![StreamDelta::content("VPN policy says use the portal.")]);

        let tools = MockDispatcher::default();
        tools.set_result(
            "search_knowledge_base",
            ToolInvocation {
                result: json!({"results": ["use the portal"]}),
                trace: "Executing tool: search_knowledge_base".to_string(),
            },
        );

        let (orch, _) = orchestrator(storage.clone(), llm.clone(), tools.clone());
        let events = collect_events(&orch, "conv-1", "what is the vpn policy?").await;

        // Reassembled arguments reached the dispatcher
        let dispatched = tools.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].0, "search_knowledge_base");
        assert_eq!(dispatched[0].1, json!({"query": "vpn"}));

        assert!(events.contains(&StreamEvent::ToolStart {
            tools: vec!["search_knowledge_base".to_string()],
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolResult { name, .. } if name == "search_knowledge_base")));
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
        assert_eq!(llm.request_count(), 2);

        // Round two went out without tools and with the tool transcript row
        let second = llm.request(1);
        assert!(second.tools.is_empty());
        assert!(second.messages.iter().any(|m| m.role == "tool"));

        // Only the corrective answer is persisted for the turn
        let messages = storage.messages("conv-1");
        assert_eq!(messages.last().unwrap().content, "VPN policy says use the portal.");
    }

    #[tokio::test]
    async fn multiple_calls_dispatch_in_index_order() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        // Fragments arrive interleaved and out of index order
        llm.enqueue_deltas(vec![
            StreamDelta {
                content: None,
                tool_calls: vec![
                    fragment(1, Some("call_b"), Some("get_user_requests"), Some("{}")),
                    fragment(0, Some("call_a"), Some("search_knowledge_base"), Some("{}")),
                ],
            },
        ]);
        llm.enqueue_deltas(vec![StreamDelta::content("done")]);

        let tools = MockDispatcher::default();
        tools.set_result(
            "search_knowledge_base",
            ToolInvocation { result: json!({}), trace: String::new() },
        );
        tools.set_result(
            "get_user_requests",
            ToolInvocation { result: json!({}), trace: String::new() },
        );

        let (orch, _) = orchestrator(storage, llm, tools.clone());
        let events = collect_events(&orch, "conv-1", "both please").await;

        let dispatched = tools.dispatched();
        assert_eq!(dispatched[0].0, "search_knowledge_base");
        assert_eq!(dispatched[1].0, "get_user_requests");
        assert!(events.contains(&StreamEvent::ToolStart {
            tools: vec![
                "search_knowledge_base".to_string(),
                "get_user_requests".to_string(),
            ],
        }));
    }

    #[tokio::test]
    async fn malformed_arguments_do_not_abort_the_turn() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta {
            content: None,
            tool_calls: vec![
                fragment(0, Some("call_a"), Some("broken"), Some("{not json")),
                fragment(1, Some("call_b"), Some("search_knowledge_base"), Some("{}")),
            ],
        }]);
        llm.enqueue_deltas(vec![StreamDelta::content("recovered")]);

        let tools = MockDispatcher::default();
        tools.set_result(
            "search_knowledge_base",
            ToolInvocation { result: json!({}), trace: String::new() },
        );

        let (orch, _) = orchestrator(storage, llm, tools.clone());
        let events = collect_events(&orch, "conv-1", "go").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolError { name, error }
                if name == "broken" && error.contains("Invalid tool arguments"))));
        // The second call still ran and the turn completed
        assert_eq!(tools.dispatched().len(), 1);
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
    }

    #[tokio::test]
    async fn dispatch_errors_become_tool_error_events() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta {
            content: None,
            tool_calls: vec![fragment(0, Some("call_a"), Some("create_shopping_request"), Some("{}"))],
        }]);
        llm.enqueue_deltas(vec![StreamDelta::content("you need to verify first")]);

        let tools = MockDispatcher::default();
        tools.set_error(
            "create_shopping_request",
            DispatchError::AuthenticationRequired("create_shopping_request".to_string()),
        );

        let (orch, _) = orchestrator(storage, llm, tools);
        let events = collect_events(&orch, "conv-1", "buy a cable").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolError { error, .. }
                if error.contains("requires an authenticated user"))));
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
    }

    #[tokio::test]
    async fn model_failure_is_the_single_terminal_error() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_error(LlmError::server_error("upstream 500"));

        let (orch, _) = orchestrator(storage, llm, MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "hi").await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("upstream 500")));
    }

    #[tokio::test]
    async fn mid_stream_failure_is_fatal() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_script(vec![
            Ok(StreamDelta::content("partial")),
            Err(LlmError::network("connection reset")),
        ]);

        let (orch, _) = orchestrator(storage, llm, MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "hi").await;

        assert_eq!(content_text(&events), "partial");
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn unknown_conversation_errors_without_model_call() {
        let storage = MockStorage::default();
        let llm = MockChatClient::default();

        let (orch, _) = orchestrator(storage, llm.clone(), MockDispatcher::default());
        let events = collect_events(&orch, "missing", "hi").await;

        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("not found")));
        assert_eq!(llm.request_count(), 0);
    }

    // ==================== Auth sub-dialog ====================

    #[tokio::test]
    async fn introduction_issues_a_code_without_model_calls() {
        let storage = MockStorage::with_conversation("conv-1");
        let monica = storage.add_user("Monica", "monica@example.com", "Marketing");
        let llm = MockChatClient::default();

        let (orch, mailer) = orchestrator(storage.clone(), llm.clone(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "soy Monica").await;

        assert_eq!(llm.request_count(), 0);
        assert!(content_text(&events).contains("verification code"));
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "monica@example.com");
        assert_eq!(storage.user(monica).otp, Some(sent[0].1));
    }

    #[tokio::test]
    async fn unknown_name_gets_a_polite_reply() {
        let storage = MockStorage::with_conversation("conv-1");
        let (orch, mailer) =
            orchestrator(storage, MockChatClient::default(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "my name is Zephyr").await;

        assert!(content_text(&events).contains("couldn't find anyone named \"Zephyr\""));
        assert!(mailer.sent().is_empty());
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
    }

    #[tokio::test]
    async fn mail_failure_does_not_abort_the_dialog() {
        let storage = MockStorage::with_conversation("conv-1");
        storage.add_user("Monica", "monica@example.com", "Marketing");
        let (orch, mailer) =
            orchestrator(storage, MockChatClient::default(), MockDispatcher::default());
        mailer.fail_next();

        let events = collect_events(&orch, "conv-1", "soy Monica").await;
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
        assert!(content_text(&events).contains("verification code"));
    }

    #[tokio::test]
    async fn valid_code_authenticates_and_binds() {
        let storage = MockStorage::with_conversation("conv-1");
        let monica = storage.add_user("Monica", "monica@example.com", "Marketing");
        storage.set_code(monica, 123_456, chrono::Utc::now() + chrono::Duration::minutes(5));

        let (orch, _) = orchestrator(storage.clone(), MockChatClient::default(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "123456").await;

        assert!(content_text(&events).contains("You're verified, Monica"));
        assert!(events.contains(&StreamEvent::Authenticated {
            user: PublicUser {
                id: monica,
                name: "Monica".to_string(),
                email: "monica@example.com".to_string(),
            },
        }));
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));

        let conv = storage.conversation("conv-1");
        assert!(conv.is_authenticated);
        assert_eq!(conv.user_id, Some(monica));
        assert_eq!(conv.title, "Chat with Monica");
        // Code is single-use
        assert_eq!(storage.user(monica).otp, None);
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let storage = MockStorage::with_conversation("conv-1");
        let monica = storage.add_user("Monica", "monica@example.com", "Marketing");
        storage.set_code(monica, 123_456, chrono::Utc::now() - chrono::Duration::minutes(1));

        let (orch, _) = orchestrator(storage.clone(), MockChatClient::default(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "123456").await;

        assert!(content_text(&events).contains("invalid or has expired"));
        assert!(!storage.conversation("conv-1").is_authenticated);
    }

    #[tokio::test]
    async fn authenticated_conversations_skip_the_classifier() {
        let storage = MockStorage::with_conversation("conv-1");
        let monica = storage.add_user("Monica", "monica@example.com", "Marketing");
        storage.bind("conv-1", monica);

        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta::content("Those six digits look like a quantity.")]);

        let (orch, _) = orchestrator(storage, llm.clone(), MockDispatcher::default());
        let events = collect_events(&orch, "conv-1", "order 654321 units").await;

        // Goes to the model instead of the auth sub-dialog
        assert_eq!(llm.request_count(), 1);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Authenticated { .. })));
    }

    #[tokio::test]
    async fn authenticated_turns_carry_identity_in_the_preamble() {
        let storage = MockStorage::with_conversation("conv-1");
        let monica = storage.add_user("Monica", "monica@example.com", "Marketing");
        storage.bind("conv-1", monica);

        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta::content("hi")]);

        let (orch, _) = orchestrator(storage, llm.clone(), MockDispatcher::default());
        collect_events(&orch, "conv-1", "hello").await;

        let request = llm.request(0);
        let system = request.messages.first().unwrap();
        assert_eq!(system.role, "system");
        assert!(system.content.as_deref().unwrap().contains("Monica"));
        assert!(system.content.as_deref().unwrap().contains("verified"));
    }

    #[tokio::test]
    async fn tool_rows_never_replay_into_later_turns() {
        let storage = MockStorage::with_conversation("conv-1");
        storage.push_message("conv-1", MessageRole::Tool, "{\"old\":\"result\"}");
        storage.push_message("conv-1", MessageRole::Assistant, "earlier answer");

        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta::content("ok")]);

        let (orch, _) = orchestrator(storage, llm.clone(), MockDispatcher::default());
        collect_events(&orch, "conv-1", "next question").await;

        let request = llm.request(0);
        assert!(request.messages.iter().all(|m| m.role != "tool"));
        assert!(request
            .messages
            .iter()
            .any(|m| m.content.as_deref() == Some("earlier answer")));
    }

    #[tokio::test]
    async fn round_two_tool_fragments_are_ignored() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta {
            content: None,
            tool_calls: vec![fragment(0, Some("call_a"), Some("search_knowledge_base"), Some("{}"))],
        }]);
        // A misbehaving second round that still tries to call tools
        llm.enqueue_deltas(vec![StreamDelta {
            content: Some("final".to_string()),
            tool_calls: vec![fragment(0, Some("call_x"), Some("search_knowledge_base"), Some("{}"))],
        }]);

        let tools = MockDispatcher::default();
        tools.set_result(
            "search_knowledge_base",
            ToolInvocation { result: json!({}), trace: String::new() },
        );

        let (orch, _) = orchestrator(storage, llm.clone(), tools.clone());
        let events = collect_events(&orch, "conv-1", "go").await;

        assert_eq!(tools.dispatched().len(), 1); // only the round-one call
        assert_eq!(llm.request_count(), 2);
        assert_eq!(events.last(), Some(&StreamEvent::Done {}));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_stop_the_turn() {
        let storage = MockStorage::with_conversation("conv-1");
        let llm = MockChatClient::default();
        llm.enqueue_deltas(vec![StreamDelta::content("nobody is listening")]);

        let (orch, _) = orchestrator(storage.clone(), llm, MockDispatcher::default());
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        orch.run("conv-1", "hi", tx).await;

        // The turn still persisted its result
        let messages = storage.messages("conv-1");
        assert_eq!(messages.last().unwrap().content, "nobody is listening");
    }
}
