//! API request and response shapes

use crate::db::{Conversation, Message, PublicUser};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub user: Option<PublicUser>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitMessageResponse {
    /// Token for the stream-open endpoint
    pub message_id: String,
}
