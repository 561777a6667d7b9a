//! In-conversation authentication sub-dialog
//!
//! Auth turns never reach the model: the classifier routes them here, the
//! reply is emitted as content and persisted, and the stream finishes with
//! `done`.

use super::events::{emit, EventTx, StreamEvent};
use super::intent::AuthIntent;
use super::turn::TurnError;
use super::Storage;
use crate::db::MessageRole;
use crate::email::Mailer;
use chrono::{Duration, Utc};
use rand::Rng;

pub const CODE_TTL_MINUTES: u32 = 5;

pub fn generate_code() -> u32 {
    rand::thread_rng().gen_range(100_000..=999_999)
}

/// Partially mask an email for display: `monica@example.com` → `m***a@example.com`
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if local.chars().count() > 2 => {
            let mut chars = local.chars();
            let first = chars.next().unwrap_or('*');
            let last = chars.last().unwrap_or('*');
            format!("{first}***{last}@{domain}")
        }
        _ => email.to_string(),
    }
}

pub async fn handle_auth_intent<S: Storage, M: Mailer>(
    storage: &S,
    mailer: &M,
    conversation_id: &str,
    intent: AuthIntent,
    tx: &EventTx,
) -> Result<(), TurnError> {
    match intent {
        AuthIntent::RequestAuth { name } => {
            request_code(storage, mailer, conversation_id, &name, tx).await
        }
        AuthIntent::VerifyCode { code } => verify_code(storage, conversation_id, code, tx).await,
    }
}

async fn request_code<S: Storage, M: Mailer>(
    storage: &S,
    mailer: &M,
    conversation_id: &str,
    name: &str,
    tx: &EventTx,
) -> Result<(), TurnError> {
    let Some(user) = storage
        .find_user_by_name(name)
        .await
        .map_err(TurnError::Storage)?
    else {
        tracing::info!(name = %name, "Auth requested for unknown name");
        return reply(
            storage,
            conversation_id,
            format!("I couldn't find anyone named \"{name}\". Please check the name and try again."),
            tx,
        )
        .await;
    };

    // A re-introduction replaces any code already in flight
    let code = generate_code();
    let expires_at = Utc::now() + Duration::minutes(i64::from(CODE_TTL_MINUTES));
    storage
        .set_verification_code(user.id, code, expires_at)
        .await
        .map_err(TurnError::Storage)?;

    if let Err(e) = mailer
        .send_verification_code(&user.email, &user.name, code, CODE_TTL_MINUTES)
        .await
    {
        // The code is stored; the user can still ask for a fresh one
        tracing::warn!(user_id = user.id, error = %e, "Verification email failed");
    }

    tracing::info!(user_id = user.id, "Verification code issued");
    reply(
        storage,
        conversation_id,
        format!(
            "I've sent a verification code to {}. Enter the six-digit code here to continue.",
            mask_email(&user.email)
        ),
        tx,
    )
    .await
}

async fn verify_code<S: Storage>(
    storage: &S,
    conversation_id: &str,
    code: u32,
    tx: &EventTx,
) -> Result<(), TurnError> {
    let Some(user) = storage
        .find_user_by_code(code, Utc::now())
        .await
        .map_err(TurnError::Storage)?
    else {
        return reply(
            storage,
            conversation_id,
            "That code is invalid or has expired. Tell me your name and I'll send you a new one."
                .to_string(),
            tx,
        )
        .await;
    };

    storage
        .clear_verification_code(user.id)
        .await
        .map_err(TurnError::Storage)?;
    storage
        .bind_user(
            conversation_id,
            user.id,
            &format!("Chat with {}", user.name),
        )
        .await
        .map_err(TurnError::Storage)?;

    tracing::info!(user_id = user.id, conv_id = %conversation_id, "Conversation authenticated");

    let greeting = format!("You're verified, {}. How can I help you today?", user.name);
    emit(
        tx,
        StreamEvent::Content {
            content: greeting.clone(),
        },
    )
    .await;
    emit(
        tx,
        StreamEvent::Authenticated {
            user: user.public(),
        },
    )
    .await;
    storage
        .add_message(conversation_id, MessageRole::Assistant, &greeting, None)
        .await
        .map_err(TurnError::Storage)?;
    emit(tx, StreamEvent::Done {}).await;
    Ok(())
}

/// Emit a content reply, persist it, finish the stream
async fn reply<S: Storage>(
    storage: &S,
    conversation_id: &str,
    text: String,
    tx: &EventTx,
) -> Result<(), TurnError> {
    emit(
        tx,
        StreamEvent::Content {
            content: text.clone(),
        },
    )
    .await;
    storage
        .add_message(conversation_id, MessageRole::Assistant, &text, None)
        .await
        .map_err(TurnError::Storage)?;
    emit(tx, StreamEvent::Done {}).await;
    Ok(())
}
