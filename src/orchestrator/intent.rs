//! Authentication intent classification
//!
//! A pure function over the inbound utterance and the conversation's
//! authentication flag. Code detection wins over name detection, and an
//! authenticated conversation never yields an intent.

use regex::Regex;
use std::sync::LazyLock;

/// A standalone run of exactly six digits
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{6})\b").unwrap());

/// Self-introduction in English or Spanish, capturing the name run
static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:my name is|i am|i'm|soy|me llamo|mi nombre es)\s+([\p{L}][\p{L} ]*)")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthIntent {
    /// The user introduced themselves and wants a verification code
    RequestAuth { name: String },
    /// The user entered a six-digit verification code
    VerifyCode { code: u32 },
}

pub fn detect_auth_intent(text: &str, authenticated: bool) -> Option<AuthIntent> {
    if authenticated {
        return None;
    }

    if let Some(captures) = CODE.captures(text) {
        if let Ok(code) = captures[1].parse::<u32>() {
            return Some(AuthIntent::VerifyCode { code });
        }
    }

    if let Some(captures) = NAME.captures(text) {
        let name = captures[1].trim();
        if !name.is_empty() {
            return Some(AuthIntent::RequestAuth {
                name: name.to_string(),
            });
        }
    }

    None
}
