use crate::common::error::ValidationError;

/// Canonical id of the conversation between two users: the lexicographically
/// larger id followed by the smaller one, so both sides derive the same key.
pub fn conversation_id(a: &str, b: &str) -> Result<String, ValidationError> {
    if a.is_empty() || b.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }
    if a == b {
        return Err(ValidationError::SelfChat);
    }
    Ok(if a > b {
        format!("{}{}", a, b)
    } else {
        format!("{}{}", b, a)
    })
}

/// Sub-collection holding the messages of one conversation.
pub fn messages_collection(conversation_id: &str) -> String {
    format!("messages/{}/chat", conversation_id)
}
