//! Client-side token estimation
//!
//! Uses tiktoken's cl100k_base encoding as a cross-vendor
//! approximation. Estimates produced here are always carried with
//! `TokenUsage::estimated == true`: cl100k is not any vendor's exact
//! tokenizer, and downstream billing must be able to tell measured
//! counts from approximated ones.

use crate::message::Message;
use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Global tokenizer instance (initialized once, thread-safe)
static TOKENIZER: LazyLock<CoreBPE> = LazyLock::new(|| {
    cl100k_base().expect("cl100k_base tokenizer is a compile-time constant and should never fail")
});

/// Per-message structural overhead (role marker + separators)
const MESSAGE_OVERHEAD: usize = 6;

/// Per-conversation overhead (start/end tokens)
const CONVERSATION_OVERHEAD: usize = 3;

/// Count tokens in a string
#[must_use]
pub fn count_tokens(text: &str) -> u32 {
    TOKENIZER.encode_with_special_tokens(text).len() as u32
}

/// Count tokens in a message (includes role overhead)
#[must_use]
pub fn count_message_tokens(message: &Message) -> u32 {
    count_tokens(&message.content) + MESSAGE_OVERHEAD as u32
}

/// Estimate prompt tokens for a whole conversation
#[must_use]
pub fn count_conversation_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(count_message_tokens)
        .sum::<u32>()
        + CONVERSATION_OVERHEAD as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_basic() {
        let tokens = count_tokens("Hello, world!");
        assert!(tokens > 0);
        assert!(tokens < 10);

        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_message_tokens_include_overhead() {
        let message = Message::user("Hello, how are you?");
        let tokens = count_message_tokens(&message);
        assert!(tokens > count_tokens("Hello, how are you?"));
    }

    #[test]
    fn test_conversation_tokens_sum_messages() {
        let messages = vec![
            Message::system("You are a helpful assistant."),
            Message::user("Hello!"),
            Message::assistant("Hi there! How can I help you?"),
        ];

        let total = count_conversation_tokens(&messages);
        let sum: u32 = messages.iter().map(count_message_tokens).sum();
        assert!(total >= sum);
    }
}
