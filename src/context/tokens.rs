//! Token estimation
//!
//! A cheap approximation, no tokenizer: each CJK character counts as one
//! token, other non-whitespace characters as a quarter token (rounded up),
//! with a floor of one for non-empty text.

use super::ChatMessage;

/// Fixed per-message overhead (role markers, separators)
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimate tokens for a piece of text
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if !c.is_whitespace() {
            other += 1;
        }
    }
    if cjk == 0 && other == 0 {
        return 0;
    }
    (cjk + other.div_ceil(4)).max(1)
}

/// Estimate tokens for one message including overhead
#[must_use]
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate tokens for a message list
#[must_use]
pub fn estimate_messages(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

const fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F      // CJK punctuation
            | 0x3040..=0x30FF // kana
            | 0x3400..=0x4DBF // extension A
            | 0x4E00..=0x9FFF // unified ideographs
            | 0xAC00..=0xD7AF // hangul
            | 0xF900..=0xFAFF // compatibility ideographs
            | 0xFF00..=0xFFEF // full-width forms
    )
}
