use crate::models::chat::ChatMessage;

/// Per-message framing overhead charged by chat-style upstreams.
const MESSAGE_OVERHEAD: u32 = 4;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0x3000..=0x303F    // CJK punctuation
        | 0xFF00..=0xFFEF    // Full-width forms
        | 0x20000..=0x2A6DF) // Extension B
}

/// Estimate the token count of `text`.
///
/// CJK characters count as one token each; everything else is charged at
/// roughly four characters per token. Any non-empty input is at least 1.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let mut cjk = 0u32;
    let mut other = 0u32;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }

    (cjk + other.div_ceil(4)).max(1)
}

/// Estimate the prompt size of a whole conversation.
pub fn estimate_messages(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + MESSAGE_OVERHEAD)
        .sum()
}
