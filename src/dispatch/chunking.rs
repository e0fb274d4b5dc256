//! Splitting replies into outbound messages
//!
//! All lengths are in characters, not bytes. Every returned chunk is
//! trimmed and non-empty.

/// Break characters for fixed-size chunking
const FIXED_BREAKS: &[char] = &['。', '！', '？', '.', '!', '?', '；', ';', '\n'];

/// Break points for natural splitting, most preferred first
const NATURAL_BREAKS: &[&str] = &[
    "\n\n", "\n", "。", "！", "？", ".", "!", "?", "；", ";", "，", ",",
];

/// Byte offset of the `n`th character, or the end of `text`
fn byte_at(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn push_trimmed(chunks: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        chunks.push(piece.to_string());
    }
}

/// Cut point for a fixed window: after the last break inside it, else the window end
pub(crate) fn fixed_cut(text: &str, size: usize) -> usize {
    let limit = byte_at(text, size);
    last_break(&text[..limit]).unwrap_or(limit)
}

/// Position just past the last sentence break, if any
pub(crate) fn last_break(text: &str) -> Option<usize> {
    text.char_indices()
        .rev()
        .find(|(_, c)| FIXED_BREAKS.contains(c))
        .map(|(i, c)| i + c.len_utf8())
}

/// Cut point for a natural window: the best break ending in `[min, max]`
pub(crate) fn natural_cut(text: &str, min: usize, max: usize) -> Option<usize> {
    let min_b = byte_at(text, min);
    let window = &text[..byte_at(text, max)];
    NATURAL_BREAKS.iter().find_map(|delim| {
        window
            .rfind(delim)
            .map(|pos| pos + delim.len())
            .filter(|end| *end >= min_b)
    })
}

/// Split into chunks of at most `size` characters
///
/// Each chunk ends at the last sentence punctuation or newline inside its
/// window when there is one.
#[must_use]
pub fn split_fixed(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if size == 0 {
        push_trimmed(&mut chunks, text);
        return chunks;
    }

    let mut rest = text.trim();
    while !rest.is_empty() {
        if char_len(rest) <= size {
            push_trimmed(&mut chunks, rest);
            break;
        }
        let cut = fixed_cut(rest, size);
        push_trimmed(&mut chunks, &rest[..cut]);
        rest = rest[cut..].trim_start();
    }
    chunks
}

/// Split at sentence and paragraph boundaries
///
/// Segments aim for `[min, max]` characters, breaking at the most preferred
/// boundary inside that window and hard-splitting at `max` when there is
/// none. Anything past `max_segments` is appended to the last segment.
#[must_use]
pub fn split_natural(text: &str, min: usize, max: usize, max_segments: usize) -> Vec<String> {
    let max = max.max(1);
    let min = min.min(max);

    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if char_len(rest) <= max {
            push_trimmed(&mut chunks, rest);
            break;
        }
        let cut = natural_cut(rest, min, max).unwrap_or_else(|| byte_at(rest, max));
        push_trimmed(&mut chunks, &rest[..cut]);
        rest = rest[cut..].trim_start();
    }

    let max_segments = max_segments.max(1);
    if chunks.len() > max_segments {
        let overflow = chunks.split_off(max_segments);
        if let Some(last) = chunks.last_mut() {
            for piece in overflow {
                let sep = joiner(last, &piece);
                last.push_str(sep);
                last.push_str(&piece);
            }
        }
    }
    chunks
}

/// Separator when gluing overflow back together
fn joiner(prev: &str, next: &str) -> &'static str {
    let cjk_boundary = prev.chars().last().is_some_and(|c| !c.is_ascii())
        || next.chars().next().is_some_and(|c| !c.is_ascii());
    if cjk_boundary { "" } else { " " }
}
