//! Incremental chunking of streamed replies

use super::chunking::{char_len, fixed_cut, last_break};

/// Buffers deltas and releases chunks as soon as they are sendable
///
/// A chunk is released once the buffer holds at least `threshold`
/// characters and a sentence break; past `hard_max` characters it is cut
/// regardless.
#[derive(Debug, Clone)]
pub struct StreamChunker {
    threshold: usize,
    hard_max: usize,
    buf: String,
}

impl StreamChunker {
    #[must_use]
    pub fn new(threshold: usize, hard_max: usize) -> Self {
        let hard_max = hard_max.max(1);
        Self {
            threshold: threshold.clamp(1, hard_max),
            hard_max,
            buf: String::new(),
        }
    }

    /// Add a delta, returning chunks ready to send
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);

        let mut ready = Vec::new();
        loop {
            let len = char_len(&self.buf);
            let cut = if len >= self.hard_max {
                Some(fixed_cut(&self.buf, self.hard_max))
            } else if len >= self.threshold {
                last_break(&self.buf)
            } else {
                None
            };
            let Some(cut) = cut else { break };

            let head: String = self.buf.drain(..cut).collect();
            let head = head.trim();
            if !head.is_empty() {
                ready.push(head.to_string());
            }
            if self.buf.trim().is_empty() {
                self.buf.clear();
                break;
            }
        }
        ready
    }

    /// Release whatever is left
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Characters buffered and not yet released
    #[must_use]
    pub fn pending(&self) -> usize {
        char_len(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_threshold() {
        let mut chunker = StreamChunker::new(20, 100);
        assert!(chunker.push("Hi. ").is_empty());
        assert!(chunker.push("How are").is_empty());
        assert_eq!(chunker.push(" you doing? I'm"), ["Hi. How are you doing?"]);
        assert_eq!(chunker.finish().as_deref(), Some("I'm"));
    }

    #[test]
    fn waits_for_a_break_above_threshold() {
        let mut chunker = StreamChunker::new(5, 100);
        assert!(chunker.push("no break here yet").is_empty());
        assert_eq!(chunker.push(" done."), ["no break here yet done."]);
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn hard_max_forces_a_cut() {
        let mut chunker = StreamChunker::new(5, 10);
        let out = chunker.push("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(out, ["abcdefghij", "klmnopqrst"]);
        assert_eq!(chunker.pending(), 6);
        assert_eq!(chunker.finish().as_deref(), Some("uvwxyz"));
    }

    #[test]
    fn concatenation_matches_input_modulo_whitespace() {
        let text = "第一句话。第二句话！Third sentence here? Fourth; fifth.\nSixth line";
        let mut chunker = StreamChunker::new(6, 12);
        let mut out = Vec::new();
        for c in text.chars() {
            out.extend(chunker.push(&c.to_string()));
        }
        out.extend(chunker.finish());

        let joined: String = out.concat().split_whitespace().collect();
        let expected: String = text.split_whitespace().collect();
        assert_eq!(joined, expected);
        assert!(out.iter().all(|c| c.chars().count() <= 12));
    }
}
