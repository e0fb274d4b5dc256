//! Reply plans: chunks with per-chunk delays

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use super::chunking::{split_fixed, split_natural};
use super::stream::StreamChunker;
use super::text::render_quote;
use crate::config::{BotConfig, QuoteMode, secs};

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub text: String,
    /// Wait before sending, counted from the previous send
    pub delay: Duration,
    /// Rendered quote prefix; first chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

/// Ordered chunks for one reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplyPlan {
    pub chunks: Vec<Chunk>,
}

impl ReplyPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk texts joined with newlines
    #[must_use]
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy)]
enum SplitMode {
    Fixed { size: usize, delay: Duration },
    Natural { min: usize, max: usize, segments: usize, delay: [f64; 2] },
}

/// Turns shaped reply text into a [`ReplyPlan`]
#[derive(Debug, Clone)]
pub struct DispatchPlanner {
    mode: SplitMode,
    initial_delay: [f64; 2],
    quote: Option<(String, usize)>,
    stream_threshold: usize,
    stream_max: usize,
}

/// Random duration within `[lo, hi]` seconds
#[must_use]
pub fn random_between(range: [f64; 2]) -> Duration {
    let lo = range[0].min(range[1]).max(0.0);
    let hi = range[0].max(range[1]).max(0.0);
    if hi - lo < f64::EPSILON {
        return secs(lo);
    }
    secs(rand::thread_rng().gen_range(lo..=hi))
}

impl DispatchPlanner {
    #[must_use]
    pub fn new(bot: &BotConfig) -> Self {
        let mode = if bot.natural_split_enabled {
            SplitMode::Natural {
                min: bot.natural_split_min_chars,
                max: bot.natural_split_max_chars,
                segments: bot.natural_split_max_segments,
                delay: bot.natural_split_delay_sec,
            }
        } else {
            SplitMode::Fixed {
                size: bot.reply_chunk_size,
                delay: secs(bot.reply_chunk_delay_sec),
            }
        };
        let quote = (bot.reply_quote_mode == QuoteMode::Text)
            .then(|| (bot.reply_quote_template.clone(), bot.reply_quote_max_chars));

        Self {
            mode,
            initial_delay: bot.random_delay_range_sec,
            quote,
            stream_threshold: bot.stream_buffer_chars,
            stream_max: bot.stream_chunk_max_chars,
        }
    }

    /// Split shaped text into message texts
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<String> {
        match self.mode {
            SplitMode::Fixed { size, .. } => split_fixed(text, size),
            SplitMode::Natural { min, max, segments, .. } => split_natural(text, min, max, segments),
        }
    }

    /// Delay before chunk `index`
    ///
    /// The first chunk waits a random pre-send delay; later chunks wait the
    /// inter-chunk delay of the split mode.
    #[must_use]
    pub fn delay_for(&self, index: usize) -> Duration {
        if index == 0 {
            return random_between(self.initial_delay);
        }
        match self.mode {
            SplitMode::Fixed { delay, .. } => delay,
            SplitMode::Natural { delay, .. } => random_between(delay),
        }
    }

    /// Rendered quote for the inbound text, when quoting is on
    #[must_use]
    pub fn quote_for(&self, source: Option<&str>) -> Option<String> {
        let (template, max_chars) = self.quote.as_ref()?;
        let source = source.filter(|s| !s.trim().is_empty())?;
        Some(render_quote(template, source, *max_chars))
    }

    /// Build the plan for a complete reply
    #[must_use]
    pub fn plan(&self, text: &str, quote_source: Option<&str>) -> ReplyPlan {
        let mut quote = self.quote_for(quote_source);
        let chunks = self
            .split(text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                text,
                delay: self.delay_for(i),
                quote: quote.take(),
            })
            .collect();
        ReplyPlan { chunks }
    }

    /// Chunker for streamed replies with this planner's thresholds
    #[must_use]
    pub fn stream_chunker(&self) -> StreamChunker {
        StreamChunker::new(self.stream_threshold, self.stream_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> BotConfig {
        BotConfig {
            random_delay_range_sec: [0.1, 0.3],
            reply_chunk_size: 12,
            reply_chunk_delay_sec: 0.2,
            ..BotConfig::default()
        }
    }

    #[test]
    fn fixed_plan_delays() {
        let planner = DispatchPlanner::new(&bot());
        let plan = planner.plan("First one. Second one.", None);

        assert_eq!(plan.len(), 2);
        let first = plan.chunks[0].delay;
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(300));
        assert_eq!(plan.chunks[1].delay, Duration::from_millis(200));
    }

    #[test]
    fn natural_plan_uses_delay_range() {
        let config = BotConfig {
            natural_split_enabled: true,
            natural_split_min_chars: 3,
            natural_split_max_chars: 12,
            natural_split_delay_sec: [0.8, 2.0],
            ..bot()
        };
        let plan = DispatchPlanner::new(&config).plan("Hello there. How are you? Fine.", None);

        assert!(plan.len() >= 2);
        for chunk in &plan.chunks[1..] {
            assert!(chunk.delay >= Duration::from_millis(800));
            assert!(chunk.delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn quote_on_first_chunk_only() {
        let config = BotConfig {
            reply_quote_mode: QuoteMode::Text,
            ..bot()
        };
        let plan = DispatchPlanner::new(&config).plan("First one. Second one.", Some("what's up"));

        assert_eq!(plan.chunks[0].quote.as_deref(), Some("> what's up\n"));
        assert!(plan.chunks[1].quote.is_none());
    }

    #[test]
    fn no_quote_when_disabled() {
        let planner = DispatchPlanner::new(&bot());
        assert!(planner.quote_for(Some("hi")).is_none());
    }

    #[test]
    fn empty_text_plans_nothing() {
        assert!(DispatchPlanner::new(&bot()).plan("  ", None).is_empty());
    }

    #[test]
    fn random_between_handles_degenerate_ranges() {
        assert_eq!(random_between([0.5, 0.5]), Duration::from_millis(500));
        assert_eq!(random_between([-1.0, 0.0]), Duration::ZERO);
        let d = random_between([2.0, 1.0]);
        assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
    }
}
