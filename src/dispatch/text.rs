//! Reply text shaping before it is split

use std::sync::LazyLock;

use regex::Regex;

use crate::config::{BotConfig, EmojiPolicy, PresetConfig};

static AI_PREAMBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(as an ai|as a language model|as an ai language model|作为一个?(ai|人工智能|语言模型))[^.!?。！？,，\n]*[.!?。！？,，]\s*")
        .expect("valid regex")
});

static EXTRA_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid regex"));

/// Drop leading "As an AI ..." sentences and collapse runs of blank lines
#[must_use]
pub fn refine(text: &str) -> String {
    let mut out = text.trim().to_string();
    loop {
        let stripped = AI_PREAMBLE.replace(&out, "").into_owned();
        if stripped == out || stripped.trim().is_empty() {
            break;
        }
        out = stripped;
    }
    EXTRA_NEWLINES.replace_all(&out, "\n\n").trim().to_string()
}

const fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF
            | 0x2600..=0x27BF
            | 0x2B00..=0x2BFF
            | 0xFE00..=0xFE0F
            | 0x200D
            | 0x20E3
            | 0xE0020..=0xE007F
    )
}

/// Remove emoji and emoji modifiers
#[must_use]
pub fn strip_emoji(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !is_emoji(*c)).collect();
    stripped
        .lines()
        .map(|l| l.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Render the reply suffix, substituting `{alias}` and `{model}`
#[must_use]
pub fn render_suffix(template: &str, preset: Option<&PresetConfig>) -> String {
    let (alias, model) = preset.map_or(("", ""), |p| (p.alias.as_str(), p.model.as_str()));
    template.replace("{alias}", alias).replace("{model}", model)
}

/// Render the quote prefix for the first chunk
///
/// `content` is cut to `max_chars` characters with an ellipsis.
#[must_use]
pub fn render_quote(template: &str, content: &str, max_chars: usize) -> String {
    let content = content.trim();
    let content = match content.char_indices().nth(max_chars) {
        Some((idx, _)) if max_chars > 0 => format!("{}…", &content[..idx]),
        _ => content.to_string(),
    };
    template.replace("{content}", &content)
}

/// Apply refinement, emoji policy, and suffix in that order
#[must_use]
pub fn shape_reply(text: &str, bot: &BotConfig, preset: Option<&PresetConfig>) -> String {
    let mut out = shape_body(text, bot);
    let suffix = render_suffix(&bot.reply_suffix, preset);
    if !suffix.is_empty() && !out.is_empty() {
        out.push_str(&suffix);
    }
    out
}

/// Refinement and emoji policy only, for streamed chunks
#[must_use]
pub fn shape_body(text: &str, bot: &BotConfig) -> String {
    let refined = if bot.refine_replies {
        refine(text)
    } else {
        text.trim().to_string()
    };
    match bot.emoji_policy {
        EmojiPolicy::Keep => refined,
        EmojiPolicy::Strip => strip_emoji(&refined),
    }
}
