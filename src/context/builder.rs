//! Context assembler for one reply turn

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::{ChatMessage, EmotionState, Role, estimate_messages};
use crate::config::BotConfig;
use crate::db::{MemoryRecord, UserProfile};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid regex"));

/// Values substituted into the system template
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    /// Conversation display name
    pub name: String,
    /// Sender display name
    pub sender: String,
    /// Name of the gateway account
    pub self_name: String,
    /// Local time, `%Y-%m-%d %H:%M`
    pub time: String,
    /// Profile nickname
    pub nickname: String,
    /// Profile relationship label
    pub relationship: String,
}

impl PromptVars {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "sender" => Some(&self.sender),
            "self_name" => Some(&self.self_name),
            "time" => Some(&self.time),
            "nickname" => Some(&self.nickname),
            "relationship" => Some(&self.relationship),
            _ => None,
        }
    }
}

/// Substitute `{placeholder}`s; unknown names are left as written
#[must_use]
pub fn render_template(template: &str, vars: &PromptVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            vars.get(&caps[1])
                .map_or_else(|| caps[0].to_string(), str::to_string)
        })
        .into_owned()
}

/// Caps applied during assembly; zero disables a cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// History rounds (one user and one assistant message each)
    pub max_rounds: usize,
    /// Token budget for the whole message list
    pub max_tokens: usize,
    /// Profile facts shown
    pub max_facts: usize,
    /// Persisted memory records considered
    pub max_memory: usize,
}

impl ContextLimits {
    #[must_use]
    pub const fn from_bot(bot: &BotConfig) -> Self {
        Self {
            max_rounds: bot.context_rounds,
            max_tokens: bot.context_max_tokens,
            max_facts: bot.profile_max_facts,
            max_memory: bot.memory_context_limit,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from_bot(&BotConfig::default())
    }
}

/// Everything the assembler reads for one turn
#[derive(Debug, Clone)]
pub struct ContextInputs<'a> {
    pub template: &'a str,
    pub vars: PromptVars,
    /// In-memory ring, oldest first
    pub history: &'a [ChatMessage],
    /// Persisted records, oldest first
    pub memory: &'a [MemoryRecord],
    pub profile: Option<&'a UserProfile>,
    pub emotion: Option<&'a EmotionState>,
    /// The merged turn content
    pub user_message: &'a str,
}

/// Message list ready for the upstream request
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub estimated_tokens: usize,
    /// History messages cut for budget
    pub dropped_history: usize,
    /// Memory lines cut for budget
    pub dropped_memory: usize,
    /// Set when the template and newest user turn alone exceed the budget
    pub over_budget: bool,
}

/// Builds bounded, role-preserving prompt contexts
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    limits: ContextLimits,
}

struct Parts {
    system: String,
    profile: Option<String>,
    emotion: Option<String>,
    memory: Vec<String>,
    history: Vec<ChatMessage>,
    user: String,
}

impl Parts {
    fn render(&self) -> Vec<ChatMessage> {
        let mut system = self.system.clone();
        for appendix in [&self.profile, &self.emotion].into_iter().flatten() {
            system.push_str("\n\n");
            system.push_str(appendix);
        }

        let mut messages = Vec::with_capacity(self.history.len() + 3);
        messages.push(ChatMessage::system(system));
        if !self.memory.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Previous conversation memory:\n{}",
                self.memory.join("\n")
            )));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(self.user.clone()));
        messages
    }
}

impl ContextAssembler {
    #[must_use]
    pub const fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub const fn limits(&self) -> ContextLimits {
        self.limits
    }

    /// Assemble the message list for one turn
    ///
    /// Output order is system, memory, history, user. When the estimate is
    /// over budget, memory lines go first, then history (oldest first), then
    /// the emotion and profile appendices. The rendered template and the
    /// newest user message are never cut.
    #[must_use]
    pub fn assemble(&self, inputs: &ContextInputs<'_>) -> AssembledContext {
        let limits = self.limits;

        let history = recent_rounds(inputs.history, limits.max_rounds);
        let memory = memory_lines(inputs.memory, &history, limits.max_memory);

        let mut parts = Parts {
            system: render_template(inputs.template, &inputs.vars),
            profile: inputs
                .profile
                .and_then(|p| profile_appendix(p, limits.max_facts)),
            emotion: inputs.emotion.map(EmotionState::descriptor),
            memory,
            history,
            user: inputs.user_message.to_string(),
        };

        let mut dropped_history = 0;
        let mut dropped_memory = 0;
        let mut messages = parts.render();
        let mut tokens = estimate_messages(&messages);

        if limits.max_tokens > 0 {
            while tokens > limits.max_tokens {
                if !parts.memory.is_empty() {
                    parts.memory.remove(0);
                    dropped_memory += 1;
                } else if !parts.history.is_empty() {
                    parts.history.remove(0);
                    dropped_history += 1;
                } else if parts.emotion.is_some() {
                    parts.emotion = None;
                } else if parts.profile.is_some() {
                    parts.profile = None;
                } else {
                    break;
                }
                messages = parts.render();
                tokens = estimate_messages(&messages);
            }
        }

        if dropped_history + dropped_memory > 0 {
            tracing::debug!(
                dropped_history,
                dropped_memory,
                tokens,
                budget = limits.max_tokens,
                "context trimmed to budget"
            );
        }

        AssembledContext {
            over_budget: limits.max_tokens > 0 && tokens > limits.max_tokens,
            messages,
            estimated_tokens: tokens,
            dropped_history,
            dropped_memory,
        }
    }
}

fn recent_rounds(history: &[ChatMessage], max_rounds: usize) -> Vec<ChatMessage> {
    let keep = if max_rounds == 0 {
        history.len()
    } else {
        history.len().min(max_rounds * 2)
    };
    history[history.len() - keep..]
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect()
}

fn memory_lines(records: &[MemoryRecord], history: &[ChatMessage], max: usize) -> Vec<String> {
    let seen: HashSet<(Role, &str)> = history
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();

    let start = if max == 0 {
        0
    } else {
        records.len().saturating_sub(max)
    };
    records[start..]
        .iter()
        .filter(|r| !seen.contains(&(r.role, r.content.as_str())))
        .map(|r| format!("{}: {}", r.role, r.content))
        .collect()
}

fn profile_appendix(profile: &UserProfile, max_facts: usize) -> Option<String> {
    let mut lines = Vec::new();
    if !profile.nickname.is_empty() {
        lines.push(format!("Nickname: {}", profile.nickname));
    }
    if !profile.relationship.is_empty() {
        lines.push(format!("Relationship: {}", profile.relationship));
    }
    if !profile.personality.is_empty() {
        lines.push(format!("Personality: {}", profile.personality));
    }
    let skip = profile.facts.len().saturating_sub(max_facts);
    let facts: Vec<_> = profile.facts.iter().skip(skip).collect();
    if !facts.is_empty() {
        lines.push("Facts:".to_string());
        lines.extend(facts.iter().map(|f| format!("- {}", f.text)));
    }

    if lines.is_empty() {
        None
    } else {
        Some(format!("[User Profile]\n{}", lines.join("\n")))
    }
}
