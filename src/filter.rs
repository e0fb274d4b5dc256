//! Turn admission
//!
//! [`FilterChain::evaluate`] runs ordered, short-circuiting checks against a
//! merged [`Turn`]. Every check is pure; the chain reports a
//! [`FilterOutcome`] and never fails.

use std::fmt;

use chrono::NaiveTime;

use crate::config::BotConfig;
use crate::driver::ConversationKind;
use crate::merge::Turn;

/// Why a turn was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyContent,
    OwnMessage,
    IgnoredChatType(String),
    Muted,
    IgnoredName,
    IgnoredKeyword(String),
    GroupWithoutMention,
    NotWhitelisted,
    QuietHours,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyContent => write!(f, "empty content"),
            Self::OwnMessage => write!(f, "own message"),
            Self::IgnoredChatType(t) => write!(f, "ignored chat type {t}"),
            Self::Muted => write!(f, "muted"),
            Self::IgnoredName => write!(f, "ignored name"),
            Self::IgnoredKeyword(k) => write!(f, "ignored keyword {k}"),
            Self::GroupWithoutMention => write!(f, "group message without mention"),
            Self::NotWhitelisted => write!(f, "not whitelisted"),
            Self::QuietHours => write!(f, "quiet hours"),
        }
    }
}

/// Result of running the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Continue to context assembly
    Admit,
    /// Drop silently
    Reject(RejectReason),
    /// Drop, but answer with a canned reply (quiet hours)
    AutoReply(String),
}

impl FilterOutcome {
    #[must_use]
    pub const fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Runtime flags of the conversation a turn belongs to
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationFlags {
    pub muted: bool,
    pub whitelisted: bool,
}

/// Daily time window, possibly crossing midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// Parse `HH:MM` bounds
    #[must_use]
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    /// Whether `now` falls inside the window; equal bounds never match
    #[must_use]
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

/// Ordered admission checks compiled from one config snapshot
#[derive(Debug, Clone)]
pub struct FilterChain {
    self_name: String,
    mute_all: bool,
    ignore_chat_types: Vec<String>,
    ignore_names: Vec<String>,
    ignore_keywords: Vec<String>,
    group_requires_mention: bool,
    whitelist: Option<Vec<String>>,
    quiet_hours: Option<QuietHours>,
    quiet_reply: Option<String>,
}

impl FilterChain {
    /// Compile the chain
    #[must_use]
    pub fn new(bot: &BotConfig) -> Self {
        let quiet_hours = if bot.quiet_hours_enabled {
            let parsed = QuietHours::parse(&bot.quiet_hours_start, &bot.quiet_hours_end);
            if parsed.is_none() {
                tracing::warn!(
                    start = %bot.quiet_hours_start,
                    end = %bot.quiet_hours_end,
                    "invalid quiet hours, window disabled"
                );
            }
            parsed
        } else {
            None
        };

        Self {
            self_name: bot.self_name.trim().to_string(),
            mute_all: bot.filter_mute,
            ignore_chat_types: lowercase(&bot.ignore_chat_types),
            ignore_names: lowercase(&bot.ignore_names),
            ignore_keywords: bot
                .ignore_keywords
                .iter()
                .filter(|k| !k.is_empty())
                .cloned()
                .collect(),
            group_requires_mention: bot.group_reply_only_when_at,
            whitelist: bot.whitelist_enabled.then(|| bot.whitelist.clone()),
            quiet_hours,
            quiet_reply: Some(bot.quiet_hours_reply.trim().to_string()).filter(|r| !r.is_empty()),
        }
    }

    /// Run the checks in order, stopping at the first rejection
    #[must_use]
    pub fn evaluate(&self, turn: &Turn, flags: ConversationFlags, now: NaiveTime) -> FilterOutcome {
        use RejectReason as R;

        if turn.content.trim().is_empty() {
            return FilterOutcome::Reject(R::EmptyContent);
        }
        if turn.is_self || (!self.self_name.is_empty() && turn.sender_name == self.self_name) {
            return FilterOutcome::Reject(R::OwnMessage);
        }
        if let Some(chat_type) = &turn.chat_type {
            let chat_type = chat_type.to_lowercase();
            if self.ignore_chat_types.contains(&chat_type) {
                return FilterOutcome::Reject(R::IgnoredChatType(chat_type));
            }
        }
        if self.mute_all || flags.muted {
            return FilterOutcome::Reject(R::Muted);
        }

        let chat_name = turn.chat_name.to_lowercase();
        if self.ignore_names.contains(&chat_name) {
            return FilterOutcome::Reject(R::IgnoredName);
        }
        if let Some(keyword) = self.ignore_keywords.iter().find(|k| turn.chat_name.contains(k.as_str())) {
            return FilterOutcome::Reject(R::IgnoredKeyword(keyword.clone()));
        }

        let is_group = turn.kind == ConversationKind::Group;
        if is_group && self.group_requires_mention && !self.mentions_me(turn) {
            return FilterOutcome::Reject(R::GroupWithoutMention);
        }
        if let Some(whitelist) = &self.whitelist
            && is_group
            && !flags.whitelisted
            && !whitelist.iter().any(|w| w == &turn.chat_name || w == &turn.conversation_id)
        {
            return FilterOutcome::Reject(R::NotWhitelisted);
        }

        if self.quiet_hours.is_some_and(|q| q.contains(now)) {
            return self
                .quiet_reply
                .clone()
                .map_or(FilterOutcome::Reject(R::QuietHours), FilterOutcome::AutoReply);
        }

        FilterOutcome::Admit
    }

    /// Boolean form of [`evaluate`](Self::evaluate) that logs rejections
    #[must_use]
    pub fn should_process(&self, turn: &Turn, flags: ConversationFlags, now: NaiveTime) -> bool {
        match self.evaluate(turn, flags, now) {
            FilterOutcome::Admit => true,
            FilterOutcome::Reject(reason) => {
                tracing::debug!(conversation = %turn.conversation_id, %reason, "turn rejected");
                false
            }
            FilterOutcome::AutoReply(_) => {
                tracing::debug!(conversation = %turn.conversation_id, "turn answered by quiet-hours reply");
                false
            }
        }
    }

    fn mentions_me(&self, turn: &Turn) -> bool {
        turn.mentions_me || (!self.self_name.is_empty() && is_at_me(&turn.content, &self.self_name))
    }
}

/// Whether the text contains `@self_name`
#[must_use]
pub fn is_at_me(text: &str, self_name: &str) -> bool {
    !self_name.is_empty() && text.contains(&format!("@{self_name}"))
}

/// Remove a leading `@self_name` marker (followed by a space or U+2005)
#[must_use]
pub fn strip_mention(text: &str, self_name: &str) -> String {
    if self_name.is_empty() {
        return text.to_string();
    }
    let marker = format!("@{self_name}");
    text.trim_start()
        .strip_prefix(&marker)
        .map_or_else(
            || text.to_string(),
            |rest| rest.trim_start_matches(['\u{2005}', ' ']).trim().to_string(),
        )
}

/// In-chat operator commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause(Option<String>),
    Resume,
    Status,
    Help,
}

impl ControlCommand {
    /// Parse `<prefix><command> [args]`
    #[must_use]
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        if prefix.is_empty() {
            return None;
        }
        let body = text.trim().strip_prefix(prefix)?;
        let mut words = body.splitn(2, char::is_whitespace);
        let command = words.next()?.to_lowercase();
        let args = words.next().map(str::trim).filter(|a| !a.is_empty());
        match command.as_str() {
            "pause" => Some(Self::Pause(args.map(ToString::to_string))),
            "resume" => Some(Self::Resume),
            "status" => Some(Self::Status),
            "help" => Some(Self::Help),
            _ => None,
        }
    }

    /// Whether `sender` may issue commands; an empty allow list admits anyone
    #[must_use]
    pub fn is_allowed(sender_id: &str, sender_name: &str, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|a| a == sender_id || a == sender_name)
    }

    /// Command summary sent for `help`
    #[must_use]
    pub fn help_text(prefix: &str) -> String {
        format!(
            "{prefix}pause [reason] - pause auto replies\n{prefix}resume - resume auto replies\n{prefix}status - show status\n{prefix}help - show this help"
        )
    }
}

fn lowercase(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.trim().to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InboundEvent;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn direct(content: &str) -> Turn {
        Turn::from_events(vec![InboundEvent::text("alice", "alice", content)])
    }

    fn group(content: &str, mentioned: bool) -> Turn {
        let mut event = InboundEvent::text("g1", "bob", content).in_group(mentioned);
        event.chat_name = "Team".to_string();
        Turn::from_events(vec![event])
    }

    fn chain(edit: impl FnOnce(&mut BotConfig)) -> FilterChain {
        let mut bot = BotConfig {
            self_name: "Parley".to_string(),
            ..BotConfig::default()
        };
        edit(&mut bot);
        FilterChain::new(&bot)
    }

    // -- basic checks ---------------------------------------------------------

    #[test]
    fn admits_plain_direct_message() {
        let outcome = chain(|_| {}).evaluate(&direct("hello"), ConversationFlags::default(), noon());
        assert_eq!(outcome, FilterOutcome::Admit);
    }

    #[test]
    fn rejects_empty_and_own_messages() {
        let c = chain(|_| {});
        let flags = ConversationFlags::default();
        assert_eq!(
            c.evaluate(&direct("   "), flags, noon()),
            FilterOutcome::Reject(RejectReason::EmptyContent)
        );

        let mut own = InboundEvent::text("alice", "me", "hi");
        own.is_self = true;
        assert_eq!(
            c.evaluate(&Turn::from_events(vec![own]), flags, noon()),
            FilterOutcome::Reject(RejectReason::OwnMessage)
        );

        let mut named = InboundEvent::text("alice", "x", "hi");
        named.sender_name = "Parley".to_string();
        assert_eq!(
            c.evaluate(&Turn::from_events(vec![named]), flags, noon()),
            FilterOutcome::Reject(RejectReason::OwnMessage)
        );
    }

    #[test]
    fn rejects_ignored_chat_types() {
        let mut event = InboundEvent::text("news", "news", "promo");
        event.chat_type = Some("Official".to_string());
        let outcome = chain(|_| {}).evaluate(
            &Turn::from_events(vec![event]),
            ConversationFlags::default(),
            noon(),
        );
        assert_eq!(
            outcome,
            FilterOutcome::Reject(RejectReason::IgnoredChatType("official".to_string()))
        );
    }

    #[test]
    fn rejects_muted() {
        let flags = ConversationFlags {
            muted: true,
            whitelisted: false,
        };
        assert_eq!(
            chain(|_| {}).evaluate(&direct("hi"), flags, noon()),
            FilterOutcome::Reject(RejectReason::Muted)
        );
        assert_eq!(
            chain(|b| b.filter_mute = true).evaluate(&direct("hi"), ConversationFlags::default(), noon()),
            FilterOutcome::Reject(RejectReason::Muted)
        );
    }

    #[test]
    fn ignore_lists_match_chat_name() {
        let flags = ConversationFlags::default();
        let by_name = chain(|b| b.ignore_names = vec!["TEAM".to_string()]);
        assert_eq!(
            by_name.evaluate(&group("@Parley hi", true), flags, noon()),
            FilterOutcome::Reject(RejectReason::IgnoredName)
        );

        let by_keyword = chain(|b| b.ignore_keywords = vec!["Tea".to_string()]);
        assert_eq!(
            by_keyword.evaluate(&group("@Parley hi", true), flags, noon()),
            FilterOutcome::Reject(RejectReason::IgnoredKeyword("Tea".to_string()))
        );
    }

    // -- groups ---------------------------------------------------------------

    #[test]
    fn group_requires_mention_unless_disabled() {
        let flags = ConversationFlags::default();
        assert_eq!(
            chain(|_| {}).evaluate(&group("hi all", false), flags, noon()),
            FilterOutcome::Reject(RejectReason::GroupWithoutMention)
        );
        assert!(chain(|_| {}).evaluate(&group("hi", true), flags, noon()).is_admit());
        // textual mention counts even without the driver flag
        assert!(chain(|_| {}).evaluate(&group("@Parley hi", false), flags, noon()).is_admit());
        assert!(
            chain(|b| b.group_reply_only_when_at = false)
                .evaluate(&group("hi all", false), flags, noon())
                .is_admit()
        );
    }

    #[test]
    fn whitelist_only_mode() {
        let c = chain(|b| {
            b.whitelist_enabled = true;
            b.whitelist = vec!["Other".to_string()];
        });
        let flags = ConversationFlags::default();
        assert_eq!(
            c.evaluate(&group("hi", true), flags, noon()),
            FilterOutcome::Reject(RejectReason::NotWhitelisted)
        );
        // direct chats are not subject to the group whitelist
        assert!(c.evaluate(&direct("hi"), flags, noon()).is_admit());
        let allowed = ConversationFlags {
            muted: false,
            whitelisted: true,
        };
        assert!(c.evaluate(&group("hi", true), allowed, noon()).is_admit());
    }

    // -- quiet hours ----------------------------------------------------------

    #[test]
    fn quiet_hours_cross_midnight() {
        let q = QuietHours::parse("23:00", "07:00").unwrap();
        assert!(q.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(q.contains(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!q.contains(NaiveTime::from_hms_opt(7, 0, 0).unwrap()));
        assert!(!q.contains(noon()));

        let day = QuietHours::parse("09:00", "17:00").unwrap();
        assert!(day.contains(noon()));
        assert!(!day.contains(NaiveTime::from_hms_opt(18, 0, 0).unwrap()));

        assert!(QuietHours::parse("25:00", "07:00").is_none());
    }

    #[test]
    fn quiet_hours_reply_or_drop() {
        let night = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        let flags = ConversationFlags::default();

        let silent = chain(|b| b.quiet_hours_enabled = true);
        assert_eq!(
            silent.evaluate(&direct("hi"), flags, night),
            FilterOutcome::Reject(RejectReason::QuietHours)
        );

        let replying = chain(|b| {
            b.quiet_hours_enabled = true;
            b.quiet_hours_reply = "Sleeping, back at 7.".to_string();
        });
        assert_eq!(
            replying.evaluate(&direct("hi"), flags, night),
            FilterOutcome::AutoReply("Sleeping, back at 7.".to_string())
        );
        assert!(replying.evaluate(&direct("hi"), flags, noon()).is_admit());
    }

    // -- mentions and commands ------------------------------------------------

    #[test]
    fn strips_leading_mention() {
        assert_eq!(strip_mention("@Parley\u{2005}hello", "Parley"), "hello");
        assert_eq!(strip_mention("@Parley what's up", "Parley"), "what's up");
        assert_eq!(strip_mention("hey @Parley", "Parley"), "hey @Parley");
        assert_eq!(strip_mention("hi", ""), "hi");
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(
            ControlCommand::parse("/pause lunch break", "/"),
            Some(ControlCommand::Pause(Some("lunch break".to_string())))
        );
        assert_eq!(ControlCommand::parse("/pause", "/"), Some(ControlCommand::Pause(None)));
        assert_eq!(ControlCommand::parse(" /STATUS ", "/"), Some(ControlCommand::Status));
        assert_eq!(ControlCommand::parse("/unknown", "/"), None);
        assert_eq!(ControlCommand::parse("resume", "/"), None);
    }

    #[test]
    fn command_allow_list() {
        assert!(ControlCommand::is_allowed("u1", "Ann", &[]));
        let allowed = vec!["Ann".to_string()];
        assert!(ControlCommand::is_allowed("u1", "Ann", &allowed));
        assert!(!ControlCommand::is_allowed("u2", "Bob", &allowed));
    }
}
