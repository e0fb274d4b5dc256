//! One reply cycle: filter, context, upstream, dispatch, memory

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use super::{RunState, Shared, control};
use crate::config::{BotConfig, ConfigSnapshot, EmotionMode};
use crate::context::{
    ChatMessage, ContextAssembler, ContextInputs, ContextLimits, EmotionState, PromptVars,
    detect_emotion, emotion_analysis_prompt, parse_emotion_reply,
};
use crate::db::{MemoryRecord, ProfileFact, UserProfile};
use crate::dispatch::text::render_suffix;
use crate::dispatch::{Chunk, DispatchPlanner, Pacer, PartialDelivery, shape_body, shape_reply};
use crate::filter::{ControlCommand, ConversationFlags, FilterChain, FilterOutcome, strip_mention};
use crate::merge::Turn;
use crate::registry::{Conversation, PipelineStage};
use crate::upstream::{ReplyStream, UpstreamClient, UpstreamError};
use crate::Error;

/// History rounds kept in memory when `context_rounds` is 0 (uncapped)
const UNCAPPED_RING_ROUNDS: usize = 20;

/// Relationship labels accepted from fact extraction
const RELATIONSHIPS: &[&str] = &["friend", "close_friend", "family", "colleague", "stranger"];

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Generated reply delivered
    Replied,
    /// Quiet-hours canned reply delivered
    AutoReplied,
    /// In-chat control command answered
    Command,
    /// Operator message sent through the control API
    Manual,
    /// Dropped while paused
    Paused,
    /// Filtered out
    Rejected { reason: String },
    /// Failed with nothing sent
    Failed { error: String },
    /// Failed, fallback reply delivered instead
    Fallback { error: String },
}

/// One processed turn, as shown by `/api/turns`
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub conversation_id: String,
    pub sender: String,
    pub input: String,
    pub reply: Option<String>,
    pub outcome: TurnOutcome,
    pub preset: Option<String>,
    pub chunks: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Processed {
    outcome: TurnOutcome,
    reply: Option<String>,
    preset: Option<String>,
    chunks: usize,
}

impl Processed {
    const fn bare(outcome: TurnOutcome) -> Self {
        Self {
            outcome,
            reply: None,
            preset: None,
            chunks: 0,
        }
    }
}

/// A delivery that stopped early
struct Interrupted {
    error: Error,
    sent: usize,
}

/// Process one turn and record its outcome
pub(super) async fn run_turn(shared: &Arc<Shared>, conversation: &Conversation, turn: Turn) {
    let started_at = Utc::now();
    let snapshot = shared.config.current();

    let processed = process(shared, conversation, &turn, &snapshot).await;
    match &processed.outcome {
        TurnOutcome::Failed { error } | TurnOutcome::Fallback { error } => {
            tracing::warn!(conversation = %conversation.id(), turn = %turn.id, %error, "turn failed");
        }
        outcome => {
            tracing::debug!(conversation = %conversation.id(), turn = %turn.id, ?outcome, "turn finished");
        }
    }

    shared.record(TurnRecord {
        conversation_id: turn.conversation_id,
        sender: turn.sender_name,
        input: turn.content,
        reply: processed.reply,
        outcome: processed.outcome,
        preset: processed.preset,
        chunks: processed.chunks,
        started_at,
        finished_at: Utc::now(),
    });
    conversation.set_stage(PipelineStage::Idle);
}

async fn process(shared: &Arc<Shared>, conversation: &Conversation, turn: &Turn, snapshot: &ConfigSnapshot) -> Processed {
    let bot = &snapshot.bot;
    let content = strip_mention(&turn.content, &bot.self_name);
    let pacer = Pacer::new(bot.min_reply_interval());

    if bot.control_commands_enabled
        && !turn.is_self
        && let Some(command) = ControlCommand::parse(&content, &bot.control_command_prefix)
    {
        if ControlCommand::is_allowed(&turn.sender_id, &turn.sender_name, &bot.control_allowed_users) {
            let reply = control::execute(shared, command, bot);
            return send_direct(shared, conversation, &pacer, reply, TurnOutcome::Command).await;
        }
        tracing::debug!(conversation = %conversation.id(), sender = %turn.sender_id, "control command from unauthorized sender");
    }

    if shared.state.get() == RunState::Paused {
        tracing::debug!(conversation = %conversation.id(), "turn dropped while paused");
        return Processed::bare(TurnOutcome::Paused);
    }

    conversation.set_stage(PipelineStage::Filtering);
    let flags = ConversationFlags {
        muted: conversation.is_muted(),
        whitelisted: conversation.is_whitelisted(),
    };
    match FilterChain::new(bot).evaluate(turn, flags, Local::now().time()) {
        FilterOutcome::Admit => {}
        FilterOutcome::Reject(reason) => {
            tracing::debug!(conversation = %conversation.id(), %reason, "turn rejected");
            return Processed::bare(TurnOutcome::Rejected {
                reason: reason.to_string(),
            });
        }
        FilterOutcome::AutoReply(reply) => {
            tracing::debug!(conversation = %conversation.id(), "quiet hours, sending auto reply");
            return send_direct(shared, conversation, &pacer, reply, TurnOutcome::AutoReplied).await;
        }
    }

    conversation.set_stage(PipelineStage::Assembling);
    let emotion = analyze_emotion(&shared.upstream, &content, bot.emotion_mode).await;
    let messages = assemble(shared, conversation, turn, &content, bot, emotion.as_ref());

    conversation.set_stage(PipelineStage::AwaitingUpstream);
    let stream = match shared.upstream.deltas(&messages, bot.stream_reply).await {
        Ok(stream) => stream,
        Err(e) => return fail(shared, conversation, &pacer, bot, Error::from(e), 0).await,
    };
    let preset_name = stream.preset.clone();

    conversation.set_stage(PipelineStage::Dispatching);
    let planner = DispatchPlanner::new(bot);
    let delivered = if bot.stream_reply {
        deliver_streamed(shared, conversation, &pacer, &planner, stream, snapshot, &content).await
    } else {
        deliver_buffered(shared, conversation, &pacer, &planner, stream, snapshot, &content).await
    };
    let (reply, chunks) = match delivered {
        Ok(delivered) => delivered,
        Err(Interrupted { error, sent }) => {
            let mut processed = fail(shared, conversation, &pacer, bot, error, sent).await;
            processed.preset = Some(preset_name);
            return processed;
        }
    };

    remember(shared, conversation, bot, &content, &reply, emotion.as_ref()).await;

    Processed {
        outcome: TurnOutcome::Replied,
        reply: Some(reply),
        preset: Some(preset_name),
        chunks,
    }
}

/// Build the upstream message list; store errors degrade to empty layers
fn assemble(
    shared: &Shared,
    conversation: &Conversation,
    turn: &Turn,
    content: &str,
    bot: &BotConfig,
    emotion: Option<&EmotionState>,
) -> Vec<ChatMessage> {
    let memory: Vec<MemoryRecord> = shared
        .store
        .memory()
        .recent(conversation.id(), bot.memory_context_limit, bot.memory_ttl())
        .unwrap_or_else(|e| {
            tracing::warn!(conversation = %conversation.id(), error = %e, "memory read failed");
            Vec::new()
        });
    let profile: Option<UserProfile> = if bot.profile_enabled {
        shared
            .store
            .profiles()
            .get(conversation.id())
            .unwrap_or_else(|e| {
                tracing::warn!(conversation = %conversation.id(), error = %e, "profile read failed");
                None
            })
    } else {
        None
    };

    let display_name = conversation.display_name();
    let template = bot
        .system_prompt_overrides
        .get(&display_name)
        .unwrap_or(&bot.system_prompt);
    let vars = PromptVars {
        name: display_name.clone(),
        sender: turn.sender_name.clone(),
        self_name: bot.self_name.clone(),
        time: Local::now().format("%Y-%m-%d %H:%M").to_string(),
        nickname: profile.as_ref().map(|p| p.nickname.clone()).unwrap_or_default(),
        relationship: profile.as_ref().map(|p| p.relationship.clone()).unwrap_or_default(),
    };

    let history = conversation.history();
    let assembled = ContextAssembler::new(ContextLimits::from_bot(bot)).assemble(&ContextInputs {
        template,
        vars,
        history: &history,
        memory: &memory,
        profile: profile.as_ref(),
        emotion,
        user_message: content,
    });

    if assembled.over_budget {
        tracing::warn!(
            conversation = %conversation.id(),
            estimated_tokens = assembled.estimated_tokens,
            budget = bot.context_max_tokens,
            "context over budget after trimming"
        );
    }
    tracing::debug!(
        conversation = %conversation.id(),
        messages = assembled.messages.len(),
        estimated_tokens = assembled.estimated_tokens,
        dropped_history = assembled.dropped_history,
        dropped_memory = assembled.dropped_memory,
        "context assembled"
    );
    assembled.messages
}

async fn deliver_buffered(
    shared: &Shared,
    conversation: &Conversation,
    pacer: &Pacer,
    planner: &DispatchPlanner,
    stream: ReplyStream,
    snapshot: &ConfigSnapshot,
    quote_source: &str,
) -> std::result::Result<(String, usize), Interrupted> {
    let preset = snapshot.preset(&stream.preset);
    let text = stream
        .collect_text()
        .await
        .map_err(|e| Interrupted { error: e.into(), sent: 0 })?;

    let shaped = shape_reply(&text, &snapshot.bot, preset);
    let plan = planner.plan(&shaped, Some(quote_source));
    if plan.is_empty() {
        return Err(Interrupted {
            error: UpstreamError::EmptyReply.into(),
            sent: 0,
        });
    }

    let sent = pacer
        .dispatch(shared.driver.as_ref(), conversation, &plan)
        .await
        .map_err(|PartialDelivery { error, sent }| Interrupted { error, sent })?;
    Ok((plan.text(), sent))
}

/// Paced sender for streamed chunks
struct StreamSender<'a> {
    shared: &'a Shared,
    conversation: &'a Conversation,
    pacer: &'a Pacer,
    planner: &'a DispatchPlanner,
    quote: Option<String>,
    sent: Vec<String>,
}

impl StreamSender<'_> {
    async fn send(&mut self, text: String) -> std::result::Result<(), Interrupted> {
        let chunk = Chunk {
            delay: self.planner.delay_for(self.sent.len()),
            quote: self.quote.take(),
            text,
        };
        self.pacer
            .send_chunk(self.shared.driver.as_ref(), self.conversation, &chunk)
            .await
            .map_err(|error| self.interrupted(error))?;
        self.sent.push(chunk.text);
        Ok(())
    }

    fn interrupted(&self, error: Error) -> Interrupted {
        Interrupted {
            error,
            sent: self.sent.len(),
        }
    }
}

/// Send chunks as the stream produces them
///
/// The newest ready chunk is held back so the reply suffix can be attached
/// to whichever chunk turns out to be last.
async fn deliver_streamed(
    shared: &Shared,
    conversation: &Conversation,
    pacer: &Pacer,
    planner: &DispatchPlanner,
    mut stream: ReplyStream,
    snapshot: &ConfigSnapshot,
    quote_source: &str,
) -> std::result::Result<(String, usize), Interrupted> {
    let bot = &snapshot.bot;
    let preset = snapshot.preset(&stream.preset);
    let mut chunker = planner.stream_chunker();
    let mut sender = StreamSender {
        shared,
        conversation,
        pacer,
        planner,
        quote: planner.quote_for(Some(quote_source)),
        sent: Vec::new(),
    };
    let mut held: Option<String> = None;

    while let Some(delta) = stream.next().await {
        let delta = delta.map_err(|e| sender.interrupted(e.into()))?;
        for piece in chunker.push(&delta) {
            let piece = shape_body(&piece, bot);
            if piece.is_empty() {
                continue;
            }
            if let Some(previous) = held.replace(piece) {
                sender.send(previous).await?;
            }
        }
    }
    if let Some(rest) = chunker.finish() {
        let rest = shape_body(&rest, bot);
        if !rest.is_empty()
            && let Some(previous) = held.replace(rest)
        {
            sender.send(previous).await?;
        }
    }

    let Some(last) = held else {
        return Err(sender.interrupted(UpstreamError::EmptyReply.into()));
    };
    let suffix = render_suffix(&bot.reply_suffix, preset);
    sender.send(format!("{last}{suffix}")).await?;

    let count = sender.sent.len();
    Ok((sender.sent.join("\n"), count))
}

/// Record a failure, sending the fallback reply when nothing went out
async fn fail(
    shared: &Shared,
    conversation: &Conversation,
    pacer: &Pacer,
    bot: &BotConfig,
    error: Error,
    sent: usize,
) -> Processed {
    let fallback = bot.fallback_reply.trim();
    if sent > 0 || fallback.is_empty() {
        return Processed {
            chunks: sent,
            ..Processed::bare(TurnOutcome::Failed {
                error: error.to_string(),
            })
        };
    }

    let chunk = Chunk {
        text: fallback.to_string(),
        delay: Duration::ZERO,
        quote: None,
    };
    match pacer.send_chunk(shared.driver.as_ref(), conversation, &chunk).await {
        Ok(()) => Processed {
            outcome: TurnOutcome::Fallback {
                error: error.to_string(),
            },
            reply: Some(chunk.text),
            preset: None,
            chunks: 1,
        },
        Err(send_error) => {
            tracing::warn!(conversation = %conversation.id(), error = %send_error, "fallback reply not sent");
            Processed::bare(TurnOutcome::Failed {
                error: error.to_string(),
            })
        }
    }
}

/// Send a reply that skips the upstream (commands, quiet hours)
async fn send_direct(
    shared: &Shared,
    conversation: &Conversation,
    pacer: &Pacer,
    reply: String,
    outcome: TurnOutcome,
) -> Processed {
    conversation.set_stage(PipelineStage::Dispatching);
    let chunk = Chunk {
        text: reply,
        delay: Duration::ZERO,
        quote: None,
    };
    match pacer.send_chunk(shared.driver.as_ref(), conversation, &chunk).await {
        Ok(()) => Processed {
            outcome,
            reply: Some(chunk.text),
            preset: None,
            chunks: 1,
        },
        Err(e) => Processed::bare(TurnOutcome::Failed { error: e.to_string() }),
    }
}

/// Detect the emotion of a turn
///
/// The model-backed mode falls back to keyword matching when the call fails
/// or its answer cannot be parsed.
async fn analyze_emotion(upstream: &UpstreamClient, text: &str, mode: EmotionMode) -> Option<EmotionState> {
    if mode != EmotionMode::Ai {
        return detect_emotion(text, mode);
    }
    let messages = [
        ChatMessage::system("You analyse the emotion of chat messages and answer with JSON only."),
        ChatMessage::user(emotion_analysis_prompt(text)),
    ];
    match upstream.complete(&messages).await {
        Ok(answer) => {
            if let Some(state) = parse_emotion_reply(&answer.text) {
                return Some(state);
            }
            tracing::debug!("emotion reply was not json, using keywords");
        }
        Err(e) => tracing::debug!(error = %e, "emotion analysis failed, using keywords"),
    }
    detect_emotion(text, EmotionMode::Keywords)
}

/// Update the in-memory ring, persisted memory, and the profile
///
/// Runs under the conversation lock. Fact extraction, when due, happens
/// before the profile write so the profile changes once per turn.
async fn remember(
    shared: &Shared,
    conversation: &Conversation,
    bot: &BotConfig,
    user: &str,
    reply: &str,
    emotion: Option<&EmotionState>,
) {
    let rounds = if bot.context_rounds == 0 {
        UNCAPPED_RING_ROUNDS
    } else {
        bot.context_rounds
    };
    conversation.push_exchange(ChatMessage::user(user), ChatMessage::assistant(reply), rounds);

    if let Err(e) = shared
        .store
        .record_exchange(conversation.id(), user, reply, bot.memory_ttl())
    {
        tracing::warn!(conversation = %conversation.id(), error = %e, "memory write failed");
    }

    if !bot.profile_enabled {
        return;
    }
    let profiles = shared.store.profiles();
    let current = match profiles.get(conversation.id()) {
        Ok(profile) => profile.unwrap_or_else(|| UserProfile::new(conversation.id())),
        Err(e) => {
            tracing::warn!(conversation = %conversation.id(), error = %e, "profile read failed");
            return;
        }
    };

    let due = bot.profile_update_every > 0 && (current.message_count + 1) % bot.profile_update_every == 0;
    let extraction = if due {
        extract_facts(&shared.upstream, &current, user, reply).await
    } else {
        None
    };

    let updated = profiles.update(conversation.id(), |p| {
        p.message_count += 1;
        if let Some(emotion) = emotion {
            p.last_emotion = Some(emotion.label.as_str().to_string());
        }
        if let Some(extraction) = extraction {
            merge_extraction(p, extraction, bot.max_profile_facts);
        }
    });
    if let Err(e) = updated {
        tracing::warn!(conversation = %conversation.id(), error = %e, "profile update failed");
    }
}

/// Facts, relationship, and traits extracted from one exchange
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FactExtraction {
    #[serde(default)]
    pub new_facts: Vec<String>,
    #[serde(default)]
    pub relationship_hint: Option<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
}

impl FactExtraction {
    /// Parse the JSON object in a model reply, tolerating surrounding text
    #[must_use]
    pub fn parse(reply: &str) -> Option<Self> {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        if end < start {
            return None;
        }
        let mut parsed: Self = serde_json::from_str(&reply[start..=end]).ok()?;

        parsed.new_facts = clean(parsed.new_facts);
        parsed.personality_traits = clean(parsed.personality_traits);
        parsed.relationship_hint = parsed
            .relationship_hint
            .map(|r| r.trim().to_lowercase())
            .filter(|r| RELATIONSHIPS.contains(&r.as_str()));
        Some(parsed)
    }
}

fn clean(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Prompt asking the model for new facts about the other party
#[must_use]
pub fn fact_extraction_prompt(user: &str, reply: &str, known: &[String]) -> String {
    let known = if known.is_empty() {
        "(none)".to_string()
    } else {
        known.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n")
    };
    format!(
        "Extract important personal facts the user revealed in this exchange (birthday, job, preferences, plans).\n\n\
         User: \"{user}\"\nAssistant: \"{reply}\"\n\nKnown facts:\n{known}\n\n\
         Answer with JSON only:\n\
         {{\"new_facts\": [\"...\"], \"relationship_hint\": \"friend|close_friend|family|colleague|stranger|null\", \"personality_traits\": [\"...\"]}}\n\
         Use empty lists when nothing new was revealed."
    )
}

/// Ask the model for new facts about the other party
async fn extract_facts(
    upstream: &UpstreamClient,
    profile: &UserProfile,
    user: &str,
    reply: &str,
) -> Option<FactExtraction> {
    let known: Vec<String> = profile.facts.iter().map(|f| f.text.clone()).collect();
    let messages = [
        ChatMessage::system("You extract facts from conversations and answer with JSON only."),
        ChatMessage::user(fact_extraction_prompt(user, reply, &known)),
    ];

    match upstream.complete(&messages).await {
        Ok(answer) => {
            let parsed = FactExtraction::parse(&answer.text);
            if parsed.is_none() {
                tracing::debug!(conversation = %profile.conversation_id, "fact extraction reply was not json");
            }
            parsed
        }
        Err(e) => {
            tracing::debug!(conversation = %profile.conversation_id, error = %e, "fact extraction failed");
            None
        }
    }
}

/// Fold an extraction into a profile, keeping at most `max_facts` facts
pub(crate) fn merge_extraction(profile: &mut UserProfile, extraction: FactExtraction, max_facts: usize) {
    let FactExtraction {
        new_facts,
        relationship_hint,
        personality_traits,
    } = extraction;

    for fact in new_facts {
        if !profile.facts.iter().any(|f| f.text == fact) {
            profile.facts.push(ProfileFact {
                text: fact,
                source_ts: Utc::now(),
            });
        }
    }
    if max_facts > 0 && profile.facts.len() > max_facts {
        let excess = profile.facts.len() - max_facts;
        profile.facts.drain(..excess);
    }
    if let Some(relationship) = relationship_hint {
        profile.relationship = relationship;
    }
    if !personality_traits.is_empty() {
        let mut traits: Vec<String> = profile
            .personality
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        for t in personality_traits {
            if !traits.contains(&t) {
                traits.push(t);
            }
        }
        profile.personality = traits.join(", ");
    }
}
