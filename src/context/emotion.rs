//! Emotion detection from keywords or a model answer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EmotionMode;

/// Detected emotion label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Anxious,
    Excited,
    Tired,
    Confused,
    Neutral,
}

impl Emotion {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Anxious => "anxious",
            Self::Excited => "excited",
            Self::Tired => "tired",
            Self::Confused => "confused",
            Self::Neutral => "neutral",
        }
    }

    /// Suggested reply tone
    #[must_use]
    pub const fn tone_hint(self) -> &'static str {
        match self {
            Self::Happy => "match the light mood and share the joy",
            Self::Sad => "be warm and understanding, avoid lecturing",
            Self::Angry => "acknowledge the feeling first and de-escalate",
            Self::Anxious => "stay calm and reassuring, offer concrete help",
            Self::Excited => "respond with energy and share the anticipation",
            Self::Tired => "be gentle and considerate, add no pressure",
            Self::Confused => "explain patiently and clearly",
            Self::Neutral => "keep a natural tone",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

const ALL: [Emotion; 8] = [
    Emotion::Happy,
    Emotion::Sad,
    Emotion::Angry,
    Emotion::Anxious,
    Emotion::Excited,
    Emotion::Tired,
    Emotion::Confused,
    Emotion::Neutral,
];

const KEYWORDS: &[(Emotion, &[&str])] = &[
    (
        Emotion::Happy,
        &["haha", "lol", "great", "glad", "thanks", "thank you", "love it", "nice", "awesome", "开心", "哈哈", "太好了", "谢谢", "😄", "😊", "👍"],
    ),
    (
        Emotion::Sad,
        &["sad", "upset", "miss you", "disappointed", "heartbroken", "crying", "难过", "伤心", "呜呜", "😢", "😭", "💔"],
    ),
    (
        Emotion::Angry,
        &["angry", "annoyed", "furious", "ridiculous", "wtf", "hate", "生气", "烦死了", "气死", "😡", "🤬"],
    ),
    (
        Emotion::Anxious,
        &["worried", "nervous", "anxious", "what do i do", "help", "deadline", "urgent", "怎么办", "着急", "焦虑", "😰", "😱"],
    ),
    (
        Emotion::Excited,
        &["can't wait", "excited", "finally", "let's go", "woohoo", "激动", "期待", "终于", "🤩", "🥳", "🚀"],
    ),
    (
        Emotion::Tired,
        &["tired", "exhausted", "sleepy", "overtime", "burned out", "累", "困", "加班", "😴", "🥱"],
    ),
    (
        Emotion::Confused,
        &["confused", "what?", "why", "don't understand", "huh", "???", "不懂", "为什么", "啥", "🤔"],
    ),
];

/// Result of emotion detection for one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionState {
    pub label: Emotion,
    pub confidence: f32,
    pub mode: EmotionMode,
    pub detected_at: DateTime<Utc>,
}

impl EmotionState {
    /// Short descriptor injected into the system prompt
    #[must_use]
    pub fn descriptor(&self) -> String {
        format!(
            "[Current Emotion] {} (confidence {:.2}): {}",
            self.label.as_str(),
            self.confidence,
            self.label.tone_hint()
        )
    }
}

/// Detect the dominant emotion in `text` by keyword
///
/// The label with the most keyword hits wins; ties go to the label listed
/// first. Returns `None` when detection is off. Any other mode is served by
/// keywords here and recorded as such.
#[must_use]
pub fn detect_emotion(text: &str, mode: EmotionMode) -> Option<EmotionState> {
    if mode == EmotionMode::Off {
        return None;
    }
    let lower = text.to_lowercase();

    let mut best = (Emotion::Neutral, 0usize);
    for (emotion, words) in KEYWORDS {
        let hits = words.iter().filter(|w| lower.contains(*w)).count();
        if hits > best.1 {
            best = (*emotion, hits);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let confidence = if best.1 == 0 {
        0.5
    } else {
        0.15f32.mul_add(best.1 as f32, 0.5).min(0.9)
    };

    Some(EmotionState {
        label: best.0,
        confidence,
        mode: EmotionMode::Keywords,
        detected_at: Utc::now(),
    })
}

/// Prompt asking the model to classify a message
#[must_use]
pub fn emotion_analysis_prompt(message: &str) -> String {
    let labels: Vec<&str> = ALL.iter().map(|e| e.as_str()).collect();
    format!(
        "Analyse the emotional state of this chat message.\n\n\
         Message: \"{message}\"\n\n\
         Answer with JSON only:\n\
         {{\"emotion\": \"{}\", \"confidence\": 0.0-1.0}}",
        labels.join("/")
    )
}

#[derive(Deserialize)]
struct EmotionAnswer {
    #[serde(default)]
    emotion: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse the JSON object in a model answer
///
/// Unknown labels become neutral and confidence is clamped to `0..=1`
/// (0.7 when missing). Returns `None` when no JSON object can be read.
#[must_use]
pub fn parse_emotion_reply(reply: &str) -> Option<EmotionState> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let answer: EmotionAnswer = serde_json::from_str(&reply[start..=end]).ok()?;

    let label = Emotion::parse(answer.emotion.trim().to_lowercase().as_str()).unwrap_or(Emotion::Neutral);
    let confidence = answer
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(0.7)
        .clamp(0.0, 1.0);

    Some(EmotionState {
        label,
        confidence,
        mode: EmotionMode::Ai,
        detected_at: Utc::now(),
    })
}
