//! Canonical request model for the orchestration layer
//!
//! [`BrainRequest`] is the immutable value every downstream stage consumes.
//! It is constructed once per inbound call, validated at deserialization
//! time, and never mutated. Wire field names are camelCase, fixed by the
//! host web layer's contract.

pub mod classifier;
pub mod messages;
pub mod orchestrator;

use serde::{Deserialize, Serialize};

/// Upper bound on characters in a single turn's flattened content
pub const MAX_TURN_CHARS: usize = 100_000;

/// Upper bound on history length accepted from the wire
pub const MAX_TURNS: usize = 256;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A file or link attached to a turn; passed through to the engines untouched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Turn content as it arrives from heterogeneous clients
///
/// Older clients send a plain string; newer ones send a list of typed parts.
/// Both shapes are accepted and flattened on demand; non-text parts are
/// skipped during flattening (their payloads ride along as attachments).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TurnContent {
    /// Flatten to a single string, joining text parts with newlines
    pub fn flattened(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn char_len(&self) -> usize {
        match self {
            Self::Text(text) => text.chars().count(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_ref())
                .map(|t| t.chars().count())
                .sum(),
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: TurnContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(content.into()),
            attachments: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(content.into()),
            attachments: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: TurnContent::Text(content.into()),
            attachments: None,
        }
    }
}

/// The canonical, validated inbound request
///
/// Fields are private so a constructed value always satisfies the
/// invariants: at least one turn, bounded turn count, bounded per-turn
/// content, non-empty selected model.
#[derive(Debug, Clone, Serialize)]
pub struct BrainRequest {
    #[serde(rename = "messages")]
    turns: Vec<ChatTurn>,
    #[serde(rename = "selectedChatModel")]
    selected_model: String,
    #[serde(rename = "activeBitContextId", skip_serializing_if = "Option::is_none")]
    context_id: Option<String>,
    #[serde(
        rename = "currentActiveSpecialistId",
        skip_serializing_if = "Option::is_none"
    )]
    specialist_id: Option<String>,
    #[serde(rename = "userTimezone", skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
    #[serde(rename = "isFromGlobalPane")]
    from_global_pane: bool,
}

impl BrainRequest {
    /// Build a validated request
    ///
    /// # Errors
    ///
    /// Returns `BrainError::Validation` when the turn list is empty or over
    /// [`MAX_TURNS`], when any turn's content exceeds [`MAX_TURN_CHARS`]
    /// characters, or when the selected model is blank.
    pub fn new(
        turns: Vec<ChatTurn>,
        selected_model: impl Into<String>,
        context_id: Option<String>,
        specialist_id: Option<String>,
        timezone: Option<String>,
        from_global_pane: bool,
    ) -> crate::error::BrainResult<Self> {
        if turns.is_empty() {
            return Err(crate::error::BrainError::Validation(
                "messages must contain at least one turn".to_string(),
            ));
        }
        if turns.len() > MAX_TURNS {
            return Err(crate::error::BrainError::Validation(format!(
                "messages contains {} turns, exceeding the limit of {}",
                turns.len(),
                MAX_TURNS
            )));
        }
        for (index, turn) in turns.iter().enumerate() {
            let len = turn.content.char_len();
            if len > MAX_TURN_CHARS {
                return Err(crate::error::BrainError::Validation(format!(
                    "message {} has {} characters, exceeding the limit of {}",
                    index, len, MAX_TURN_CHARS
                )));
            }
        }
        let selected_model = selected_model.into();
        if selected_model.trim().is_empty() {
            return Err(crate::error::BrainError::Validation(
                "selectedChatModel must not be empty".to_string(),
            ));
        }

        Ok(Self {
            turns,
            selected_model,
            context_id,
            specialist_id,
            timezone,
            from_global_pane,
        })
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn selected_model(&self) -> &str {
        &self.selected_model
    }

    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    pub fn specialist_id(&self) -> Option<&str> {
        self.specialist_id.as_deref()
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn from_global_pane(&self) -> bool {
        self.from_global_pane
    }

    /// Flattened content of the most recent user turn, the classifier's
    /// primary input. `None` when the history carries no user turn.
    pub fn latest_user_utterance(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.flattened())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBrainRequest {
    messages: Vec<ChatTurn>,
    selected_chat_model: String,
    #[serde(default)]
    active_bit_context_id: Option<String>,
    #[serde(default)]
    current_active_specialist_id: Option<String>,
    #[serde(default)]
    user_timezone: Option<String>,
    #[serde(default)]
    is_from_global_pane: bool,
}

impl<'de> Deserialize<'de> for BrainRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawBrainRequest::deserialize(deserializer)?;
        BrainRequest::new(
            raw.messages,
            raw.selected_chat_model,
            raw.active_bit_context_id,
            raw.current_active_specialist_id,
            raw.user_timezone,
            raw.is_from_global_pane,
        )
        .map_err(serde::de::Error::custom)
    }
}

/// Stable identity used for experiment bucketing
///
/// First non-null of user id, session id, peer IP wins. Requests with none
/// of the three are outside any experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
}

impl RequestIdentity {
    pub fn new(
        user_id: Option<String>,
        session_id: Option<String>,
        ip_address: Option<String>,
    ) -> Self {
        Self {
            user_id,
            session_id,
            ip_address,
        }
    }

    /// The bucketing key, or `None` when no identifier is available
    pub fn bucket_key(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.session_id.as_deref())
            .or(self.ip_address.as_deref())
    }
}
