//! Message history normalization
//!
//! Inbound histories arrive in heterogeneous shapes (string content,
//! part-list content, stray system turns, consecutive same-role turns).
//! The adapter flattens them into the canonical user/assistant sequence the
//! backends consume, and filters conversational dead-ends: a user/assistant
//! pair where the assistant declined or failed to satisfy the request.
//! Re-sending such pairs makes the agent re-litigate stale requests.
//!
//! Dead-end detection is free-text matching over assistant output and is a
//! heuristic: it catches common refusal phrasings, not every failure. The
//! final exchange is never filtered, so the turn under discussion always
//! survives.

use crate::backends::BackendKind;
use crate::brain::{ChatTurn, Role};

/// Refusal phrasings that mark an assistant turn as a dead-end reply.
/// Matched case-insensitively within the opening of the turn.
const DEAD_END_MARKERS: &[&str] = &[
    "i can't",
    "i cannot",
    "i couldn't",
    "i could not",
    "i'm unable to",
    "i am unable to",
    "i'm not able to",
    "i am not able to",
    "i wasn't able to",
    "i was not able to",
    "i'm sorry, but",
    "i don't have the ability",
    "i do not have the ability",
    "i don't have access to",
    "i do not have access to",
];

/// Refusals appear in the opening sentences of a reply; scanning further
/// produces false positives on answers that merely quote a refusal.
const DEAD_END_SCAN_CHARS: usize = 200;

/// One flattened turn in the canonical history (user/assistant only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTurn {
    pub role: Role,
    pub content: String,
}

/// Output of the normalization pipeline
#[derive(Debug, Clone)]
pub struct PreparedHistory {
    turns: Vec<NormalizedTurn>,
    /// Inbound system-role content, hoisted out of the history. The
    /// orchestrator appends it to the cached system prompt.
    system_fragments: Vec<String>,
    dropped_dead_ends: usize,
}

impl PreparedHistory {
    pub fn turns(&self) -> &[NormalizedTurn] {
        &self.turns
    }

    pub fn system_fragments(&self) -> &[String] {
        &self.system_fragments
    }

    pub fn dropped_dead_ends(&self) -> usize {
        self.dropped_dead_ends
    }
}

/// Converts inbound histories into the canonical form each backend needs
#[derive(Debug, Clone)]
pub struct MessageAdapter {
    /// History tail length handed to the direct backend; the agent backend
    /// receives the full history.
    direct_history_limit: usize,
}

impl Default for MessageAdapter {
    fn default() -> Self {
        Self {
            direct_history_limit: 12,
        }
    }
}

impl MessageAdapter {
    pub fn new(direct_history_limit: usize) -> Self {
        Self {
            direct_history_limit: direct_history_limit.max(1),
        }
    }

    /// Run the full pipeline: flatten content, hoist system turns, coalesce
    /// consecutive same-role turns, drop dead-end pairs.
    pub fn prepare(&self, turns: &[ChatTurn]) -> PreparedHistory {
        let mut system_fragments = Vec::new();
        let mut normalized: Vec<NormalizedTurn> = Vec::with_capacity(turns.len());

        for turn in turns {
            let content = turn.content.flattened();
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            if turn.role == Role::System {
                system_fragments.push(content.to_string());
                continue;
            }
            match normalized.last_mut() {
                Some(last) if last.role == turn.role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(content);
                }
                _ => normalized.push(NormalizedTurn {
                    role: turn.role,
                    content: content.to_string(),
                }),
            }
        }

        let (turns, dropped_dead_ends) = filter_dead_ends(normalized);

        if dropped_dead_ends > 0 {
            tracing::debug!(
                dropped_pairs = dropped_dead_ends,
                "Filtered dead-end exchanges from history"
            );
        }

        PreparedHistory {
            turns,
            system_fragments,
            dropped_dead_ends,
        }
    }

    /// Shape the prepared history for a backend. The direct backend gets a
    /// bounded tail to keep its latency profile; the agent backend gets the
    /// full history for tool-context continuity.
    pub fn for_backend<'a>(
        &self,
        kind: BackendKind,
        prepared: &'a PreparedHistory,
    ) -> &'a [NormalizedTurn] {
        match kind {
            BackendKind::Agent => prepared.turns(),
            BackendKind::Direct => {
                let turns = prepared.turns();
                let start = turns.len().saturating_sub(self.direct_history_limit);
                &turns[start..]
            }
        }
    }
}

/// Drop user/assistant pairs whose assistant half is a dead-end reply.
///
/// The final exchange is exempt: whatever the assistant last said is the
/// live context for the current request.
fn filter_dead_ends(turns: Vec<NormalizedTurn>) -> (Vec<NormalizedTurn>, usize) {
    let len = turns.len();
    let mut kept: Vec<NormalizedTurn> = Vec::with_capacity(len);
    let mut dropped = 0usize;
    let mut index = 0usize;

    while index < len {
        let is_candidate_pair = index + 1 < len
            && turns[index].role == Role::User
            && turns[index + 1].role == Role::Assistant
            && is_dead_end_reply(&turns[index + 1].content);
        // A pair touching the last two turns is the live exchange.
        let is_final_exchange = index + 2 >= len;

        if is_candidate_pair && !is_final_exchange {
            dropped += 1;
            index += 2;
        } else {
            kept.push(turns[index].clone());
            index += 1;
        }
    }

    (kept, dropped)
}

/// Whether an assistant reply reads as "couldn't fulfill the request"
pub(crate) fn is_dead_end_reply(content: &str) -> bool {
    let opening: String = content
        .chars()
        .take(DEAD_END_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();
    DEAD_END_MARKERS
        .iter()
        .any(|marker| opening.contains(marker))
}
