//! Execution-time records created while a candidate program runs.
//!
//! Meetings own ordered chats; agents participate in many meetings. The chat
//! history of an agent is derived from these records on demand.

use crate::ids::{AgentId, ChatId, MeetingId, SystemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker name whose chats are presented with the `system` role.
pub const SYSTEM_SPEAKER: &str = "system";

/// Chat role as understood by the LLM gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message sent to the chat gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Collaboration context inside one candidate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    /// Candidate whose execution created this meeting.
    pub system_id: SystemId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Execution-time actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub system_id: SystemId,
    pub name: String,
    pub temperature: f64,
    pub created_at: DateTime<Utc>,
}

/// Something said by an agent inside a meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub meeting_id: MeetingId,
    pub speaker_id: AgentId,
    /// Denormalised speaker name so history views need no extra lookup.
    pub speaker_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// Role of this chat from the point of view of `viewer`.
    pub fn role_for(&self, viewer: AgentId) -> Role {
        if self.speaker_id == viewer {
            Role::Assistant
        } else if self.speaker_name == SYSTEM_SPEAKER {
            Role::System
        } else {
            Role::User
        }
    }
}

/// Merge chats from all meetings of `viewer` into its ordered history.
///
/// Chats are sorted by timestamp (ties broken by id so the order is total).
/// Messages spoken by other agents are prefixed with the speaker's name.
pub fn chat_history(viewer: AgentId, chats: impl IntoIterator<Item = Chat>) -> Vec<ChatMessage> {
    let mut chats: Vec<Chat> = chats.into_iter().collect();
    chats.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    chats.dedup_by(|a, b| a.id == b.id);

    chats
        .into_iter()
        .map(|chat| {
            let role = chat.role_for(viewer);
            let content = match role {
                Role::User => format!("{}: {}", chat.speaker_name, chat.content),
                Role::System | Role::Assistant => chat.content,
            };
            ChatMessage { role, content }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn chat(meeting: MeetingId, speaker: AgentId, name: &str, content: &str, at: i64) -> Chat {
        Chat {
            id: ChatId::generate(),
            meeting_id: meeting,
            speaker_id: speaker,
            speaker_name: name.to_string(),
            content: content.to_string(),
            created_at: Utc.timestamp_opt(0, 0).unwrap() + Duration::microseconds(at),
        }
    }

    #[test]
    fn roles_follow_speaker() {
        let me = AgentId::generate();
        let other = AgentId::generate();
        let system = AgentId::generate();
        let meeting = MeetingId::generate();

        let history = chat_history(
            me,
            vec![
                chat(meeting, other, "Critic", "looks wrong", 3),
                chat(meeting, system, SYSTEM_SPEAKER, "solve it", 1),
                chat(meeting, me, "Solver", "answer is 4", 2),
            ],
        );

        assert_eq!(history.len(), 3);
        assert_eq!(history[0], ChatMessage::system("solve it"));
        assert_eq!(history[1], ChatMessage::assistant("answer is 4"));
        assert_eq!(history[2], ChatMessage::user("Critic: looks wrong"));
    }

    #[test]
    fn history_merges_meetings_by_timestamp() {
        let me = AgentId::generate();
        let other = AgentId::generate();
        let first = MeetingId::generate();
        let second = MeetingId::generate();

        let history = chat_history(
            me,
            vec![
                chat(first, other, "A", "one", 1),
                chat(first, other, "A", "three", 3),
                chat(second, other, "B", "two", 2),
            ],
        );
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["A: one", "B: two", "A: three"]);
    }

    proptest! {
        #[test]
        fn history_is_sorted_merge(times in prop::collection::vec(0i64..1_000_000, 0..40)) {
            let me = AgentId::generate();
            let other = AgentId::generate();
            let meetings = [MeetingId::generate(), MeetingId::generate(), MeetingId::generate()];
            let chats: Vec<Chat> = times
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let speaker = if i % 2 == 0 { me } else { other };
                    chat(meetings[i % 3], speaker, "x", &t.to_string(), *t)
                })
                .collect();

            let history = chat_history(me, chats);
            prop_assert_eq!(history.len(), times.len());

            let mut sorted = times.clone();
            sorted.sort();
            let observed: Vec<i64> = history
                .iter()
                .map(|m| {
                    let raw = m.content.strip_prefix("x: ").unwrap_or(&m.content);
                    raw.parse::<i64>().unwrap()
                })
                .collect();
            prop_assert_eq!(observed, sorted);
        }
    }
}
