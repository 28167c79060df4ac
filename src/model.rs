use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChatId(pub i64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The same user in two different chats is tracked as two independent cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserChatKey {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

impl fmt::Display for UserChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user {} in chat {}", self.user_id, self.chat_id)
    }
}

/// Normalized inbound vocabulary consumed by the verification state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Join {
        key: UserChatKey,
        timestamp: DateTime<Utc>,
    },
    Message {
        key: UserChatKey,
        timestamp: DateTime<Utc>,
        text: String,
    },
    Leave {
        key: UserChatKey,
        timestamp: DateTime<Utc>,
    },
}
