use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{ChatEvent, ChatId, UserChatKey, UserId};

/// The slice of member info the clients attach to a join notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub is_bot: bool,
    pub first_name: String,
}

/// Raw notification shapes from the bot-API style client.
#[derive(Debug, Clone, PartialEq)]
pub enum BotApiUpdate {
    Message {
        chat_id: ChatId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        text: String,
        is_edited: bool,
    },
    MembersJoined {
        chat_id: ChatId,
        timestamp: DateTime<Utc>,
        members: Vec<MemberInfo>,
    },
    MemberLeft {
        chat_id: ChatId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
}

/// Raw notification shapes from the MTProto style client.
#[derive(Debug, Clone, PartialEq)]
pub enum MtprotoUpdate {
    NewMessage {
        chat_id: ChatId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        text: String,
    },
    ChatAction {
        chat_id: ChatId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        action: ChatAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    Joined { is_bot: bool },
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawUpdate {
    BotApi(BotApiUpdate),
    Mtproto(MtprotoUpdate),
}

/// Maps both client vocabularies onto the state machine's. Joins by bot
/// accounts are dropped here so the state machine never sees them; a
/// bot-API join notification can carry several members at once.
pub fn normalize(update: RawUpdate) -> Vec<ChatEvent> {
    match update {
        RawUpdate::BotApi(BotApiUpdate::Message {
            chat_id,
            user_id,
            timestamp,
            text,
            is_edited: _,
        }) => vec![ChatEvent::Message {
            key: UserChatKey { chat_id, user_id },
            timestamp,
            text,
        }],
        RawUpdate::BotApi(BotApiUpdate::MembersJoined {
            chat_id,
            timestamp,
            members,
        }) => members
            .into_iter()
            .filter(|m| !m.is_bot)
            .map(|m| {
                debug!("member {} ({}) joined chat {}", m.user_id, m.first_name, chat_id);
                ChatEvent::Join {
                    key: UserChatKey {
                        chat_id,
                        user_id: m.user_id,
                    },
                    timestamp,
                }
            })
            .collect(),
        RawUpdate::BotApi(BotApiUpdate::MemberLeft {
            chat_id,
            user_id,
            timestamp,
        }) => vec![ChatEvent::Leave {
            key: UserChatKey { chat_id, user_id },
            timestamp,
        }],
        RawUpdate::Mtproto(MtprotoUpdate::NewMessage {
            chat_id,
            user_id,
            timestamp,
            text,
        }) => vec![ChatEvent::Message {
            key: UserChatKey { chat_id, user_id },
            timestamp,
            text,
        }],
        RawUpdate::Mtproto(MtprotoUpdate::ChatAction {
            chat_id,
            user_id,
            timestamp,
            action,
        }) => {
            let key = UserChatKey { chat_id, user_id };
            match action {
                ChatAction::Joined { is_bot: true } => vec![],
                ChatAction::Joined { is_bot: false } => {
                    vec![ChatEvent::Join { key, timestamp }]
                }
                ChatAction::Left => vec![ChatEvent::Leave { key, timestamp }],
            }
        }
    }
}

/// Capability seam over the two network clients. The core only ever needs
/// event delivery (via the inbound channel) and member removal.
#[async_trait]
pub trait ChatNetwork: Send + Sync {
    fn name(&self) -> &str;
    fn can_remove_members(&self) -> bool;
    async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
}

pub struct Dispatcher {
    adapters: Vec<Arc<dyn ChatNetwork>>,
}

impl Dispatcher {
    pub fn new(adapters: Vec<Arc<dyn ChatNetwork>>) -> Self {
        Dispatcher { adapters }
    }

    /// Routes the removal to whichever adapter advertises the privilege,
    /// picked at call time.
    pub async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        let Some(adapter) = self.adapters.iter().find(|a| a.can_remove_members()) else {
            warn!(
                "no connected client can remove members (user {} in chat {})",
                user_id, chat_id
            );
            return Err(Error::action("no connected client can remove members"));
        };
        debug!(
            "removing user {} from chat {} via {}",
            user_id,
            chat_id,
            adapter.name()
        );
        adapter.remove_member(chat_id, user_id).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeNetwork;
    use super::*;

    fn key(chat: i64, user: u64) -> UserChatKey {
        UserChatKey {
            chat_id: ChatId(chat),
            user_id: UserId(user),
        }
    }

    #[test]
    fn bot_api_join_yields_one_event_per_human_member() {
        let now = Utc::now();
        let events = normalize(RawUpdate::BotApi(BotApiUpdate::MembersJoined {
            chat_id: ChatId(-1),
            timestamp: now,
            members: vec![
                MemberInfo {
                    user_id: UserId(1),
                    is_bot: false,
                    first_name: "Ada".into(),
                },
                MemberInfo {
                    user_id: UserId(2),
                    is_bot: true,
                    first_name: "SpamBot".into(),
                },
                MemberInfo {
                    user_id: UserId(3),
                    is_bot: false,
                    first_name: "Grace".into(),
                },
            ],
        }));
        assert_eq!(
            events,
            vec![
                ChatEvent::Join {
                    key: key(-1, 1),
                    timestamp: now
                },
                ChatEvent::Join {
                    key: key(-1, 3),
                    timestamp: now
                },
            ]
        );
    }

    #[test]
    fn both_message_families_normalize_identically() {
        let now = Utc::now();
        let from_bot_api = normalize(RawUpdate::BotApi(BotApiUpdate::Message {
            chat_id: ChatId(-1),
            user_id: UserId(1),
            timestamp: now,
            text: "#ichbin Ada".into(),
            is_edited: false,
        }));
        let from_mtproto = normalize(RawUpdate::Mtproto(MtprotoUpdate::NewMessage {
            chat_id: ChatId(-1),
            user_id: UserId(1),
            timestamp: now,
            text: "#ichbin Ada".into(),
        }));
        assert_eq!(from_bot_api, from_mtproto);
    }

    #[test]
    fn leave_notifications_normalize_from_both_families() {
        let now = Utc::now();
        let bot_api = normalize(RawUpdate::BotApi(BotApiUpdate::MemberLeft {
            chat_id: ChatId(-1),
            user_id: UserId(9),
            timestamp: now,
        }));
        let mtproto = normalize(RawUpdate::Mtproto(MtprotoUpdate::ChatAction {
            chat_id: ChatId(-1),
            user_id: UserId(9),
            timestamp: now,
            action: ChatAction::Left,
        }));
        assert_eq!(bot_api, mtproto);
        assert_eq!(
            bot_api,
            vec![ChatEvent::Leave {
                key: key(-1, 9),
                timestamp: now
            }]
        );
    }

    #[test]
    fn mtproto_bot_join_is_dropped() {
        let events = normalize(RawUpdate::Mtproto(MtprotoUpdate::ChatAction {
            chat_id: ChatId(-1),
            user_id: UserId(5),
            timestamp: Utc::now(),
            action: ChatAction::Joined { is_bot: true },
        }));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn removal_routes_to_the_privileged_adapter() {
        let passive = Arc::new(FakeNetwork::new("mtproto", false));
        let privileged = Arc::new(FakeNetwork::new("bot-api", true));
        let dispatcher = Dispatcher::new(vec![passive.clone(), privileged.clone()]);

        dispatcher
            .remove_member(ChatId(-1), UserId(7))
            .await
            .unwrap();
        assert!(passive.removals.lock().unwrap().is_empty());
        assert_eq!(*privileged.removals.lock().unwrap(), vec![key(-1, 7)]);
    }

    #[tokio::test]
    async fn removal_without_privileged_adapter_is_an_action_error() {
        let passive = Arc::new(FakeNetwork::new("mtproto", false));
        let dispatcher = Dispatcher::new(vec![passive]);
        let err = dispatcher
            .remove_member(ChatId(-1), UserId(7))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Action { .. }));
    }
}
