use serde_json::Value;
use tracing::warn;

/// Offset the platform adds to a group chat's id to form its peer id,
/// distinguishing chat conversations from plain user ids.
pub const CHAT_PEER_OFFSET: i64 = 2_000_000_000;

/// Long Poll event code for a new message.
pub const MESSAGE: i64 = 4;

/// Flag bit set on outbound (self-sent) messages.
pub const FLAG_OUTBOX: i64 = 2;

/// One platform event, parsed once at the boundary from the positional
/// array the long-poll endpoint returns:
/// `[event_code, message_id, flags, peer_id, timestamp, text, extra,
/// attachments]`. Positions past the event code are optional for some
/// event kinds and default to zero/empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub event_code: i64,
    pub message_id: i64,
    pub flags: i64,
    pub peer_id: i64,
    pub timestamp: i64,
    pub text: String,
    /// Service-info payload (membership changes and the like).
    pub extra: Value,
    /// Attachment summary.
    pub attachments: Value,
}

impl Update {
    /// Parse one raw positional update. Returns `None` when the value is
    /// not an array or carries no event code.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let items = raw.as_array()?;
        let event_code = items.first()?.as_i64()?;
        let int = |i: usize| items.get(i).and_then(Value::as_i64).unwrap_or(0);
        let text = items
            .get(5)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(Self {
            event_code,
            message_id: int(1),
            flags: int(2),
            peer_id: int(3),
            timestamp: int(4),
            text,
            extra: items.get(6).cloned().unwrap_or(Value::Null),
            attachments: items.get(7).cloned().unwrap_or(Value::Null),
        })
    }

    /// Whether the message was sent by the bot itself.
    pub fn is_outbound(&self) -> bool {
        self.flags & FLAG_OUTBOX != 0
    }

    /// Chat id for chat-scoped events; `None` for direct peers.
    pub fn chat_id(&self) -> Option<i64> {
        (self.peer_id >= CHAT_PEER_OFFSET).then(|| self.peer_id - CHAT_PEER_OFFSET)
    }

    /// Membership change carried in this update's service payload, if any.
    pub fn service_action(&self) -> Option<ServiceAction> {
        ServiceAction::from_extra(&self.extra)
    }
}

/// Classified membership-change marker from a message update's `extra`
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    MemberAdded { user_id: i64 },
    MemberRemoved { user_id: i64 },
    InvitedByLink { user_id: i64 },
}

impl ServiceAction {
    /// Classify a service payload. Malformed payloads (a `source_act`
    /// without a usable acting user) are logged and yield `None` so the
    /// rest of the update's processing continues.
    pub fn from_extra(extra: &Value) -> Option<Self> {
        let act = extra.get("source_act")?.as_str()?;
        let Some(user_id) = extra.get("source_mid").and_then(parse_user_id) else {
            warn!("service message {:?} is missing a usable source_mid", act);
            return None;
        };

        match act {
            "chat_invite_user" => Some(Self::MemberAdded { user_id }),
            "chat_kick_user" => Some(Self::MemberRemoved { user_id }),
            "chat_invite_user_by_link" => Some(Self::InvitedByLink { user_id }),
            other => {
                warn!("unrecognized service action {:?}", other);
                None
            }
        }
    }
}

// source_mid arrives as a number or a numeric string depending on the
// long-poll mode.
fn parse_user_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
