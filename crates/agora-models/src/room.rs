use crate::call::CallId;
use crate::UserId;

/// A named broadcast channel. Each category renders to a distinct key
/// prefix, so two categories can never collide on a literal room key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomName {
    /// A feed channel, e.g. "following" or "discover".
    Feed(String),
    /// Live activity on a single post (comment counts, reactions).
    Post(i64),
    /// A user's personal channel; every connection of that user joins it.
    User(UserId),
    /// The trending-topics channel.
    Trending,
    /// Per-call channel for call lifecycle events.
    Call(CallId),
}

impl RoomName {
    /// Canonical string key for this room.
    pub fn key(&self) -> String {
        match self {
            RoomName::Feed(kind) => format!("feed:{kind}"),
            RoomName::Post(id) => format!("post:{id}"),
            RoomName::User(id) => format!("user:{id}"),
            RoomName::Trending => "trending".to_string(),
            RoomName::Call(id) => format!("call:{id}"),
        }
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}
