//! Client-side session records held by the relay.

use std::fmt::{Display, Formatter};

use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

/// Opaque, unguessable identifier bound to a relay client via cookie.
///
/// Two concatenated simple v4 UUIDs: 64 hex characters, well past the
/// 128-bit floor the cookie contract requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn mint() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    /// Accept a candidate cookie value. Only values this process could have
    /// minted are considered valid; anything else is treated as absent.
    pub fn parse(value: &str) -> Option<Self> {
        let valid =
            value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the relay remembers about one client.
///
/// `last_url` and `last_snapshot` only move forward on successful
/// operations, so a failed navigation leaves the last known-good page
/// servable.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Renderer session bound to this client, once one exists.
    pub render_session_id: Option<String>,
    pub last_url: Option<Url>,
    /// Raw inlined snapshot as returned by the renderer; transforms are
    /// applied per delivery, not at storage time.
    pub last_snapshot: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            render_session_id: None,
            last_url: None,
            last_snapshot: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
