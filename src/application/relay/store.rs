//! Client-session storage behind a small store interface.
//!
//! Memory-backed today; the trait is the seam where a shared or persistent
//! store would plug in without touching the protocol logic.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::session::{ClientSession, SessionId};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, sid: &SessionId) -> Option<ClientSession>;
    async fn put(&self, sid: SessionId, session: ClientSession);
    async fn remove(&self, sid: &SessionId);
    async fn len(&self) -> usize;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, ClientSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, sid: &SessionId) -> Option<ClientSession> {
        self.sessions.get(sid).map(|entry| entry.clone())
    }

    async fn put(&self, sid: SessionId, session: ClientSession) {
        self.sessions.insert(sid, session);
    }

    async fn remove(&self, sid: &SessionId) {
        self.sessions.remove(sid);
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let store = MemorySessionStore::new();
        let sid = SessionId::mint();

        assert!(store.get(&sid).await.is_none());
        assert_eq!(store.len().await, 0);

        store.put(sid.clone(), ClientSession::new()).await;
        assert!(store.get(&sid).await.is_some());
        assert_eq!(store.len().await, 1);

        store.remove(&sid).await;
        assert!(store.get(&sid).await.is_none());
    }
}
