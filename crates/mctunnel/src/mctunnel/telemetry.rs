use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub host: String,
    pub player: String,
    pub backend: String,
    pub via: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

/// Keeps a session listed for as long as the guard lives.
pub struct ActiveSession {
    registry: SharedSessions,
    id: String,
}

impl ActiveSession {
    pub fn register(registry: &SharedSessions, info: SessionInfo) -> Self {
        let id = info.id.clone();
        registry.add(info);
        Self {
            registry: registry.clone(),
            id,
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, at: u64) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            client: "127.0.0.1:50000".into(),
            host: "play.example.net".into(),
            player: "Alice".into(),
            backend: "127.0.0.1:25566".into(),
            via: "direct".into(),
            started_at_unix_ms: at,
        }
    }

    #[test]
    fn guard_removes_on_drop() {
        let reg: SharedSessions = Arc::new(SessionRegistry::new());
        let a = ActiveSession::register(&reg, info("s-a", 2));
        {
            let _b = ActiveSession::register(&reg, info("s-b", 1));
            let ids: Vec<String> = reg.snapshot().into_iter().map(|s| s.id).collect();
            assert_eq!(ids, ["s-b", "s-a"]);
        }
        assert_eq!(reg.len(), 1);
        drop(a);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
    }
}
