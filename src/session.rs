//! Session manager (C4): cryptographic session IDs bound to exactly one
//! backend, with rotation on privilege change.

use crate::error::{ProxyError, ProxyResult};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

const SESSION_ID_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub server_id: String,
    pub created_at: u64,
    pub last_used_at: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Guarded, reader/writer-locked session store. Writes are O(1).
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new session bound to `server_id`.
    pub fn create_session(&self, server_id: &str) -> ProxyResult<String> {
        let id = generate_session_id();
        let record = SessionRecord {
            id: id.clone(),
            server_id: server_id.to_string(),
            created_at: now_unix(),
            last_used_at: now_unix(),
        };
        let mut guard = self
            .sessions
            .write()
            .map_err(|_| ProxyError::internal("session store poisoned"))?;
        guard.insert(id.clone(), record);
        Ok(id)
    }

    /// Validates that `id` exists and is bound to `server_id`.
    pub fn validate_session(&self, id: &str, server_id: &str) -> ProxyResult<()> {
        let guard = self
            .sessions
            .read()
            .map_err(|_| ProxyError::internal("session store poisoned"))?;
        match guard.get(id) {
            None => Err(ProxyError::SessionNotFound),
            Some(record) if record.server_id != server_id => Err(ProxyError::SessionBelongsToOther),
            Some(_) => Ok(()),
        }
    }

    /// Records activity on a session, bumping `last_used_at`.
    pub fn touch(&self, id: &str) -> ProxyResult<()> {
        let mut guard = self
            .sessions
            .write()
            .map_err(|_| ProxyError::internal("session store poisoned"))?;
        let record = guard.get_mut(id).ok_or(ProxyError::SessionNotFound)?;
        record.last_used_at = now_unix();
        Ok(())
    }

    /// Validates `old_id`, invalidates it, and mints a fresh session for the
    /// same backend. The caller is responsible for flagging the new session
    /// as post-privilege-change in the audit trail.
    pub fn rotate_session(&self, old_id: &str, server_id: &str) -> ProxyResult<String> {
        self.validate_session(old_id, server_id)?;
        let new_id = generate_session_id();
        let record = SessionRecord {
            id: new_id.clone(),
            server_id: server_id.to_string(),
            created_at: now_unix(),
            last_used_at: now_unix(),
        };
        let mut guard = self
            .sessions
            .write()
            .map_err(|_| ProxyError::internal("session store poisoned"))?;
        guard.remove(old_id);
        guard.insert(new_id.clone(), record);
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_session_validates_for_its_own_backend() {
        let mgr = SessionManager::new();
        let id = mgr.create_session("demo").unwrap();
        assert!(mgr.validate_session(&id, "demo").is_ok());
    }

    #[test]
    fn session_does_not_validate_for_another_backend() {
        let mgr = SessionManager::new();
        let id = mgr.create_session("demo").unwrap();
        let err = mgr.validate_session(&id, "other").unwrap_err();
        assert!(matches!(err, ProxyError::SessionBelongsToOther));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let mgr = SessionManager::new();
        let err = mgr.validate_session("deadbeef", "demo").unwrap_err();
        assert!(matches!(err, ProxyError::SessionNotFound));
    }

    #[test]
    fn session_id_is_at_least_24_bytes_hex() {
        let mgr = SessionManager::new();
        let id = mgr.create_session("demo").unwrap();
        assert!(id.len() >= 48); // 24 bytes hex-encoded would be 48 chars; we use 32 bytes = 64 chars
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rotation_invalidates_old_id_and_keeps_backend_binding() {
        let mgr = SessionManager::new();
        let old = mgr.create_session("demo").unwrap();
        let new = mgr.rotate_session(&old, "demo").unwrap();
        assert_ne!(old, new);
        assert!(mgr.validate_session(&old, "demo").is_err());
        assert!(mgr.validate_session(&new, "demo").is_ok());
    }
}
