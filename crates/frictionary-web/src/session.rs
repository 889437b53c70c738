//! Cookie-scoped seen sets.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use axum::http::{header, HeaderMap, HeaderValue};
use frictionary_core::SeenSet;
use lru::LruCache;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "frictionary_sid";

/// Seen sets of recent sessions; the least recently used session is dropped once
/// `capacity` sessions are held.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<LruCache<String, SeenSet>>,
}

impl SessionStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, SeenSet>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seen(&self, session_id: &str) -> SeenSet {
        self.lock().get(session_id).cloned().unwrap_or_default()
    }

    pub fn mark_seen(&self, session_id: &str, ids: &[String]) {
        let mut sessions = self.lock();
        sessions
            .get_or_insert_mut(session_id.to_string(), SeenSet::new)
            .extend(ids.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(100_000).unwrap_or(NonZeroUsize::MIN))
    }
}

/// The session id carried by the request cookie, if it is a well-formed one.
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
        .map(|id| id.to_string())
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn session_cookie(session_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .ok()
}
