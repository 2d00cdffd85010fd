//! Session Context Store
//!
//! Small rolling summary per session id, used to give the next prompt a
//! short excerpt of prior turns. Bounded two ways: entries idle longer than
//! the TTL are reset on access and pruned by maintenance, and the LRU cap
//! evicts the least recently used session when full.
//!
//! Updates to one session are serialized through that session's own lock;
//! different sessions never contend beyond the brief map lookup.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub last_request: String,
    pub last_response: Option<String>,
    pub request_count: u64,
    pub total_processing_ms: u64,
    pub last_activity: DateTime<Utc>,
    /// Most recent successful turns, oldest first
    pub recent_turns: VecDeque<String>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            last_request: String::new(),
            last_response: None,
            request_count: 0,
            total_processing_ms: 0,
            last_activity: Utc::now(),
            recent_turns: VecDeque::new(),
        }
    }
}

struct SessionSlot {
    entry: SessionEntry,
    touched: Instant,
}

impl SessionSlot {
    fn fresh() -> Self {
        Self {
            entry: SessionEntry::new(),
            touched: Instant::now(),
        }
    }
}

type Slot = Arc<Mutex<SessionSlot>>;

pub struct SessionStore {
    slots: Mutex<LruCache<String, Slot>>,
    ttl: Duration,
    max_turns: usize,
    excerpt_chars: usize,
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

impl SessionStore {
    pub fn new(capacity: usize, ttl: Duration, max_turns: usize, excerpt_chars: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(cap)),
            ttl,
            max_turns,
            excerpt_chars,
        }
    }

    async fn slot(&self, session_id: &str, create: bool) -> Option<Slot> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(session_id) {
            return Some(Arc::clone(slot));
        }
        if !create {
            return None;
        }
        let slot = Arc::new(Mutex::new(SessionSlot::fresh()));
        slots.put(session_id.to_string(), Arc::clone(&slot));
        Some(slot)
    }

    /// Prior-turn excerpt for the next prompt; empty for unknown or idle sessions
    pub async fn recent_context(&self, session_id: &str) -> Vec<String> {
        let Some(slot) = self.slot(session_id, false).await else {
            return Vec::new();
        };
        let slot = slot.lock().await;
        if slot.touched.elapsed() >= self.ttl {
            return Vec::new();
        }
        slot.entry.recent_turns.iter().cloned().collect()
    }

    /// Fold one finished request into the session. `response` is `None` for
    /// failed requests: counters move but no turn is kept.
    pub async fn record_exchange(&self, session_id: &str, request: &str, response: Option<&str>, processing_ms: u64) {
        let Some(slot) = self.slot(session_id, true).await else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.touched.elapsed() >= self.ttl {
            *slot = SessionSlot::fresh();
        }

        let max_turns = self.max_turns;
        let turn = response.map(|r| {
            format!(
                "Q: {} | A: {}",
                excerpt(request, self.excerpt_chars),
                excerpt(r, self.excerpt_chars)
            )
        });

        let entry = &mut slot.entry;
        entry.last_request = request.to_string();
        entry.last_response = response.map(|r| r.to_string());
        entry.request_count += 1;
        entry.total_processing_ms += processing_ms;
        entry.last_activity = Utc::now();
        if let Some(turn) = turn {
            entry.recent_turns.push_back(turn);
            while entry.recent_turns.len() > max_turns {
                entry.recent_turns.pop_front();
            }
        }
        slot.touched = Instant::now();
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionEntry> {
        let slot = self.slot(session_id, false).await?;
        let slot = slot.lock().await;
        if slot.touched.elapsed() >= self.ttl {
            return None;
        }
        Some(slot.entry.clone())
    }

    /// Drop idle sessions (called periodically)
    pub async fn prune_expired(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut expired = Vec::new();
        for (key, slot) in slots.iter() {
            // A slot busy with an update is active by definition
            if let Ok(s) = slot.try_lock() {
                if s.touched.elapsed() >= self.ttl {
                    expired.push(key.clone());
                }
            }
        }
        for key in &expired {
            slots.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
