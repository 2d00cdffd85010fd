//! Fake generator for deterministic testing
//!
//! Replies come from a script; once the script is used up every call gets
//! the fallback reply. Tracks call counts, prompts seen, and the highest
//! number of simultaneous in-flight calls.
//!
//! ```rust,ignore
//! let primary = Arc::new(FakeGenerator::scripted(vec![FakeReply::fail("503")]));
//! let local = Arc::new(FakeGenerator::always("summary"));
//! let registry = ProviderRegistry::new()
//!     .with(MODEL_GPT4O, primary.clone())
//!     .with(MODEL_LOCAL, local.clone());
//! ```

use super::{estimate_tokens, Generation, ProviderError, TextGenerator};
use async_trait::async_trait;
use medgate_shared::audit::TokenUsage;
use medgate_shared::packet::Constraints;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FakeReply {
    Text(String),
    Fail(ProviderError),
    /// Whitespace-only output
    Empty,
}

impl FakeReply {
    pub fn text(s: &str) -> Self {
        FakeReply::Text(s.to_string())
    }

    pub fn fail(msg: &str) -> Self {
        FakeReply::Fail(ProviderError::Http(msg.to_string()))
    }
}

pub struct FakeGenerator {
    script: Mutex<VecDeque<FakeReply>>,
    fallback: FakeReply,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FakeGenerator {
    pub fn new(script: Vec<FakeReply>, fallback: FakeReply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call succeeds with `text`
    pub fn always(text: &str) -> Self {
        Self::new(Vec::new(), FakeReply::text(text))
    }

    /// Every call fails
    pub fn failing(msg: &str) -> Self {
        Self::new(Vec::new(), FakeReply::fail(msg))
    }

    /// Script first, then success with a fixed text
    pub fn scripted(script: Vec<FakeReply>) -> Self {
        Self::new(script, FakeReply::text("ok"))
    }

    /// Hold every call for `delay` before replying
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_reply(&self) -> FakeReply {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn generate(&self, prompt: &str, _constraints: &Constraints) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Decrements even when the caller's timeout drops this future
        let _guard = InFlightGuard(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self.next_reply();

        match reply {
            FakeReply::Text(text) => Ok(Generation {
                usage: TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&text)),
                text,
            }),
            FakeReply::Fail(e) => Err(e),
            FakeReply::Empty => Ok(Generation {
                text: "   ".to_string(),
                usage: TokenUsage::default(),
            }),
        }
    }
}
