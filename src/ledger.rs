use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

impl ConversationTurn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }

    /// The `Speaker: text` line shipped to the model as history context.
    pub fn render(&self) -> String {
        format!("{}: {}", self.speaker.label(), self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTimeEntry {
    pub elapsed_secs: f64,
    pub user_len: usize,
    pub assistant_len: usize,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate response-time statistics over the recorded entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseTimeStats {
    pub count: usize,
    pub average_secs: f64,
    pub median_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    /// Entries slower than the warning threshold.
    pub warning_count: usize,
    /// Entries slower than the slow threshold.
    pub slow_count: usize,
}

/// Thresholds (seconds) above which a response counts as slow.
pub const WARNING_THRESHOLD_SECS: f64 = 10.0;
pub const SLOW_THRESHOLD_SECS: f64 = 20.0;

#[derive(Debug, Default)]
struct LedgerInner {
    turns: Vec<ConversationTurn>,
    usage_total: u64,
    usage_history: Vec<TokenUsageRecord>,
    response_times: Vec<ResponseTimeEntry>,
    message_count: u64,
}

/// Live conversation state for one session: message history, token
/// accounting and timing statistics.
///
/// All state sits behind one mutex, which is what keeps the token
/// invariant (total == sum of uncleared records) and the atomicity of
/// reset-vs-append: no append computed before a reset can land after it.
#[derive(Debug)]
pub struct ConversationLedger {
    created_at: DateTime<Utc>,
    inner: Mutex<LedgerInner>,
}

impl Default for ConversationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLedger {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ── History ──────────────────────────────────────────────────────

    pub fn append_turn(&self, speaker: Speaker, text: impl Into<String>) {
        self.lock().turns.push(ConversationTurn::new(speaker, text));
    }

    /// Record one completed generation: user turn, assistant turn, the
    /// token-usage record and the timing entry land under a single lock
    /// acquisition, so no reader ever observes half an exchange.
    pub fn append_exchange(
        &self,
        user_text: &str,
        assistant_text: &str,
        tokens: u64,
        elapsed: Duration,
    ) {
        let mut inner = self.lock();
        inner
            .turns
            .push(ConversationTurn::new(Speaker::User, user_text));
        inner
            .turns
            .push(ConversationTurn::new(Speaker::Assistant, assistant_text));
        inner.usage_total += tokens;
        inner.usage_history.push(TokenUsageRecord {
            timestamp: Utc::now(),
            tokens,
        });
        inner.response_times.push(ResponseTimeEntry {
            elapsed_secs: elapsed.as_secs_f64(),
            user_len: user_text.len(),
            assistant_len: assistant_text.len(),
            timestamp: Utc::now(),
        });
        inner.message_count += 1;
    }

    /// Wholesale replacement of the history, used when a saved memory is
    /// loaded to resume a past conversation. Distinct from append: the
    /// previous turns are gone afterwards, nothing is duplicated.
    pub fn replace_history(&self, snapshot: Vec<ConversationTurn>) {
        self.lock().turns = snapshot;
    }

    pub fn history_snapshot(&self) -> Vec<ConversationTurn> {
        self.lock().turns.clone()
    }

    /// History rendered as `Speaker: text` lines for the model.
    pub fn rendered_history(&self) -> Vec<String> {
        self.lock().turns.iter().map(ConversationTurn::render).collect()
    }

    pub fn message_count(&self) -> u64 {
        self.lock().message_count
    }

    // ── Token accounting ─────────────────────────────────────────────

    pub fn add_token_usage(&self, tokens: u64) {
        let mut inner = self.lock();
        inner.usage_total += tokens;
        inner.usage_history.push(TokenUsageRecord {
            timestamp: Utc::now(),
            tokens,
        });
    }

    /// Clear the running total and the record list together.
    pub fn reset_token_usage(&self) {
        let mut inner = self.lock();
        inner.usage_total = 0;
        inner.usage_history.clear();
    }

    pub fn current_total(&self) -> u64 {
        self.lock().usage_total
    }

    pub fn usage_snapshot(&self) -> (u64, Vec<TokenUsageRecord>) {
        let inner = self.lock();
        (inner.usage_total, inner.usage_history.clone())
    }

    /// Records with `start <= timestamp < end`, for graphing.
    pub fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TokenUsageRecord> {
        self.lock()
            .usage_history
            .iter()
            .filter(|record| record.timestamp >= start && record.timestamp < end)
            .cloned()
            .collect()
    }

    // ── Timing statistics ────────────────────────────────────────────

    pub fn response_time_stats(&self) -> ResponseTimeStats {
        let inner = self.lock();
        let times: Vec<f64> = inner
            .response_times
            .iter()
            .map(|entry| entry.elapsed_secs)
            .collect();
        drop(inner);

        if times.is_empty() {
            return ResponseTimeStats::default();
        }

        let mut sorted = times.clone();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let median_secs = if count % 2 == 0 {
            f64::midpoint(sorted[count / 2 - 1], sorted[count / 2])
        } else {
            sorted[count / 2]
        };

        ResponseTimeStats {
            count,
            average_secs: times.iter().sum::<f64>() / count as f64,
            median_secs,
            min_secs: sorted[0],
            max_secs: sorted[count - 1],
            warning_count: times.iter().filter(|t| **t > WARNING_THRESHOLD_SECS).count(),
            slow_count: times.iter().filter(|t| **t > SLOW_THRESHOLD_SECS).count(),
        }
    }
}
