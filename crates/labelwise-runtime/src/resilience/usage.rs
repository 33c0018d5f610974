//! Per-judge call accounting.
//!
//! Records calls, retries, failures, tokens and cache hits per judge so a
//! batch can report what each strategy cost.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use labelwise_core::TokenUsage;

/// Accumulated usage for one judge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeUsage {
    /// Logical invocations (one per `call`, whatever the retries)
    pub invocations: u64,

    /// Backend requests actually sent
    pub requests: u64,

    /// Requests beyond the first per invocation
    pub retries: u64,

    /// Invocations that ended without a response
    pub failures: u64,

    /// Invocations answered from the response cache
    pub cache_hits: u64,

    /// Rationale requests sent, retries included
    pub rationale_requests: u64,

    /// Rationales that came back with text
    pub rationales: u64,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl JudgeUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn absorb(&mut self, other: &JudgeUsage) {
        self.invocations += other.invocations;
        self.requests += other.requests;
        self.retries += other.retries;
        self.failures += other.failures;
        self.cache_hits += other.cache_hits;
        self.rationale_requests += other.rationale_requests;
        self.rationales += other.rationales;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Point-in-time copy of all usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub judges: BTreeMap<String, JudgeUsage>,
    pub total: JudgeUsage,
}

/// Thread-safe usage tracker shared by every caller in a run.
#[derive(Debug, Default)]
pub struct UsageTracker {
    judges: RwLock<BTreeMap<String, JudgeUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, judge: &str, f: impl FnOnce(&mut JudgeUsage)) {
        let mut judges = self.judges.write();
        match judges.get_mut(judge) {
            Some(usage) => f(usage),
            None => {
                let mut usage = JudgeUsage::default();
                f(&mut usage);
                judges.insert(judge.to_string(), usage);
            }
        }
    }

    /// An invocation that got a response after `requests` backend calls.
    pub fn record_success(&self, judge: &str, requests: u32, tokens: &TokenUsage) {
        self.update(judge, |u| {
            u.invocations += 1;
            u.requests += requests as u64;
            u.retries += requests.saturating_sub(1) as u64;
            u.prompt_tokens += tokens.prompt_tokens as u64;
            u.completion_tokens += tokens.completion_tokens as u64;
        });
    }

    /// An invocation that ended without a response after `requests` calls.
    pub fn record_failure(&self, judge: &str, requests: u32) {
        self.update(judge, |u| {
            u.invocations += 1;
            u.requests += requests as u64;
            u.retries += requests.saturating_sub(1) as u64;
            u.failures += 1;
        });
    }

    /// A rationale lookup that took `requests` backend calls.
    pub fn record_rationale(&self, judge: &str, requests: u32, produced: bool) {
        self.update(judge, |u| {
            u.rationale_requests += requests as u64;
            if produced {
                u.rationales += 1;
            }
        });
    }

    pub fn record_cache_hit(&self, judge: &str) {
        self.update(judge, |u| {
            u.invocations += 1;
            u.cache_hits += 1;
        });
    }

    pub fn judge(&self, judge: &str) -> JudgeUsage {
        self.judges.read().get(judge).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let judges = self.judges.read().clone();
        let mut total = JudgeUsage::default();
        for usage in judges.values() {
            total.absorb(usage);
        }
        UsageSnapshot { judges, total }
    }

    pub fn reset(&self) {
        self.judges.write().clear();
    }
}
