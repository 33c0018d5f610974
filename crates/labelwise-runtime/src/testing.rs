//! Scripted backends and judges for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use labelwise_core::{JudgeResponse, Label, PromptView, Record, StrategyResult};

use crate::judge::{Judge, JudgeError};
use crate::providers::{BackendError, JudgeBackend};

type Reply = Result<JudgeResponse, BackendError>;

/// Backend that plays back scripted replies, then repeats a default reply.
pub(crate) struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    delay: Option<Duration>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    views: Mutex<Vec<PromptView>>,
    rationale: Result<Option<String>, BackendError>,
    explained: Mutex<Vec<Label>>,
}

impl ScriptedBackend {
    pub fn always(name: &str, reply: Reply) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: reply,
            delay: None,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            views: Mutex::new(Vec::new()),
            rationale: Ok(None),
            explained: Mutex::new(Vec::new()),
        }
    }

    pub fn always_logprobs(name: &str, token: &str, logp0: f64, logp1: f64) -> Self {
        Self::always(name, Ok(JudgeResponse::with_logprobs(token, logp0, logp1)))
    }

    pub fn always_confidence(name: &str, token: &str, confidence: f64) -> Self {
        Self::always(name, Ok(JudgeResponse::with_confidence(token, confidence)))
    }

    pub fn failing(name: &str, error: BackendError) -> Self {
        Self::always(name, Err(error))
    }

    /// Queue a reply played before the default.
    pub fn then(self, reply: Reply) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer every explanation request with `reply`.
    pub fn with_rationale(mut self, reply: Result<Option<String>, BackendError>) -> Self {
        self.rationale = reply;
        self
    }

    /// Classification calls only.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Labels the backend was asked to explain, in request order.
    pub fn explained(&self) -> Vec<Label> {
        self.explained.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen_views(&self) -> Vec<PromptView> {
        self.views.lock().clone()
    }
}

#[async_trait]
impl JudgeBackend for ScriptedBackend {
    async fn invoke(&self, view: &PromptView) -> Result<JudgeResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.views.lock().push(view.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }

    async fn explain(&self, _view: &PromptView, label: Label) -> Result<Option<String>, BackendError> {
        self.explained.lock().push(label);
        self.rationale.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Judge returning a fixed result for every record.
pub(crate) struct FixedJudge {
    id: String,
    reply: Result<StrategyResult, JudgeError>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl FixedJudge {
    pub fn labeled(id: &str, soft_label: f64, confidence: f64) -> Self {
        Self::replying(
            id,
            Ok(StrategyResult::new(
                soft_label,
                confidence,
                id,
                Duration::from_millis(5),
                0,
            )),
        )
    }

    pub fn replying(id: &str, reply: Result<StrategyResult, JudgeError>) -> Self {
        Self {
            id: id.to_string(),
            reply,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for FixedJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn classify(&self, _record: &Record) -> Result<StrategyResult, JudgeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}
