//! Polling loop for runs
//!
//! [`Poller`] drives a [`RunMachine`] until the run settles, sleeping between
//! queries according to a [`BackoffPolicy`]. Sleeps suspend only the awaiting
//! task and wake early on cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::ToolOutput;
use crate::error::Result;
use crate::event::{RunEventRecord, RunStatus};
use crate::run::{Run, RunMachine};
use crate::thread::Thread;

/// Delay between status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay every time
    #[serde(rename_all = "camelCase")]
    Fixed { interval_ms: u64 },

    /// `initial * multiplier^attempt`, capped at `max`
    #[serde(rename_all = "camelCase")]
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
        /// Pick uniformly from the upper half of the delay
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 500,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed {
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Delay before the query following attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                let factor = multiplier.max(1.0).powi(attempt.min(32) as i32);
                let ms = ((*initial_ms as f64) * factor).min(*max_ms as f64) as u64;
                if *jitter && ms > 1 {
                    let low = ms / 2;
                    Duration::from_millis(rand::thread_rng().gen_range(low..=ms))
                } else {
                    Duration::from_millis(ms)
                }
            }
        }
    }
}

/// Polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Consecutive transient errors tolerated before giving up
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
}

fn default_max_transient_retries() -> u32 {
    5
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_transient_retries: default_max_transient_retries(),
        }
    }
}

/// Cooperative cancellation signal shared by everything serving one request
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Guard that cancels the token when dropped
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: Some(self.clone()),
        }
    }
}

/// Cancels its token on drop unless disarmed
#[derive(Debug)]
pub struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    /// Keep the token alive past the guard
    pub fn disarm(mut self) -> CancellationToken {
        self.token.take().unwrap_or_default()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

/// Drives runs to a settled status
#[derive(Clone)]
pub struct Poller {
    machine: RunMachine,
    config: PollConfig,
}

impl Poller {
    pub fn new(machine: RunMachine, config: PollConfig) -> Self {
        Self { machine, config }
    }

    pub fn machine(&self) -> &RunMachine {
        &self.machine
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll until the run is terminal or requires action
    ///
    /// Transient errors are retried up to the configured bound. Sleeps never
    /// overshoot the run's deadline. On cancellation the run is marked
    /// `Cancelled` locally and no further queries are issued.
    pub async fn wait(
        &self,
        run: &mut Run,
        thread: &mut Thread,
        cancel: &CancellationToken,
    ) -> Result<RunStatus> {
        let mut attempt: u32 = 0;
        let mut transient_failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.machine.cancel(run, thread);
                return Ok(run.status);
            }

            match self.machine.poll(run, thread).await {
                Ok(status) if status.is_terminal() || status == RunStatus::RequiresAction => {
                    return Ok(status);
                }
                Ok(_) => transient_failures = 0,
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if transient_failures > self.config.max_transient_retries {
                        warn!(
                            run.id = %run.id,
                            "Giving up after {} transient errors",
                            transient_failures
                        );
                        return Err(e);
                    }
                    debug!(run.id = %run.id, "Retrying after transient error: {}", e);
                }
                Err(e) => return Err(e),
            }

            let remaining = run.expires_at.saturating_duration_since(Instant::now());
            let delay = self.config.backoff.delay(attempt).min(remaining);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Resume a run with tool results, retrying transient submit failures
    pub async fn resume(
        &self,
        run: &mut Run,
        thread: &mut Thread,
        mut outputs: Vec<ToolOutput>,
    ) -> Result<RunStatus> {
        let mut attempt: u32 = 0;
        loop {
            match self.machine.resume(run, thread, outputs.clone()).await {
                Err(e) if e.is_transient() && attempt < self.config.max_transient_retries => {
                    debug!(run.id = %run.id, "Retrying tool result submission: {}", e);
                    // Accepted outputs are no longer pending
                    outputs.retain(|o| {
                        run.pending_tool_calls
                            .iter()
                            .any(|call| call.id == o.tool_call_id)
                    });
                    tokio::time::sleep(self.config.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Lazily poll a run, yielding its events as they are recorded
    ///
    /// Events after `checkpoint` are yielded first. Each pull that finds no
    /// buffered events performs one poll. The stream ends once the run is
    /// terminal or requires action and its events are drained, or after the
    /// first non-transient error.
    pub fn run_events(
        &self,
        run: Run,
        thread: Thread,
        checkpoint: u64,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<RunEventRecord>> + '_ {
        struct State {
            run: Run,
            thread: Thread,
            checkpoint: u64,
            cancel: CancellationToken,
            attempt: u32,
            done: bool,
        }

        let state = State {
            run,
            thread,
            checkpoint,
            cancel,
            attempt: 0,
            done: false,
        };

        stream::unfold(state, move |mut state| async move {
            loop {
                let next = state.thread.events().since(state.checkpoint).next().cloned();
                if let Some(record) = next {
                    state.checkpoint = record.seq;
                    return Some((Ok(record), state));
                }
                let settled = state.run.is_terminal() || state.run.status == RunStatus::RequiresAction;
                if state.done || settled {
                    return None;
                }

                if state.cancel.is_cancelled() {
                    self.machine.cancel(&mut state.run, &mut state.thread);
                    continue;
                }

                if state.attempt > 0 {
                    let remaining = state
                        .run
                        .expires_at
                        .saturating_duration_since(Instant::now());
                    let delay = self.config.backoff.delay(state.attempt - 1).min(remaining);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = state.cancel.cancelled() => {}
                    }
                }
                state.attempt = state.attempt.saturating_add(1);

                if let Err(e) = self.machine.poll(&mut state.run, &mut state.thread).await {
                    state.done = !e.is_transient();
                    return Some((Err(e), state));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use crate::event::RunEvent;
    use crate::scripted::{AgentScript, ScriptedBackend};
    use futures::StreamExt;
    use relay_core::agent::Agent;

    fn poller(backend: Arc<ScriptedBackend>, config: PollConfig) -> Poller {
        Poller::new(RunMachine::new(backend), config)
    }

    fn fast() -> PollConfig {
        PollConfig {
            backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
            max_transient_retries: 2,
        }
    }

    async fn submit(poller: &Poller, thread: &mut Thread, agent: &str, ttl: Duration) -> Run {
        poller
            .machine()
            .submit(
                &Agent::new(agent, "gpt-4o", "test"),
                thread,
                "input",
                Instant::now() + ttl,
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay(4), Duration::from_millis(5_000));
        assert_eq!(policy.delay(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = BackoffPolicy::Exponential {
            initial_ms: 1_000,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: true,
        };
        for attempt in 0..20 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_backoff_config_format() {
        let config: PollConfig = serde_json::from_str(
            r#"{ "backoff": { "kind": "fixed", "intervalMs": 250 }, "maxTransientRetries": 1 }"#,
        )
        .unwrap();
        assert_eq!(config.backoff.delay(7), Duration::from_millis(250));
        assert_eq!(config.max_transient_retries, 1);

        let config: PollConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PollConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_completed() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "summarizer",
            AgentScript::new()
                .then_status(RunStatus::InProgress)
                .then_status(RunStatus::InProgress)
                .then_reply("summary"),
        ));
        let poller = poller(backend.clone(), fast());
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "summarizer", Duration::from_secs(30)).await;

        let status = poller
            .wait(&mut run, &mut thread, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("summary"));
        assert_eq!(backend.get_run_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_within_bound() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "flaky",
            AgentScript::new()
                .then_transient("timeout")
                .then_transient("timeout")
                .then_reply("ok"),
        ));
        let poller = poller(backend, fast());
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "flaky", Duration::from_secs(30)).await;

        let status = poller
            .wait(&mut run, &mut thread, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_retry_resends_only_unaccepted_outputs() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent(
                    "catalog",
                    AgentScript::new()
                        .then_call_tools(vec![
                            ("ListFood".to_string(), serde_json::json!({})),
                            ("RemoveFood".to_string(), serde_json::json!({ "id": 3 })),
                        ])
                        .then_respond_with(|ctx| format!("{} outputs", ctx.tool_outputs.len())),
                )
                .with_transient_submit(2),
        );
        let poller = poller(backend.clone(), fast());
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "catalog", Duration::from_secs(30)).await;
        let cancel = CancellationToken::new();

        assert_eq!(
            poller.wait(&mut run, &mut thread, &cancel).await.unwrap(),
            RunStatus::RequiresAction
        );
        let outputs = run
            .pending_tool_calls
            .iter()
            .map(|call| ToolOutput::new(call.id.clone(), "ok"))
            .collect();

        let status = poller.resume(&mut run, &mut thread, outputs).await.unwrap();
        assert_eq!(status, RunStatus::InProgress);
        assert_eq!(backend.submitted_tool_calls(), vec!["call_1", "call_2", "call_2"]);

        assert_eq!(
            poller.wait(&mut run, &mut thread, &cancel).await.unwrap(),
            RunStatus::Completed
        );
        assert_eq!(run.result.as_deref(), Some("2 outputs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_past_bound_surface() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "down",
            AgentScript::new().then_transient("connection refused"),
        ));
        let poller = poller(backend.clone(), fast());
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "down", Duration::from_secs(30)).await;

        let err = poller
            .wait(&mut run, &mut thread, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::Transient { .. }));
        // One initial attempt plus two retries
        assert_eq!(backend.get_run_count(), 3);
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stops_at_deadline() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "stuck",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let poller = poller(
            backend,
            PollConfig {
                backoff: BackoffPolicy::fixed(Duration::from_secs(60)),
                max_transient_retries: 0,
            },
        );
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "stuck", Duration::from_secs(5)).await;
        let started = Instant::now();

        let status = poller
            .wait(&mut run, &mut thread, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Expired);
        // The 60s interval is cut short by the 5s deadline
        assert!(Instant::now() - started <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "stuck",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let poller = poller(
            backend.clone(),
            PollConfig {
                backoff: BackoffPolicy::fixed(Duration::from_secs(10)),
                max_transient_retries: 0,
            },
        );
        let mut thread = Thread::new();
        let mut run = submit(&poller, &mut thread, "stuck", Duration::from_secs(600)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let status = poller.wait(&mut run, &mut thread, &cancel).await.unwrap();

        assert_eq!(status, RunStatus::Cancelled);
        // Queries at 0s, 10s and 20s, none after the cancel at 25s
        assert_eq!(backend.get_run_count(), 3);
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let token = CancellationToken::new();
        {
            let _guard = token.drop_guard();
        }
        assert!(token.is_cancelled());

        let token = CancellationToken::new();
        let guard = token.drop_guard();
        let kept = guard.disarm();
        assert!(!token.is_cancelled());
        assert!(!kept.is_cancelled());

        // Waiters registered before cancel are woken
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_events_stream() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "summarizer",
            AgentScript::new()
                .then_status(RunStatus::InProgress)
                .then_reply("summary"),
        ));
        let poller = poller(backend.clone(), fast());
        let mut thread = Thread::new();
        let run = submit(&poller, &mut thread, "summarizer", Duration::from_secs(30)).await;

        let events: Vec<RunEventRecord> = poller
            .run_events(run, thread, 0, CancellationToken::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        let seqs: Vec<u64> = events.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(matches!(
            events[0].event,
            RunEvent::StatusChanged {
                new_status: RunStatus::InProgress,
                ..
            }
        ));
        assert!(matches!(
            events[2].event,
            RunEvent::Completed {
                status: RunStatus::Completed,
                ..
            }
        ));
        assert_eq!(backend.get_run_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_events_is_lazy() {
        let backend = Arc::new(ScriptedBackend::new().with_agent(
            "stuck",
            AgentScript::new().then_status(RunStatus::InProgress),
        ));
        let poller = poller(backend.clone(), fast());
        let mut thread = Thread::new();
        let run = submit(&poller, &mut thread, "stuck", Duration::from_secs(30)).await;

        let stream = poller.run_events(run, thread, 0, CancellationToken::new());
        futures::pin_mut!(stream);
        assert_eq!(backend.get_run_count(), 0);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(backend.get_run_count(), 1);
    }
}
