//! Session bookkeeping: one bound computer per session, many sessions in
//! parallel, idle eviction, graceful shutdown.
//!
//! Sessions hold task ids, not task handles; the cancellation tree
//! (manager → session → run) is how shutdown reaches running work. The
//! session map's mutex is held only across map mutations.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ComputerPool;
use crate::callbacks::{
    BudgetCap, Callback, CallbackPipeline, ImageRetention, PiiScrubber, PromptCacheHinter,
    RunContext, TrajectoryWriter,
};
use crate::computer::{Computer, ComputerSpec};
use crate::env::EnvSnapshot;
use crate::error::{AgentError, RunStatus};
use crate::llm::{LlmPort, ModelSpec};
use crate::run::{HookedLlmPort, Orchestrator, RunConfig, RunResult};
use crate::schema::{Message, Usage};

/// Everything needed to execute one run on behalf of a client.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub model: String,
    pub input: Vec<Message>,
    pub session_id: Option<String>,
    pub computer_spec: ComputerSpec,
    pub env: EnvSnapshot,
    pub max_steps: Option<usize>,
    pub max_trajectory_budget: Option<f64>,
    pub image_retention_window: Option<usize>,
    pub trajectory_dir: Option<PathBuf>,
}

struct SessionEntry {
    computer: Arc<dyn Computer>,
    last_activity: Instant,
    active_tasks: HashSet<Uuid>,
    cancel: CancellationToken,
}

/// Tunables the manager is built with.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub session_idle_timeout: Duration,
    pub shutdown_deadline: Duration,
    /// Register the PII scrubber on every run.
    pub scrub_pii: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(300),
            shutdown_deadline: Duration::from_secs(30),
            scrub_pii: false,
        }
    }
}

pub struct SessionManager {
    llm: Arc<dyn LlmPort>,
    pool: Arc<ComputerPool>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    options: ManagerOptions,
    accepting: AtomicBool,
    shutdown_done: Mutex<bool>,
    root_cancel: CancellationToken,
    task_done: Notify,
}

impl SessionManager {
    pub fn new(llm: Arc<dyn LlmPort>, pool: Arc<ComputerPool>, options: ManagerOptions) -> Self {
        Self {
            llm,
            pool,
            sessions: Mutex::new(HashMap::new()),
            options,
            accepting: AtomicBool::new(true),
            shutdown_done: Mutex::new(false),
            root_cancel: CancellationToken::new(),
            task_done: Notify::new(),
        }
    }

    /// Execute one run to completion. Errors returned here happened before
    /// any run state existed (unknown model, pool exhausted, shutdown);
    /// everything after that is reported inside the `RunResult`.
    pub async fn execute(self: &Arc<Self>, req: RunRequest) -> Result<RunResult, AgentError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(AgentError::Config(
                "server is shutting down; not accepting new runs".to_string(),
            ));
        }

        let spec = ModelSpec::parse(&req.model)?;
        let session_id = req
            .session_id
            .clone()
            .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4().simple()));

        let (computer, session_cancel) =
            self.bind_session(&session_id, &req.computer_spec).await?;

        let run_id = Uuid::new_v4();
        let ctx = RunContext {
            run_id,
            session_id: session_id.clone(),
            model: req.model.clone(),
        };

        let pipeline = self.build_pipeline(&req);
        let hooked: Arc<dyn LlmPort> = Arc::new(HookedLlmPort::new(
            Arc::clone(&self.llm),
            pipeline.clone(),
            ctx.clone(),
        ));
        let agent = crate::loops::resolve(&spec, hooked)?;

        self.register_task(&session_id, run_id).await;

        let config = RunConfig {
            max_steps: req.max_steps.unwrap_or(100),
            image_retention_window: req.image_retention_window,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            agent,
            computer,
            pipeline,
            None,
            config,
            req.env,
            ctx,
            session_cancel.child_token(),
        );

        let input = req.input;
        let handle = tokio::spawn(async move { orchestrator.run(input).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, %session_id, "run task panicked");
                RunResult {
                    status: RunStatus::Failed,
                    output: vec![Message::assistant_text("The run failed: internal error.")],
                    usage: Usage::default(),
                    error: Some(format!("run task failed: {e}")),
                }
            }
        };

        self.finish_task(&session_id, run_id).await;
        Ok(result)
    }

    fn build_pipeline(&self, req: &RunRequest) -> CallbackPipeline {
        let mut callbacks: Vec<Arc<dyn Callback>> = Vec::new();
        if self.options.scrub_pii {
            callbacks.push(Arc::new(PiiScrubber));
        }
        if let Some(window) = req.image_retention_window {
            callbacks.push(Arc::new(ImageRetention::new(window)));
        }
        callbacks.push(Arc::new(PromptCacheHinter::default()));
        if let Some(budget) = req.max_trajectory_budget {
            callbacks.push(Arc::new(BudgetCap::new(budget)));
        }
        if let Some(dir) = &req.trajectory_dir {
            callbacks.push(Arc::new(TrajectoryWriter::new(dir.clone())));
        }
        CallbackPipeline::new(callbacks)
    }

    /// Find the session, creating it (and leasing its computer) on first
    /// use. The pool acquire happens outside the map lock; a losing race
    /// returns the extra handle.
    async fn bind_session(
        &self,
        session_id: &str,
        spec: &ComputerSpec,
    ) -> Result<(Arc<dyn Computer>, CancellationToken), AgentError> {
        loop {
            {
                let mut sessions = self.sessions.lock().await;
                if let Some(entry) = sessions.get_mut(session_id) {
                    entry.last_activity = Instant::now();
                    return Ok((Arc::clone(&entry.computer), entry.cancel.clone()));
                }
            }

            let handle = self.pool.acquire(spec).await?;

            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(session_id) {
                // Someone else created the session while we were acquiring.
                drop(sessions);
                self.pool.release(handle).await;
                continue;
            }
            let cancel = self.root_cancel.child_token();
            tracing::info!(%session_id, computer = %handle.name(), "session created");
            sessions.insert(
                session_id.to_string(),
                SessionEntry {
                    computer: Arc::clone(&handle),
                    last_activity: Instant::now(),
                    active_tasks: HashSet::new(),
                    cancel: cancel.clone(),
                },
            );
            return Ok((handle, cancel));
        }
    }

    async fn register_task(&self, session_id: &str, run_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.active_tasks.insert(run_id);
            entry.last_activity = Instant::now();
        }
    }

    async fn finish_task(&self, session_id: &str, run_id: Uuid) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.active_tasks.remove(&run_id);
                entry.last_activity = Instant::now();
            }
        }
        self.task_done.notify_waiters();
    }

    /// Cancel every run in a session and drop it, returning its computer to
    /// the pool.
    pub async fn close_session(&self, session_id: &str) {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        if let Some(entry) = entry {
            entry.cancel.cancel();
            self.pool.release(entry.computer).await;
            tracing::info!(%session_id, "session closed");
        }
    }

    pub async fn active_task_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|s| s.active_tasks.len()).sum()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the pool could satisfy a probe acquire.
    pub async fn healthy(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.pool.can_acquire().await
    }

    /// Background task evicting sessions with no activity for the idle
    /// timeout. Runs until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let tick = manager.options.session_idle_timeout.div_f32(4.0).max(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = manager.root_cancel.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                manager.sweep_idle().await;
            }
        })
    }

    async fn sweep_idle(&self) {
        let timeout = self.options.session_idle_timeout;
        let expired: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.lock().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.active_tasks.is_empty() && s.last_activity.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| sessions.remove_entry(&id))
                .collect()
        };
        for (session_id, entry) in expired {
            tracing::info!(%session_id, "evicting idle session");
            self.pool.release(entry.computer).await;
        }
    }

    /// Graceful, idempotent shutdown: stop accepting, wait for active runs
    /// up to the deadline, cancel the rest, return every handle, close the
    /// pool.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let mut done = self.shutdown_done.lock().await;
        if *done {
            return;
        }

        let deadline = Instant::now() + self.options.shutdown_deadline;
        while self.active_task_count().await > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, self.task_done.notified()).await;
        }

        self.root_cancel.cancel();

        // Cancelled runs unwind quickly; give them a bounded moment.
        let grace = Instant::now() + Duration::from_secs(2);
        while self.active_task_count().await > 0 && Instant::now() < grace {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.task_done.notified())
                .await;
        }

        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            self.pool.release(entry.computer).await;
        }
        self.pool.shutdown().await;

        *done = true;
        tracing::info!("session manager shut down");
    }
}
