//! The cooperative executor: priority-banded task scheduling, pause/resume,
//! and the current-task/current-executor accessors.
//!
//! Grounded on `ajenga/ctx.py`'s `Task` class (the `pause`/`resume`,
//! `last_active_time`, `state` map) and on spec §4.5's band algorithm. There
//! is no real parallelism here — one dispatch's bands run as plain,
//! `!Send` futures driven by `futures::future::join_all` on the current
//! task, matching §5's "single-threaded cooperative event loop" model
//! directly rather than emulating it on top of OS threads, so no
//! `tokio::spawn`/`LocalSet` is needed anywhere in this crate.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use serde_json::Value as Json;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::graph::Terminal;
use crate::priority::Priority;
use crate::store::RouteState;

/// Default timeout and priority table, threaded explicitly into
/// `DispatchEngine::new` rather than read from a global (spec §9 forbids
/// process-wide mutable singletons).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_wait_timeout: std::time::Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            // Matches `original_source`'s `timeout: float = 3600` default.
            default_wait_timeout: std::time::Duration::from_secs(3600),
        }
    }
}

struct TaskInner {
    id: Uuid,
    terminal: Rc<Terminal>,
    priority: Cell<Priority>,
    paused: Cell<bool>,
    last_active_time: Cell<Instant>,
    locals: RefCell<HashMap<String, Json>>,
    resume_tx: RefCell<Option<oneshot::Sender<Result<RouteState>>>>,
    /// The route state this task is currently running with — its original
    /// match, or whatever `_check_wait` substituted on a successful wakeup
    /// (spec §4.6's "set T.args := args").
    args: RefCell<RouteState>,
    /// Fires once this task's terminal handler returns, pause or no pause.
    /// `_check_wait` waits on this after resuming a task so that the band
    /// that woke it doesn't consider itself finished until the woken task's
    /// continuation has actually run — the mechanism behind spec §5's
    /// "wake-up happens strictly before the triggering event's normal
    /// handlers" guarantee.
    completed: Notify,
}

/// A cooperatively scheduled execution of one matched terminal (spec §3/§4.7).
#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("priority", &self.inner.priority.get())
            .field("paused", &self.inner.paused.get())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Task {}

tokio::task_local! {
    static CURRENT_TASK: Task;
    static CURRENT_EXECUTOR: Rc<Executor>;
}

impl Task {
    fn new(terminal: Rc<Terminal>, priority: Priority, args: RouteState) -> Self {
        Task {
            inner: Rc::new(TaskInner {
                id: Uuid::new_v4(),
                terminal,
                priority: Cell::new(priority),
                paused: Cell::new(false),
                last_active_time: Cell::new(Instant::now()),
                locals: RefCell::new(HashMap::new()),
                resume_tx: RefCell::new(None),
                args: RefCell::new(args),
                completed: Notify::new(),
            }),
        }
    }

    /// Waits for this task's terminal handler to return. A no-op past-tense
    /// wait if it already has: [`Notify`] remembers one outstanding permit,
    /// so calling this after completion still resolves immediately.
    pub async fn await_completion(&self) {
        self.inner.completed.notified().await;
    }

    fn mark_completed(&self) {
        self.inner.completed.notify_one();
    }

    /// The route state the task is currently running with. Updated by
    /// [`Task::resume`] on a successful wakeup, so `this[i]`-style access
    /// after a `wait_until` reflects the event that woke it.
    pub fn args(&self) -> RouteState {
        self.inner.args.borrow().clone()
    }

    /// The `i`-th positional arg of [`Task::args`] (spec §4.1's `store[i]`).
    pub fn positional(&self, i: usize) -> Option<crate::keyfunc::RouteValue> {
        self.inner.args.borrow().positional.get(i).cloned()
    }

    /// The task-local accessor a running handler uses to refer to itself
    /// (spec §4.5's `current()`).
    pub fn current() -> Task {
        CURRENT_TASK.with(|t| t.clone())
    }

    /// `Some` only when called from within a running task.
    pub fn try_current() -> Option<Task> {
        CURRENT_TASK.try_with(|t| t.clone()).ok()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority.get()
    }

    pub fn set_priority(&self, priority: Priority) {
        self.inner.priority.set(priority);
    }

    pub fn last_active_time(&self) -> Instant {
        self.inner.last_active_time.get()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.get()
    }

    pub fn terminal(&self) -> Rc<Terminal> {
        self.inner.terminal.clone()
    }

    /// The wait machinery's task-local flag bag (`suspend_other`,
    /// `suspend_next_priority`).
    pub fn set_local(&self, key: impl Into<String>, value: impl Into<Json>) {
        self.inner.locals.borrow_mut().insert(key.into(), value.into());
    }

    pub fn get_local(&self, key: &str) -> Option<Json> {
        self.inner.locals.borrow().get(key).cloned()
    }

    /// Suspends the running task until [`Task::resume`] is called. Freezes
    /// `last_active_time` at pause entry (spec §4.7).
    pub async fn pause(&self) -> Result<RouteState> {
        let (tx, rx) = oneshot::channel();
        *self.inner.resume_tx.borrow_mut() = Some(tx);
        self.inner.paused.set(true);
        self.inner.last_active_time.set(Instant::now());
        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Routing("task dropped while paused".into())));
        self.inner.paused.set(false);
        self.inner.last_active_time.set(Instant::now());
        outcome
    }

    /// Resumes a paused task with a success or error value. A no-op if the
    /// task is not currently paused (or has already been resumed/dropped).
    pub fn resume(&self, value: Result<RouteState>) {
        if let Ok(state) = &value {
            *self.inner.args.borrow_mut() = state.clone();
        }
        if let Some(tx) = self.inner.resume_tx.borrow_mut().take() {
            let _ = tx.send(value);
        }
    }
}

/// Runs matched terminals in priority bands (spec §4.5). Holds no
/// reference to the [`crate::dispatch::DispatchEngine`] that owns it —
/// `run_dispatch` is handed one explicitly, keeping the executor free of
/// back-pointers (spec §9's cyclic-reference note).
pub struct Executor {
    pub config: ExecutorConfig,
    next_priority: Cell<bool>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Rc<Executor> {
        Rc::new(Executor {
            config,
            next_priority: Cell::new(true),
        })
    }

    pub fn current() -> Rc<Executor> {
        CURRENT_EXECUTOR.with(|e| e.clone())
    }

    pub fn try_current() -> Option<Rc<Executor>> {
        CURRENT_EXECUTOR.try_with(|e| e.clone()).ok()
    }

    /// Called by a handler (via the `suspend_next_priority()` helper) to
    /// stop the current dispatch after its band finishes.
    pub fn request_suspend_next_priority(&self) {
        self.next_priority.set(false);
    }

    /// Runs one matched `(terminal, state)` pair as a task scoped under this
    /// executor, returning whether it finished without error and counts
    /// toward "handled" (spec §4.5). Exposed so `_check_wait` can run a
    /// woken task's continuation inline and `await_completion` it before
    /// returning, rather than only being reachable from [`Executor::run_dispatch`].
    pub async fn run_one<F, Fut>(self: &Rc<Self>, band: Priority, on_handler_error: &F, terminal: Rc<Terminal>, state: RouteState) -> bool
    where
        F: Fn(Rc<Terminal>, EngineError) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let task = Task::new(terminal.clone(), band, state.clone());
        let result = CURRENT_TASK
            .scope(task.clone(), CURRENT_EXECUTOR.scope(self.clone(), terminal.invoke(state)))
            .await;
        task.mark_completed();
        match result {
            Ok(()) => terminal.count_finished,
            Err(e) => {
                warn!(terminal = %terminal.name, error = %e, "handler failed");
                on_handler_error(terminal, e).await;
                false
            }
        }
    }

    /// Runs every matched `(terminal, state)` pair, grouped into priority
    /// bands in order, stopping early if any task this dispatch requested
    /// `suspend_next_priority`. Returns whether any `count_finished`
    /// terminal completed without error.
    ///
    /// A task woken mid-band by `_check_wait` is not re-enqueued here: it
    /// runs (and is awaited to completion) inline inside `_check_wait`'s own
    /// handler via [`Executor::run_one`]/[`Task::await_completion`], which is
    /// itself one of the futures this band's `join_all` is waiting on.
    pub async fn run_dispatch<F, Fut>(self: &Rc<Self>, on_handler_error: F, matches: Vec<(Rc<Terminal>, RouteState)>) -> bool
    where
        F: Fn(Rc<Terminal>, EngineError) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut bands: HashMap<Priority, Vec<(Rc<Terminal>, RouteState)>> = HashMap::new();
        for (terminal, state) in matches {
            // A process node upstream of the match may have overridden the
            // band via `RouteState.priority_override` (spec §3's RouteState
            // triple); otherwise fall back to the terminal's own priority.
            let band = state.priority_override.unwrap_or(terminal.priority);
            if band == Priority::Never {
                // Never-priority terminals (ephemeral wait markers) are
                // routable but never scheduled directly.
                continue;
            }
            bands.entry(band).or_default().push((terminal, state));
        }

        self.next_priority.set(true);
        let mut handled = false;
        for band in Priority::scheduled_bands() {
            if !self.next_priority.get() {
                debug!(?band, "suspend_next_priority set, stopping dispatch");
                break;
            }
            let Some(items) = bands.remove(&band) else { continue };
            debug!(?band, count = items.len(), "running priority band");
            let futs = items
                .into_iter()
                .map(|(terminal, state)| self.run_one(band, &on_handler_error, terminal, state));
            let results = futures::future::join_all(futs).await;
            if results.into_iter().any(|r| r) {
                handled = true;
            }
        }
        handled
    }
}
