//! The dispatch engine: installed routing graph, terminal registry, and the
//! event-to-task pipeline.
//!
//! Grounded on `ajenga/router/__init__.py`'s `Router.subscribe`/`dispatch`
//! pair and `ajenga/ctx.py`'s exception-as-meta-event redispatch. Registers
//! the permanent `_check_wait` terminal (spec §4.6) at construction time, so
//! every engine instance has wakeup arbitration wired in before a caller can
//! subscribe anything else.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::rc::Rc;

use serde_json::Value as Json;
use tracing::{error, trace};

use crate::combinators::always;
use crate::error::{EngineError, Result};
use crate::event::{AttrBag, Event, EventProvider};
use crate::executor::{Executor, ExecutorConfig};
use crate::graph::{self, ClosedGraph, NodeRef, Terminal};
use crate::priority::Priority;
use crate::store::{KeyStore, RouteState};

/// A user handler failed to the point of exhausting the meta-event
/// re-dispatch depth cap. Re-entering `handle_event` beyond this depth would
/// risk an infinite loop if a meta-event handler itself always raises.
const MAX_EXCEPTION_REDISPATCH_DEPTH: u8 = 1;

struct DispatchEngineInner {
    root: NodeRef,
    terminals: std::cell::RefCell<HashMap<u64, Rc<Terminal>>>,
    executor: Rc<Executor>,
}

/// The installed routing graph plus the executor that drives it.
///
/// Cheap to clone (an `Rc` around shared inner state) — `wait_until` clones
/// the currently-running engine to subscribe/unsubscribe its ephemeral
/// subgraph without needing a global.
#[derive(Clone)]
pub struct DispatchEngine(Rc<DispatchEngineInner>);

tokio::task_local! {
    static CURRENT_ENGINE: DispatchEngine;
}

impl DispatchEngine {
    /// Builds a fresh engine: an empty always-true root plus the permanent
    /// `_check_wait` wakeup-arbitration terminal.
    pub fn new(config: ExecutorConfig) -> Self {
        let engine = DispatchEngine(Rc::new(DispatchEngineInner {
            root: graph::new_root(),
            terminals: std::cell::RefCell::new(HashMap::new()),
            executor: Executor::new(config),
        }));
        engine.register_check_wait();
        engine
    }

    fn register_check_wait(&self) {
        let engine = self.clone();
        let terminal = Terminal::new("_check_wait", Priority::Wakeup, false, move |state| {
            let engine = engine.clone();
            async move { crate::wait::check_wait(&engine, state).await }
        });
        let closed = always().apply(terminal).expect("leaf apply never fails");
        self.subscribe(closed).expect("registering the built-in wakeup terminal cannot fail");
    }

    /// The engine driving the task currently executing. Only valid from
    /// within a running handler (set up by [`DispatchEngine::handle_event`]).
    pub fn current() -> DispatchEngine {
        CURRENT_ENGINE.with(|e| e.clone())
    }

    pub fn try_current() -> Option<DispatchEngine> {
        CURRENT_ENGINE.try_with(|e| e.clone()).ok()
    }

    pub fn executor(&self) -> Rc<Executor> {
        self.0.executor.clone()
    }

    /// Installs `graph` into the engine, merging its entry into the root
    /// (and any node that already shares a merge axis) and registering its
    /// terminal(s) in the back-index `unsubscribe_terminals` uses.
    pub fn subscribe(&self, graph: ClosedGraph) -> Result<()> {
        graph::merge_into_root(&self.0.root, &graph.entry)?;
        let mut terminals = self.0.terminals.borrow_mut();
        for terminal in graph.terminals {
            trace!(terminal = %terminal.name, id = terminal.id(), "subscribed");
            terminals.insert(terminal.id(), terminal);
        }
        Ok(())
    }

    /// Retires the given terminals: prunes them (and any nonterminal left
    /// with no remaining successors as a result) from the graph, and drops
    /// them from the back-index. Used by `wait_until` to retire its
    /// ephemeral terminal once it fires or times out.
    pub fn unsubscribe_terminals(&self, ids: &[u64]) {
        let set: HashSet<u64> = ids.iter().copied().collect();
        graph::unsubscribe_terminals(&self.0.root, &set);
        let mut terminals = self.0.terminals.borrow_mut();
        for id in ids {
            terminals.remove(id);
        }
    }

    /// Routes `event` from `source` through the installed graph and runs
    /// every match through the executor's priority bands. Returns whether
    /// any `count_finished` terminal completed without raising.
    pub async fn handle_event(&self, source: Rc<dyn EventProvider>, event: Event) -> bool {
        self.handle_event_with_extras(source, event, HashMap::new()).await
    }

    /// Same as [`DispatchEngine::handle_event`], seeding adapter-supplied
    /// extras (e.g. a bot handle under `"bot"`) into the dispatch's
    /// `KeyStore`.
    pub async fn handle_event_with_extras(&self, source: Rc<dyn EventProvider>, event: Event, extras: HashMap<String, Json>) -> bool {
        self.handle_event_inner(source, event, extras, 0).await
    }

    fn handle_event_inner(
        &self,
        source: Rc<dyn EventProvider>,
        event: Event,
        extras: HashMap<String, Json>,
        exception_depth: u8,
    ) -> Pin<Box<dyn std::future::Future<Output = bool> + '_>> {
        Box::pin(async move {
            let store = KeyStore::for_event_with_extras(event.clone(), source.clone(), extras);
            let state = RouteState::new(store);

            let matches = match graph::route(&self.0.root, &event, &state).await {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "routing failed");
                    return false;
                }
            };

            // A terminal reachable through more than one merged path keeps
            // only its first match, per the node-merging property (spec §8).
            let mut seen = HashSet::new();
            let matches: Vec<_> = matches.into_iter().filter(|(t, _)| seen.insert(t.id())).collect();

            let engine = self.clone();
            let on_handler_error = move |terminal: Rc<Terminal>, e: EngineError| {
                let engine = engine.clone();
                let source = source.clone();
                async move {
                    if exception_depth >= MAX_EXCEPTION_REDISPATCH_DEPTH {
                        error!(terminal = %terminal.name, error = %e, "handler failed while already dispatching an exception, dropping");
                        return;
                    }
                    let meta = Event::Meta {
                        meta_type: "ExceptionNotHandled".into(),
                        attrs: AttrBag::new().with("terminal", terminal.name.clone()).with("error", e.to_string()),
                    };
                    engine.handle_event_inner(source, meta, HashMap::new(), exception_depth + 1).await;
                }
            };

            let executor = self.0.executor.clone();
            CURRENT_ENGINE.scope(self.clone(), executor.run_dispatch(on_handler_error, matches)).await
        })
    }
}
