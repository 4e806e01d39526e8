//! Per-traversal scratchpad and the frozen state a task runs with.
//!
//! Grounded on `ajenga_router/keyfunc.py`'s store argument threaded through
//! every `KeyFunction` call, and on `ajenga/ctx.py`'s `Context` object that a
//! running handler reads bound values from (`ctx['foo']`, `ctx[0]`).
//!
//! A [`KeyStore`] has two tiers, matching §4.2/§4.3's distinction between
//! what a whole dispatch shares and what one branch of the graph privately
//! accumulates:
//!
//! - `shared`: the incoming event, its source, and adapter-supplied extras
//!   (e.g. a bot handle) — one instance per dispatched event, visible to
//!   every branch the traversal forks into.
//! - `captured`/`aliases`: named bindings recorded by nodes as routing
//!   proceeds down one particular path — forked (deep-cloned) wherever the
//!   graph branches, so a capture made down one branch never leaks into a
//!   sibling.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as Json;

use crate::event::{Event, EventProvider};
use crate::keyfunc::RouteValue;
use crate::priority::Priority;

struct Shared {
    event: Rc<Event>,
    source: Rc<dyn EventProvider>,
    extras: HashMap<String, Json>,
    /// Type-erased slots reserved for cross-cutting bookkeeping that must be
    /// visible to every branch of one traversal — currently only the wait
    /// subsystem's pending-candidate list (`_wakeup_candidates`). Kept
    /// type-erased here rather than naming the concrete type so this module
    /// doesn't have to depend upward on `executor`/`wait`.
    reserved: RefCell<HashMap<&'static str, Rc<dyn Any>>>,
}

/// The per-traversal, per-branch scratchpad a [`crate::keyfunc::KeyFunction`]
/// reads from and a combinator writes captures into.
#[derive(Clone)]
pub struct KeyStore {
    shared: Rc<Shared>,
    captured: HashMap<String, RouteValue>,
    aliases: HashMap<String, String>,
}

impl KeyStore {
    /// An empty store with a placeholder event, for constructing
    /// `KeyFunction`s and combinators in isolation (tests, doctests).
    pub fn new() -> Self {
        KeyStore::for_event(Event::Unknown, crate::event::NamedSource::new("anonymous"))
    }

    /// The store a fresh dispatch begins routing with.
    pub fn for_event(event: Event, source: Rc<dyn EventProvider>) -> Self {
        KeyStore {
            shared: Rc::new(Shared {
                event: Rc::new(event),
                source,
                extras: HashMap::new(),
                reserved: RefCell::new(HashMap::new()),
            }),
            captured: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Same as [`KeyStore::for_event`], additionally seeding adapter-supplied
    /// extras (e.g. a bot handle under `"bot"`), mirroring `ctx.py`'s
    /// `**kwargs` threaded alongside the event.
    pub fn for_event_with_extras(
        event: Event,
        source: Rc<dyn EventProvider>,
        extras: HashMap<String, Json>,
    ) -> Self {
        let mut store = KeyStore::for_event(event, source);
        Rc::get_mut(&mut store.shared)
            .expect("no other reference exists yet")
            .extras = extras;
        store
    }

    pub fn event(&self) -> Rc<Event> {
        self.shared.event.clone()
    }

    pub fn source(&self) -> Rc<dyn EventProvider> {
        self.shared.source.clone()
    }

    pub fn extra(&self, name: &str) -> Option<Json> {
        self.shared.extras.get(name).cloned()
    }

    /// Resolves `name` through the alias table, if any.
    fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<RouteValue> {
        self.captured.get(self.canonical(name)).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.captured.contains_key(self.canonical(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: RouteValue) {
        self.captured.insert(name.into(), value);
    }

    /// Makes `alias` resolve to whatever `canonical` is bound to. Used by
    /// combinators that let a caller rename a well-known capture (e.g.
    /// binding `qq_from()`'s `"qq"` to a caller-chosen name).
    pub fn alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// Snapshot of every named capture visible at this point, for freezing
    /// into a [`crate::store::RouteState`] (see [`RouteState::build`]).
    pub fn build(&self) -> HashMap<String, RouteValue> {
        self.captured.clone()
    }

    /// Fetches the reserved slot named `key`, creating it via `default` on
    /// first use. The type parameter is fixed by the first caller for the
    /// lifetime of this store's `shared` lineage; mismatched types across
    /// call sites would panic, which in practice can't happen since exactly
    /// one module (`wait`) ever names a given reserved key.
    pub fn reserved_or_insert<T: 'static, F: FnOnce() -> T>(&self, key: &'static str, default: F) -> Rc<T> {
        let mut slots = self.shared.reserved.borrow_mut();
        let entry = slots
            .entry(key)
            .or_insert_with(|| Rc::new(default()) as Rc<dyn Any>);
        entry
            .clone()
            .downcast::<T>()
            .expect("reserved store key used with a different type than its first caller")
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        KeyStore::new()
    }
}

/// The frozen `(store, positional_args, priority_override)` a task is handed
/// when its terminal fires — built by [`RouteState::build`] at the moment a
/// routing path reaches a terminal (spec §3/§4.3).
#[derive(Clone)]
pub struct RouteState {
    pub store: KeyStore,
    pub positional: Vec<RouteValue>,
    pub priority_override: Option<Priority>,
}

impl RouteState {
    pub fn new(store: KeyStore) -> Self {
        RouteState {
            store,
            positional: Vec::new(),
            priority_override: None,
        }
    }

    /// A private child state for one outgoing branch: named captures and
    /// positional args are deep-cloned so a sibling branch's bindings can't
    /// observe this one's, while the underlying event/source stay shared.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn push_positional(&mut self, value: RouteValue) {
        self.positional.push(value);
    }

    pub fn set_priority_override(&mut self, priority: Priority) {
        self.priority_override = Some(priority);
    }

    /// The `(kwargs, positional)` snapshot handed to a task at dispatch.
    pub fn build(&self) -> (HashMap<String, RouteValue>, Vec<RouteValue>) {
        (self.store.build(), self.positional.clone())
    }
}
