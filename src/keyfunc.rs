//! Key extraction: the axis a nonterminal node branches on.
//!
//! Grounded on `ajenga_router/keyfunc.py`'s `KeyFunction`/`KeyFunctionImpl`:
//! a `KeyFunction` is identified by a stable `id` (so two independent
//! subscriptions over the same axis converge on the same graph node, per
//! §4.2's node-merging rule) and carries a `key` name used when the
//! extracted value is recorded into the [`crate::store::KeyStore`].
//!
//! User callables may be sync or async; [`KeyFunction::sync`] and
//! [`KeyFunction::r#async`] both normalize to the same boxed-future shape
//! internally, matching the "accept both sync and async user-provided
//! functions" requirement of §4.1.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::event::{Event, EventKind, GroupPermission};
use crate::message::MessageKind;
use crate::store::{KeyStore, RouteState};

/// The branchable value produced by a [`KeyFunction`] and recorded in a
/// [`KeyStore`]. Deliberately not `serde_json::Value`: route dispatch needs
/// `Hash + Eq` keys, which JSON's float variant cannot provide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteValue {
    Str(String),
    Int(i64),
    Bool(bool),
    EventKind(EventKind),
    MessageKind(MessageKind),
    Permission(GroupPermission),
    Unit,
}

impl RouteValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RouteValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RouteValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RouteValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for RouteValue {
    fn from(s: &str) -> Self {
        RouteValue::Str(s.to_string())
    }
}
impl From<String> for RouteValue {
    fn from(s: String) -> Self {
        RouteValue::Str(s)
    }
}
impl From<i64> for RouteValue {
    fn from(i: i64) -> Self {
        RouteValue::Int(i)
    }
}
impl From<bool> for RouteValue {
    fn from(b: bool) -> Self {
        RouteValue::Bool(b)
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

/// A pure `(event, store) -> value` extraction, normalized to async.
///
/// Clone is cheap (an `Rc` around the boxed closure); cloning preserves
/// `id`, which is what graph composition compares for node merging.
#[derive(Clone)]
pub struct KeyFunction {
    id: u64,
    key: &'static str,
    func: Rc<dyn Fn(&Event, &KeyStore) -> BoxFut<'static, RouteValue>>,
}

impl std::fmt::Debug for KeyFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFunction")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl PartialEq for KeyFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for KeyFunction {}

static NEXT_KEYFN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-unique id. Combinators that should merge
/// across independent calls (the "well-known KeyFunctions" of §6) instead
/// cache one `KeyFunction` behind a `OnceLock` and clone it, so every call
/// site shares the same `id`.
pub fn fresh_id() -> u64 {
    NEXT_KEYFN_ID.fetch_add(1, Ordering::Relaxed)
}

impl KeyFunction {
    /// Wrap a synchronous extraction function.
    pub fn sync<F>(key: &'static str, id: u64, f: F) -> Self
    where
        F: Fn(&Event, &KeyStore) -> RouteValue + 'static,
    {
        KeyFunction {
            id,
            key,
            func: Rc::new(move |event, store| {
                let v = f(event, store);
                Box::pin(async move { Ok(v) })
            }),
        }
    }

    /// Wrap an asynchronous extraction function.
    pub fn r#async<F, Fut>(key: &'static str, id: u64, f: F) -> Self
    where
        F: Fn(Event, KeyStore) -> Fut + 'static,
        Fut: Future<Output = Result<RouteValue>> + 'static,
    {
        KeyFunction {
            id,
            key,
            func: Rc::new(move |event, store| Box::pin(f(event.clone(), store.clone()))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub async fn call(&self, event: &Event, store: &KeyStore) -> Result<RouteValue> {
        (self.func)(event, store).await
    }
}

/// A side-effecting step used by `ProcessNode` (spec §3/§4.3): given the
/// triggering event and the route state accumulated so far, produces a
/// (possibly mutated) state and forwards unconditionally. Unlike
/// [`KeyFunction`] it owns its [`RouteState`] argument rather than
/// borrowing it, since a process step's whole point is to write new
/// bindings (named captures, positional args, reserved-slot bookkeeping)
/// into the state it hands downstream.
#[derive(Clone)]
pub struct Process {
    id: u64,
    func: Rc<dyn Fn(Event, RouteState) -> BoxFut<'static, RouteState>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Process {}

impl Process {
    pub fn new<F, Fut>(id: u64, f: F) -> Self
    where
        F: Fn(Event, RouteState) -> Fut + 'static,
        Fut: Future<Output = Result<RouteState>> + 'static,
    {
        Process {
            id,
            func: Rc::new(move |event, state| Box::pin(f(event, state))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn call(&self, event: Event, state: RouteState) -> Result<RouteState> {
        (self.func)(event, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyStore;

    #[tokio::test]
    async fn sync_keyfunction_extracts_event_type() {
        let kf = KeyFunction::sync("event.type", fresh_id(), |event, _store| {
            RouteValue::Str(format!("{:?}", event.kind()))
        });
        let store = KeyStore::new();
        let ev = Event::Unknown;
        let v = kf.call(&ev, &store).await.unwrap();
        assert_eq!(v.as_str(), Some("Unknown"));
    }

    #[test]
    fn cloned_keyfunctions_share_id() {
        let kf = KeyFunction::sync("k", 42, |_e, _s| RouteValue::Unit);
        let kf2 = kf.clone();
        assert_eq!(kf.id(), kf2.id());
    }
}
