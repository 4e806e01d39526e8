//! Public combinators for building a [`crate::graph::OpenGraph`].
//!
//! Grounded on `ajenga/router/__init__.py` (the `event_type`, `qq`, `group`,
//! `permission`, `startswith`/`endswith`/`equals` factory functions) and
//! `ajenga/router/message.py` (`has`/`MessageTypeNode`). Each factory that
//! represents a *well-known axis* (one a conforming implementation must
//! supply per spec §6) caches a single [`KeyFunction`] behind a
//! [`std::sync::OnceLock`] so that two independent calls — e.g.
//! `event_type_is(FriendMessage)` in one subscription and
//! `event_type_is(GroupMessage)` in another — share the same `id` and
//! therefore merge into one discriminator node (spec §4.2).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::OnceLock;

use crate::error::Result;
use crate::event::{Event, EventKind, GroupPermission};
use crate::graph::{Node, NonterminalKind, OpenGraph};
use crate::keyfunc::{KeyFunction, Process, RouteValue};
use crate::message::MessageKind;
use crate::priority::Priority;
use crate::store::{KeyStore, RouteState};

fn cached_keyfn(cell: &'static OnceLock<KeyFunction>, key: &'static str, f: impl Fn(&Event, &KeyStore) -> RouteValue + 'static) -> KeyFunction {
    cell.get_or_init(|| KeyFunction::sync(key, crate::keyfunc::fresh_id(), f)).clone()
}

fn equal_leaf(keyfn: KeyFunction, value: RouteValue) -> OpenGraph {
    let mut successors = HashMap::new();
    successors.insert(value, Vec::new());
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Equal {
            keyfn,
            successors: RefCell::new(successors),
        },
    }));
    OpenGraph::leaf(node)
}

static EVENT_TYPE_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches events whose discriminant is `kind` (spec §6's `event.type` axis).
pub fn event_type_is(kind: EventKind) -> OpenGraph {
    let keyfn = cached_keyfn(&EVENT_TYPE_AXIS, "event.type", |event, _store| RouteValue::EventKind(event.kind()));
    equal_leaf(keyfn, RouteValue::EventKind(kind))
}

static META_TYPE_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches `Event::Meta` events whose `meta_type` equals `meta_type`.
pub fn meta_type_is(meta_type: impl Into<String>) -> OpenGraph {
    let keyfn = cached_keyfn(&META_TYPE_AXIS, "event.meta_type", |event, _store| {
        RouteValue::Str(event.meta_type().unwrap_or_default().to_string())
    });
    equal_leaf(keyfn, RouteValue::Str(meta_type.into()))
}

static QQ_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches message events whose sender qq equals `qq`.
pub fn qq_from(qq: i64) -> OpenGraph {
    let keyfn = cached_keyfn(&QQ_AXIS, "event.sender.qq", |event, _store| {
        RouteValue::Int(event.sender().map(|s| s.qq).unwrap_or_default())
    });
    equal_leaf(keyfn, RouteValue::Int(qq))
}

static GROUP_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches events whose group equals `group`.
pub fn group_from(group: i64) -> OpenGraph {
    let keyfn = cached_keyfn(&GROUP_AXIS, "event.group", |event, _store| {
        RouteValue::Int(event.group().unwrap_or_default())
    });
    equal_leaf(keyfn, RouteValue::Int(group))
}

static PERMISSION_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches message events whose sender permission equals `permission`.
pub fn permission_is(permission: GroupPermission) -> OpenGraph {
    let keyfn = cached_keyfn(&PERMISSION_AXIS, "event.sender.permission", |event, _store| {
        RouteValue::Permission(event.sender().map(|s| s.permission).unwrap_or(GroupPermission::None))
    });
    equal_leaf(keyfn, RouteValue::Permission(permission))
}

static PLAIN_TEXT_AXIS: OnceLock<KeyFunction> = OnceLock::new();

fn plain_text_keyfn() -> KeyFunction {
    // `as_plain()` already left-strips; matching `strip=True`'s further
    // `.strip()` in `ajenga/router/message.py` also drops trailing
    // whitespace, so `equals("ping")` matches `"ping\n"`.
    cached_keyfn(&PLAIN_TEXT_AXIS, "event.message.as_plain", |event, _store| {
        RouteValue::Str(event.message().map(|m| m.as_plain().trim_end().to_string()).unwrap_or_default())
    })
}

/// Matches message events whose plain text equals `text` exactly.
pub fn equals(text: impl Into<String>) -> OpenGraph {
    equal_leaf(plain_text_keyfn(), RouteValue::Str(text.into()))
}

static STARTSWITH_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches message events whose plain text starts with `prefix`; the
/// matched prefix is recorded under `event.message.as_plain` and the
/// remainder is captured as positional arg 0 (spec §4.3).
pub fn startswith(prefix: impl Into<String>) -> OpenGraph {
    let keyfn = cached_keyfn(&STARTSWITH_AXIS, "event.message.as_plain", |event, _store| {
        RouteValue::Str(event.message().map(|m| m.as_plain()).unwrap_or_default())
    });
    let mut trie = crate::graph::PrefixTrie::default();
    trie.insert_prefix(&prefix.into());
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Prefix {
            keyfn,
            trie: RefCell::new(trie),
        },
    }));
    OpenGraph::leaf(node)
}

static ENDSWITH_AXIS: OnceLock<KeyFunction> = OnceLock::new();

/// Matches message events whose plain text ends with `suffix`, implemented
/// as a longest-prefix match over the *reversed* text, exactly as the
/// original (`ajenga/router/__init__.py`'s `endswith`) does it. The
/// reversed text is itself left-stripped, matching `strip=True`'s
/// `as_plain()[::-1].lstrip()` — trailing whitespace in the original text
/// becomes leading whitespace once reversed, so this drops it, letting
/// `endswith("bye")` match `"good bye  "`.
pub fn endswith(suffix: impl Into<String>) -> OpenGraph {
    let keyfn = cached_keyfn(&ENDSWITH_AXIS, "event.message.as_plain.reversed", |event, _store| {
        let text: String = event.message().map(|m| m.as_plain()).unwrap_or_default();
        let reversed: String = text.chars().rev().collect();
        RouteValue::Str(reversed.trim_start().to_string())
    });
    let reversed_suffix: String = suffix.into().chars().rev().collect();
    let mut trie = crate::graph::PrefixTrie::default();
    trie.insert_prefix(&reversed_suffix);
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Prefix {
            keyfn,
            trie: RefCell::new(trie),
        },
    }));
    OpenGraph::leaf(node)
}

/// Matches message events carrying at least one element of `kind`
/// (`ajenga/router/message.py`'s `has`).
pub fn has(kind: MessageKind) -> OpenGraph {
    let mut successors = HashMap::new();
    successors.insert(kind, Vec::new());
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::MessageType {
            successors: RefCell::new(successors),
        },
    }));
    OpenGraph::leaf(node)
}

/// Matches when `predicate` returns `true`, recording the boolean under
/// `key` for diagnostics.
pub fn if_<F>(key: &'static str, predicate: F) -> OpenGraph
where
    F: Fn(&Event, &KeyStore) -> bool + 'static,
{
    let keyfn = KeyFunction::sync(key, crate::keyfunc::fresh_id(), move |event, store| RouteValue::Bool(predicate(event, store)));
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Predicate {
            keyfn,
            on_true: RefCell::new(Vec::new()),
            on_false: RefCell::new(Vec::new()),
        },
    }));
    OpenGraph::leaf(node)
}

/// Always-matching no-op leaf, useful as the left operand of a composition
/// that otherwise has nothing to branch on.
pub fn always() -> OpenGraph {
    let process = Process::new(crate::keyfunc::fresh_id(), |_event, state| async move { Ok(state) });
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Process {
            process,
            successors: RefCell::new(Vec::new()),
        },
    }));
    OpenGraph::leaf(node)
}

/// Runs `side_effect` over the accumulated route state and forwards
/// unconditionally (`ajenga/router/__init__.py`'s `process`).
pub fn process<F, Fut>(side_effect: F) -> OpenGraph
where
    F: Fn(Event, RouteState) -> Fut + 'static,
    Fut: std::future::Future<Output = Result<RouteState>> + 'static,
{
    let process = Process::new(crate::keyfunc::fresh_id(), side_effect);
    let node = Rc::new(Node::Nonterminal(crate::graph::Nonterminal {
        kind: NonterminalKind::Process {
            process,
            successors: RefCell::new(Vec::new()),
        },
    }));
    OpenGraph::leaf(node)
}

/// Conversation identity: matches events of the same [`EventKind`] and
/// (when applicable) the same group/qq as `reference`. Grounded on
/// `ajenga/ctx.py`'s `wait_next`, which scopes the wait to "the same
/// conversation the spawning event came from".
pub fn same_event_as(reference: &Event) -> OpenGraph {
    let kind = reference.kind();
    let group = reference.group();
    let qq = reference.sender().map(|s| s.qq);
    if_("same_conversation", move |event, _store| {
        event.kind() == kind && event.group() == group && event.sender().map(|s| s.qq) == qq
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{GroupPermission, NamedSource, Sender};
    use crate::graph::{route, Terminal};
    use crate::message::MessageChain;
    use crate::store::RouteState;

    fn friend_message(text: &str) -> Event {
        Event::FriendMessage {
            message: MessageChain::plain(text),
            message_id: 1,
            sender: Sender {
                qq: 7,
                name: "a".into(),
                permission: GroupPermission::None,
            },
        }
    }

    #[tokio::test]
    async fn startswith_captures_prefix_and_remainder() {
        let h = Terminal::new("h", Priority::Normal, true, |_s| async { Ok(()) });
        let graph = startswith("!help").apply(h).unwrap();
        let event = friend_message("  !help me");
        let source = NamedSource::new("bot");
        let state = RouteState::new(KeyStore::for_event(event.clone(), source));
        let matches = route(&graph.entry, &event, &state).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1.positional[0], RouteValue::Str(" me".into()));
    }

    #[tokio::test]
    async fn endswith_matches_reversed_suffix() {
        let h = Terminal::new("h", Priority::Normal, true, |_s| async { Ok(()) });
        let graph = endswith("bye").apply(h).unwrap();
        let event = friend_message("good bye");
        let source = NamedSource::new("bot");
        let state = RouteState::new(KeyStore::for_event(event.clone(), source));
        let matches = route(&graph.entry, &event, &state).await.unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn event_type_is_shares_axis_across_calls() {
        let a = event_type_is(EventKind::FriendMessage);
        let b = event_type_is(EventKind::GroupMessage);
        let Node::Nonterminal(na) = &*a.entry else { panic!() };
        let Node::Nonterminal(nb) = &*b.entry else { panic!() };
        assert_eq!(na.merge_axis(), nb.merge_axis());
    }
}
