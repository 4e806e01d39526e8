//! The event data model.
//!
//! Recovered field-for-field from `ajenga/event/event_impl.py` and
//! `ajenga/event/meta.py`: a closed set of message, recall, membership,
//! request, and lifecycle events, plus an open-ended attribute bag for
//! `Meta`/`Protocol`/`Custom`/`Unknown` events (see DESIGN NOTES §9 of
//! `SPEC_FULL.md` — dynamic attribute access is modeled as a tagged union
//! with an explicit bag rather than an implicit fallback dict).

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::message::MessageChain;

/// A group member's standing, used by priority/permission-gated routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupPermission {
    None,
    Member,
    Admin,
    Owner,
}

/// The sender of a message event.
#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub qq: i64,
    pub name: String,
    pub permission: GroupPermission,
}

/// A string-keyed bag of attributes backing events whose shape isn't known
/// ahead of time (`Meta`, `Protocol`, `Custom`, `Unknown`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrBag(HashMap<String, Value>);

impl AttrBag {
    pub fn new() -> Self {
        AttrBag(HashMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }
}

/// The closed set of event discriminants this core routes on.
///
/// `type` in spec terms is simply the enum discriminant; type-specific
/// payloads live in each variant's fields, matching the `@dataclass` layout
/// of the original event classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    GroupMessage {
        message: MessageChain,
        message_id: i64,
        sender: Sender,
        group: i64,
    },
    FriendMessage {
        message: MessageChain,
        message_id: i64,
        sender: Sender,
    },
    TempMessage {
        message: MessageChain,
        message_id: i64,
        sender: Sender,
        group: i64,
    },
    GroupRecall {
        qq: i64,
        message_id: i64,
        operator: i64,
        group: i64,
    },
    FriendRecall {
        qq: i64,
        message_id: i64,
    },
    GroupMute {
        qq: i64,
        operator: i64,
        group: i64,
        duration: i64,
    },
    GroupUnmute {
        qq: i64,
        operator: i64,
        group: i64,
    },
    GroupJoin {
        qq: i64,
        operator: i64,
        group: i64,
    },
    GroupLeave {
        qq: i64,
        operator: i64,
        group: i64,
    },
    FriendAdd {
        qq: i64,
    },
    FriendRemove {
        qq: i64,
    },
    GroupJoinRequest {
        qq: i64,
        group: i64,
        comment: String,
    },
    GroupInvitedRequest {
        operator: i64,
        group: i64,
        comment: String,
    },
    FriendAddRequest {
        qq: i64,
        comment: String,
    },
    Meta {
        meta_type: String,
        attrs: AttrBag,
    },
    Protocol {
        protocol: String,
        attrs: AttrBag,
    },
    Custom {
        channel: String,
        attrs: AttrBag,
    },
    Unknown,
}

/// The event-type discriminant, exposed separately so `event_type_is` can key
/// an `EqualNode` on a plain `Copy` enum instead of matching on payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    GroupMessage,
    FriendMessage,
    TempMessage,
    GroupRecall,
    FriendRecall,
    GroupMute,
    GroupUnmute,
    GroupJoin,
    GroupLeave,
    FriendAdd,
    FriendRemove,
    GroupJoinRequest,
    GroupInvitedRequest,
    FriendAddRequest,
    Meta,
    Protocol,
    Custom,
    Unknown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::GroupMessage { .. } => EventKind::GroupMessage,
            Event::FriendMessage { .. } => EventKind::FriendMessage,
            Event::TempMessage { .. } => EventKind::TempMessage,
            Event::GroupRecall { .. } => EventKind::GroupRecall,
            Event::FriendRecall { .. } => EventKind::FriendRecall,
            Event::GroupMute { .. } => EventKind::GroupMute,
            Event::GroupUnmute { .. } => EventKind::GroupUnmute,
            Event::GroupJoin { .. } => EventKind::GroupJoin,
            Event::GroupLeave { .. } => EventKind::GroupLeave,
            Event::FriendAdd { .. } => EventKind::FriendAdd,
            Event::FriendRemove { .. } => EventKind::FriendRemove,
            Event::GroupJoinRequest { .. } => EventKind::GroupJoinRequest,
            Event::GroupInvitedRequest { .. } => EventKind::GroupInvitedRequest,
            Event::FriendAddRequest { .. } => EventKind::FriendAddRequest,
            Event::Meta { .. } => EventKind::Meta,
            Event::Protocol { .. } => EventKind::Protocol,
            Event::Custom { .. } => EventKind::Custom,
            Event::Unknown => EventKind::Unknown,
        }
    }

    pub fn message(&self) -> Option<&MessageChain> {
        match self {
            Event::GroupMessage { message, .. }
            | Event::FriendMessage { message, .. }
            | Event::TempMessage { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<&Sender> {
        match self {
            Event::GroupMessage { sender, .. }
            | Event::FriendMessage { sender, .. }
            | Event::TempMessage { sender, .. } => Some(sender),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<i64> {
        match self {
            Event::GroupMessage { group, .. }
            | Event::TempMessage { group, .. }
            | Event::GroupRecall { group, .. }
            | Event::GroupMute { group, .. }
            | Event::GroupUnmute { group, .. }
            | Event::GroupJoin { group, .. }
            | Event::GroupLeave { group, .. }
            | Event::GroupJoinRequest { group, .. }
            | Event::GroupInvitedRequest { group, .. } => Some(*group),
            _ => None,
        }
    }

    pub fn meta_type(&self) -> Option<&str> {
        match self {
            Event::Meta { meta_type, .. } => Some(meta_type),
            _ => None,
        }
    }

    pub fn attrs(&self) -> Option<&AttrBag> {
        match self {
            Event::Meta { attrs, .. } | Event::Protocol { attrs, .. } | Event::Custom { attrs, .. } => {
                Some(attrs)
            }
            _ => None,
        }
    }
}

/// Identity of an event's origin (a bot session, the meta bus, a custom
/// channel bus). Equality is by identity only, per spec — this crate never
/// inspects a provider beyond comparing it.
pub trait EventProvider: fmt::Debug {
    /// A stable identity distinguishing this provider from any other.
    fn provider_id(&self) -> usize;
}

impl PartialEq for dyn EventProvider {
    fn eq(&self, other: &Self) -> bool {
        self.provider_id() == other.provider_id()
    }
}
impl Eq for dyn EventProvider {}

/// A minimal concrete `EventProvider`, sufficient for tests and for any
/// collaborator that doesn't need a richer adapter-specific identity.
#[derive(Debug, Clone)]
pub struct NamedSource {
    id: usize,
    pub name: &'static str,
}

impl NamedSource {
    pub fn new(name: &'static str) -> Rc<Self> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Rc::new(NamedSource {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            name,
        })
    }
}

impl EventProvider for NamedSource {
    fn provider_id(&self) -> usize {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_matches_variant() {
        let ev = Event::FriendMessage {
            message: MessageChain::plain("hi"),
            message_id: 1,
            sender: Sender {
                qq: 10,
                name: "a".into(),
                permission: GroupPermission::None,
            },
        };
        assert_eq!(ev.kind(), EventKind::FriendMessage);
        assert_eq!(ev.group(), None);
    }

    #[test]
    fn named_source_identity_is_stable_per_instance() {
        let a = NamedSource::new("bot");
        let b = NamedSource::new("bot");
        assert_ne!(a.provider_id(), b.provider_id());
        assert_eq!(a.provider_id(), a.provider_id());
    }
}
