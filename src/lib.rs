//! Event routing and cooperative task engine for asynchronous chat-bot
//! frameworks.
//!
//! A collaborator builds a [`graph::OpenGraph`] out of the [`combinators`]
//! (equality, prefix, predicate, `&`/`|` composition, `process`, `if_`,
//! `has`), closes it over a [`graph::Terminal`], and [`dispatch::DispatchEngine::subscribe`]s
//! it. Feeding events through [`dispatch::DispatchEngine::handle_event`]
//! traverses the installed graph, groups the matches into priority bands
//! (spec §4.5), and runs each as a cooperatively scheduled [`executor::Task`]
//! that may [`wait::wait_until`] a later event before completing.
//!
//! Module layout mirrors the dependency order each piece actually needs:
//! `message` → `event` → `error` → `priority` → `store` → `keyfunc` →
//! `graph` → `combinators` → `executor` → `dispatch` → `wait`.

pub mod combinators;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod keyfunc;
pub mod message;
pub mod priority;
pub mod store;
pub mod wait;

pub use combinators::{
    always, endswith, equals, event_type_is, group_from, has, if_, meta_type_is, permission_is, process, qq_from, same_event_as,
    startswith,
};
pub use dispatch::DispatchEngine;
pub use error::{EngineError, Result};
pub use event::{AttrBag, Event, EventKind, EventProvider, GroupPermission, NamedSource, Sender};
pub use executor::{Executor, ExecutorConfig, Task};
pub use graph::{ClosedGraph, OpenGraph, Terminal};
pub use keyfunc::{KeyFunction, RouteValue};
pub use message::{MessageChain, MessageElement, MessageKind};
pub use priority::Priority;
pub use store::{KeyStore, RouteState};
pub use wait::{suspend_next_priority, wait_next, wait_quote, wait_until};
