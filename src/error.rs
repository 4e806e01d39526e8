//! Error types for graph construction, routing, and task execution.
//!
//! Mirrors the error kinds required by the routing/dispatch/executor/wait
//! subsystems: [`EngineError::Routing`], [`EngineError::Handler`],
//! [`EngineError::Timeout`], and [`EngineError::MethodNotInjected`]. All
//! variants implement `std::error::Error` via `thiserror`, following the
//! teacher crate's `GraphError` enum.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All error kinds surfaced by the routing graph, dispatch engine, executor,
/// and wait subsystem.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Graph misuse: applying a terminal to an already-closed graph, or a
    /// KeyFunction/process closure raising during construction or routing.
    #[error("routing error: {0}")]
    Routing(String),

    /// A user handler raised while running as a task. Carries the terminal
    /// name for diagnostics; the failing task transitions to `Dead` and the
    /// error is re-dispatched as an `ExceptionNotHandled` meta-event.
    #[error("handler '{terminal}' failed: {message}")]
    Handler {
        /// Name of the terminal whose handler raised.
        terminal: String,
        /// Display of the underlying failure.
        message: String,
    },

    /// A `wait_until` deadline elapsed before a matching event arrived.
    #[error("wait_until timed out after {elapsed_secs}s")]
    Timeout {
        /// Seconds elapsed since the task last became active.
        elapsed_secs: f64,
    },

    /// A collaborator-facing marker: an event method (e.g. `reply`) was
    /// invoked but never bound by the adapter that produced the event. This
    /// variant is surfaced to callers, never recovered from internally.
    #[error("method not injected: {0}")]
    MethodNotInjected(String),
}

impl EngineError {
    pub(crate) fn handler(terminal: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::Handler {
            terminal: terminal.into(),
            message: message.to_string(),
        }
    }
}
