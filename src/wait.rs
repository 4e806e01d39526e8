//! `wait_until` / `wait_next` / `wait_quote`: suspending the current task
//! until a matching event arrives or a deadline elapses, and the
//! `_check_wait` arbitration terminal that wakes parked tasks.
//!
//! Grounded on `ajenga/ctx.py`'s `wait_for`/`wait_next`/`wait_quote`. The
//! original schedules a delayed synthetic event and checks a
//! `check_not_timed_out` predicate on every subsequent dispatch to detect
//! its own deadline; this crate races [`Task::pause`] against
//! `tokio::time::sleep` directly via `tokio::select!` instead — the same
//! externally observable deadline (resumed no later than timeout, ephemeral
//! terminal unsubscribed before the error surfaces) without re-entering the
//! dispatch loop to watch a clock. See DESIGN.md.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::combinators::{has, if_, process, same_event_as};
use crate::dispatch::DispatchEngine;
use crate::error::{EngineError, Result};
use crate::event::EventProvider;
use crate::executor::{Executor, Task};
use crate::graph::{OpenGraph, Terminal};
use crate::message::MessageKind;
use crate::priority::Priority;
use crate::store::RouteState;

const WAKEUP_CANDIDATES_KEY: &str = "_wakeup_candidates";

/// One task parked in [`wait_until`], recorded against the triggering
/// event's shared store when its ephemeral subgraph matches (spec §4.6).
struct WakeupCandidate {
    task: Task,
    dumpy_terminal: Rc<Terminal>,
    captured: RouteState,
    suspend_other: bool,
    suspend_next_priority: bool,
}

type CandidateList = RefCell<Vec<WakeupCandidate>>;

/// Suspends the current task until `graph` matches a subsequent event, or
/// `timeout` elapses.
///
/// `suspend_other`: once this wait is the one that gets woken, stop
/// `_check_wait` from also waking any other candidate recorded against the
/// same triggering event.
///
/// `suspend_next_priority`: once woken, also stop the *waking* dispatch's
/// remaining priority bands from running (spec §4.6's `next_priority`).
pub async fn wait_until(
    graph: OpenGraph,
    timeout: Duration,
    suspend_other: bool,
    suspend_next_priority: bool,
) -> Result<RouteState> {
    let task = Task::current();
    let engine = DispatchEngine::current();

    let dumpy = Terminal::new("_wait_until_ephemeral", Priority::Never, false, |_state| async { Ok(()) });

    let recorder_dumpy = dumpy.clone();
    let recorder_task = task.clone();
    let recorder = process(move |_event, state| {
        let dumpy = recorder_dumpy.clone();
        let task = recorder_task.clone();
        async move {
            record_candidate(&task, &dumpy, state.clone(), suspend_other, suspend_next_priority);
            Ok(state)
        }
    });

    let closed = (graph & recorder).apply(dumpy.clone())?;
    engine.subscribe(closed)?;
    trace!(terminal = dumpy.id(), ?timeout, "wait_until: ephemeral terminal subscribed");

    tokio::select! {
        result = task.pause() => result,
        _ = tokio::time::sleep(timeout) => {
            engine.unsubscribe_terminals(&[dumpy.id()]);
            let elapsed = task.last_active_time().elapsed().as_secs_f64();
            debug!(terminal = dumpy.id(), elapsed, "wait_until: deadline elapsed");
            Err(EngineError::Timeout { elapsed_secs: elapsed })
        }
    }
}

/// Records a candidate wakeup against the shared store of the traversal
/// currently executing `_event` — visible to `_check_wait`'s handler
/// because [`crate::store::RouteState::fork`] shares `KeyStore`'s `shared`
/// half (the reserved-slot bookkeeping) across every branch of one
/// dispatch, even though it deep-clones `captured`/`aliases` per branch.
fn record_candidate(task: &Task, dumpy: &Rc<Terminal>, captured: RouteState, suspend_other: bool, suspend_next_priority: bool) {
    let list: Rc<CandidateList> = captured.store.reserved_or_insert(WAKEUP_CANDIDATES_KEY, || RefCell::new(Vec::new()));
    list.borrow_mut().push(WakeupCandidate {
        task: task.clone(),
        dumpy_terminal: dumpy.clone(),
        captured,
        suspend_other,
        suspend_next_priority,
    });
}

/// The permanent `Wakeup`-priority terminal dispatch.rs registers under the
/// always-true root. Runs before any user priority band on every dispatched
/// event (spec §4.6's wakeup arbitration).
pub(crate) async fn check_wait(engine: &DispatchEngine, state: RouteState) -> Result<()> {
    let list: Rc<CandidateList> = state.store.reserved_or_insert(WAKEUP_CANDIDATES_KEY, || RefCell::new(Vec::new()));
    let mut candidates: Vec<WakeupCandidate> = list.borrow_mut().drain(..).collect();
    if candidates.is_empty() {
        return Ok(());
    }

    // Ascending by last_active_time, then pop from the end: the most
    // recently active wait is arbitrated first.
    candidates.sort_by(|a, b| a.task.last_active_time().cmp(&b.task.last_active_time()));

    let current_priority = Task::current().priority();
    let mut any_suspend_next_priority = false;
    while let Some(candidate) = candidates.pop() {
        let WakeupCandidate {
            task,
            dumpy_terminal,
            captured,
            suspend_other,
            suspend_next_priority,
        } = candidate;

        engine.unsubscribe_terminals(&[dumpy_terminal.id()]);
        task.set_priority(current_priority);
        task.resume(Ok(captured));
        task.await_completion().await;

        any_suspend_next_priority |= suspend_next_priority;
        if suspend_other {
            break;
        }
    }

    if any_suspend_next_priority {
        Executor::current().request_suspend_next_priority();
    }
    Ok(())
}

/// Waits for the next event in the same conversation as the one that woke
/// the current task, additionally matching `graph` (`ajenga/ctx.py`'s
/// `wait_next`).
pub async fn wait_next(graph: OpenGraph, timeout: Duration, suspend_other: bool, suspend_next_priority: bool) -> Result<RouteState> {
    let current_event = Task::current().args().store.event();
    let conversation = same_event_as(&current_event) & graph;
    wait_until(conversation, timeout, suspend_other, suspend_next_priority).await
}

/// Waits for a message quoting `message_id` from `bot`, additionally
/// matching `graph` (`ajenga/ctx.py`'s `wait_quote`).
pub async fn wait_quote(
    message_id: i64,
    bot: Rc<dyn EventProvider>,
    graph: OpenGraph,
    timeout: Duration,
    suspend_other: bool,
    suspend_next_priority: bool,
) -> Result<RouteState> {
    let quote_graph = has(MessageKind::Quote)
        & if_("quote_id_matches", move |event, store| {
            event.message().and_then(|m| m.first_quote()) == Some(message_id) && *store.source() == *bot
        })
        & graph;
    wait_until(quote_graph, timeout, suspend_other, suspend_next_priority).await
}

/// Requests that the current dispatch stop running any later priority band
/// once the one in progress finishes (spec §4.6/§8 scenario 3).
pub fn suspend_next_priority() {
    Executor::current().request_suspend_next_priority();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::event_type_is;
    use crate::event::{Event, EventKind, GroupPermission, NamedSource, Sender};
    use crate::executor::ExecutorConfig;
    use crate::message::MessageChain;

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

    #[tokio::test(start_paused = true)]
    async fn wait_until_times_out_when_nothing_matches() {
        let engine = DispatchEngine::new(ExecutorConfig {
            default_wait_timeout: Duration::from_secs(1),
        });
        let source: Rc<dyn crate::event::EventProvider> = NamedSource::new("bot");

        let waiting_terminal = Terminal::new("waits", Priority::Normal, true, move |_state| async move {
            let outcome = wait_until(event_type_is(EventKind::GroupMessage), Duration::from_millis(50), false, false).await;
            assert!(matches!(outcome, Err(EngineError::Timeout { .. })));
            Ok(())
        });
        let closed = event_type_is(EventKind::FriendMessage).apply(waiting_terminal).unwrap();
        engine.subscribe(closed).unwrap();

        let handled = tokio::time::timeout(
            Duration::from_secs(5),
            engine.handle_event(source, friend_message("hi")),
        )
        .await
        .expect("dispatch completed (timeout branch always resolves the task)");
        assert!(handled);
    }
}
