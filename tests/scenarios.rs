//! End-to-end scenarios exercising the public API: routing, priority
//! gating, and the wait subsystem's wakeup arbitration and timeouts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use chatrouter::{
    always, equals, event_type_is, startswith, suspend_next_priority, wait_next, wait_quote, wait_until, DispatchEngine, EngineError,
    EventKind, EventProvider, ExecutorConfig, GroupPermission, MessageChain, MessageElement, NamedSource, Priority, Sender, Terminal,
};
use chatrouter::Event;

fn friend_message(text: &str) -> Event {
    Event::FriendMessage {
        message: MessageChain::plain(text),
        message_id: 1,
        sender: Sender {
            qq: 7,
            name: "alice".into(),
            permission: GroupPermission::None,
        },
    }
}

fn friend_quote(message_id: i64) -> Event {
    let mut chain = MessageChain::new();
    chain.push(MessageElement::Quote { message_id });
    Event::FriendMessage {
        message: chain,
        message_id: 2,
        sender: Sender {
            qq: 7,
            name: "alice".into(),
            permission: GroupPermission::None,
        },
    }
}

fn bot_source() -> Rc<dyn EventProvider> {
    NamedSource::new("bot")
}

#[tokio::test]
async fn equality_dispatch_only_runs_the_matching_handler() {
    let engine = DispatchEngine::new(ExecutorConfig::default());

    let h1_ran = Rc::new(Cell::new(0));
    let h1_ran_in = h1_ran.clone();
    let h1 = Terminal::new("h1", Priority::Normal, true, move |_state| {
        let h1_ran = h1_ran_in.clone();
        async move {
            h1_ran.set(h1_ran.get() + 1);
            Ok(())
        }
    });

    let h2_ran = Rc::new(Cell::new(false));
    let h2_ran_in = h2_ran.clone();
    let h2 = Terminal::new("h2", Priority::Normal, true, move |_state| {
        let h2_ran = h2_ran_in.clone();
        async move {
            h2_ran.set(true);
            Ok(())
        }
    });

    engine.subscribe(event_type_is(EventKind::FriendMessage).apply(h1).unwrap()).unwrap();
    engine.subscribe(event_type_is(EventKind::GroupMessage).apply(h2).unwrap()).unwrap();

    let handled = engine.handle_event(bot_source(), friend_message("hi")).await;
    assert!(handled);
    assert_eq!(h1_ran.get(), 1);
    assert!(!h2_ran.get());
}

#[tokio::test]
async fn prefix_match_captures_prefix_and_remainder() {
    let engine = DispatchEngine::new(ExecutorConfig::default());

    let captured = Rc::new(RefCell::new((String::new(), String::new())));
    let captured_in = captured.clone();
    let h = Terminal::new("help", Priority::Normal, true, move |state| {
        let captured = captured_in.clone();
        async move {
            let prefix = state.store.get("event.message.as_plain").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            let remainder = state.positional.first().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            *captured.borrow_mut() = (prefix, remainder);
            Ok(())
        }
    });

    engine.subscribe(startswith("!help").apply(h).unwrap()).unwrap();

    let handled = engine.handle_event(bot_source(), friend_message("  !help me")).await;
    assert!(handled);
    let (prefix, remainder) = captured.borrow().clone();
    assert_eq!(prefix, "!help");
    assert_eq!(remainder, " me");
}

#[tokio::test]
async fn suspend_next_priority_stops_lower_bands_from_running() {
    let engine = DispatchEngine::new(ExecutorConfig::default());

    let low_ran = Rc::new(Cell::new(false));
    let low_ran_in = low_ran.clone();
    let low = Terminal::new("low", Priority::Low, true, move |_state| {
        let low_ran = low_ran_in.clone();
        async move {
            low_ran.set(true);
            Ok(())
        }
    });

    let high_ran = Rc::new(Cell::new(false));
    let high_ran_in = high_ran.clone();
    let high = Terminal::new("high", Priority::High, true, move |_state| {
        let high_ran = high_ran_in.clone();
        async move {
            high_ran.set(true);
            suspend_next_priority();
            Ok(())
        }
    });

    engine.subscribe(event_type_is(EventKind::FriendMessage).apply(low).unwrap()).unwrap();
    engine.subscribe(event_type_is(EventKind::FriendMessage).apply(high).unwrap()).unwrap();

    let handled = engine.handle_event(bot_source(), friend_message("hi")).await;
    assert!(handled);
    assert!(high_ran.get());
    assert!(!low_ran.get());
}

#[tokio::test(start_paused = true)]
async fn wait_next_resolves_on_reply_and_times_out_otherwise() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let engine = DispatchEngine::new(ExecutorConfig::default());
            let reply_text = Rc::new(RefCell::new(None::<String>));
            let reply_text_in = reply_text.clone();

            let ping = Terminal::new("ping", Priority::Normal, true, move |_state| {
                let reply_text = reply_text_in.clone();
                async move {
                    let outcome = wait_next(always(), Duration::from_millis(100), false, false).await?;
                    let text = outcome.store.event().message().map(|m| m.as_plain());
                    *reply_text.borrow_mut() = text;
                    Ok(())
                }
            });
            engine.subscribe(equals("ping").apply(ping).unwrap()).unwrap();

            let engine_for_ping = engine.clone();
            let source = bot_source();
            let ping_source = source.clone();
            let ping_task = tokio::task::spawn_local(async move { engine_for_ping.handle_event(ping_source, friend_message("ping")).await });
            tokio::task::yield_now().await;

            let handled_pong = engine.handle_event(source.clone(), friend_message("pong")).await;
            assert!(handled_pong);
            assert!(ping_task.await.unwrap());
            assert_eq!(reply_text.borrow().as_deref(), Some("pong"));

            // Second task times out when nothing ever replies.
            let timed_out = Rc::new(Cell::new(false));
            let timed_out_in = timed_out.clone();
            let silent = Terminal::new("silent", Priority::Normal, true, move |_state| {
                let timed_out = timed_out_in.clone();
                async move {
                    let outcome = wait_next(always(), Duration::from_millis(100), false, false).await;
                    timed_out.set(matches!(outcome, Err(EngineError::Timeout { .. })));
                    Ok(())
                }
            });
            engine.subscribe(equals("silent").apply(silent).unwrap()).unwrap();

            let engine_for_silent = engine.clone();
            let silent_source = source.clone();
            let silent_task =
                tokio::task::spawn_local(async move { engine_for_silent.handle_event(silent_source, friend_message("silent")).await });
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(150)).await;
            silent_task.await.unwrap();
            assert!(timed_out.get());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn wait_quote_matches_only_the_quoted_message_id() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let engine = DispatchEngine::new(ExecutorConfig::default());
            let woke = Rc::new(Cell::new(false));
            let woke_in = woke.clone();
            let source = bot_source();
            let bot_in = source.clone();

            let asker = Terminal::new("asker", Priority::Normal, true, move |_state| {
                let woke = woke_in.clone();
                let bot = bot_in.clone();
                async move {
                    let outcome = wait_quote(42, bot, always(), Duration::from_millis(200), false, false).await;
                    woke.set(outcome.is_ok());
                    Ok(())
                }
            });
            engine.subscribe(equals("ask").apply(asker).unwrap()).unwrap();

            let engine_for_ask = engine.clone();
            let ask_source = source.clone();
            let ask_task = tokio::task::spawn_local(async move { engine_for_ask.handle_event(ask_source, friend_message("ask")).await });
            tokio::task::yield_now().await;

            engine.handle_event(source.clone(), friend_quote(7)).await;
            assert!(!woke.get(), "a quote of the wrong message id must not wake the waiter");

            engine.handle_event(source.clone(), friend_quote(42)).await;
            ask_task.await.unwrap();
            assert!(woke.get());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn suspend_other_gives_the_most_recently_active_waiter_priority() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let engine = DispatchEngine::new(ExecutorConfig::default());
            let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));

            fn reply_graph() -> chatrouter::OpenGraph {
                event_type_is(EventKind::FriendMessage) & equals("reply")
            }

            let log_old = log.clone();
            let old_trigger = Terminal::new("old_trigger", Priority::Normal, true, move |_state| {
                let log = log_old.clone();
                async move {
                    match wait_until(reply_graph(), Duration::from_millis(300), false, false).await {
                        Ok(_) => log.borrow_mut().push("old_woke"),
                        Err(_) => log.borrow_mut().push("old_timeout"),
                    }
                    Ok(())
                }
            });
            engine.subscribe(equals("go_old").apply(old_trigger).unwrap()).unwrap();

            let log_new = log.clone();
            let new_trigger = Terminal::new("new_trigger", Priority::Normal, true, move |_state| {
                let log = log_new.clone();
                async move {
                    match wait_until(reply_graph(), Duration::from_millis(300), true, false).await {
                        Ok(_) => log.borrow_mut().push("new_woke"),
                        Err(_) => log.borrow_mut().push("new_timeout"),
                    }
                    Ok(())
                }
            });
            engine.subscribe(equals("go_new").apply(new_trigger).unwrap()).unwrap();

            let source = bot_source();

            let e1 = engine.clone();
            let s1 = source.clone();
            let old_task = tokio::task::spawn_local(async move { e1.handle_event(s1, friend_message("go_old")).await });
            tokio::task::yield_now().await;

            tokio::time::advance(Duration::from_millis(50)).await;

            let e2 = engine.clone();
            let s2 = source.clone();
            let new_task = tokio::task::spawn_local(async move { e2.handle_event(s2, friend_message("go_new")).await });
            tokio::task::yield_now().await;

            engine.handle_event(source.clone(), friend_message("reply")).await;
            new_task.await.unwrap();
            assert_eq!(&*log.borrow(), &["new_woke"]);

            // T_old was left parked and now times out on its own.
            tokio::time::advance(Duration::from_millis(300)).await;
            old_task.await.unwrap();
            assert_eq!(&*log.borrow(), &["new_woke", "old_timeout"]);
        })
        .await;
}
