use super::*;
use crate::cancel::CancellationToken;
use crate::sync_context::SyncContext;
use crate::task::{TaskState, yield_now};
use crate::test_utils::*;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Factory: Send, Sync, Clone);
assert_impl_all!(MainThreadScheduler: Send, Sync, Spawn);
assert_impl_all!(PoolScheduler: Send, Sync, Spawn);
assert_impl_all!(SwitchToMainThread: Send);
assert_impl_all!(crate::task::JoinHandle<i32>: Send);

#[test]
fn test_run_round_trips_between_main_and_pool() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let main_id = thread::current().id();

    let f = factory.clone();
    let out = factory.run(async move {
        assert_eq!(thread::current().id(), main_id);
        f.switch_to_thread_pool().await;
        assert_ne!(thread::current().id(), main_id);
        f.switch_to_main_thread().await.unwrap();
        assert_eq!(thread::current().id(), main_id);
        42
    });
    assert_eq!(out, 42);
}

#[test]
fn test_run_completes_synchronous_future_inline() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();

    assert_eq!(factory.run(async { 5 }), 5);

    let handle = factory.run_async(async { 6 });
    assert!(handle.is_finished());
    assert_eq!(handle.state(), TaskState::CompletedSynchronously);
    assert_eq!(handle.join().unwrap(), 6);
}

#[test]
#[should_panic(expected = "boom")]
fn test_run_resumes_task_panics() {
    let (ctx, _dispatcher) = context_on_current_thread();
    ctx.factory().run(async { panic!("boom") });
}

#[test]
fn test_switch_is_immediately_ready_only_on_main() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();

    // On the main thread, inside a task: ready without suspension.
    let f = factory.clone();
    let out = factory.run(async move {
        f.switch_to_main_thread().await.unwrap();
        1
    });
    assert_eq!(out, 1);

    // Off the main thread the same await must suspend until someone pumps;
    // here the creating task's own handle join provides the pump.
    let hopped = AsyncFlag::new();
    let handle = {
        let factory = factory.clone();
        let hopped = hopped.clone();
        thread::spawn(move || {
            let f = factory.clone();
            factory.run_async(async move {
                f.switch_to_main_thread().await.unwrap();
                hopped.set();
            })
        })
        .join()
        .unwrap()
    };
    assert!(!hopped.wait_blocking(Duration::from_millis(100)));
    handle.join().unwrap();
    assert!(hopped.is_set());
}

// A worker-thread `run` whose task needs the main thread cannot finish
// until the main thread joins the collection and pumps it.
#[test]
fn test_worker_run_waits_for_main_thread_join() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let collection = ctx.create_collection();
    let factory = ctx.create_factory(&collection);

    let switched = AsyncFlag::new();
    let worker = {
        let factory = factory.clone();
        let switched = switched.clone();
        thread::spawn(move || {
            let f = factory.clone();
            factory.run(async move {
                f.switch_to_main_thread().await.unwrap();
                switched.set();
                7
            })
        })
    };

    assert!(!switched.wait_blocking(Duration::from_millis(150)));

    let out = factory.run({
        let collection = collection.clone();
        let switched = switched.clone();
        async move {
            delay(Duration::from_millis(50)).await;
            assert!(!switched.is_set());
            let _joined = collection.join();
            switched.wait().await;
            11
        }
    });
    assert_eq!(out, 11);
    assert_eq!(worker.join().unwrap(), 7);
}

// A sync context captured inside `run` still delivers posts to the main
// thread afterwards, through the host's nested loop frame.
#[test]
fn test_posted_callback_reaches_main_through_nested_frame() {
    let (ctx, dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let main_id = thread::current().id();

    let captured = factory.run(async { SyncContext::current().unwrap() });

    let exit = Arc::new(AtomicBool::new(false));
    {
        let captured = captured.clone();
        let exit = exit.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            captured.post(move || {
                assert_eq!(thread::current().id(), main_id);
                exit.store(true, Ordering::Release);
            });
        });
    }
    dispatcher.run_frame(|| exit.load(Ordering::Acquire));
    assert!(exit.load(Ordering::Acquire));
}

#[test]
fn test_yields_resume_on_main_during_join() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let main_id = thread::current().id();

    let handle = factory.run_async(async move {
        yield_now().await;
        assert_eq!(thread::current().id(), main_id);
        yield_now().await;
        assert_eq!(thread::current().id(), main_id);
        7
    });
    assert!(!handle.is_finished());
    assert_eq!(handle.join().unwrap(), 7);
}

#[test]
fn test_transition_counters_balance() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let recorder = Arc::new(TransitionRecorder::default());
    let _reg = ctx.add_transition_listener(recorder.clone());

    let f = factory.clone();
    let handle = factory.run_async(async move {
        // Already on the main thread: counts zero.
        f.switch_to_main_thread().await.unwrap();
        f.switch_to_thread_pool().await;
        f.switch_to_main_thread().await.unwrap();
        f.switch_to_thread_pool().await;
        f.switch_to_main_thread().await.unwrap();
    });
    let id = handle.id();
    handle.join().unwrap();

    assert_eq!(recorder.transitioning_count(id), 2);
    assert_eq!(recorder.transitioned_count(id), 2);
    assert_eq!(recorder.cancelled_count(id), 0);
}

async fn ping_pong(factory: Factory, deadline: Instant) {
    while Instant::now() < deadline {
        factory.switch_to_main_thread().await.unwrap();
        factory.switch_to_thread_pool().await;
    }
}

// Two factories over two collections, cross-joined, hammering both lanes:
// must drain to zero without deadlock.
#[test]
fn test_cross_joined_factories_stress() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k1 = ctx.create_collection();
    let k2 = ctx.create_collection();
    let f1 = ctx.create_factory(&k1);
    let f2 = ctx.create_factory(&k2);

    let deadline = Instant::now() + Duration::from_millis(500);
    let out = f1.run({
        let (f1, f2, k2) = (f1.clone(), f2.clone(), k2.clone());
        async move {
            let _cross = k2.join();
            let a = f1.run_async(ping_pong(f1.clone(), deadline));
            let b = f2.run_async(ping_pong(f2.clone(), deadline));
            a.await.unwrap();
            b.await.unwrap();
            0
        }
    });
    assert_eq!(out, 0);
    assert!(k1.member_ids().is_empty());
    assert!(k2.member_ids().is_empty());
}

// Work of an unrelated collection stays filtered while the main thread is
// blocked, runs promptly once joined, and new work filters again after the
// scope closes.
#[test]
fn test_unrelated_work_filtered_until_join_and_after_revert() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k2 = ctx.create_collection();
    let f2 = ctx.create_factory(&k2);
    let factory = ctx.factory();

    let first = AsyncFlag::new();
    let second = AsyncFlag::new();
    let resume = AsyncFlag::new();

    // Start the unrelated task from a plain thread so it is nobody's child.
    let unrelated = {
        let f2 = f2.clone();
        let (first, resume, second) = (first.clone(), resume.clone(), second.clone());
        thread::spawn(move || {
            let f = f2.clone();
            f2.run_async(async move {
                f.switch_to_main_thread().await.unwrap();
                first.set();
                // The resumption after this await is a fresh main-thread
                // continuation, posted after the join scope has closed.
                resume.wait().await;
                second.set();
            })
        })
        .join()
        .unwrap()
    };

    let out = factory.run({
        let k2 = k2.clone();
        let (first, resume, second) = (first.clone(), resume.clone(), second.clone());
        async move {
            delay(Duration::from_millis(80)).await;
            assert!(!first.is_set());

            let joined = k2.join();
            first.wait().await;
            drop(joined);

            resume.set();
            delay(Duration::from_millis(150)).await;
            assert!(!second.is_set());

            let _rejoined = k2.join();
            second.wait().await;
            0
        }
    });
    assert_eq!(out, 0);
    assert!(unrelated.is_finished());
}

// A -> B -> A join cycle must not hang the closure walk.
#[test]
fn test_join_cycle_completes() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let ka = ctx.create_collection();
    let kb = ctx.create_collection();
    let fa = ctx.create_factory(&ka);
    let fb = ctx.create_factory(&kb);

    let b_done = AsyncFlag::new();
    let b = {
        let fb = fb.clone();
        let ka = ka.clone();
        let b_done = b_done.clone();
        thread::spawn(move || {
            let f = fb.clone();
            fb.run_async(async move {
                let _cycle = ka.join();
                f.switch_to_main_thread().await.unwrap();
                b_done.set();
            })
        })
        .join()
        .unwrap()
    };

    let out = fa.run({
        let kb = kb.clone();
        let b_done = b_done.clone();
        async move {
            let _edge = kb.join();
            b_done.wait().await;
            1
        }
    });
    assert_eq!(out, 1);
    assert!(b.is_finished());
}

// With no main-thread sink installed, every entry point still works and the
// main-thread switch is a no-op.
#[test]
fn test_headless_context_is_noop_for_main_switch() {
    let ctx = headless_context();
    let factory = ctx.factory();
    let here = thread::current().id();

    let f = factory.clone();
    let out = factory.run(async move {
        f.switch_to_main_thread().await.unwrap();
        thread::current().id()
    });
    assert_eq!(out, here);

    let worker_out = {
        let factory = factory.clone();
        thread::spawn(move || {
            let f = factory.clone();
            factory.run(async move {
                f.switch_to_main_thread().await.unwrap();
                1
            })
        })
        .join()
        .unwrap()
    };
    assert_eq!(worker_out, 1);
}

// A task created under suppressed relevance is not the blocker's child, so
// its main-thread work needs an explicit join.
#[test]
fn test_suppressed_task_needs_explicit_join() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k = ctx.create_collection();
    let f2 = ctx.create_factory(&k);
    let factory = ctx.factory();

    let reached_main = AsyncFlag::new();
    let out = factory.run({
        let ctx = ctx.clone();
        let k = k.clone();
        let reached_main = reached_main.clone();
        async move {
            let inner = {
                let _hidden = ctx.suppress_relevance();
                let f = f2.clone();
                let reached = reached_main.clone();
                f2.run_async(async move {
                    f.switch_to_thread_pool().await;
                    f.switch_to_main_thread().await.unwrap();
                    reached.set();
                })
            };

            delay(Duration::from_millis(100)).await;
            assert!(!reached_main.is_set());

            let _joined = k.join();
            reached_main.wait().await;
            inner.await.unwrap();
            0
        }
    });
    assert_eq!(out, 0);
}

// Joining a collection twice concurrently and closing both scopes leaves
// the edge counts at baseline.
#[test]
fn test_double_join_restores_baseline() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k = ctx.create_collection();
    let factory = ctx.factory();

    factory.run({
        let k = k.clone();
        async move {
            let g1 = k.join();
            let g2 = k.join();
            assert_eq!(k.join_edge_count(), 2);
            drop(g1);
            assert_eq!(k.join_edge_count(), 1);
            drop(g2);
            assert_eq!(k.join_edge_count(), 0);
        }
    });
}

#[test]
fn test_cancelled_switch_fails_off_main() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k = ctx.create_collection();
    let factory = ctx.create_factory(&k);
    let recorder = Arc::new(TransitionRecorder::default());
    let _reg = ctx.add_transition_listener(recorder.clone());

    let token = CancellationToken::new();
    let requested = AsyncFlag::new();
    let outcome = AsyncFlag::new();
    let main_id = thread::current().id();

    let handle = {
        let factory = factory.clone();
        let token = token.clone();
        let (requested, outcome) = (requested.clone(), outcome.clone());
        thread::spawn(move || {
            let f = factory.clone();
            factory.run_async(async move {
                f.switch_to_thread_pool().await;
                requested.set();
                let result = f.switch_to_main_thread().cancellable_with(&token).await;
                assert_eq!(result, Err(SwitchError::Cancelled));
                // Cancellation must never deliver on the main thread.
                assert_ne!(thread::current().id(), main_id);
                outcome.set();
            })
        })
        .join()
        .unwrap()
    };

    assert!(requested.wait_blocking(Duration::from_secs(2)));
    // Give the switch a moment to queue its grant before cancelling it.
    thread::sleep(Duration::from_millis(30));
    token.cancel();
    assert!(outcome.wait_blocking(Duration::from_secs(2)));
    assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));

    let id = handle.id();
    assert_eq!(recorder.transitioning_count(id), 1);
    assert_eq!(recorder.transitioned_count(id), 1);
    assert_eq!(recorder.cancelled_count(id), 1);
}

// A worker blocked in `run` must execute its own task's rerouted pool
// continuations inline rather than deadlock against them.
#[test]
fn test_worker_blocker_drains_own_pool_work_inline() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();

    let (blocked_thread, resumed_thread) = thread::spawn(move || {
        let blocked = thread::current().id();
        let resumed = factory.run(async move {
            delay(Duration::from_millis(100)).await;
            thread::current().id()
        });
        (blocked, resumed)
    })
    .join()
    .unwrap();
    assert_eq!(blocked_thread, resumed_thread);
}

#[test]
fn test_run_joined_admits_collection_members() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k = ctx.create_collection();
    let f2 = ctx.create_factory(&k);
    let factory = ctx.factory();

    let reached = AsyncFlag::new();
    let member = {
        let f2 = f2.clone();
        let reached = reached.clone();
        thread::spawn(move || {
            let f = f2.clone();
            f2.run_async(async move {
                f.switch_to_main_thread().await.unwrap();
                reached.set();
            })
        })
        .join()
        .unwrap()
    };

    factory.run_joined(&k, {
        let reached = reached.clone();
        async move {
            reached.wait().await;
        }
    });
    assert!(reached.is_set());
    assert!(member.is_finished());
}

#[test]
fn test_main_scheduler_runs_on_main_with_transitions() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let recorder = Arc::new(TransitionRecorder::default());
    let _reg = ctx.add_transition_listener(recorder.clone());
    let main_id = thread::current().id();

    let scheduler = factory.main_scheduler();
    let handle = thread::spawn(move || scheduler.spawn(async move { thread::current().id() }))
        .join()
        .unwrap();
    let id = handle.id();
    let out = handle.join().unwrap();
    assert_eq!(out, main_id);
    assert_eq!(recorder.transitioning_count(id), 1);
    assert_eq!(recorder.transitioned_count(id), 1);
}

#[test]
fn test_pool_scheduler_runs_off_main() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let main_id = thread::current().id();

    let handle = factory.pool_scheduler().spawn(async move { thread::current().id() });
    let out = handle.join().unwrap();
    assert_ne!(out, main_id);
}

#[test]
fn test_send_runs_on_main_and_returns_value() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let main_id = thread::current().id();

    let out = factory.run(async move {
        let captured = SyncContext::current().unwrap();
        let done = AsyncFlag::new();
        {
            let done = done.clone();
            thread::spawn(move || {
                let value = captured.send(move || {
                    assert_eq!(thread::current().id(), main_id);
                    5
                });
                assert_eq!(value, 5);
                done.set();
            });
        }
        done.wait().await;
        0
    });
    assert_eq!(out, 0);
}

#[test]
fn test_nested_run_composes() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();

    let f = factory.clone();
    let out = factory.run(async move {
        let inner_factory = f.clone();
        f.switch_to_thread_pool().await;
        f.switch_to_main_thread().await.unwrap();

        let g = inner_factory.clone();
        let inner = inner_factory.run(async move {
            g.switch_to_thread_pool().await;
            g.switch_to_main_thread().await.unwrap();
            21
        });
        inner * 2
    });
    assert_eq!(out, 42);
}

#[test]
fn test_always_yield_defers_even_on_main() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let recorder = Arc::new(TransitionRecorder::default());
    let _reg = ctx.add_transition_listener(recorder.clone());

    let f = factory.clone();
    let handle = factory.run_async(async move {
        f.switch_to_main_thread().always_yield().await.unwrap();
        7
    });
    assert!(!handle.is_finished());
    let id = handle.id();
    assert_eq!(handle.join().unwrap(), 7);

    // Staying on the main thread is not a transition.
    assert_eq!(recorder.transitioning_count(id), 0);
    assert_eq!(recorder.transitioned_count(id), 0);
}

// A switch awaited outside any joinable task parks on a transient
// free-floating task, reachable through the factory's collection.
#[test]
fn test_switch_outside_task_is_reachable_through_collection() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let k = ctx.create_collection();
    let factory = ctx.create_factory(&k);

    let granted = AsyncFlag::new();
    let foreign = {
        let factory = factory.clone();
        let granted = granted.clone();
        thread::spawn(move || {
            futures::executor::block_on(async move {
                factory.switch_to_main_thread().await.unwrap();
                granted.set();
            });
        })
    };

    assert!(!granted.wait_blocking(Duration::from_millis(100)));

    ctx.factory().run_joined(&k, {
        let granted = granted.clone();
        async move {
            granted.wait().await;
        }
    });
    foreign.join().unwrap();
    assert!(granted.is_set());
}

#[test]
fn test_ambient_identity_flows_and_suppresses() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();

    let ctx2 = ctx.clone();
    let f = factory.clone();
    factory.run(async move {
        let id = crate::task::current();
        {
            let _hidden = ctx2.suppress_relevance();
            assert_eq!(crate::task::try_current(), None);
        }
        assert_eq!(crate::task::current(), id);

        // Identity follows the task across a lane change.
        f.switch_to_thread_pool().await;
        assert_eq!(crate::task::current(), id);
    });
}

#[test]
fn test_run_cancellable_abandons_wait_on_worker() {
    let (ctx, _dispatcher) = context_on_current_thread();
    let factory = ctx.factory();
    let token = CancellationToken::new();
    let never = AsyncFlag::new();

    let waiter = {
        let factory = factory.clone();
        let token = token.clone();
        let never = never.clone();
        thread::spawn(move || {
            factory.run_cancellable(
                async move {
                    never.wait().await;
                    1
                },
                &token,
            )
        })
    };

    thread::sleep(Duration::from_millis(50));
    token.cancel();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(crate::task::JoinError::Cancelled)));

    // The abandoned task is detached, not dead: it still completes.
    never.set();
}
