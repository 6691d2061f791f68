//! Stress tests that hammer pipelines and the registry from many tasks.
//!
//! These tests exercise the concurrency contracts under real parallelism:
//! exactly-once instance creation, serialized transitions with no lost
//! updates, and per-source ordering through effect branches.

#[cfg(test)]
mod stress_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;

    use crate::{Dispatch, Model, ModelHandle, Scope, Switchboard, Wiring};

    // ==========================================================================
    // Test Models
    // ==========================================================================

    #[derive(Clone, PartialEq, Debug, Default)]
    struct TallyState {
        total: i64,
        applied: u64,
    }

    struct Tally;

    impl Model for Tally {
        type State = TallyState;

        fn default_state(&self) -> TallyState {
            TallyState::default()
        }

        fn wire(&self, w: &mut Wiring<Self>) {
            w.mutator("add", |draft, v: &i64| {
                draft.total += v;
                draft.applied += 1;
            });
        }
    }

    /// Echoes its effect input into an append-only log, in arrival order.
    struct EchoLog;

    impl Model for EchoLog {
        type State = Vec<i64>;

        fn default_state(&self) -> Vec<i64> {
            Vec::new()
        }

        fn wire(&self, w: &mut Wiring<Self>) {
            w.mutator("append", |draft, v: &i64| draft.push(*v));
            w.effect("feed", |input, _state| {
                Ok(input.map(|payload| Ok(Dispatch::own("append", payload))))
            });
        }
    }

    /// Counts effect initializations across rebinds.
    struct Beacon {
        inits: Arc<AtomicUsize>,
    }

    impl Model for Beacon {
        type State = i32;

        fn default_state(&self) -> i32 {
            0
        }

        fn wire(&self, w: &mut Wiring<Self>) {
            w.reducer("noop", |s, _: &()| s);
            let inits = self.inits.clone();
            w.effect("watchdog", move |input, _state| {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(input.map(|p| Ok(Dispatch::own("noop", p))))
            });
        }
    }

    /// Vary timing between racing tasks.
    async fn jitter() {
        if fastrand::bool() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_micros(fastrand::u64(0..80))).await;
        }
    }

    // ==========================================================================
    // TEST: Concurrent get_or_create races to one instance
    // ==========================================================================
    //
    // Many tasks request the same singleton at once. Exactly one factory run
    // must win, and every task must observe the winning instance.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let board = Switchboard::new();
        let made = Arc::new(AtomicUsize::new(0));
        let tasks = 64;

        let mut handles = Vec::new();
        for _ in 0..tasks {
            let board = board.clone();
            let made = made.clone();
            handles.push(tokio::spawn(async move {
                jitter().await;
                board.get_or_create(Scope::Singleton, move || {
                    made.fetch_add(1, Ordering::SeqCst);
                    Tally
                })
            }));
        }

        let mut winner: Option<ModelHandle<Tally>> = None;
        for h in handles {
            let handle = h.await.unwrap();
            match &winner {
                None => winner = Some(handle),
                Some(first) => assert!(
                    first.same_instance(&handle),
                    "a racing task observed a different instance"
                ),
            }
        }

        assert_eq!(
            made.load(Ordering::SeqCst),
            1,
            "factory ran {} times for one key",
            made.load(Ordering::SeqCst)
        );
        assert_eq!(board.registered_count(), 1);
    }

    // ==========================================================================
    // TEST: Parallel triggers never lose an update
    // ==========================================================================
    //
    // Transitions are serialized on the apply gate; with N tasks sending K
    // increments each, exactly N * K transitions must land.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_triggers_apply_exactly_once() {
        let board = Switchboard::new();
        let tally = board.get_or_create(Scope::Singleton, || Tally);
        let pipe = tally.bind().unwrap();

        let tasks = 8u64;
        let per_task = 200u64;

        let mut handles = Vec::new();
        for _ in 0..tasks {
            let pipe = pipe.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..per_task {
                    pipe.send("add", 1i64).unwrap();
                    if i % 16 == 0 {
                        jitter().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let state = pipe.state();
        assert_eq!(
            state.applied,
            tasks * per_task,
            "expected {} transitions, got {}",
            tasks * per_task,
            state.applied
        );
        assert_eq!(state.total, (tasks * per_task) as i64);
    }

    // ==========================================================================
    // TEST: Concurrent binds share one engine
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_binds_share_one_engine() {
        let board = Switchboard::new();
        let inits = Arc::new(AtomicUsize::new(0));
        let beacon = board.get_or_create(Scope::Singleton, {
            let inits = inits.clone();
            move || Beacon { inits }
        });

        let mut handles = Vec::new();
        for _ in 0..32 {
            let beacon = beacon.clone();
            handles.push(tokio::spawn(async move {
                jitter().await;
                beacon.bind().unwrap()
            }));
        }

        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        for engine in &engines[1..] {
            assert!(Arc::ptr_eq(&engines[0], engine));
        }

        assert_eq!(
            inits.load(Ordering::SeqCst),
            1,
            "effects initialized more than once"
        );
        assert_eq!(board.binding_count(), 1);
    }

    // ==========================================================================
    // TEST: Transient churn leaves nothing behind after prune
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transient_churn_prunes_clean() {
        let board = Switchboard::new();
        let tasks = 32usize;

        let mut handles = Vec::new();
        for i in 0..tasks {
            let board = board.clone();
            handles.push(tokio::spawn(async move {
                let tally = board.get_or_create(Scope::Transient, || Tally);
                let pipe = tally.bind().unwrap();
                pipe.send("add", i as i64).unwrap();
                jitter().await;
                assert_eq!(pipe.state().total, i as i64);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Every handle is gone; the weak entries are sweepable.
        assert_eq!(board.binding_count(), tasks);
        assert_eq!(board.prune(), tasks);
        assert_eq!(board.binding_count(), 0);
    }

    // ==========================================================================
    // TEST: Effect branch preserves per-sender order under parallel load
    // ==========================================================================
    //
    // One sender pushes a numbered sequence through an effect branch while an
    // unrelated pipeline churns on other workers; the log must come out in
    // the exact order it went in.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_effect_branch_preserves_sender_order() {
        let board = Switchboard::new();
        let log = board.get_or_create(Scope::Singleton, || EchoLog);
        let pipe = log.bind().unwrap();

        let noise = {
            let board = board.clone();
            tokio::spawn(async move {
                let tally = board.get_or_create(Scope::Transient, || Tally);
                let pipe = tally.bind().unwrap();
                for _ in 0..500 {
                    pipe.send("add", 1i64).unwrap();
                }
            })
        };

        let total = 200usize;
        for i in 0..total {
            pipe.send("feed", i as i64).unwrap();
        }

        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            pipe.watch().wait_until(|entries| entries.len() == total),
        )
        .await
        .expect("effect branch stalled")
        .unwrap();

        let expected: Vec<i64> = (0..total as i64).collect();
        assert_eq!(settled, expected);

        noise.await.unwrap();
    }

    // ==========================================================================
    // TEST: Distinct named scopes build independently under contention
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_named_scopes_race_independently() {
        let board = Switchboard::new();
        let made = Arc::new(AtomicUsize::new(0));
        let names = 32;

        let mut handles = Vec::new();
        for i in 0..names {
            // Two tasks per name race to create it.
            for _ in 0..2 {
                let board = board.clone();
                let made = made.clone();
                handles.push(tokio::spawn(async move {
                    jitter().await;
                    board.get_or_create(Scope::named(format!("tally:{i}")), move || {
                        made.fetch_add(1, Ordering::SeqCst);
                        Tally
                    })
                }));
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(made.load(Ordering::SeqCst), names);
        assert_eq!(board.registered_count(), names);
    }
}
