//! Cooperative cancellation of running and waiting calls.
#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use scriptpool::{
        ContextFactory, DiagnosticCallbacks, DiagnosticCategory, EngineLimits, Error,
        InterpreterContext, Invocation, PoolOptions, RhaiFactory, ScriptExecutor, ScriptFault,
        ScriptRequest, SessionConfiguration, ThreadPolicy,
        testutils::{CountingFactory, RecordingCallbacks, ready_pool, wait_until},
    };
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn cancelled_token_fails_before_checkout() {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());
        let recorder = RecordingCallbacks::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .execute(
                ScriptRequest::new("write_verbose(\"never\"); 1"),
                &recorder.callbacks(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(recorder.records().is_empty());
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn cancel_stops_a_sleeping_script_and_keeps_queued_diagnostics() {
        for policy in [ThreadPolicy::NewThreadPerUse, ThreadPolicy::ReuseThread] {
            let pool = ready_pool(
                CountingFactory::rhai(),
                PoolOptions::new(1, 1).with_thread_policy(policy),
            )
            .await
            .unwrap();
            let executor = ScriptExecutor::new(pool.clone());
            let recorder = RecordingCallbacks::new();
            let cancel = CancellationToken::new();
            cancel_after(&cancel, Duration::from_millis(100));

            let started = Instant::now();
            let err = executor
                .execute(
                    ScriptRequest::new(
                        "write_verbose(\"before\"); sleep(5000); write_verbose(\"after\");",
                    ),
                    &recorder.callbacks(),
                    &cancel,
                )
                .await
                .unwrap_err();
            assert!(err.is_cancelled(), "{policy:?}: {err:?}");
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(recorder.messages(DiagnosticCategory::Verbose), vec!["before"]);

            // The context is reclaimed once the script reaches its checkpoint.
            assert!(
                wait_until(Duration::from_secs(2), || pool.status().idle == 1).await,
                "{policy:?}: {:?}",
                pool.status()
            );
            assert_eq!(pool.status().live, 1);
            assert_eq!(executor.run("1").await.unwrap().into_vec(), vec![json!(1)]);
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_a_busy_loop() {
        let unlimited = EngineLimits::default().with_max_operations(0);
        let factory = RhaiFactory::new().with_limits(unlimited);
        let pool = ready_pool(CountingFactory::new(factory), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(50));

        let err = executor
            .execute(
                ScriptRequest::new("let n = 0; loop { n += 1; }"),
                &RecordingCallbacks::new().callbacks(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(wait_until(Duration::from_secs(2), || pool.status().idle == 1).await);
    }

    /// Emits verbose records for a while and never looks at its cancel token.
    struct Chatty;

    impl ContextFactory for Chatty {
        fn create(
            &self,
            _config: &SessionConfiguration,
        ) -> scriptpool::Result<Box<dyn InterpreterContext>> {
            Ok(Box::new(Chatty))
        }
    }

    impl InterpreterContext for Chatty {
        fn invoke(&mut self, invocation: Invocation<'_>) -> Result<Vec<Value>, ScriptFault> {
            let until = Instant::now() + Duration::from_millis(1500);
            while Instant::now() < until {
                invocation.diagnostics.verbose("tick");
                std::thread::sleep(Duration::from_micros(500));
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_returns_while_an_uncooperative_context_keeps_emitting() {
        let pool = ready_pool(CountingFactory::new(Chatty), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());
        // Slower than the producer, so the queue never runs dry on its own.
        let callbacks = DiagnosticCallbacks::new()
            .with_verbose(|_| std::thread::sleep(Duration::from_millis(1)));
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(100));

        let started = Instant::now();
        let err = executor
            .execute(ScriptRequest::new("ignored"), &callbacks, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "cancel took {:?}",
            started.elapsed()
        );

        // The context comes back once it finishes on its own.
        assert!(wait_until(Duration::from_secs(3), || pool.status().idle == 1).await);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_a_context() {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());
        let held = pool.checkout().await.unwrap();

        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(50));
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            executor.execute(
                ScriptRequest::new("1"),
                &RecordingCallbacks::new().callbacks(),
                &cancel,
            ),
        )
        .await
        .expect("cancellation must end the wait")
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));

        drop(held);
        let status = pool.status();
        assert_eq!((status.live, status.idle), (1, 1));
    }
}
