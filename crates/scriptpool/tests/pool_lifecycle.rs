//! Pool lifecycle: opening, bounds, growth, disposal.
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scriptpool::{
        ContextFactory, Error, ExecutionContextPool, InterpreterContext, PoolOptions, PoolState,
        ScriptExecutor, SessionConfiguration, ThreadPolicy,
        testutils::{CountingFactory, ready_pool, wait_until},
    };
    use serde_json::json;
    use tracing_subscriber::fmt;

    #[tokio::test]
    async fn execute_before_initialize_fails_without_blocking() {
        fmt::try_init().ok();
        let pool = ExecutionContextPool::new(CountingFactory::rhai());
        let executor = ScriptExecutor::new(pool);
        let result = tokio::time::timeout(Duration::from_secs(1), executor.run("1"))
            .await
            .expect("execute must not block on an uninitialized pool");
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn failed_open_is_atomic_and_retryable() {
        let factory = CountingFactory::rhai().fail_at(2);
        let pool = ExecutionContextPool::new(factory.clone());

        let err = pool
            .initialize(PoolOptions::new(3, 4), SessionConfiguration::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(pool.state(), PoolState::Uninitialized);
        assert_eq!(pool.status().live, 0);
        assert_eq!(factory.live(), 0);

        pool.initialize(PoolOptions::new(3, 4), SessionConfiguration::default())
            .await
            .unwrap();
        let status = pool.status();
        assert_eq!(status.state, PoolState::Ready);
        assert_eq!((status.live, status.idle), (3, 3));
        assert_eq!(factory.live(), 3);
    }

    struct Panicking;

    impl ContextFactory for Panicking {
        fn create(
            &self,
            _config: &SessionConfiguration,
        ) -> scriptpool::Result<Box<dyn InterpreterContext>> {
            panic!("interpreter setup blew up")
        }
    }

    #[tokio::test]
    async fn panicking_factory_is_a_configuration_error() {
        for policy in [ThreadPolicy::NewThreadPerUse, ThreadPolicy::ReuseThread] {
            let pool = ExecutionContextPool::new(Panicking);
            let err = pool
                .initialize(
                    PoolOptions::new(1, 1).with_thread_policy(policy),
                    SessionConfiguration::default(),
                )
                .await
                .unwrap_err();
            match err {
                Error::Configuration(message) => {
                    assert!(message.contains("interpreter setup blew up"), "{message}")
                }
                other => panic!("{policy:?}: unexpected error {other:?}"),
            }
            assert_eq!(pool.state(), PoolState::Uninitialized);
        }
    }

    #[tokio::test]
    async fn unknown_module_fails_open() {
        let pool = ExecutionContextPool::new(CountingFactory::rhai());
        let config = SessionConfiguration::builder()
            .with_module("nowhere")
            .build()
            .unwrap();
        let err = pool
            .initialize(PoolOptions::default(), config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("nowhere")));
        assert_eq!(pool.state(), PoolState::Uninitialized);
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::default())
            .await
            .unwrap();
        let err = pool
            .initialize(PoolOptions::default(), SessionConfiguration::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn disposed_pool_stays_disposed() {
        let factory = CountingFactory::rhai();
        let pool = ready_pool(factory.clone(), PoolOptions::new(2, 4))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());

        pool.dispose();
        pool.dispose();
        assert_eq!(pool.state(), PoolState::Disposed);
        assert_eq!(factory.live(), 0);

        assert!(matches!(executor.run("1").await, Err(Error::NotInitialized)));
        assert!(matches!(
            pool.initialize(PoolOptions::default(), SessionConfiguration::default())
                .await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn dispose_lets_in_flight_work_finish() {
        let factory = CountingFactory::rhai();
        let pool = ready_pool(factory.clone(), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());

        let running = tokio::spawn(async move { executor.run("sleep(100); 7").await });
        assert!(wait_until(Duration::from_secs(1), || pool.status().borrowed == 1).await);
        pool.dispose();
        assert_eq!(pool.status().live, 1, "borrowed context survives dispose");

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.into_vec(), vec![json!(7)]);
        assert_eq!(pool.status().live, 0);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn waiting_checkout_fails_on_dispose() {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::new(1, 1))
            .await
            .unwrap();
        let held = pool.checkout().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        pool.dispose();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::NotInitialized)));
        drop(held);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn extra_caller_waits_for_a_release() {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::new(1, 2))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());
        let first = pool.checkout().await.unwrap();
        let _second = pool.checkout().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), executor.run("1")).await;
        assert!(blocked.is_err(), "third caller must wait while two contexts are out");

        drop(first);
        let result = tokio::time::timeout(Duration::from_secs(1), executor.run("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.into_vec(), vec![json!(1)]);
        assert_eq!(pool.status().live, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_count_stays_within_bounds_under_load() {
        let factory = CountingFactory::rhai();
        let pool = ready_pool(factory.clone(), PoolOptions::new(1, 3))
            .await
            .unwrap();
        let executor = ScriptExecutor::new(pool.clone());

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.run(format!("sleep(20); {i}")).await })
            })
            .collect();
        for task in tasks {
            let status = pool.status();
            assert!(status.live >= 1 && status.live <= 3, "{status:?}");
            task.await.unwrap().unwrap();
        }
        let status = pool.status();
        assert!(status.live <= 3);
        assert_eq!(status.borrowed, 0);
        assert!(factory.created() <= 3);
        assert!(factory.peak() <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abandoned_checkouts_never_exceed_max() {
        for policy in [ThreadPolicy::NewThreadPerUse, ThreadPolicy::ReuseThread] {
            let factory = CountingFactory::rhai();
            let pool = ready_pool(
                factory.clone(),
                PoolOptions::new(1, 2).with_thread_policy(policy),
            )
            .await
            .unwrap();
            let held = pool.checkout().await.unwrap();

            factory.set_delay(Duration::from_millis(150));
            for _ in 0..3 {
                let abandoned =
                    tokio::time::timeout(Duration::from_millis(5), pool.checkout()).await;
                assert!(abandoned.is_err(), "{policy:?}");
            }
            factory.set_delay(Duration::ZERO);

            let again = tokio::time::timeout(Duration::from_secs(2), pool.checkout())
                .await
                .expect("a context should become available")
                .unwrap();
            assert!(factory.peak() <= 2, "{policy:?}: peak {}", factory.peak());
            assert_eq!(pool.status().live, 2, "{policy:?}");
            drop((held, again));
            pool.dispose();
        }
    }

    #[tokio::test]
    async fn reuse_thread_pins_each_context_to_one_thread() {
        let pool = ready_pool(
            CountingFactory::rhai(),
            PoolOptions::new(1, 1).with_thread_policy(ThreadPolicy::ReuseThread),
        )
        .await
        .unwrap();
        let executor = ScriptExecutor::new(pool.clone());

        let first = executor.run("thread_tag()").await.unwrap().into_vec();
        let second = executor.run("thread_tag()").await.unwrap().into_vec();
        assert_eq!(first, second);
        let tag = first[0].as_str().unwrap();
        assert!(tag.starts_with("scriptpool-context-"), "{tag}");

        let context = pool.checkout().await.unwrap();
        assert_eq!(context.thread_policy(), Some(ThreadPolicy::ReuseThread));
    }
}
