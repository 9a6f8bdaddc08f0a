//! Delivery of diagnostic records to caller callbacks.
#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use scriptpool::{
        DiagnosticCallbacks, DiagnosticCategory, DiagnosticRecord, Error, PoolOptions,
        ProgressRecordType, ScriptExecutor, ScriptRequest,
        testutils::{CountingFactory, RecordingCallbacks, ready_pool},
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn executor() -> ScriptExecutor {
        let pool = ready_pool(CountingFactory::rhai(), PoolOptions::new(1, 2))
            .await
            .unwrap();
        ScriptExecutor::new(pool)
    }

    async fn run_with(
        executor: &ScriptExecutor,
        script: &str,
        callbacks: &DiagnosticCallbacks,
    ) -> scriptpool::Result<Vec<serde_json::Value>> {
        executor
            .execute(
                ScriptRequest::new(script),
                callbacks,
                &CancellationToken::new(),
            )
            .await
            .map(|r| r.into_vec())
    }

    #[tokio::test]
    async fn progress_is_reported_in_order() {
        let executor = executor().await;
        let recorder = RecordingCallbacks::new();
        run_with(
            &executor,
            "write_progress(\"work\", 50); write_progress(\"work\", 100);",
            &recorder.callbacks(),
        )
        .await
        .unwrap();
        assert_eq!(recorder.progress_percents(), vec![50, 100]);
        assert_eq!(recorder.records().len(), 2);
    }

    #[tokio::test]
    async fn progress_carries_status_and_completion() {
        let executor = executor().await;
        let recorder = RecordingCallbacks::new();
        run_with(
            &executor,
            r#"
                write_progress("copy", 10, "starting", "a.txt");
                complete_progress("copy");
            "#,
            &recorder.callbacks(),
        )
        .await
        .unwrap();
        let records = recorder.records();
        let DiagnosticRecord::Progress(first) = &records[0] else {
            panic!("expected progress, got {:?}", records[0]);
        };
        assert_eq!(first.status_description, "starting");
        assert_eq!(first.current_operation.as_deref(), Some("a.txt"));
        let DiagnosticRecord::Progress(last) = &records[1] else {
            panic!("expected progress, got {:?}", records[1]);
        };
        assert_eq!(last.record_type, ProgressRecordType::Completed);
        assert!(last.is_final());
    }

    #[tokio::test]
    async fn records_within_a_category_keep_emission_order() {
        let executor = executor().await;
        let recorder = RecordingCallbacks::new();
        run_with(
            &executor,
            "for i in 0..100 { write_verbose(`v${i}`); write_debug(`d${i}`); }",
            &recorder.callbacks(),
        )
        .await
        .unwrap();
        let verbose: Vec<_> = (0..100).map(|i| format!("v{i}")).collect();
        let debug: Vec<_> = (0..100).map(|i| format!("d{i}")).collect();
        assert_eq!(recorder.messages(DiagnosticCategory::Verbose), verbose);
        assert_eq!(recorder.messages(DiagnosticCategory::Debug), debug);
    }

    #[tokio::test]
    async fn every_category_reaches_its_callback() {
        let executor = executor().await;
        let recorder = RecordingCallbacks::new();
        let result = run_with(
            &executor,
            r#"
                write_verbose("v");
                debug("d");
                print("i");
                write_warning("w");
                write_error("e");
                write_progress("p", 1);
                "done"
            "#,
            &recorder.callbacks(),
        )
        .await
        .unwrap();
        assert_eq!(result, vec![json!("done")]);

        for category in DiagnosticCategory::ALL {
            assert_eq!(
                recorder.messages(category).len(),
                1,
                "{category} should have one record"
            );
        }
        let records = recorder.records();
        let information = records
            .iter()
            .find_map(|r| match r {
                DiagnosticRecord::Information(i) => Some(i.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(information.source.as_deref(), Some("print"));
        let error = records
            .iter()
            .find_map(|r| match r {
                DiagnosticRecord::Error(e) => Some(e.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error.location.as_deref(), Some("line 6"));
    }

    #[tokio::test]
    async fn unregistered_categories_are_dropped() {
        let executor = executor().await;
        let recorder = RecordingCallbacks::new();
        let callbacks = recorder.callbacks_for(&[DiagnosticCategory::Progress]);
        run_with(
            &executor,
            "write_verbose(\"v\"); write_warning(\"w\"); write_progress(\"p\", 5);",
            &callbacks,
        )
        .await
        .unwrap();
        assert_eq!(recorder.progress_percents(), vec![5]);
        assert_eq!(recorder.records().len(), 1);

        // No callbacks at all is fine too.
        assert_eq!(
            executor.run("write_warning(\"ignored\"); 1").await.unwrap().into_vec(),
            vec![json!(1)]
        );
    }

    #[tokio::test]
    async fn failing_callback_is_reported_without_stopping_delivery() {
        let executor = executor().await;
        let verbose = Arc::new(Mutex::new(Vec::new()));
        let verbose_c = verbose.clone();
        let callbacks = DiagnosticCallbacks::new()
            .with_warning(|w| panic!("cannot handle {}", w.message))
            .with_verbose(move |v| verbose_c.lock().unwrap().push(v.message.clone()));

        let err = run_with(
            &executor,
            r#"
                write_verbose("a");
                write_warning("w1");
                write_verbose("b");
                write_warning("w2");
                write_verbose("c");
                42
            "#,
            &callbacks,
        )
        .await
        .unwrap_err();

        assert_eq!(*verbose.lock().unwrap(), vec!["a", "b", "c"]);
        let Error::CallbackFailed { faults } = err else {
            panic!("expected CallbackFailed, got {err:?}");
        };
        assert_eq!(faults.len(), 2);
        assert!(faults.iter().all(|f| f.category == DiagnosticCategory::Warning));
        assert_eq!(faults[0].message, "cannot handle w1");
        assert_eq!(faults[1].index, 1);

        // The pool is unaffected.
        assert_eq!(executor.run("1").await.unwrap().into_vec(), vec![json!(1)]);
    }

    #[tokio::test]
    async fn callback_faults_join_script_faults() {
        let executor = executor().await;
        let callbacks = DiagnosticCallbacks::new().with_error(|_| panic!("handler down"));
        let err = run_with(
            &executor,
            "write_error(\"first\"); throw \"fatal\";",
            &callbacks,
        )
        .await
        .unwrap_err();
        match &err {
            Error::ScriptExecution {
                message,
                callback_faults,
                ..
            } => {
                assert_eq!(message, "fatal");
                assert_eq!(callback_faults.len(), 1);
                assert_eq!(callback_faults[0].category, DiagnosticCategory::Error);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.callback_faults().len(), 1);
    }
}
