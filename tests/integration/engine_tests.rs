//! Engine facade integration tests
//!
//! Registration, enqueue validation, history, progress and store injection.

#[cfg(test)]
mod tests {
    use crate::common::fixtures::{Flaky, Gate, Recorder, fast_config, fast_engine, register};
    use crate::common::{wait_until, within};
    use crate::{assert_err, assert_ok};
    use async_trait::async_trait;
    use batch_ops::{
        HandlerContext, HandlerError, HandlerOutput, HistoryFilter,
        InMemoryOperationStore, Operation, OperationEngine, OperationHandler, OperationId,
        OperationResult, OperationSpec, OperationStatus, OperationStore, OperationType, OpsError,
        QueueItemSpec, handler_fn,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ==================== Registration and enqueue ====================

    #[test]
    fn test_register_rejects_empty_title() {
        let engine = fast_engine();
        let err = assert_err!(
            engine.register_operation(OperationSpec::new(OperationType::Import, "   "))
        );
        assert!(matches!(err, OpsError::Validation(_)));
    }

    #[test]
    fn test_register_defaults() {
        let engine = fast_engine();
        let op = register(&engine, OperationType::Export, "Export");
        let operation = engine.get_operation(&op).unwrap();

        assert_eq!(operation.status, OperationStatus::Pending);
        assert_eq!(operation.created_by, "system");
        assert_eq!(operation.cycle, 1);
        assert_eq!(operation.total_items, 0);
        assert!(operation.started_at.is_none());
    }

    struct NeedsIds;

    #[async_trait]
    impl OperationHandler for NeedsIds {
        async fn handle(
            &self,
            _ctx: HandlerContext,
            payload: serde_json::Value,
        ) -> Result<HandlerOutput, HandlerError> {
            let ids = payload["ids"].as_array().map(Vec::len).unwrap_or(0) as u64;
            Ok(HandlerOutput::items(ids, 0))
        }

        fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
            if payload["ids"].is_array() {
                Ok(())
            } else {
                Err("ids must be an array".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_preflight_validation_blocks_enqueue() {
        let engine = fast_engine();
        engine.register_handler(OperationType::BulkDelete, Arc::new(NeedsIds));
        let op = engine
            .register_operation(
                OperationSpec::new(OperationType::BulkDelete, "Purge").with_total_items(5),
            )
            .unwrap();

        let err = assert_err!(engine.enqueue(&op, QueueItemSpec::new(json!({"ids": "all"}))));
        assert!(matches!(err, OpsError::Validation(_)));
        assert!(err.to_string().contains("ids must be an array"));
        assert!(engine.list_queue_items().is_empty());

        assert_ok!(engine.enqueue(&op, QueueItemSpec::new(json!({"ids": [1, 2, 3]}))));
        assert_ok!(engine.enqueue(&op, QueueItemSpec::new(json!({"ids": [4, 5]}))));
        assert_ok!(engine.drain().await);

        let operation = engine.get_operation(&op).unwrap();
        assert_eq!(operation.total_items, 5);
        assert_eq!(operation.processed_items, 5);
        assert_eq!(operation.success_items, 5);
        assert_eq!(operation.progress, 100.0);
    }

    #[test]
    fn test_unknown_handler_is_validation_error() {
        let engine = fast_engine();
        let op = register(&engine, OperationType::Import, "Import");
        let err = assert_err!(engine.enqueue(&op, QueueItemSpec::default()));
        assert!(matches!(err, OpsError::Validation(_)));
    }

    #[test]
    fn test_max_retries_bounds_are_configuration_errors() {
        let engine = fast_engine();
        Recorder::install(&engine, OperationType::Import);
        let op = register(&engine, OperationType::Import, "Import");

        for bad in [0, 11] {
            let err =
                assert_err!(engine.enqueue(&op, QueueItemSpec::default().with_max_retries(bad)));
            assert!(matches!(err, OpsError::Configuration(_)));
        }
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default().with_max_retries(10)));
    }

    #[tokio::test]
    async fn test_future_scheduled_item_waits() {
        let engine = fast_engine();
        let recorder = Recorder::install(&engine, OperationType::Import);
        let op = register(&engine, OperationType::Import, "Import");
        let at = chrono::Utc::now() + chrono::Duration::milliseconds(40);
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default().with_scheduled_at(at)));

        assert!(assert_ok!(engine.process_next().await).is_none());
        within(2, engine.drain()).await.unwrap();
        assert!(chrono::Utc::now() >= at);
        assert_eq!(recorder.labels().len(), 1);
    }

    // ==================== History ====================

    #[tokio::test]
    async fn test_history_capacity_evicts_oldest() {
        let mut config = fast_config();
        config.history.capacity = 2;
        let engine = OperationEngine::new(config).unwrap();
        Recorder::install(&engine, OperationType::Export);

        for title in ["first", "second", "third"] {
            let op = register(&engine, OperationType::Export, title);
            assert_ok!(engine.enqueue(&op, QueueItemSpec::default()));
            assert_ok!(engine.drain().await);
        }

        let titles: Vec<String> = engine
            .list_history()
            .into_iter()
            .map(|r| r.operation.title)
            .collect();
        assert_eq!(titles, vec!["second", "third"]);

        let stats = engine.history_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(engine.latest_history(1)[0].operation.title, "third");
    }

    #[tokio::test]
    async fn test_search_history() {
        let engine = fast_engine();
        Recorder::install(&engine, OperationType::BulkDelete);
        Flaky::install(&engine, OperationType::Export, u32::MAX);

        let purge = engine
            .register_operation(
                OperationSpec::new(OperationType::BulkDelete, "Purge Bounced Contacts")
                    .with_description("weekly hygiene"),
            )
            .unwrap();
        let export = register(&engine, OperationType::Export, "Export campaign");
        assert_ok!(engine.enqueue(&purge, QueueItemSpec::default()));
        assert_ok!(engine.enqueue(&export, QueueItemSpec::default().with_max_retries(1)));
        assert_ok!(engine.drain().await);

        let bounced = engine.search_history(&HistoryFilter::new().with_search("BOUNCED"));
        assert_eq!(bounced.len(), 1);
        assert_eq!(bounced[0].operation.id, purge);

        let hygiene = engine.search_history(&HistoryFilter::new().with_search("hygiene"));
        assert_eq!(hygiene.len(), 1);

        let failures = engine.search_history(
            &HistoryFilter::new()
                .with_type(OperationType::Export)
                .with_status(OperationStatus::Failed),
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].result, OperationResult::Failure);

        let hour = chrono::Duration::hours(1);
        let now = chrono::Utc::now();
        assert_eq!(
            engine
                .search_history(&HistoryFilter::new().between(now - hour, now + hour))
                .len(),
            2
        );
    }

    // ==================== Progress ====================

    #[tokio::test]
    async fn test_phases_and_progress_snapshot() {
        let engine = fast_engine();
        engine.register_handler(
            OperationType::Import,
            handler_fn(|ctx: HandlerContext, _payload| async move {
                ctx.advance_phase("validate", 100.0)?;
                ctx.advance_phase("write", 40.0)?;
                Ok::<_, HandlerError>(HandlerOutput::items(4, 0))
            }),
        );
        let op = engine
            .register_operation(
                OperationSpec::new(OperationType::Import, "Import leads")
                    .with_total_items(4)
                    .with_phases(["validate", "write"]),
            )
            .unwrap();
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default()));
        assert_ok!(engine.drain().await);

        let snapshot = engine.progress(&op).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Completed);
        assert_eq!(snapshot.percent, 100.0);
        assert_eq!(snapshot.processed_items, 4);
        assert_eq!(snapshot.current_phase.as_deref(), Some("write"));

        let operation = engine.get_operation(&op).unwrap();
        assert!(operation.phases[0].completed_at.is_some());
        assert!(operation.phases[1].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_progress_events_for_running_operation() {
        let engine = fast_engine();
        let gate = Gate::install(&engine, OperationType::Export);
        let op = register(&engine, OperationType::Export, "Long export");
        let mut events = engine.subscribe_progress();
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default()));

        engine.start();
        within(2, gate.entered()).await;

        let event = within(2, events.recv()).await.unwrap();
        assert_eq!(event.operation_id, op);
        assert_eq!(event.status, OperationStatus::Running);
        assert!(event.eta.is_none());

        gate.release();
        assert!(
            wait_until(Duration::from_secs(2), || {
                engine.get_operation(&op).unwrap().status == OperationStatus::Completed
            })
            .await
        );
        engine.shutdown().await;
    }

    #[test]
    fn test_progress_of_unknown_operation() {
        let engine = fast_engine();
        assert!(engine.progress(&OperationId::new()).is_none());
    }

    // ==================== Store injection ====================

    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryOperationStore,
        updates: AtomicUsize,
    }

    impl OperationStore for CountingStore {
        fn insert(&self, operation: Operation) -> batch_ops::Result<()> {
            self.inner.insert(operation)
        }

        fn get(&self, id: &OperationId) -> Option<Operation> {
            self.inner.get(id)
        }

        fn list(&self) -> Vec<Operation> {
            self.inner.list()
        }

        fn update(
            &self,
            id: &OperationId,
            mutation: &mut dyn FnMut(&mut Operation) -> batch_ops::Result<()>,
        ) -> batch_ops::Result<Operation> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update(id, mutation)
        }

        fn remove(&self, id: &OperationId) -> Option<Operation> {
            self.inner.remove(id)
        }
    }

    #[tokio::test]
    async fn test_custom_operation_store() {
        let store = Arc::new(CountingStore::default());
        let engine = OperationEngine::with_operation_store(fast_config(), store.clone()).unwrap();
        Recorder::install(&engine, OperationType::Import);

        let op = register(&engine, OperationType::Import, "Import");
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default()));
        assert_ok!(engine.drain().await);

        assert_eq!(
            store.get(&op).map(|o| o.status),
            Some(OperationStatus::Completed)
        );
        assert!(store.updates.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_remove_operation() {
        let engine = fast_engine();
        let op = register(&engine, OperationType::Import, "Import");
        let removed = assert_ok!(engine.remove_operation(&op));
        assert_eq!(removed.id, op);
        assert!(engine.list_operations().is_empty());
        assert!(matches!(
            assert_err!(engine.remove_operation(&op)),
            OpsError::NotFound(_)
        ));
    }
}
