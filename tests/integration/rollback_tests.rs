//! Rollback checkpoint integration tests

#[cfg(test)]
mod tests {
    use crate::common::fixtures::{Flaky, RecordingStrategy, fast_config, fast_engine, register};
    use crate::{assert_err, assert_ok};
    use batch_ops::{
        OperationEngine, OperationStatus, OperationType, OpsError, QueueItemSpec, RollbackData,
        RollbackId, RollbackType, compute_checksum,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pre_image() -> serde_json::Value {
        json!({
            "table": "contacts",
            "rows": [{"id": 7, "email": "a@example.com"}, {"id": 9, "email": "b@example.com"}]
        })
    }

    #[tokio::test]
    async fn test_record_and_restore() {
        let engine = fast_engine();
        let strategy = Arc::new(RecordingStrategy::default());
        engine.register_restore_strategy(RollbackType::Database, strategy.clone());
        let op = register(&engine, OperationType::BulkDelete, "Purge");

        let metadata = HashMap::from([("table".to_string(), "contacts".to_string())]);
        let id = assert_ok!(engine.record_rollback(
            &op,
            RollbackType::Database,
            pre_image(),
            metadata
        ));

        let checkpoints = engine.rollbacks_for(&op);
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].checksum, compute_checksum(&pre_image()).unwrap());
        assert!(assert_ok!(engine.verify_rollback(&id)));

        let outcome = assert_ok!(engine.restore(&id).await);
        assert_eq!(outcome.rollback_id, id);
        assert_eq!(outcome.operation_id, op);
        assert_eq!(outcome.detail, Some(format!("restored {}", id)));
        assert_eq!(strategy.calls(), 1);
        assert_eq!(strategy.restored()[0].data, pre_image());
    }

    #[tokio::test]
    async fn test_tampered_checkpoint_is_not_restored() {
        let engine = fast_engine();
        let strategy = Arc::new(RecordingStrategy::default());
        engine.register_restore_strategy(RollbackType::Database, strategy.clone());
        let op = register(&engine, OperationType::BulkUpdate, "Retag");

        let original = assert_ok!(engine.record_rollback(
            &op,
            RollbackType::Database,
            pre_image(),
            HashMap::new()
        ));
        let mut tampered: RollbackData = engine
            .list_rollbacks()
            .into_iter()
            .find(|c| c.id == original)
            .unwrap();
        tampered.id = RollbackId::new();
        tampered.data["rows"][0]["email"] = json!("attacker@example.com");
        let tampered_id = assert_ok!(engine.import_rollback(tampered));

        assert!(!assert_ok!(engine.verify_rollback(&tampered_id)));
        let err = assert_err!(engine.restore(&tampered_id).await);
        assert!(matches!(err, OpsError::Rollback(_)));
        assert!(err.to_string().contains("Checksum mismatch"));
        assert_eq!(strategy.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_strategy_is_rollback_error() {
        let engine = fast_engine();
        let op = register(&engine, OperationType::Import, "Import");
        let id = assert_ok!(engine.record_rollback(
            &op,
            RollbackType::File,
            json!({"path": "/tmp/leads.csv"}),
            HashMap::new()
        ));

        let err = assert_err!(engine.restore(&id).await);
        assert!(matches!(err, OpsError::Rollback(_)));
    }

    #[tokio::test]
    async fn test_failure_never_restores_automatically() {
        let engine = fast_engine();
        let strategy = Arc::new(RecordingStrategy::default());
        engine.register_restore_strategy(RollbackType::Database, strategy.clone());
        Flaky::install(&engine, OperationType::BulkDelete, u32::MAX);

        let op = register(&engine, OperationType::BulkDelete, "Purge");
        assert_ok!(engine.record_rollback(
            &op,
            RollbackType::Database,
            pre_image(),
            HashMap::new()
        ));
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default().with_max_retries(1)));
        assert_ok!(engine.drain().await);

        assert_eq!(
            engine.get_operation(&op).unwrap().status,
            OperationStatus::Failed
        );
        assert_eq!(strategy.calls(), 0);
        assert_eq!(engine.rollbacks_for(&op).len(), 1);
    }

    #[test]
    fn test_retention_keeps_newest_entries() {
        let mut config = fast_config();
        config.rollback.max_entries = Some(2);
        let engine = OperationEngine::new(config).unwrap();
        let op = register(&engine, OperationType::BulkUpdate, "Retag");

        let ids: Vec<RollbackId> = (0..3)
            .map(|i| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                engine
                    .record_rollback(&op, RollbackType::Database, json!({ "n": i }), HashMap::new())
                    .unwrap()
            })
            .collect();

        let kept: Vec<RollbackId> = engine.list_rollbacks().into_iter().map(|c| c.id).collect();
        assert_eq!(kept.len(), 2);
        assert!(!kept.contains(&ids[0]));
        assert!(kept.contains(&ids[2]));
    }

    #[test]
    fn test_delete_and_duplicate_import() {
        let engine = fast_engine();
        let op = register(&engine, OperationType::Export, "Export");
        let id = assert_ok!(engine.record_rollback(
            &op,
            RollbackType::Custom("crm".to_string()),
            json!({"segment": 4}),
            HashMap::new()
        ));

        let checkpoint = engine.list_rollbacks().remove(0);
        assert!(matches!(
            assert_err!(engine.import_rollback(checkpoint.clone())),
            OpsError::Validation(_)
        ));

        let deleted = assert_ok!(engine.delete_rollback(&id));
        assert_eq!(deleted.rollback_type, RollbackType::Custom("crm".to_string()));
        assert!(engine.list_rollbacks().is_empty());
        assert!(matches!(
            assert_err!(engine.verify_rollback(&id)),
            OpsError::NotFound(_)
        ));
    }
}
