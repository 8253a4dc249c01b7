//! Configuration loading integration tests

#[cfg(test)]
mod tests {
    use crate::assert_ok;
    use crate::common::fixtures::{Flaky, register};
    use batch_ops::{EngineConfig, OperationEngine, OperationType, OpsError, QueueItemSpec};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_engine_honours_file_config() {
        let file = write_config(
            r#"
queue:
  default_max_retries: 2
retry:
  initial_delay_ms: 1
  max_delay_ms: 2
history:
  capacity: 5
"#,
        );

        let config = assert_ok!(EngineConfig::from_file(file.path()).await);
        let engine = assert_ok!(OperationEngine::new(config));
        let flaky = Flaky::install(&engine, OperationType::Import, u32::MAX);

        let op = register(&engine, OperationType::Import, "Import");
        assert_ok!(engine.enqueue(&op, QueueItemSpec::default()));
        assert_ok!(engine.drain().await);

        assert_eq!(flaky.invocations(), 2);
        assert_eq!(engine.config().history.capacity, 5);
    }

    #[tokio::test]
    async fn test_invalid_file_config_rejected() {
        let file = write_config("retry:\n  backoff_factor: 0.1\n");
        let err = EngineConfig::from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, OpsError::Configuration(_)));
        assert!(err.to_string().contains("backoff_factor"));

        let file = write_config("queue: [not, a, mapping]\n");
        assert!(EngineConfig::from_file(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_example_config_parses() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/engine.example.yaml");
        let config = assert_ok!(EngineConfig::from_file(&path).await);
        assert_eq!(config.rollback.max_entries, Some(500));
        assert_eq!(config.executor.max_concurrent, 1);
    }

    #[test]
    fn test_max_concurrent_accepted_but_serial() {
        let mut config = EngineConfig::default();
        config.executor.max_concurrent = 8;
        let engine = assert_ok!(OperationEngine::new(config));
        assert_eq!(engine.config().executor.max_concurrent, 8);
    }
}
