#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tether_config::CompactionConfig;
    use tether_core::{EventBus, Message, Role};
    use tether_hooks::HookExecutor;
    use tether_llm::{MockModel, MockModelProvider, ProviderPool};
    use tether_runtime::Compactor;
    use tether_session::FileSession;
    use tether_wal::WalOptions;

    fn session_with_history(dir: &std::path::Path, count: usize, chars: usize) -> FileSession {
        let session = FileSession::open(
            "sess-compact",
            dir,
            WalOptions {
                disable_sync: true,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..count {
            let body = format!("m{i}-{}", "x".repeat(chars));
            let msg = if i % 2 == 0 {
                Message::user(body)
            } else {
                Message::assistant(body)
            };
            session.append(msg).unwrap();
        }
        session
    }

    fn compactor(pool: Arc<ProviderPool>, config: CompactionConfig) -> Compactor {
        Compactor::new(config, pool, "summarizer-model".into(), None)
    }

    fn pool_with(model: MockModel) -> (Arc<ProviderPool>, Arc<MockModel>) {
        let provider = MockModelProvider::new(model);
        let handle = provider.model_handle();
        (Arc::new(ProviderPool::new(Arc::new(provider))), handle)
    }

    // Forty messages near the token budget with preserve_count 4.
    #[tokio::test]
    async fn test_compaction_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        // ~600 estimated tokens per message -> ~24k total against a 25k
        // budget, over the 0.8 threshold.
        let session = session_with_history(dir.path(), 40, 2400);
        let (pool, handle) = pool_with(MockModel::new("m").with_response("what happened so far"));
        let compactor = compactor(
            pool,
            CompactionConfig {
                budget_tokens: 25_000,
                threshold: 0.8,
                preserve_count: 4,
                ..Default::default()
            },
        );
        let hooks = HookExecutor::new(dir.path());
        let bus = EventBus::default();

        let compacted = compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        assert!(compacted);
        assert_eq!(handle.requests_made(), 1);

        // 1 summary + 4 preserved tail messages.
        let messages = session.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].text_content().starts_with("summary: "));
        for (i, msg) in messages[1..].iter().enumerate() {
            assert!(msg.text_content().starts_with(&format!("m{}", 36 + i)));
        }
        bus.close().await;
    }

    #[tokio::test]
    async fn test_compacted_transcript_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let session = session_with_history(dir.path(), 40, 2400);
            let (pool, _) = pool_with(MockModel::new("m").with_response("the summary"));
            let compactor = compactor(
                pool,
                CompactionConfig {
                    budget_tokens: 25_000,
                    threshold: 0.8,
                    preserve_count: 4,
                    ..Default::default()
                },
            );
            let hooks = HookExecutor::new(dir.path());
            let bus = EventBus::default();
            compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
            bus.close().await;
        }
        let session = FileSession::open(
            "sess-compact",
            dir.path(),
            WalOptions {
                disable_sync: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(session.messages().len(), 5);
        assert!(session.messages()[0].text_content().starts_with("summary: "));
    }

    #[tokio::test]
    async fn test_under_threshold_no_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_history(dir.path(), 10, 100);
        let (pool, handle) = pool_with(MockModel::new("m"));
        let compactor = compactor(pool, CompactionConfig::default());
        let hooks = HookExecutor::new(dir.path());
        let bus = EventBus::default();
        let compacted = compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        assert!(!compacted);
        assert_eq!(handle.requests_made(), 0);
        assert_eq!(session.messages().len(), 10);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_summarizer_retry_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_history(dir.path(), 40, 2400);
        let model = MockModel::new("m")
            .with_error("transient")
            .with_response("recovered summary");
        let (pool, handle) = pool_with(model);
        let compactor = compactor(
            pool,
            CompactionConfig {
                budget_tokens: 25_000,
                threshold: 0.8,
                preserve_count: 4,
                max_retries: 2,
                retry_delay_ms: 1,
                ..Default::default()
            },
        );
        let hooks = HookExecutor::new(dir.path());
        let bus = EventBus::default();
        let compacted = compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        assert!(compacted);
        assert_eq!(handle.requests_made(), 2);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_summarizer_exhaustion_aborts_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_history(dir.path(), 40, 2400);
        let model = MockModel::new("m")
            .with_error("down")
            .with_error("down")
            .with_error("down");
        let (pool, _) = pool_with(model);
        let compactor = compactor(
            pool,
            CompactionConfig {
                budget_tokens: 25_000,
                threshold: 0.8,
                preserve_count: 4,
                max_retries: 2,
                retry_delay_ms: 1,
                ..Default::default()
            },
        );
        let hooks = HookExecutor::new(dir.path());
        let bus = EventBus::default();
        // Aborts compaction without failing the caller.
        let compacted = compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        assert!(!compacted);
        assert_eq!(session.messages().len(), 40);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_pre_compact_hook_deny_skips() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with_history(dir.path(), 40, 2400);
        let (pool, handle) = pool_with(MockModel::new("m").with_response("unused"));
        let compactor = compactor(
            pool,
            CompactionConfig {
                budget_tokens: 25_000,
                threshold: 0.8,
                preserve_count: 4,
                ..Default::default()
            },
        );
        let mut hooks = HookExecutor::new(dir.path());
        hooks.register(vec![tether_hooks::ShellHook {
            event: tether_hooks::HookEvent::PreCompact,
            command: r#"echo '{"decision": "deny"}'"#.into(),
            selector: tether_hooks::Selector::default(),
            timeout: None,
            env: Default::default(),
            name: "deny-compact".into(),
        }]);
        let bus = EventBus::default();
        let compacted = compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        assert!(!compacted);
        assert_eq!(handle.requests_made(), 0);
        assert_eq!(session.messages().len(), 40);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_rollout_artifact_written() {
        let dir = tempfile::tempdir().unwrap();
        let rollout = dir.path().join("rollout");
        let session = session_with_history(dir.path(), 40, 2400);
        let (pool, _) = pool_with(MockModel::new("m").with_response("summary text"));
        let compactor = compactor(
            pool,
            CompactionConfig {
                budget_tokens: 25_000,
                threshold: 0.8,
                preserve_count: 4,
                rollout_dir: Some(rollout.clone()),
                ..Default::default()
            },
        );
        let hooks = HookExecutor::new(dir.path());
        let bus = EventBus::default();
        compactor.maybe_compact(&session, &hooks, &bus).await.unwrap();
        let artifacts: Vec<_> = std::fs::read_dir(&rollout)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(artifacts.len(), 1);
        let raw = std::fs::read_to_string(artifacts[0].path()).unwrap();
        assert!(raw.contains("summary text"));
        bus.close().await;
    }
}
