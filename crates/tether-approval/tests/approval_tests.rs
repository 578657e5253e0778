#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tether_approval::{
        Decision, Filter, GcConfig, MemoryStore, Queue, RecordLog, Store, Whitelist,
    };
    use tether_core::TetherError;
    use tether_wal::WalOptions;

    fn params(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    fn mem_queue() -> Queue {
        Queue::new(Arc::new(MemoryStore::new()), Arc::new(Whitelist::new()))
    }

    fn wal_opts() -> WalOptions {
        WalOptions {
            disable_sync: true,
            ..Default::default()
        }
    }

    // ── Queue tests ────────────────────────────────────────────

    #[test]
    fn test_request_starts_pending() {
        let q = mem_queue();
        let (rec, auto) = q.request("sess-1", "bash_execute", &params(json!({"k": 1}))).unwrap();
        assert!(!auto);
        assert_eq!(rec.decision, Decision::Pending);
        assert_eq!(rec.id.len(), 16);
        assert_eq!(q.pending("sess-1").len(), 1);
    }

    #[test]
    fn test_approve_whitelists_identical_request() {
        let q = mem_queue();
        let p = params(json!({"k": 1}));
        let (rec, auto) = q.request("sess-1", "tool_x", &p).unwrap();
        assert!(!auto);
        q.approve(&rec.id, "looks fine").unwrap();

        let (second, auto) = q.request("sess-1", "tool_x", &p).unwrap();
        assert!(auto);
        assert_eq!(second.decision, Decision::Approved);
        assert!(second.auto);
        assert_eq!(second.comment, "whitelisted");
        // Decided immediately, no pending entry.
        assert!(q.pending("sess-1").is_empty());
    }

    #[test]
    fn test_whitelist_is_key_order_insensitive() {
        let q = mem_queue();
        let (rec, _) = q
            .request("sess-1", "tool_x", &params(json!({"a": 1, "b": 2})))
            .unwrap();
        q.approve(&rec.id, "").unwrap();
        let mut reordered = serde_json::Map::new();
        reordered.insert("b".into(), json!(2));
        reordered.insert("a".into(), json!(1));
        let (_, auto) = q.request("sess-1", "tool_x", &reordered).unwrap();
        assert!(auto);
    }

    #[test]
    fn test_whitelist_scoped_to_session() {
        let q = mem_queue();
        let p = params(json!({"k": 1}));
        let (rec, _) = q.request("sess-1", "tool_x", &p).unwrap();
        q.approve(&rec.id, "").unwrap();
        let (_, auto) = q.request("sess-2", "tool_x", &p).unwrap();
        assert!(!auto);
    }

    #[test]
    fn test_decisions_are_monotonic() {
        let q = mem_queue();
        let (rec, _) = q.request("sess-1", "tool_x", &params(json!({}))).unwrap();
        q.reject(&rec.id, "nope").unwrap();
        // A terminal record never transitions again.
        assert!(matches!(
            q.timeout(&rec.id),
            Err(TetherError::ApprovalNotFound(_))
        ));
        let looked = q.lookup(&rec.id).unwrap();
        assert_eq!(looked.decision, Decision::Rejected);
        assert_eq!(looked.comment, "nope");
    }

    #[test]
    fn test_approve_after_reject_errors_and_never_whitelists() {
        let q = mem_queue();
        let p = params(json!({"k": 1}));
        let (rec, _) = q.request("sess-1", "tool_x", &p).unwrap();
        q.reject(&rec.id, "not today").unwrap();

        // Approving an already-rejected id is an error, not a re-read.
        assert!(matches!(
            q.approve(&rec.id, "second opinion"),
            Err(TetherError::ApprovalNotFound(_))
        ));
        assert_eq!(q.lookup(&rec.id).unwrap().decision, Decision::Rejected);

        // The rejected (tool, params) pair was never whitelisted: the
        // identical request still prompts.
        assert!(q.whitelist().is_empty());
        let (second, auto) = q.request("sess-1", "tool_x", &p).unwrap();
        assert!(!auto);
        assert_eq!(second.decision, Decision::Pending);
    }

    #[test]
    fn test_unknown_id_errors() {
        let q = mem_queue();
        assert!(matches!(
            q.approve("deadbeef00000000", ""),
            Err(TetherError::ApprovalNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_approval() {
        let q = Arc::new(mem_queue());
        let (rec, _) = q.request("sess-1", "tool_x", &params(json!({}))).unwrap();
        let waiter = {
            let q = Arc::clone(&q);
            let id = rec.id.clone();
            tokio::spawn(async move { q.wait(&id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.approve(&rec.id, "go").unwrap();
        let decided = waiter.await.unwrap().unwrap();
        assert_eq!(decided.decision, Decision::Approved);
    }

    #[tokio::test]
    async fn test_wait_timeout_records_timeout_decision() {
        let q = mem_queue();
        let (rec, _) = q.request("sess-1", "tool_x", &params(json!({}))).unwrap();
        let decided = q.wait(&rec.id, Duration::from_millis(30)).await.unwrap();
        assert_eq!(decided.decision, Decision::Timeout);
        assert_eq!(q.lookup(&rec.id).unwrap().decision, Decision::Timeout);
    }

    // ── Durable record log tests ───────────────────────────────

    #[test]
    fn test_record_log_replays_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
            let q = Queue::new(log, Arc::new(Whitelist::new()));
            let (rec, _) = q.request("sess-1", "tool_x", &params(json!({"k": 1}))).unwrap();
            q.approve(&rec.id, "ok").unwrap();
            rec.id
        };

        let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
        let wl = Arc::new(Whitelist::new());
        let q = Queue::new(log, Arc::clone(&wl));
        // Whitelist re-seeded from the approved record.
        let (rec, auto) = q.request("sess-1", "tool_x", &params(json!({"k": 1}))).unwrap();
        assert!(auto, "whitelist should survive reopen");
        assert_eq!(rec.decision, Decision::Approved);
        assert_eq!(q.lookup(&id).unwrap().decision, Decision::Approved);
    }

    #[test]
    fn test_record_log_pending_restored() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
            let q = Queue::new(log, Arc::new(Whitelist::new()));
            let (rec, _) = q.request("sess-1", "tool_x", &params(json!({}))).unwrap();
            rec.id
        };
        let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
        let q = Queue::new(log, Arc::new(Whitelist::new()));
        let pending = q.pending("");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[test]
    fn test_query_filters_and_orders() {
        let q = mem_queue();
        let (a, _) = q.request("sess-1", "tool_a", &params(json!({"n": 1}))).unwrap();
        let (_b, _) = q.request("sess-2", "tool_b", &params(json!({"n": 2}))).unwrap();
        q.approve(&a.id, "").unwrap();

        let approved = q.query(&Filter {
            decision: Some(Decision::Approved),
            ..Default::default()
        });
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].tool, "tool_a");

        let by_session = q.query(&Filter {
            session_id: Some("sess-2".into()),
            ..Default::default()
        });
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].tool, "tool_b");
    }

    // ── GC tests ───────────────────────────────────────────────

    #[test]
    fn test_gc_retention_count() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
        let q = Queue::new(Arc::clone(&log) as Arc<dyn Store>, Arc::new(Whitelist::new()));
        let mut ids = Vec::new();
        for i in 0..10 {
            let (rec, _) = q
                .request("sess-1", "tool_x", &params(json!({"n": i})))
                .unwrap();
            ids.push(rec.id);
        }
        RecordLog::configure_gc(&log, GcConfig {
            retention_days: 0,
            retention_count: 3,
            ..GcConfig::defaults()
        });
        let stats = log.gc().unwrap();
        assert_eq!(stats.dropped, 7);
        assert_eq!(stats.after_count, 3);
        let remaining = log.all();
        assert_eq!(remaining.len(), 3);
        for rec in &remaining {
            assert!(ids[7..].contains(&rec.id), "only the newest records survive");
        }
    }

    #[test]
    fn test_gc_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
            let q = Queue::new(Arc::clone(&log) as Arc<dyn Store>, Arc::new(Whitelist::new()));
            for i in 0..10 {
                q.request("sess-1", "tool_x", &params(json!({"n": i}))).unwrap();
            }
            RecordLog::configure_gc(&log, GcConfig {
                retention_days: 0,
                retention_count: 4,
                ..GcConfig::defaults()
            });
            log.gc().unwrap();
            log.close().unwrap();
        }
        let log = RecordLog::open(dir.path(), wal_opts()).unwrap();
        assert_eq!(log.all().len(), 4);
    }

    #[test]
    fn test_gc_retention_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
        let q = Queue::new(Arc::clone(&log) as Arc<dyn Store>, Arc::new(Whitelist::new()));
        for i in 0..20 {
            q.request("sess-1", "tool_x", &params(json!({"n": i, "pad": "x".repeat(64)})))
                .unwrap();
        }
        let before = log.gc_status();
        assert_eq!(before.runs, 0);
        RecordLog::configure_gc(&log, GcConfig {
            retention_days: 0,
            retention_count: 0,
            retention_bytes: 1024,
            ..GcConfig::defaults()
        });
        let stats = log.gc().unwrap();
        assert!(stats.dropped > 0);
        assert!(stats.after_bytes <= 1024);
        let status = log.gc_status();
        assert_eq!(status.runs, 1);
        assert_eq!(status.total_dropped, stats.dropped as u64);
    }

    #[test]
    fn test_gc_noop_under_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RecordLog::open(dir.path(), wal_opts()).unwrap());
        let q = Queue::new(Arc::clone(&log) as Arc<dyn Store>, Arc::new(Whitelist::new()));
        for i in 0..5 {
            q.request("sess-1", "tool_x", &params(json!({"n": i}))).unwrap();
        }
        let stats = log.gc().unwrap();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.after_count, 5);
    }
}
