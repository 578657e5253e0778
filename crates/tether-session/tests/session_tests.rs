#[cfg(test)]
mod tests {
    use tether_approval::{ApprovalRecord, Decision, Filter as ApprovalFilter};
    use tether_core::{Message, Role, TetherError};
    use tether_session::{Channel, FileSession, ListFilter, SessionManager, MAX_CHECKPOINT_BYTES};
    use tether_wal::WalOptions;

    fn opts() -> WalOptions {
        WalOptions {
            disable_sync: true,
            ..Default::default()
        }
    }

    fn texts(session: &FileSession) -> Vec<String> {
        session
            .messages()
            .iter()
            .map(|m| m.text_content())
            .collect()
    }

    #[test]
    fn test_append_assigns_id_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        let stored = s.append(Message::user("hello")).unwrap();
        assert_eq!(stored.id, "sess-1-000001");
        assert!(stored.timestamp.is_some());
        assert_eq!(stored.session_id, "sess-1");
        // Caller-provided ids are preserved.
        let mut own = Message::user("next");
        own.id = "my-id".into();
        let stored = s.append(own).unwrap();
        assert_eq!(stored.id, "my-id");
    }

    #[test]
    fn test_list_preserves_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        for i in 0..5 {
            s.append(Message::user(format!("m{i}"))).unwrap();
        }
        let all = s.list(&ListFilter::default()).unwrap();
        let got: Vec<String> = all.iter().map(|m| m.text_content()).collect();
        assert_eq!(got, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        s.append(Message::user("u1")).unwrap();
        s.append(Message::assistant("a1")).unwrap();
        s.append(Message::user("u2")).unwrap();

        let users = s
            .list(&ListFilter {
                role: Some(Role::User),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(users.len(), 2);

        let limited = s
            .list(&ListFilter {
                offset: 1,
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].text_content(), "a1");
    }

    #[test]
    fn test_checkpoint_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        s.append(Message::user("m1")).unwrap();
        s.append(Message::user("m2")).unwrap();
        s.append(Message::user("m3")).unwrap();
        s.checkpoint("a").unwrap();
        s.append(Message::user("m4")).unwrap();
        s.append(Message::user("m5")).unwrap();
        s.resume("a").unwrap();
        assert_eq!(texts(&s), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_resume_unknown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert!(matches!(
            s.resume("missing"),
            Err(TetherError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn test_transcript_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            for i in 0..4 {
                s.append(Message::user(format!("m{i}"))).unwrap();
            }
            // Dropped without close: crash.
        }
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert_eq!(texts(&s), vec!["m0", "m1", "m2", "m3"]);
        // Appends continue with the right sequence.
        let next = s.append(Message::user("m4")).unwrap();
        assert_eq!(next.id, "sess-1-000005");
    }

    #[test]
    fn test_checkpoint_resume_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            s.append(Message::user("m1")).unwrap();
            s.append(Message::user("m2")).unwrap();
            s.checkpoint("a").unwrap();
            s.append(Message::user("m3")).unwrap();
        }
        {
            // Reopen sees the full transcript, then resumes.
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            assert_eq!(texts(&s), vec!["m1", "m2", "m3"]);
            s.resume("a").unwrap();
            assert_eq!(texts(&s), vec!["m1", "m2"]);
        }
        // The resume itself is durable.
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert_eq!(texts(&s), vec!["m1", "m2"]);
    }

    #[test]
    fn test_appends_after_resume_replay_correctly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            s.append(Message::user("m1")).unwrap();
            s.checkpoint("a").unwrap();
            s.append(Message::user("m2")).unwrap();
            s.resume("a").unwrap();
            s.append(Message::user("m3")).unwrap();
            assert_eq!(texts(&s), vec!["m1", "m3"]);
        }
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert_eq!(texts(&s), vec!["m1", "m3"]);
    }

    #[test]
    fn test_checkpoint_size_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        // Leave generous headroom for JSON framing, then push just over.
        let big = "x".repeat(MAX_CHECKPOINT_BYTES / 2);
        s.append(Message::user(&big)).unwrap();
        s.checkpoint("fits").unwrap();
        s.append(Message::user(&big)).unwrap();
        s.append(Message::user(&big)).unwrap();
        match s.checkpoint("too-big") {
            Err(TetherError::CheckpointTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_CHECKPOINT_BYTES);
            }
            other => panic!("expected CheckpointTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_checkpoint_names() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert!(s.checkpoint("Bad").is_err());
        assert!(s.checkpoint("").is_err());
        assert!(s.checkpoint("ok-1").is_ok());
    }

    #[test]
    fn test_fork_copies_messages_not_approvals() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("parent", dir.path(), opts()).unwrap();
        s.append(Message::user("m1")).unwrap();
        s.append(Message::assistant("m2")).unwrap();
        s.append_approval(ApprovalRecord {
            id: String::new(),
            session_id: String::new(),
            tool: "bash_execute".into(),
            params: Default::default(),
            decision: Decision::Approved,
            requested_at: chrono::Utc::now(),
            decided_at: None,
            comment: String::new(),
            auto: false,
        })
        .unwrap();

        let child = s.fork("child").unwrap();
        assert_eq!(texts(&child), vec!["m1", "m2"]);
        assert_eq!(
            child.list_approvals(&ApprovalFilter::default()).unwrap().len(),
            0
        );
        // Parent untouched.
        assert_eq!(s.list_approvals(&ApprovalFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_approvals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            let rec = s
                .append_approval(ApprovalRecord {
                    id: String::new(),
                    session_id: String::new(),
                    tool: "bash_execute".into(),
                    params: Default::default(),
                    decision: Decision::Pending,
                    requested_at: chrono::Utc::now(),
                    decided_at: None,
                    comment: String::new(),
                    auto: false,
                })
                .unwrap();
            rec.id
        };
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        let records = s.list_approvals(&ApprovalFilter::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
    }

    #[test]
    fn test_progress_gc_after_checkpoint_keeps_transcript() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
            for i in 0..6 {
                s.append(Message::user(format!("m{i}"))).unwrap();
            }
            s.checkpoint("trim").unwrap();
            s.append(Message::user("after")).unwrap();
        }
        // The checkpoint GC may have truncated early progress entries; the
        // snapshot must still reconstruct the full transcript.
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        assert_eq!(
            texts(&s),
            vec!["m0", "m1", "m2", "m3", "m4", "m5", "after"]
        );
    }

    #[test]
    fn test_closed_session_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileSession::open("sess-1", dir.path(), opts()).unwrap();
        s.close().unwrap();
        assert!(matches!(
            s.append(Message::user("x")),
            Err(TetherError::SessionClosed)
        ));
        assert!(s.list(&ListFilter::default()).is_err());
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSession::open("", dir.path(), opts()).is_err());
        assert!(FileSession::open("bad/slash", dir.path(), opts()).is_err());
    }

    // ── Manager tests ──────────────────────────────────────────

    #[test]
    fn test_manager_caches_and_reports_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::with_max_sessions(dir.path(), opts(), 8);
        let (a, first) = mgr.open("sess-1").unwrap();
        assert!(first);
        let (b, second) = mgr.open("sess-1").unwrap();
        assert!(!second);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.live_count(), 1);
    }

    #[test]
    fn test_manager_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::with_max_sessions(dir.path(), opts(), 2);
        mgr.open("s1").unwrap();
        mgr.open("s2").unwrap();
        mgr.open("s3").unwrap();
        assert_eq!(mgr.live_count(), 2);
        assert!(!mgr.live_ids().contains(&"s1".to_string()));
        // Evicted sessions reopen cleanly.
        let (s1, _) = mgr.open("s1").unwrap();
        assert!(!s1.is_closed());
    }

    #[test]
    fn test_manager_close_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::with_max_sessions(dir.path(), opts(), 8);
        let (s, _) = mgr.open("sess-1").unwrap();
        s.append(Message::user("m")).unwrap();
        mgr.close("sess-1").unwrap();
        assert_eq!(mgr.live_count(), 0);
        assert!(s.is_closed());
    }

    // ── Channel WAL tests ──────────────────────────────────────

    #[test]
    fn test_channel_isolation() {
        use tether_session::ChannelWal;
        let dir = tempfile::tempdir().unwrap();
        let wal = ChannelWal::open(dir.path(), opts()).unwrap();
        let p1 = wal.append(Channel::Progress, "progress", b"p1").unwrap();
        wal.append(Channel::Control, "control", b"c1").unwrap();

        let mut progress = Vec::new();
        wal.read_since(Channel::Progress, p1, |e| {
            progress.push(e.data);
            Ok(())
        })
        .unwrap();
        assert_eq!(progress, vec![b"p1".to_vec()]);

        let mut control = Vec::new();
        wal.read_since(Channel::Control, 0, |e| {
            control.push(e.data);
            Ok(())
        })
        .unwrap();
        assert_eq!(control, vec![b"c1".to_vec()]);

        wal.rotate(Channel::Control).unwrap();
        let cursors = wal.snapshot();
        assert_eq!(cursors[&Channel::Progress], p1);
        let files: Vec<_> = std::fs::read_dir(dir.path().join("control"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("segment-"))
            .collect();
        assert!(!files.is_empty());
    }

    #[test]
    fn test_channel_positions_independent() {
        use tether_session::ChannelWal;
        let dir = tempfile::tempdir().unwrap();
        let wal = ChannelWal::open(dir.path(), opts()).unwrap();
        assert_eq!(wal.append(Channel::Progress, "m", b"a").unwrap(), 0);
        assert_eq!(wal.append(Channel::Progress, "m", b"b").unwrap(), 1);
        assert_eq!(wal.append(Channel::Control, "c", b"x").unwrap(), 0);
        assert_eq!(wal.append(Channel::Monitor, "a", b"y").unwrap(), 0);
    }
}
