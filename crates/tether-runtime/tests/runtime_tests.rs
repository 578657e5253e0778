#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tether_config::TetherConfig;
    use tether_core::{
        ContentBlock, Result, Role, TetherError, Tool, ToolContext, ToolDescriptor, ToolResult,
    };
    use tether_llm::{MockModel, MockModelProvider, StopReason};
    use tether_runtime::{exit_code, McpSession, RunRequest, Runtime};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "bash_execute"
        }

        fn description(&self) -> &str {
            "Run a shell command"
        }

        fn schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            })
        }

        fn capabilities(&self) -> Vec<String> {
            vec![tether_core::tool::capability::COMMAND.to_string()]
        }

        async fn execute(
            &self,
            ctx: &ToolContext,
            params: serde_json::Map<String, serde_json::Value>,
        ) -> Result<ToolResult> {
            let command = params["command"].as_str().unwrap_or_default();
            let output = command.strip_prefix("echo ").unwrap_or(command);
            Ok(ToolResult::ok(ctx.call_id.clone(), format!("{output}\n")))
        }
    }

    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "slow_sleep"
        }

        fn description(&self) -> &str {
            "Sleeps"
        }

        fn schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            ctx: &ToolContext,
            _params: serde_json::Map<String, serde_json::Value>,
        ) -> Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolResult::ok(ctx.call_id.clone(), "done"))
        }
    }

    fn config_at(dir: &std::path::Path) -> TetherConfig {
        let mut config = TetherConfig::default();
        config.project.root = Some(dir.to_path_buf());
        config
    }

    async fn runtime_with_model(dir: &std::path::Path, model: MockModel) -> Runtime {
        Runtime::builder()
            .config(config_at(dir))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(EchoTool))
            .build()
            .await
            .unwrap()
    }

    // One tool round-trip: prompt -> tool call -> result -> final text.
    #[tokio::test]
    async fn test_single_tool_echo() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo hi"}))
            .with_response("hi");
        let rt = runtime_with_model(dir.path(), model).await;

        let result = rt
            .run(RunRequest::prompt("run echo hi").with_session("sess-echo"))
            .await
            .unwrap();
        assert_eq!(result.output, "hi");
        assert_eq!(result.stop_reason, StopReason::EndTurn);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "bash_execute");
        assert_eq!(result.iterations, 2);

        // Transcript: user, assistant(tool_call), tool result, assistant.
        let (session, _) = rt.sessions().open("sess-echo").unwrap();
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[2].role, Role::Tool);
        match &messages[2].content[0] {
            ContentBlock::ToolResult { output, is_error, .. } => {
                assert_eq!(output, "hi\n");
                assert!(!is_error);
            }
            other => panic!("expected tool result block, got {other:?}"),
        }
        assert_eq!(messages[3].text_content(), "hi");
        rt.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_empty_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with_model(dir.path(), MockModel::new("m")).await;
        match rt.run(RunRequest::prompt("   ")).await {
            Err(TetherError::InvalidRequest(_)) => {}
            other => panic!("expected invalid request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with_model(dir.path(), MockModel::new("m")).await;
        let result = rt
            .run(RunRequest::prompt("hello").with_session("bad/id"))
            .await;
        assert!(matches!(result, Err(TetherError::InvalidSessionId(_))));
    }

    #[tokio::test]
    async fn test_closed_runtime_rejects_runs() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with_model(dir.path(), MockModel::new("m")).await;
        rt.close().await.unwrap();
        assert!(rt.run(RunRequest::prompt("hello")).await.is_err());
    }

    // max_iterations = N allows exactly N model calls.
    #[tokio::test]
    async fn test_iteration_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(dir.path());
        config.agent.max_iterations = 2;
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo a"}))
            .with_tool_call("bash_execute", json!({"command": "echo b"}))
            .with_tool_call("bash_execute", json!({"command": "echo c"}));
        let provider = MockModelProvider::new(model);
        let handle = provider.model_handle();
        let rt = Runtime::builder()
            .config(config)
            .provider(Arc::new(provider))
            .tool(Arc::new(EchoTool))
            .build()
            .await
            .unwrap();

        let result = rt.run(RunRequest::prompt("loop forever")).await;
        match result {
            Err(TetherError::IterationBudget { max }) => assert_eq!(max, 2),
            other => panic!("expected iteration budget error, got {other:?}"),
        }
        assert_eq!(handle.requests_made(), 2);
    }

    #[tokio::test]
    async fn test_tool_error_fed_back_to_model() {
        struct FailTool;
        #[async_trait]
        impl Tool for FailTool {
            fn name(&self) -> &str {
                "fragile"
            }
            fn description(&self) -> &str {
                "Always fails"
            }
            fn schema(&self) -> serde_json::Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(
                &self,
                _ctx: &ToolContext,
                _params: serde_json::Map<String, serde_json::Value>,
            ) -> Result<ToolResult> {
                Err(TetherError::ToolExecution {
                    tool: "fragile".into(),
                    reason: "induced".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("fragile", json!({}))
            .with_response("recovered");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(FailTool))
            .build()
            .await
            .unwrap();

        // The loop does not abort; the error lands in the transcript.
        let result = rt
            .run(RunRequest::prompt("try it").with_session("sess-fail"))
            .await
            .unwrap();
        assert_eq!(result.output, "recovered");
        let (session, _) = rt.sessions().open("sess-fail").unwrap();
        let messages = session.messages();
        match &messages[2].content[0] {
            ContentBlock::ToolResult { is_error, output, .. } => {
                assert!(is_error);
                assert!(output.contains("induced"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_as_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("no_such_tool", json!({}))
            .with_response("ok then");
        let rt = runtime_with_model(dir.path(), model).await;
        let result = rt.run(RunRequest::prompt("call something")).await.unwrap();
        assert_eq!(result.output, "ok then");
    }

    #[tokio::test]
    async fn test_invalid_arguments_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        // Missing the required "command" key.
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"wrong": 1}))
            .with_response("gave up");
        let rt = runtime_with_model(dir.path(), model).await;
        let result = rt
            .run(RunRequest::prompt("bad args").with_session("sess-args"))
            .await
            .unwrap();
        assert_eq!(result.output, "gave up");
        let (session, _) = rt.sessions().open("sess-args").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sandbox_blocks_dangerous_command() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "rm -rf /"}))
            .with_response("refused");
        let rt = runtime_with_model(dir.path(), model).await;
        let result = rt
            .run(RunRequest::prompt("wipe it").with_session("sess-sb"))
            .await
            .unwrap();
        assert_eq!(result.output, "refused");
        let (session, _) = rt.sessions().open("sess-sb").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { is_error, output, .. } => {
                assert!(is_error);
                assert!(output.contains("command blocked"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    // A reviewer approval whitelists identical follow-up requests.
    #[tokio::test]
    async fn test_approval_gate_and_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo one"}))
            .with_tool_call("bash_execute", json!({"command": "echo one"}))
            .with_response("both ran");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(EchoTool))
            .require_approval("bash_execute")
            .build()
            .await
            .unwrap();

        // Reviewer: approve the first pending record when it shows up.
        let approvals = Arc::clone(rt.approvals());
        let reviewer = tokio::spawn(async move {
            loop {
                let pending = approvals.pending("");
                if let Some(rec) = pending.first() {
                    approvals.approve(&rec.id, "looks fine").unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result = rt
            .run(RunRequest::prompt("run twice").with_session("sess-appr"))
            .await
            .unwrap();
        reviewer.await.unwrap();
        assert_eq!(result.output, "both ran");

        // Two approved records: one by the reviewer, one auto from the
        // whitelist hit.
        let records = rt.approvals().query(&tether_approval::Filter {
            decision: Some(tether_approval::Decision::Approved),
            ..Default::default()
        });
        assert_eq!(records.len(), 2);
        assert!(!records[0].auto);
        assert!(records[1].auto);
        assert_eq!(records[1].comment, "whitelisted");
    }

    #[tokio::test]
    async fn test_approval_rejection_blocks_tool() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo nope"}))
            .with_response("understood");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(EchoTool))
            .require_approval("bash_execute")
            .build()
            .await
            .unwrap();

        let approvals = Arc::clone(rt.approvals());
        tokio::spawn(async move {
            loop {
                if let Some(rec) = approvals.pending("").first() {
                    approvals.reject(&rec.id, "not today").unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result = rt
            .run(RunRequest::prompt("try").with_session("sess-rej"))
            .await
            .unwrap();
        assert_eq!(result.output, "understood");
        let (session, _) = rt.sessions().open("sess-rej").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { is_error, output, .. } => {
                assert!(is_error);
                assert!(output.contains("rejected"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_tool_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo hi"}))
            .with_response("blocked");
        let rt = runtime_with_model(dir.path(), model).await;
        let mut request = RunRequest::prompt("restricted").with_session("sess-wl");
        request.allowed_tools = Some(vec!["other_tool".into()]);
        let result = rt.run(request).await.unwrap();
        assert_eq!(result.output, "blocked");
        let (session, _) = rt.sessions().open("sess-wl").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("slow_sleep", json!({}))
            .with_response("never reached");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(SleepTool))
            .build()
            .await
            .unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });
        let started = std::time::Instant::now();
        let result = rt
            .run_with_cancel(RunRequest::prompt("sleep"), cancel)
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        match result {
            Err(e) => assert_eq!(e.code(), "cancelled"),
            Ok(_) => panic!("expected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_wall_clock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(dir.path());
        config.agent.request_timeout_secs = 0;
        let model = MockModel::new("m").with_response("too late");
        let rt = Runtime::builder()
            .config(config)
            .provider(Arc::new(MockModelProvider::new(model)))
            .build()
            .await
            .unwrap();
        match rt.run(RunRequest::prompt("hello")).await {
            Err(TetherError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_stream_event_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo hi"}))
            .with_response("hi there");
        let rt = runtime_with_model(dir.path(), model).await;

        let (mut rx, handle) = rt
            .run_stream(RunRequest::prompt("run echo hi").with_session("sess-stream"))
            .unwrap();
        let mut types = Vec::new();
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            if let tether_middleware::StreamEvent::ContentBlockDelta { text: t, .. } = &event {
                text.push_str(t);
            }
            types.push(event.event_type().to_string());
        }
        let result = handle.wait().await.unwrap();
        assert_eq!(result.output, "hi there");
        assert_eq!(text, "hi there");

        assert_eq!(types.first().map(String::as_str), Some("agent_start"));
        assert!(types.contains(&"message_start".to_string()));
        assert!(types.contains(&"content_block_delta".to_string()));
        assert!(types.contains(&"tool_execution_start".to_string()));
        assert!(types.contains(&"tool_execution_stop".to_string()));
        assert!(types.contains(&"iteration_stop".to_string()));
        let agent_stop_at = types.iter().position(|t| t == "agent_stop").unwrap();
        let tool_start_at = types.iter().position(|t| t == "tool_execution_start").unwrap();
        assert!(tool_start_at < agent_stop_at);
    }

    #[tokio::test]
    async fn test_run_stream_emits_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m").with_error("upstream offline");
        let rt = runtime_with_model(dir.path(), model).await;
        let (mut rx, handle) = rt.run_stream(RunRequest::prompt("hello")).unwrap();
        let mut saw_error = false;
        while let Some(event) = rx.recv().await {
            if event.event_type() == "error" {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_sequential_runs_share_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_response("first answer")
            .with_response("second answer");
        let provider = MockModelProvider::new(model);
        let handle = provider.model_handle();
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(provider))
            .build()
            .await
            .unwrap();

        rt.run(RunRequest::prompt("one").with_session("sess-seq"))
            .await
            .unwrap();
        rt.run(RunRequest::prompt("two").with_session("sess-seq"))
            .await
            .unwrap();

        // The second model call saw the whole prior transcript.
        let requests = handle.recorded_requests();
        assert_eq!(requests[1].messages.len(), 3);
        let (session, _) = rt.sessions().open("sess-seq").unwrap();
        assert_eq!(session.messages().len(), 4);
    }

    #[tokio::test]
    async fn test_mcp_tools_namespaced_and_routed() {
        struct KbSession;
        #[async_trait]
        impl McpSession for KbSession {
            fn name(&self) -> &str {
                "kb"
            }
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
                Ok(vec![ToolDescriptor {
                    name: "lookup".into(),
                    description: "Look something up".into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }),
                    capabilities: vec![],
                }])
            }
            async fn call_tool(
                &self,
                name: &str,
                params: serde_json::Map<String, serde_json::Value>,
            ) -> Result<ToolResult> {
                assert_eq!(name, "lookup");
                let query = params["query"].as_str().unwrap_or_default();
                Ok(ToolResult::ok("", format!("kb:{query}")))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("mcp__kb__lookup", json!({"query": "walrus"}))
            .with_response("found it");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .mcp_session(Arc::new(KbSession))
            .build()
            .await
            .unwrap();

        assert!(rt.registry().has("mcp__kb__lookup"));
        let result = rt
            .run(RunRequest::prompt("look up walrus").with_session("sess-mcp"))
            .await
            .unwrap();
        assert_eq!(result.output, "found it");
        let (session, _) = rt.sessions().open("sess-mcp").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { output, .. } => assert_eq!(output, "kb:walrus"),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_output_trace_written() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo traced"}))
            .with_response("ok");
        let rt = runtime_with_model(dir.path(), model).await;
        rt.run(RunRequest::prompt("go").with_session("sess-trace"))
            .await
            .unwrap();
        let log = dir.path().join(".trace").join("log-sess-trace.jsonl");
        let raw = std::fs::read_to_string(log).unwrap();
        assert!(raw.contains("bash_execute"));
    }

    #[tokio::test]
    async fn test_streaming_tool_output_capped_across_chunks() {
        struct ChunkyTool;
        #[async_trait]
        impl Tool for ChunkyTool {
            fn name(&self) -> &str {
                "chunky"
            }
            fn description(&self) -> &str {
                "Streams output"
            }
            fn schema(&self) -> serde_json::Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(
                &self,
                ctx: &ToolContext,
                _params: serde_json::Map<String, serde_json::Value>,
            ) -> Result<ToolResult> {
                Ok(ToolResult::ok(ctx.call_id.clone(), "unused"))
            }
        }
        #[async_trait]
        impl tether_core::StreamingTool for ChunkyTool {
            async fn execute_streaming(
                &self,
                ctx: &ToolContext,
                _params: serde_json::Map<String, serde_json::Value>,
                on_chunk: tether_core::ChunkSink<'_>,
            ) -> Result<ToolResult> {
                for chunk in ["01234", "56789", "abcde"] {
                    on_chunk(chunk);
                }
                Ok(ToolResult::ok(ctx.call_id.clone(), String::new()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(dir.path());
        config.agent.max_tool_output_chars = 10;
        let model = MockModel::new("m")
            .with_tool_call("chunky", json!({}))
            .with_response("done");
        let rt = Runtime::builder()
            .config(config)
            .provider(Arc::new(MockModelProvider::new(model)))
            .streaming_tool(Arc::new(ChunkyTool))
            .build()
            .await
            .unwrap();

        rt.run(RunRequest::prompt("stream it").with_session("sess-chunk"))
            .await
            .unwrap();
        let (session, _) = rt.sessions().open("sess-chunk").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { output, .. } => {
                // The cap applies across chunks: only the first ten
                // characters survive.
                assert_eq!(output, "0123456789");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(None), 0);
        assert_eq!(
            exit_code(Some(&TetherError::HookBlocked {
                hook: "h".into(),
                stderr: "s".into()
            })),
            2
        );
        assert_eq!(exit_code(Some(&TetherError::Timeout("t".into()))), 1);
    }

    #[tokio::test]
    async fn test_middleware_rewrites_tool_arguments() {
        struct Rewriter;
        #[async_trait]
        impl tether_middleware::Middleware for Rewriter {
            fn name(&self) -> &str {
                "rewriter"
            }
            async fn before_tool(
                &self,
                state: &mut tether_middleware::StageState,
            ) -> Result<()> {
                if let Some(call) = &mut state.tool_call {
                    call.arguments
                        .insert("command".into(), json!("echo rewritten"));
                }
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m")
            .with_tool_call("bash_execute", json!({"command": "echo original"}))
            .with_response("done");
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(MockModelProvider::new(model)))
            .tool(Arc::new(EchoTool))
            .middleware(Arc::new(Rewriter))
            .build()
            .await
            .unwrap();
        rt.run(RunRequest::prompt("go").with_session("sess-mw"))
            .await
            .unwrap();
        let (session, _) = rt.sessions().open("sess-mw").unwrap();
        match &session.messages()[2].content[0] {
            ContentBlock::ToolResult { output, .. } => assert_eq!(output, "rewritten\n"),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_middleware_error_aborts_run() {
        struct Blocker;
        #[async_trait]
        impl tether_middleware::Middleware for Blocker {
            fn name(&self) -> &str {
                "blocker"
            }
            async fn before_model(
                &self,
                _state: &mut tether_middleware::StageState,
            ) -> Result<()> {
                Err(TetherError::Middleware {
                    name: "blocker".into(),
                    reason: "induced".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m").with_response("unreachable");
        let provider = MockModelProvider::new(model);
        let handle = provider.model_handle();
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(provider))
            .middleware(Arc::new(Blocker))
            .build()
            .await
            .unwrap();
        let result = rt.run(RunRequest::prompt("go")).await;
        assert!(matches!(result, Err(TetherError::Middleware { .. })));
        // Short-circuited before the model was ever called.
        assert_eq!(handle.requests_made(), 0);
    }

    #[tokio::test]
    async fn test_tier_override_resolves_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModel::new("m").with_response("tiered");
        let provider = MockModelProvider::new(model);
        let handle = provider.model_handle();
        let rt = Runtime::builder()
            .config(config_at(dir.path()))
            .provider(Arc::new(provider))
            .tier("fast", "tether-small")
            .build()
            .await
            .unwrap();
        rt.run(RunRequest::prompt("quick").with_tier("fast"))
            .await
            .unwrap();
        assert_eq!(handle.recorded_requests()[0].model, "tether-small");
    }
}
