// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end tests across the crates: run an eval against the mock
//! model, persist it through the log recorder, and post-process the
//! resulting transcripts with the scanner pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use verdict_core::{
    eval_tasks, EvalOptions, GenerateSolver, MatchScorer, Model, Sample, Scorer, Task,
    TaskStatus, ToolLoopSolver,
};
use verdict_log::EvalRecorder;
use verdict_model::mock::{MockApi, ScriptedApi, ScriptedStep};
use verdict_model::{ChatMessage, GenerateConfig, ToolCall};
use verdict_scan::{register_scanner, ScanOptions, ScanResult, ScanScanner, Transcripts};
use verdict_tools::{Tool, ToolError, ToolRegistry, ToolResult};

fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    std::mem::forget(tx);
    rx
}

fn numeric_task(name: &str, n: usize) -> Task {
    Task {
        name: name.into(),
        dataset: (0..n)
            .map(|i| Sample::new(format!("s{i}"), "what is 6*7?", "42"))
            .collect(),
        solver: Arc::new(GenerateSolver),
        scorers: vec![Arc::new(MatchScorer::numeric()) as Arc<dyn Scorer>],
        tools: Arc::new(ToolRegistry::new()),
        config: GenerateConfig::default(),
    }
}

#[tokio::test]
async fn eval_writes_a_readable_log_with_perfect_score() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("logs/run.eval");
    let recorder = Arc::new(EvalRecorder::new(&location));

    let model = Arc::new(Model::new(
        Arc::new(MockApi::new("ANSWER: 42")),
        "mock/model",
        GenerateConfig::default(),
    ));
    let results = eval_tasks(
        vec![(numeric_task("smoke", 3), recorder)],
        model,
        Arc::new(EvalOptions::default()),
        no_cancel(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, TaskStatus::Success);
    assert_eq!(results[0].results.error_samples, 0);
    assert!((results[0].results.scores["match"] - 1.0).abs() < 1e-9);

    // the log is durable and readable back
    let document = EvalRecorder::read(&location).unwrap();
    assert_eq!(document.samples.len(), 3);
    assert_eq!(document.results.unwrap().status, TaskStatus::Success);
    // every sample transcript is fully completed
    for sample in &document.samples {
        assert!(sample.events.iter().all(|r| !r.event.is_pending()));
        assert_eq!(sample.usage.total_tokens, 20);
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes text back"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(
        &self,
        arguments: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::Text(
            arguments["text"].as_str().unwrap_or_default().to_string(),
        ))
    }
}

#[tokio::test]
async fn tool_loop_appends_tool_messages_in_call_order() {
    let mut first = ToolCall::new("call-1", "echo");
    first
        .arguments
        .insert("text".into(), serde_json::json!("hi"));

    let api = ScriptedApi::new(vec![
        ScriptedStep::tool_call(first),
        ScriptedStep::text("all done"),
    ]);
    let model = Arc::new(Model::new(
        Arc::new(api),
        "mock/model",
        GenerateConfig::default(),
    ));

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    let task = Task {
        name: "tools".into(),
        dataset: vec![Sample::new("s1", "go", "done")],
        solver: Arc::new(ToolLoopSolver),
        scorers: vec![],
        tools: Arc::new(tools),
        config: GenerateConfig::default(),
    };

    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(EvalRecorder::new(dir.path().join("run.eval")));
    let results = eval_tasks(
        vec![(task, recorder)],
        model,
        Arc::new(EvalOptions::default()),
        no_cancel(),
    )
    .await
    .unwrap();

    let sample = &results[0].samples[0];
    assert!(sample.error.is_none(), "{:?}", sample.error);

    // user, assistant(tool_calls), tool result, assistant text
    assert_eq!(sample.messages.len(), 4);
    let calls = sample.messages[1].tool_calls().unwrap();
    assert_eq!(calls[0].id, "call-1");
    match &sample.messages[2] {
        ChatMessage::Tool {
            tool_call_id,
            function,
            ..
        } => {
            assert_eq!(tool_call_id.as_deref(), Some("call-1"));
            assert_eq!(function.as_deref(), Some("echo"));
        }
        other => panic!("expected tool message, got {other:?}"),
    }
    assert_eq!(sample.messages[2].text(), "hi");
    assert_eq!(sample.messages[3].text(), "all done");
}

#[tokio::test]
async fn scan_over_eval_logs_produces_result_tables() {
    // run an eval into a log dir
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    let recorder = Arc::new(EvalRecorder::new(logs.join("run.eval")));
    let model = Arc::new(Model::new(
        Arc::new(MockApi::new("ANSWER: 42")),
        "mock/model",
        GenerateConfig::default(),
    ));
    eval_tasks(
        vec![(numeric_task("scanned", 4), recorder)],
        model,
        Arc::new(EvalOptions::default()),
        no_cancel(),
    )
    .await
    .unwrap();

    // a scanner flagging transcripts whose answer was correct
    struct CorrectScanner;
    #[async_trait]
    impl verdict_scan::Scanner for CorrectScanner {
        fn name(&self) -> &str {
            "correct"
        }
        async fn scan(
            &self,
            transcript: &verdict_scan::ScanTranscript,
        ) -> anyhow::Result<Vec<ScanResult>> {
            let correct = transcript
                .messages
                .iter()
                .any(|m| m.is_assistant() && m.text().contains("42"));
            Ok(vec![ScanResult::value(correct)])
        }
    }
    register_scanner("e2e_correct", Arc::new(|_| Ok(Arc::new(CorrectScanner))));

    let transcripts = Transcripts::from_logs(&logs).unwrap();
    assert_eq!(transcripts.count(), 4);

    let results = verdict_scan::scan(
        "post",
        transcripts,
        &[ScanScanner {
            name: "e2e_correct".into(),
            params: serde_json::json!({}),
        }],
        &dir.path().join("scans"),
        &ScanOptions::default(),
        None,
    )
    .await
    .unwrap();

    let rows = &results.scanners["e2e_correct"];
    assert_eq!(rows.len(), 4);
    assert!(rows
        .iter()
        .all(|row| row["value"] == serde_json::json!(true)));
}
