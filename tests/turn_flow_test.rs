//! 对话轮次端到端测试：文本回复、直接工具、待审批工具、校验失败、会话归属、上游超时

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use survey_copilot::approval::{Decision, TaskStatus};
use survey_copilot::config::AppConfig;
use survey_copilot::core::Stores;
use survey_copilot::ledger::ToolRunStatus;
use survey_copilot::llm::{EngineReply, LlmError, ScriptedEngine, TurnRole};
use survey_copilot::memory::Role;
use survey_copilot::store::MemoryStore;
use survey_copilot::tools::{InMemorySurveyBackend, SurveyStage, SurveySummary};
use survey_copilot::{Copilot, CopilotBuilder, CopilotError, TurnOutcome, TurnRequest};

const CALLER: &str = "hr-alice";

struct Harness {
    copilot: Copilot,
    backend: Arc<InMemorySurveyBackend>,
    engine: Arc<ScriptedEngine>,
}

async fn harness(replies: Vec<Result<EngineReply, LlmError>>) -> Harness {
    harness_with(ScriptedEngine::new(replies), AppConfig::default()).await
}

async fn harness_with(engine: ScriptedEngine, config: AppConfig) -> Harness {
    let backend = Arc::new(InMemorySurveyBackend::new());
    backend
        .insert(SurveySummary {
            id: "srv_q1".to_string(),
            title: "Q1 Engagement".to_string(),
            company_id: "acme".to_string(),
            stage: SurveyStage::Open,
            participants: 120,
            responses: 87,
        })
        .await;
    backend
        .insert(SurveySummary {
            id: "srv_globex".to_string(),
            title: "Globex Pulse".to_string(),
            company_id: "globex".to_string(),
            stage: SurveyStage::Open,
            participants: 10,
            responses: 2,
        })
        .await;

    let engine = Arc::new(engine);
    let copilot = CopilotBuilder::new(config)
        .with_stores(Stores::from_backend(Arc::new(MemoryStore::new())))
        .with_engine(engine.clone())
        .with_survey_backend(backend.clone())
        .build()
        .unwrap();
    Harness {
        copilot,
        backend,
        engine,
    }
}

fn turn(text: &str) -> TurnRequest {
    TurnRequest::new(CALLER, text).with_tenant("acme")
}

#[tokio::test]
async fn test_close_survey_goes_through_approval() {
    let h = harness(vec![Ok(EngineReply::tool_call(
        "close_survey",
        json!({"surveyId": "srv_q1"}),
    ))])
    .await;

    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("close the Q1 Engagement survey"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, TurnOutcome::AwaitingApproval);
    let pending = reply.pending_task.unwrap();
    assert_eq!(pending.status, TaskStatus::WaitingApproval);
    assert_eq!(pending.input, json!({"surveyId": "srv_q1"}));

    // 审批前：无 ToolRun，调研未关闭
    assert!(h
        .copilot
        .ledger
        .list_for_session(&reply.session_id)
        .await
        .unwrap()
        .is_empty());
    let before = h.copilot.approvals.get(CALLER, &pending.task_id).await.unwrap();
    assert_eq!(before.steps.len(), 1);
    assert_eq!(before.steps[0].input, json!({"surveyId": "srv_q1"}));

    let view = h
        .copilot
        .approvals
        .decide(CALLER, &pending.task_id, Decision::Approve)
        .await
        .unwrap();
    assert_eq!(view.task.status, TaskStatus::Succeeded);
    assert_eq!(view.tool_runs.len(), 1);
    assert_eq!(view.tool_runs[0].status, ToolRunStatus::Succeeded);
    assert_eq!(view.tool_runs[0].input, json!({"surveyId": "srv_q1"}));
    assert_eq!(view.tool_runs[0].task_id.as_deref(), Some(pending.task_id.as_str()));

    // 重复点击批准不会产生第二个 ToolRun
    let again = h
        .copilot
        .approvals
        .decide(CALLER, &pending.task_id, Decision::Approve)
        .await
        .unwrap();
    assert_eq!(again.task.status, TaskStatus::Succeeded);
    assert_eq!(
        h.copilot
            .ledger
            .list_for_session(&reply.session_id)
            .await
            .unwrap()
            .len(),
        1
    );

    let history = h.copilot.messages.history(&reply.session_id).await.unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Tool, Role::Assistant, Role::Tool, Role::Assistant]
    );
}

#[tokio::test]
async fn test_rejected_task_cannot_be_approved() {
    let h = harness(vec![Ok(EngineReply::tool_call(
        "send_reminders",
        json!({"surveyId": "srv_q1"}),
    ))])
    .await;
    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("nudge the people who haven't answered Q1"))
        .await
        .unwrap();
    let task_id = reply.pending_task.unwrap().task_id;

    let view = h
        .copilot
        .approvals
        .decide(CALLER, &task_id, Decision::Reject)
        .await
        .unwrap();
    assert_eq!(view.task.status, TaskStatus::Rejected);

    let err = h
        .copilot
        .approvals
        .decide(CALLER, &task_id, Decision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, CopilotError::StateConflict { .. }));
    assert!(h.backend.dispatches().await.is_empty());
}

#[tokio::test]
async fn test_out_of_scope_question_gets_plain_reply() {
    let h = harness(vec![Ok(EngineReply::text(
        "I can only help with surveys on this platform.",
    ))])
    .await;
    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("what's the weather"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, TurnOutcome::Replied);
    assert!(reply.pending_task.is_none());

    let history = h.copilot.messages.history(&reply.session_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);
    assert!(h
        .copilot
        .ledger
        .list_for_session(&reply.session_id)
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .copilot
        .approvals
        .list_for_session(CALLER, &reply.session_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_schema_violation_adds_exactly_one_turn() {
    let h = harness(vec![
        Ok(EngineReply::text("Hello!")),
        Ok(EngineReply::tool_call(
            "send_invitations",
            json!({"surveyId": 42, "channel": "pigeon"}),
        )),
    ])
    .await;
    let first = h
        .copilot
        .orchestrator
        .handle_turn(turn("hi"))
        .await
        .unwrap();
    let before = h.copilot.messages.history(&first.session_id).await.unwrap().len();

    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("invite everyone to Q1").in_session(&first.session_id))
        .await
        .unwrap();
    assert_eq!(reply.session_id, first.session_id);
    assert_eq!(reply.outcome, TurnOutcome::InvalidToolCall);

    // 用户消息 + 一条错误回复
    let after = h.copilot.messages.history(&reply.session_id).await.unwrap();
    assert_eq!(after.len(), before + 2);
    assert_eq!(after.last().unwrap().role, Role::Assistant);
    assert!(h
        .copilot
        .ledger
        .list_for_session(&reply.session_id)
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .copilot
        .approvals
        .list_for_session(CALLER, &reply.session_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_foreign_session_is_never_resumed() {
    let h = harness(vec![
        Ok(EngineReply::text("Hi Alice")),
        Ok(EngineReply::text("Hi Bob")),
    ])
    .await;
    let alice = h
        .copilot
        .orchestrator
        .handle_turn(turn("hello"))
        .await
        .unwrap();

    let bob = h
        .copilot
        .orchestrator
        .handle_turn(TurnRequest::new("hr-bob", "hello").in_session(&alice.session_id))
        .await
        .unwrap();
    assert_ne!(bob.session_id, alice.session_id);
    assert_eq!(
        h.copilot.messages.history(&alice.session_id).await.unwrap().len(),
        2
    );
    assert!(matches!(
        h.copilot.sessions.get_for_caller("hr-bob", &alice.session_id).await,
        Err(CopilotError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_direct_tool_is_scoped_to_tenant_and_fed_back() {
    let h = harness(vec![
        Ok(EngineReply::tool_call("list_surveys", json!({}))),
        Ok(EngineReply::text("You have one open survey: Q1 Engagement.")),
    ])
    .await;
    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("which surveys are running?"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, TurnOutcome::Replied);
    assert_eq!(reply.tool_run_ids.len(), 1);

    let run = h.copilot.ledger.get(&reply.tool_run_ids[0]).await.unwrap();
    assert_eq!(run.status, ToolRunStatus::Succeeded);
    let output = run.output.unwrap().to_string();
    assert!(output.contains("srv_q1"));
    assert!(!output.contains("srv_globex"));
}

#[tokio::test]
async fn test_upstream_timeout_keeps_user_message_and_session_usable() {
    let mut config = AppConfig::default();
    config.llm.request_timeout_secs = 1;
    // 首轮在取出回复之前就超时
    let engine = ScriptedEngine::new(Vec::new()).with_delay(Duration::from_millis(1500));
    let h = harness_with(engine, config).await;

    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("are you there?"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, TurnOutcome::UpstreamUnavailable);

    let history = h.copilot.messages.history(&reply.session_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content.as_deref(), Some("are you there?"));

    // 同一会话重试：原用户消息仍在上下文里
    h.engine.set_delay(None).await;
    h.engine.push(Ok(EngineReply::text("Yes, I'm here."))).await;
    let retry = h
        .copilot
        .orchestrator
        .handle_turn(turn("hello again").in_session(&reply.session_id))
        .await
        .unwrap();
    assert_eq!(retry.session_id, reply.session_id);
    assert_eq!(retry.outcome, TurnOutcome::Replied);
    assert_eq!(retry.reply_text, "Yes, I'm here.");

    let requests = h.engine.requests().await;
    assert_eq!(requests.len(), 2);
    let users: Vec<&str> = requests[1]
        .history
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .map(|t| t.text.as_str())
        .collect();
    assert_eq!(users, vec!["are you there?", "hello again"]);

    let recent = h
        .copilot
        .messages
        .recent_window(&reply.session_id, 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 4);
    assert!(recent.windows(2).all(|w| w[0].created_at < w[1].created_at));
}

#[tokio::test]
async fn test_abandon_while_close_is_pending_leaves_survey_open() {
    let h = harness(vec![
        Ok(EngineReply::tool_call("close_survey", json!({"surveyId": "srv_q1"}))),
        Ok(EngineReply::tool_call("get_survey", json!({"surveyId": "srv_q1"}))),
        Ok(EngineReply::text("Q1 Engagement is still open.")),
    ])
    .await;
    let reply = h
        .copilot
        .orchestrator
        .handle_turn(turn("close Q1"))
        .await
        .unwrap();
    let task_id = reply.pending_task.unwrap().task_id;

    let view = h.copilot.approvals.abandon(CALLER, &task_id).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Canceled);
    assert!(view.tool_runs.is_empty());
    assert!(matches!(
        h.copilot
            .approvals
            .decide(CALLER, &task_id, Decision::Approve)
            .await,
        Err(CopilotError::StateConflict { .. })
    ));

    let check = h
        .copilot
        .orchestrator
        .handle_turn(turn("is Q1 still open?").in_session(&reply.session_id))
        .await
        .unwrap();
    let run = h.copilot.ledger.get(&check.tool_run_ids[0]).await.unwrap();
    assert!(run.output.unwrap().to_string().contains("open"));
}
