//! 对话轮次编排
//!
//! 一轮 = 恢复/新建会话 → 先落盘用户消息 → 取上下文窗口 → 调推理引擎（带超时与取消）→
//! 文本直接回复；工具调用先校验，再按审批策略直接执行或转为待审批任务。
//! 直接执行的结果在同一轮内回喂给引擎，最多 max_tool_rounds 次。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalService, PendingTask, ProposeRequest};
use crate::core::CopilotError;
use crate::ledger::{NewToolRun, ToolRunLedger};
use crate::llm::{
    EngineReply, EngineRequest, EngineTurn, LlmError, ReasoningEngine, ToolResultTurn,
};
use crate::memory::{Message, MessageLog, NewMessage};
use crate::session::SessionManager;
use crate::tools::{ApprovalPolicy, ExecutionMode, ToolContext, ToolExecutor, ValidatedCall};

const UPSTREAM_APOLOGY: &str = "Sorry, something went wrong on my side. Please try again.";

/// 一次用户输入
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub caller_id: String,
    pub tenant_id: Option<String>,
    pub locale: Option<String>,
    /// 希望续接的会话；不存在 / 非本人 / 已关闭时会新建
    pub session_id: Option<String>,
    pub text: String,
}

impl TurnRequest {
    pub fn new(caller_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// 引擎给出文本回复（可能在若干次直接工具调用之后）
    Replied,
    /// 需审批工具已转为待审批任务
    AwaitingApproval,
    /// 工具调用未通过校验或工具不存在
    InvalidToolCall,
    /// 达到单轮工具调用上限
    ToolRoundLimit,
    /// 推理引擎失败 / 超时 / 被取消
    UpstreamUnavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    pub reply_text: String,
    pub pending_task: Option<PendingTask>,
    pub outcome: TurnOutcome,
    /// 本轮直接执行产生的 ToolRun
    pub tool_run_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: Option<String>,
    /// 回放给引擎的最近消息数
    pub context_window: usize,
    pub max_tool_rounds: usize,
    pub engine_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            context_window: 20,
            max_tool_rounds: 3,
            engine_timeout: Duration::from_secs(60),
        }
    }
}

pub struct TurnOrchestrator {
    sessions: SessionManager,
    messages: MessageLog,
    ledger: ToolRunLedger,
    approvals: Arc<ApprovalService>,
    executor: Arc<ToolExecutor>,
    policy: ApprovalPolicy,
    engine: Arc<dyn ReasoningEngine>,
    settings: OrchestratorSettings,
}

/// 单轮内的可变状态
struct TurnState {
    session_id: String,
    user_message: Message,
    ctx: ToolContext,
    tool_results: Vec<ToolResultTurn>,
    tool_run_ids: Vec<String>,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionManager,
        messages: MessageLog,
        ledger: ToolRunLedger,
        approvals: Arc<ApprovalService>,
        executor: Arc<ToolExecutor>,
        policy: ApprovalPolicy,
        engine: Arc<dyn ReasoningEngine>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            sessions,
            messages,
            ledger,
            approvals,
            executor,
            policy,
            engine,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnReply, CopilotError> {
        self.handle_turn_with_cancel(request, CancellationToken::new())
            .await
    }

    /// 处理一轮；cancel 触发时放弃等待引擎，用户消息保持已落盘
    pub async fn handle_turn_with_cancel(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnReply, CopilotError> {
        let session_id = self
            .sessions
            .resume_or_create(
                &request.caller_id,
                request.tenant_id.as_deref(),
                request.locale.as_deref(),
                request.session_id.as_deref(),
            )
            .await?;
        // 续接的会话沿用创建时的 locale 与租户范围
        let session = self
            .sessions
            .get_for_caller(&request.caller_id, &session_id)
            .await?;
        let locale = session.locale;

        let user_message = self
            .messages
            .append(NewMessage::user(&session_id, request.text.clone()))
            .await?;
        self.sessions.touch(&session_id).await?;

        let history: Vec<EngineTurn> = self
            .messages
            .context_window(&session_id, self.settings.context_window)
            .await?
            .iter()
            .filter_map(EngineTurn::from_message)
            .collect();

        let mut state = TurnState {
            ctx: ToolContext {
                caller_id: request.caller_id.clone(),
                tenant_id: session.tenant_id,
                session_id: session_id.clone(),
            },
            session_id,
            user_message,
            tool_results: Vec::new(),
            tool_run_ids: Vec::new(),
        };

        loop {
            let engine_request = EngineRequest {
                system: self.settings.system_prompt.clone(),
                locale: Some(locale.clone()),
                history: history.clone(),
                tool_results: state.tool_results.clone(),
                tools: self.executor.registry().declarations(),
            };

            let reply = match self.call_engine(&engine_request, &cancel).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(session_id = %state.session_id, error = %e, "Reasoning engine unavailable");
                    return self
                        .finish(state, UPSTREAM_APOLOGY.to_string(), TurnOutcome::UpstreamUnavailable, None)
                        .await;
                }
            };

            let (name, arguments) = match reply {
                EngineReply::Text { content } => {
                    return self.finish(state, content, TurnOutcome::Replied, None).await;
                }
                EngineReply::ToolCall { name, arguments } => (name, arguments),
            };

            if state.tool_results.len() >= self.settings.max_tool_rounds {
                tracing::warn!(
                    session_id = %state.session_id,
                    tool = %name,
                    rounds = state.tool_results.len(),
                    "Tool round limit reached"
                );
                let text = format!(
                    "I stopped after {} tool calls without reaching an answer. Could you narrow the request?",
                    state.tool_results.len()
                );
                return self.finish(state, text, TurnOutcome::ToolRoundLimit, None).await;
            }

            let call = match self.executor.registry().validate(&name, &arguments) {
                Ok(call) => call,
                Err(e) if e.is_conversational() => {
                    tracing::info!(session_id = %state.session_id, tool = %name, error = %e, "Rejected tool call");
                    let text = format!("I couldn't run that action. {e}");
                    return self.finish(state, text, TurnOutcome::InvalidToolCall, None).await;
                }
                Err(e) => return Err(e),
            };

            match self.policy.mode(&call.tool_name) {
                ExecutionMode::Gated => return self.propose(state, &request, call).await,
                ExecutionMode::Direct => match self.run_direct(&mut state, call).await {
                    Ok(()) => {}
                    Err(e @ CopilotError::UpstreamUnavailable(_)) => {
                        tracing::warn!(session_id = %state.session_id, error = %e, "Tool backend unavailable");
                        return self
                            .finish(state, UPSTREAM_APOLOGY.to_string(), TurnOutcome::UpstreamUnavailable, None)
                            .await;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn call_engine(
        &self,
        request: &EngineRequest,
        cancel: &CancellationToken,
    ) -> Result<EngineReply, LlmError> {
        let timeout = self.settings.engine_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = tokio::time::timeout(timeout, self.engine.respond(request)) => {
                result.unwrap_or(Err(LlmError::Timeout(timeout.as_secs())))
            }
        }
    }

    /// 直接执行：ToolRun pending → running → succeeded | failed，结果写入 tool 轮次并回喂引擎
    ///
    /// 工具领域错误照常回喂；超时在记账后以 UpstreamUnavailable 返回，由调用方结束本轮
    async fn run_direct(&self, state: &mut TurnState, call: ValidatedCall) -> Result<(), CopilotError> {
        let run = self
            .ledger
            .open(NewToolRun {
                session_id: state.session_id.clone(),
                message_id: Some(state.user_message.id.clone()),
                task_id: None,
                step_id: None,
                tool_name: call.tool_name.clone(),
                input: call.arguments.clone(),
            })
            .await?;
        let run = self.ledger.start(run).await?;
        state.tool_run_ids.push(run.id.clone());

        let (output, unavailable) = match self.executor.execute(&state.ctx, &call).await {
            Ok(output) => {
                self.ledger.succeed(run, output.clone()).await?;
                (output, None)
            }
            Err(failure) => {
                let error = CopilotError::from(failure);
                self.ledger.fail(run, error.to_string()).await?;
                let output = json!({ "error": error.to_string() });
                (output, matches!(error, CopilotError::UpstreamUnavailable(_)).then_some(error))
            }
        };

        self.messages
            .append(NewMessage::tool(
                &state.session_id,
                &call.tool_name,
                call.arguments.clone(),
                output.clone(),
            ))
            .await?;
        if let Some(error) = unavailable {
            return Err(error);
        }
        state.tool_results.push(ToolResultTurn {
            tool_name: call.tool_name,
            arguments: call.arguments,
            output,
        });
        Ok(())
    }

    /// 需审批：建 Task/Step，写一条 tool 审计轮次与一条说明性助手回复，不执行
    async fn propose(
        &self,
        state: TurnState,
        request: &TurnRequest,
        call: ValidatedCall,
    ) -> Result<TurnReply, CopilotError> {
        let title = proposal_title(&call.tool_name, &call.arguments);
        let pending = self
            .approvals
            .propose(ProposeRequest {
                session_id: state.session_id.clone(),
                created_by: request.caller_id.clone(),
                tenant_id: state.ctx.tenant_id.clone(),
                title: title.clone(),
                goal: Some(request.text.clone()),
                call: call.clone(),
            })
            .await?;

        self.messages
            .append(NewMessage::tool(
                &state.session_id,
                &call.tool_name,
                call.arguments,
                json!({ "status": pending.status, "taskId": pending.task_id }),
            ))
            .await?;

        let text = format!("This needs your approval before I proceed: {title}. Approve or reject to continue.");
        self.finish(state, text, TurnOutcome::AwaitingApproval, Some(pending))
            .await
    }

    async fn finish(
        &self,
        state: TurnState,
        reply_text: String,
        outcome: TurnOutcome,
        pending_task: Option<PendingTask>,
    ) -> Result<TurnReply, CopilotError> {
        self.messages
            .append(NewMessage::assistant(&state.session_id, reply_text.clone()))
            .await?;
        self.sessions.touch(&state.session_id).await?;
        tracing::info!(
            session_id = %state.session_id,
            outcome = ?outcome,
            tool_runs = state.tool_run_ids.len(),
            "Turn finished"
        );
        Ok(TurnReply {
            session_id: state.session_id,
            reply_text,
            pending_task,
            outcome,
            tool_run_ids: state.tool_run_ids,
        })
    }
}

/// 待审批任务标题，如 `close_survey (surveyId=srv_q1)`
fn proposal_title(tool_name: &str, arguments: &Value) -> String {
    let Some(fields) = arguments.as_object().filter(|m| !m.is_empty()) else {
        return tool_name.to_string();
    };
    let params = fields
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{tool_name} ({params})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::TaskStatus;
    use crate::ledger::ToolRunStatus;
    use crate::llm::{parse_engine_output, ScriptedEngine};
    use crate::memory::Role;
    use crate::store::MemoryStore;
    use crate::tools::survey::SurveySummary;
    use crate::tools::{
        register_survey_tools, InMemorySurveyBackend, SurveyStage, Tool, ToolRegistry,
    };
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct SlowLookupInput {}

    /// 后端卡住的只读工具
    struct SlowLookupTool;

    #[async_trait]
    impl Tool for SlowLookupTool {
        type Input = SlowLookupInput;

        fn name(&self) -> &str {
            "slow_lookup"
        }

        fn description(&self) -> &str {
            "Look up survey data from a slow backend"
        }

        async fn execute(&self, _ctx: &ToolContext, _input: SlowLookupInput) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(json!({ "rows": 0 }))
        }
    }

    struct Fixture {
        orchestrator: TurnOrchestrator,
        engine: Arc<ScriptedEngine>,
        messages: MessageLog,
        ledger: ToolRunLedger,
        approvals: Arc<ApprovalService>,
    }

    async fn fixture(engine: ScriptedEngine, settings: OrchestratorSettings) -> Fixture {
        fixture_with(engine, settings, 5, |_| {}).await
    }

    async fn fixture_with(
        engine: ScriptedEngine,
        settings: OrchestratorSettings,
        tool_timeout_secs: u64,
        extra_tools: impl FnOnce(&mut ToolRegistry),
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(InMemorySurveyBackend::new());
        backend
            .insert(SurveySummary {
                id: "srv_q1".to_string(),
                title: "Q1 Engagement".to_string(),
                company_id: "acme".to_string(),
                stage: SurveyStage::Open,
                participants: 40,
                responses: 31,
            })
            .await;
        backend
            .insert(SurveySummary {
                id: "srv_globex".to_string(),
                title: "Globex Pulse".to_string(),
                company_id: "globex".to_string(),
                stage: SurveyStage::Open,
                participants: 8,
                responses: 1,
            })
            .await;
        let mut registry = ToolRegistry::new();
        register_survey_tools(&mut registry, backend).unwrap();
        extra_tools(&mut registry);
        let executor = Arc::new(ToolExecutor::new(Arc::new(registry), tool_timeout_secs));

        let sessions = SessionManager::new(store.clone(), "en");
        let messages = MessageLog::new(store.clone());
        let ledger = ToolRunLedger::new(store.clone());
        let approvals = Arc::new(ApprovalService::new(
            store,
            ledger.clone(),
            messages.clone(),
            sessions.clone(),
            executor.clone(),
        ));
        let engine = Arc::new(engine);
        let orchestrator = TurnOrchestrator::new(
            sessions,
            messages.clone(),
            ledger.clone(),
            approvals.clone(),
            executor,
            ApprovalPolicy::default(),
            engine.clone(),
            settings,
        );
        Fixture {
            orchestrator,
            engine,
            messages,
            ledger,
            approvals,
        }
    }

    #[tokio::test]
    async fn test_text_reply() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::text("Hi Alice"))]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "hello"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::Replied);
        assert_eq!(reply.reply_text, "Hi Alice");

        let history = f.messages.history(&reply.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);

        // 引擎看到的上下文包含本轮用户消息
        let requests = f.engine.requests().await;
        assert_eq!(requests[0].history, vec![EngineTurn::user("hello")]);
        assert_eq!(requests[0].tools.len(), 9);
    }

    #[tokio::test]
    async fn test_direct_tool_result_is_fed_back() {
        let f = fixture(
            ScriptedEngine::new(vec![
                Ok(EngineReply::tool_call("survey_response_stats", json!({"surveyId": "srv_q1"}))),
                Ok(EngineReply::text("31 of 40 responded.")),
            ]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "how is Q1 going?").with_tenant("acme"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::Replied);
        assert_eq!(reply.tool_run_ids.len(), 1);

        let run = f.ledger.get(&reply.tool_run_ids[0]).await.unwrap();
        assert_eq!(run.status, ToolRunStatus::Succeeded);
        assert!(run.message_id.is_some());

        let requests = f.engine.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].tool_results.len(), 1);
        assert_eq!(requests[1].tool_results[0].tool_name, "survey_response_stats");
        // tool 轮次不进入回放历史
        assert_eq!(requests[1].history, requests[0].history);

        let roles: Vec<Role> = f
            .messages
            .history(&reply.session_id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_gated_tool_creates_task_without_run() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::tool_call(
                "close_survey",
                json!({"surveyId": "srv_q1"}),
            ))]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "close the Q1 Engagement survey"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::AwaitingApproval);
        let pending = reply.pending_task.unwrap();
        assert_eq!(pending.status, TaskStatus::WaitingApproval);
        assert_eq!(pending.title, "close_survey (surveyId=srv_q1)");
        assert!(f.ledger.list_for_session(&reply.session_id).await.unwrap().is_empty());

        let view = f.approvals.get("alice", &pending.task_id).await.unwrap();
        assert_eq!(view.task.goal.as_deref(), Some("close the Q1 Engagement survey"));
        assert_eq!(view.steps[0].input, json!({"surveyId": "srv_q1"}));
    }

    #[tokio::test]
    async fn test_invalid_tool_call_adds_one_turn() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::tool_call(
                "close_survey",
                json!({"survey": 7}),
            ))]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "close it"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::InvalidToolCall);
        assert!(reply.reply_text.contains("surveyId"));

        let history = f.messages.history(&reply.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(f.ledger.list_for_session(&reply.session_id).await.unwrap().is_empty());
        assert!(f
            .approvals
            .list_for_session("alice", &reply.session_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_conversational() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::tool_call("delete_company", json!({})))]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "delete acme"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::InvalidToolCall);
        assert!(reply.reply_text.contains("delete_company"));
    }

    #[tokio::test]
    async fn test_tool_round_limit() {
        let call = || Ok(EngineReply::tool_call("list_surveys", json!({})));
        let f = fixture(
            ScriptedEngine::new(vec![call(), call(), call()]),
            OrchestratorSettings {
                max_tool_rounds: 2,
                ..Default::default()
            },
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "list surveys forever"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::ToolRoundLimit);
        assert_eq!(reply.tool_run_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_timeout_keeps_user_message() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::text("too late"))])
                .with_delay(Duration::from_secs(5)),
            OrchestratorSettings {
                engine_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "hello?"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::UpstreamUnavailable);

        let history = f.messages.history(&reply.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content.as_deref(), Some("hello?"));
        assert_eq!(history[1].content.as_deref(), Some(UPSTREAM_APOLOGY));
    }

    #[tokio::test]
    async fn test_malformed_engine_reply_is_upstream_error() {
        let f = fixture(
            ScriptedEngine::new(vec![parse_engine_output(
                r#"{"tool": "close_survey", "args": "#,
            )]),
            OrchestratorSettings::default(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "close Q1"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::UpstreamUnavailable);
        assert_eq!(reply.reply_text, UPSTREAM_APOLOGY);

        let history = f.messages.history(&reply.session_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|m| !m.content.as_deref().unwrap_or_default().contains("\"tool\"")));
        assert!(f
            .approvals
            .list_for_session("alice", &reply.session_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_direct_tool_timeout_ends_turn_as_upstream_error() {
        let f = fixture_with(
            ScriptedEngine::new(vec![
                Ok(EngineReply::tool_call("slow_lookup", json!({}))),
                Ok(EngineReply::text("should not be asked")),
            ]),
            OrchestratorSettings::default(),
            1,
            |registry| registry.register(SlowLookupTool).unwrap(),
        )
        .await;
        let reply = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "pull the slow report"))
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::UpstreamUnavailable);
        assert_eq!(reply.reply_text, UPSTREAM_APOLOGY);
        assert_eq!(f.engine.requests().await.len(), 1);

        let run = f.ledger.get(&reply.tool_run_ids[0]).await.unwrap();
        assert_eq!(run.status, ToolRunStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.starts_with("Upstream unavailable"), "{error}");
        assert!(error.contains("timed out"));

        let roles: Vec<Role> = f
            .messages
            .history(&reply.session_id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_resumed_session_keeps_its_tenant_scope() {
        let f = fixture(
            ScriptedEngine::new(vec![
                Ok(EngineReply::text("Hi")),
                Ok(EngineReply::tool_call("list_surveys", json!({}))),
                Ok(EngineReply::text("One survey.")),
                Ok(EngineReply::tool_call("list_surveys", json!({}))),
                Ok(EngineReply::text("Still one survey.")),
            ]),
            OrchestratorSettings::default(),
        )
        .await;
        let first = f
            .orchestrator
            .handle_turn(TurnRequest::new("alice", "hello").with_tenant("acme"))
            .await
            .unwrap();

        // 续接时不带租户，或带了别的租户，都按会话创建时的 acme 限定
        for request in [
            TurnRequest::new("alice", "list surveys"),
            TurnRequest::new("alice", "list surveys").with_tenant("globex"),
        ] {
            let reply = f
                .orchestrator
                .handle_turn(request.in_session(&first.session_id))
                .await
                .unwrap();
            assert_eq!(reply.session_id, first.session_id);
            let run = f.ledger.get(&reply.tool_run_ids[0]).await.unwrap();
            let output = run.output.unwrap().to_string();
            assert!(output.contains("srv_q1"));
            assert!(!output.contains("srv_globex"));
        }
    }

    #[tokio::test]
    async fn test_cancelled_turn() {
        let f = fixture(
            ScriptedEngine::new(vec![Ok(EngineReply::text("never"))])
                .with_delay(Duration::from_secs(5)),
            OrchestratorSettings::default(),
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reply = f
            .orchestrator
            .handle_turn_with_cancel(TurnRequest::new("alice", "hi"), cancel)
            .await
            .unwrap();
        assert_eq!(reply.outcome, TurnOutcome::UpstreamUnavailable);
    }

    #[test]
    fn test_proposal_title() {
        assert_eq!(proposal_title("send_reminders", &json!({})), "send_reminders");
        assert_eq!(
            proposal_title("send_invitations", &json!({"surveyId": "s1", "limit": 5})),
            "send_invitations (limit=5, surveyId=s1)"
        );
    }
}
