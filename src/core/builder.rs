//! Copilot 构建器：统一的初始化逻辑
//!
//! 按配置组装存储、工具注册表、审批策略、执行器、审批服务与轮次编排器。

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalService;
use crate::config::{AppConfig, LlmSection};
use crate::core::orchestrator::{OrchestratorSettings, TurnOrchestrator};
use crate::core::CopilotError;
use crate::ledger::ToolRunLedger;
use crate::llm::{MockEngine, OpenAiEngine, ReasoningEngine};
use crate::memory::MessageLog;
use crate::session::SessionManager;
use crate::store::{MemoryStore, MessageStore, SessionStore, TaskStore, ToolRunStore};
use crate::tools::{
    register_survey_tools, ApprovalPolicy, InMemorySurveyBackend, SurveyBackend, ToolExecutor,
    ToolRegistry,
};

/// 四个逻辑存储；通常由同一个后端实现
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub tool_runs: Arc<dyn ToolRunStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: SessionStore + MessageStore + ToolRunStore + TaskStore + 'static,
    {
        Self {
            sessions: backend.clone(),
            messages: backend.clone(),
            tool_runs: backend.clone(),
            tasks: backend,
        }
    }
}

/// 组装完成的各组件
pub struct Copilot {
    pub orchestrator: TurnOrchestrator,
    pub approvals: Arc<ApprovalService>,
    pub sessions: SessionManager,
    pub messages: MessageLog,
    pub ledger: ToolRunLedger,
    pub registry: Arc<ToolRegistry>,
    pub policy: ApprovalPolicy,
}

pub struct CopilotBuilder {
    config: AppConfig,
    stores: Option<Stores>,
    engine: Option<Arc<dyn ReasoningEngine>>,
    backend: Option<Arc<dyn SurveyBackend>>,
}

impl CopilotBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            stores: None,
            engine: None,
            backend: None,
        }
    }

    /// 未设置时使用 MemoryStore
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// 未设置时按 [llm] 段创建
    pub fn with_engine(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// 未设置时使用空的 InMemorySurveyBackend
    pub fn with_survey_backend(mut self, backend: Arc<dyn SurveyBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Copilot, CopilotError> {
        let config = self.config;
        let stores = self
            .stores
            .unwrap_or_else(|| Stores::from_backend(Arc::new(MemoryStore::new())));
        let engine = match self.engine {
            Some(engine) => engine,
            None => create_engine_from_config(&config.llm)?,
        };
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemorySurveyBackend::new()) as Arc<dyn SurveyBackend>);

        let mut registry = ToolRegistry::new();
        register_survey_tools(&mut registry, backend)?;
        let registry = Arc::new(registry);

        let policy = ApprovalPolicy::default().with_gated(config.tools.extra_gated.iter().cloned());
        for name in &config.tools.extra_gated {
            if !registry.contains(name) {
                tracing::warn!(tool = %name, "extra_gated names an unregistered tool");
            }
        }

        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            config.tools.tool_timeout_secs,
        ));
        let sessions = SessionManager::new(stores.sessions, config.app.default_locale.clone());
        let messages = MessageLog::new(stores.messages);
        let ledger = ToolRunLedger::new(stores.tool_runs);
        let approvals = Arc::new(ApprovalService::new(
            stores.tasks,
            ledger.clone(),
            messages.clone(),
            sessions.clone(),
            executor.clone(),
        ));

        let settings = OrchestratorSettings {
            system_prompt: config.app.system_prompt.clone(),
            context_window: config.orchestrator.context_window,
            max_tool_rounds: config.orchestrator.max_tool_rounds,
            engine_timeout: Duration::from_secs(config.llm.request_timeout_secs),
        };
        let orchestrator = TurnOrchestrator::new(
            sessions.clone(),
            messages.clone(),
            ledger.clone(),
            approvals.clone(),
            executor,
            policy.clone(),
            engine,
            settings,
        );

        tracing::info!(
            tools = registry.tool_names().len(),
            provider = %config.llm.provider,
            "Copilot assembled"
        );

        Ok(Copilot {
            orchestrator,
            approvals,
            sessions,
            messages,
            ledger,
            registry,
            policy,
        })
    }
}

/// 按 [llm] 段创建推理引擎：openai 走 OpenAI 兼容端点，mock 为本地回显
pub fn create_engine_from_config(
    llm: &LlmSection,
) -> Result<Arc<dyn ReasoningEngine>, CopilotError> {
    match llm.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEngine::new(
            llm.base_url.as_deref(),
            &llm.model,
            None,
        ))),
        "mock" => Ok(Arc::new(MockEngine)),
        other => Err(CopilotError::Config(format!("unknown llm provider: {other}"))),
    }
}
