//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COPILOT__*` 覆盖（双下划线表示嵌套，如 `COPILOT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub tools: ToolsSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、默认语言、系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 新会话未指定 locale 时使用
    pub default_locale: String,
    pub system_prompt: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_locale: "en".to_string(),
            system_prompt: None,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// [orchestrator] 段：上下文窗口与单轮工具调用上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub context_window: usize,
    pub max_tool_rounds: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            context_window: 20,
            max_tool_rounds: 3,
        }
    }
}

/// [tools] 段：工具超时、额外需审批的工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 在默认审批表之外追加的工具名
    pub extra_gated: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            extra_gated: Vec::new(),
        }
    }
}

/// [storage] 段：SQLite 路径（需 async-sqlite feature），未设置时用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 COPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COPILOT__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
