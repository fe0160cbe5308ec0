//! Survey Copilot 命令行
//!
//! 入口：初始化日志、加载配置、组装编排器，然后在终端里逐行对话。
//! `/approve <task_id>`、`/reject <task_id>`、`/abandon <task_id>` 处理待审批动作，`/tasks` 列出本会话任务，
//! `/sessions` 列出本人会话（`/sessions <id>` 切换），`/tools` 列出工具及是否需审批（`/tools json` 输出完整声明）。

use std::sync::Arc;

use anyhow::Context;
use survey_copilot::approval::Decision;
use survey_copilot::config::{load_config, AppConfig};
use survey_copilot::core::Stores;
use survey_copilot::tools::{InMemorySurveyBackend, SurveyStage, SurveySummary};
use survey_copilot::{Copilot, CopilotBuilder, TurnRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    survey_copilot::observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let backend = Arc::new(InMemorySurveyBackend::new());
    seed_surveys(&backend).await;

    let copilot = CopilotBuilder::new(config.clone())
        .with_stores(open_stores(&config).await?)
        .with_survey_backend(backend)
        .build()
        .context("Failed to assemble copilot")?;

    let caller_id = std::env::var("COPILOT_USER").unwrap_or_else(|_| "hr-admin".to_string());
    let tenant_id = std::env::var("COPILOT_TENANT").ok();
    run_repl(&copilot, &caller_id, tenant_id).await
}

#[cfg(feature = "async-sqlite")]
async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    use survey_copilot::store::{MemoryStore, SqliteStore};

    match &config.storage.sqlite_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create data directory")?;
            }
            let store = SqliteStore::open(path)
                .await
                .context("Failed to open SQLite store")?;
            Ok(Stores::from_backend(Arc::new(store)))
        }
        None => Ok(Stores::from_backend(Arc::new(MemoryStore::new()))),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    use survey_copilot::store::MemoryStore;

    if config.storage.sqlite_path.is_some() {
        tracing::warn!("storage.sqlite_path is set but the async-sqlite feature is off, using memory");
    }
    Ok(Stores::from_backend(Arc::new(MemoryStore::new())))
}

async fn seed_surveys(backend: &InMemorySurveyBackend) {
    let seeds = [
        ("srv_q1_engagement", "Q1 Engagement", "acme", SurveyStage::Open, 120, 87),
        ("srv_onboarding", "Onboarding Pulse", "acme", SurveyStage::Draft, 0, 0),
        ("srv_wellbeing", "Wellbeing Check", "globex", SurveyStage::Closed, 60, 58),
    ];
    for (id, title, company, stage, participants, responses) in seeds {
        backend
            .insert(SurveySummary {
                id: id.to_string(),
                title: title.to_string(),
                company_id: company.to_string(),
                stage,
                participants,
                responses,
            })
            .await;
    }
}

async fn run_repl(
    copilot: &Copilot,
    caller_id: &str,
    tenant_id: Option<String>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut session_id: Option<String> = None;

    stdout
        .write_all(
            b"survey-copilot ready. /tasks, /sessions [id], /tools [json], /approve <id>, /reject <id>, /abandon <id>, /quit\n",
        )
        .await?;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/tasks", _) => match &session_id {
                Some(sid) => copilot
                    .approvals
                    .list_for_session(caller_id, sid)
                    .await?
                    .iter()
                    .map(|t| format!("{}  [{}]  {}", t.id, t.status, t.title))
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => "(no session yet)".to_string(),
            },
            ("/sessions", "") => copilot
                .sessions
                .list_for_caller(caller_id)
                .await?
                .iter()
                .map(|s| {
                    let marker = if session_id.as_deref() == Some(s.id.as_str()) { "*" } else { " " };
                    format!("{marker} {}  [{}]  last active {}", s.id, s.status.as_str(), s.last_message_at)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            ("/sessions", id) => match copilot.sessions.get_for_caller(caller_id, id.trim()).await {
                Ok(session) => {
                    session_id = Some(session.id.clone());
                    format!("switched to {}", session.id)
                }
                Err(e) => format!("error: {e}"),
            },
            ("/tools", "json") => copilot.registry.to_schema_json(),
            ("/tools", _) => copilot
                .registry
                .declarations()
                .iter()
                .map(|d| {
                    let mode = if copilot.policy.requires_approval(&d.name) {
                        "needs approval"
                    } else {
                        "direct"
                    };
                    format!("{:<28} {:<15} {}", d.name, mode, d.description)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            (cmd @ ("/approve" | "/reject"), task_id) => {
                let decision = Decision::parse(cmd.trim_start_matches('/'))
                    .context("invalid decision")?;
                match copilot
                    .approvals
                    .decide(caller_id, task_id.trim(), decision)
                    .await
                {
                    Ok(view) => format!("task {} is now {}", view.task.id, view.task.status),
                    Err(e) => format!("error: {e}"),
                }
            }
            ("/abandon", task_id) => match copilot.approvals.abandon(caller_id, task_id.trim()).await {
                Ok(view) => format!("task {} is now {}", view.task.id, view.task.status),
                Err(e) => format!("error: {e}"),
            },
            _ => {
                let request = TurnRequest {
                    caller_id: caller_id.to_string(),
                    tenant_id: tenant_id.clone(),
                    locale: None,
                    session_id: session_id.clone(),
                    text: line.to_string(),
                };
                let reply = copilot
                    .orchestrator
                    .handle_turn(request)
                    .await
                    .context("Turn failed")?;
                session_id = Some(reply.session_id.clone());
                match reply.pending_task {
                    Some(task) => format!("{}\n  pending task: {}", reply.reply_text, task.task_id),
                    None => reply.reply_text,
                }
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }

    Ok(())
}
