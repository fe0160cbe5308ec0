//! 调研平台工具集
//!
//! 工具本身只做参数声明与结果序列化，具体业务逻辑（发邮件、改阶段、生成报告等）由注入的 SurveyBackend 承担。
//! InMemorySurveyBackend 供本地运行与测试。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::CopilotError;
use crate::tools::{Tool, ToolContext, ToolRegistry};

/// 调研生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStage {
    Draft,
    Open,
    Closed,
    Archived,
}

impl SurveyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyStage::Draft => "draft",
            SurveyStage::Open => "open",
            SurveyStage::Closed => "closed",
            SurveyStage::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveySummary {
    pub id: String,
    pub title: String,
    pub company_id: String,
    pub stage: SurveyStage,
    pub participants: u32,
    pub responses: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStats {
    pub survey_id: String,
    pub participants: u32,
    pub responses: u32,
    pub response_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub survey_id: String,
    pub kind: String,
    pub recipients: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportJob {
    pub survey_id: String,
    pub job_id: String,
}

/// 调研业务后端（外部协作者）；错误以文本返回，由台账原样记录
#[async_trait]
pub trait SurveyBackend: Send + Sync {
    async fn list_surveys(
        &self,
        ctx: &ToolContext,
        stage: Option<SurveyStage>,
    ) -> Result<Vec<SurveySummary>, String>;

    async fn get_survey(&self, ctx: &ToolContext, survey_id: &str) -> Result<SurveySummary, String>;

    async fn response_stats(&self, ctx: &ToolContext, survey_id: &str) -> Result<ResponseStats, String>;

    async fn send_invitations(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        participant_ids: Option<&[String]>,
    ) -> Result<DispatchReceipt, String>;

    async fn send_reminders(&self, ctx: &ToolContext, survey_id: &str) -> Result<DispatchReceipt, String>;

    async fn change_stage(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        stage: SurveyStage,
    ) -> Result<SurveySummary, String>;

    async fn trigger_report(&self, ctx: &ToolContext, survey_id: &str) -> Result<ReportJob, String>;

    async fn assign_to_company(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        company_id: &str,
    ) -> Result<SurveySummary, String>;
}

fn to_output<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

// ---------- 入参 ----------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListSurveysInput {
    /// 仅列出该阶段的调研
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<SurveyStage>,
}

/// 只需调研 ID 的入参
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SurveyRef {
    #[schemars(length(min = 1))]
    pub survey_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendInvitationsInput {
    #[schemars(length(min = 1))]
    pub survey_id: String,
    /// 只邀请这些参与者；缺省时邀请全部
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangeStageInput {
    #[schemars(length(min = 1))]
    pub survey_id: String,
    pub stage: SurveyStage,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AssignSurveyInput {
    #[schemars(length(min = 1))]
    pub survey_id: String,
    #[schemars(length(min = 1))]
    pub company_id: String,
}

// ---------- 只读工具 ----------

pub struct ListSurveysTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for ListSurveysTool {
    type Input = ListSurveysInput;

    fn name(&self) -> &str {
        "list_surveys"
    }

    fn description(&self) -> &str {
        "List surveys visible to the current user, optionally filtered by stage."
    }

    async fn execute(&self, ctx: &ToolContext, input: ListSurveysInput) -> Result<Value, String> {
        let surveys = self.backend.list_surveys(ctx, input.stage).await?;
        to_output(serde_json::json!({ "surveys": surveys }))
    }
}

pub struct GetSurveyTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for GetSurveyTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "get_survey"
    }

    fn description(&self) -> &str {
        "Get one survey by id: title, company, stage and participation counts."
    }

    async fn execute(&self, ctx: &ToolContext, input: SurveyRef) -> Result<Value, String> {
        to_output(self.backend.get_survey(ctx, &input.survey_id).await?)
    }
}

pub struct SurveyStatsTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for SurveyStatsTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "survey_response_stats"
    }

    fn description(&self) -> &str {
        "Get response statistics (participants, responses, response rate) for a survey."
    }

    async fn execute(&self, ctx: &ToolContext, input: SurveyRef) -> Result<Value, String> {
        to_output(self.backend.response_stats(ctx, &input.survey_id).await?)
    }
}

// ---------- 变更工具（默认需审批） ----------

pub struct SendInvitationsTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for SendInvitationsTool {
    type Input = SendInvitationsInput;

    fn name(&self) -> &str {
        "send_invitations"
    }

    fn description(&self) -> &str {
        "Email survey invitations to all participants, or only to the given participant ids."
    }

    async fn execute(&self, ctx: &ToolContext, input: SendInvitationsInput) -> Result<Value, String> {
        let receipt = self
            .backend
            .send_invitations(ctx, &input.survey_id, input.participant_ids.as_deref())
            .await?;
        to_output(receipt)
    }
}

pub struct SendRemindersTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for SendRemindersTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "send_reminders"
    }

    fn description(&self) -> &str {
        "Email reminders to participants who have not responded yet."
    }

    async fn execute(&self, ctx: &ToolContext, input: SurveyRef) -> Result<Value, String> {
        to_output(self.backend.send_reminders(ctx, &input.survey_id).await?)
    }
}

pub struct CloseSurveyTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for CloseSurveyTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "close_survey"
    }

    fn description(&self) -> &str {
        "Close a survey so that no further responses are accepted."
    }

    async fn execute(&self, ctx: &ToolContext, input: SurveyRef) -> Result<Value, String> {
        let survey = self
            .backend
            .change_stage(ctx, &input.survey_id, SurveyStage::Closed)
            .await?;
        to_output(survey)
    }
}

pub struct ChangeStageTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for ChangeStageTool {
    type Input = ChangeStageInput;

    fn name(&self) -> &str {
        "change_survey_stage"
    }

    fn description(&self) -> &str {
        "Move a survey to another lifecycle stage (draft, open, closed, archived)."
    }

    async fn execute(&self, ctx: &ToolContext, input: ChangeStageInput) -> Result<Value, String> {
        to_output(
            self.backend
                .change_stage(ctx, &input.survey_id, input.stage)
                .await?,
        )
    }
}

pub struct TriggerReportTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for TriggerReportTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "trigger_report_generation"
    }

    fn description(&self) -> &str {
        "Start generating the results report for a survey."
    }

    async fn execute(&self, ctx: &ToolContext, input: SurveyRef) -> Result<Value, String> {
        to_output(self.backend.trigger_report(ctx, &input.survey_id).await?)
    }
}

pub struct AssignSurveyTool {
    backend: Arc<dyn SurveyBackend>,
}

#[async_trait]
impl Tool for AssignSurveyTool {
    type Input = AssignSurveyInput;

    fn name(&self) -> &str {
        "assign_survey_to_company"
    }

    fn description(&self) -> &str {
        "Assign a survey to another company (tenant)."
    }

    async fn execute(&self, ctx: &ToolContext, input: AssignSurveyInput) -> Result<Value, String> {
        to_output(
            self.backend
                .assign_to_company(ctx, &input.survey_id, &input.company_id)
                .await?,
        )
    }
}

/// 注册全部调研工具
pub fn register_survey_tools(
    registry: &mut ToolRegistry,
    backend: Arc<dyn SurveyBackend>,
) -> Result<(), CopilotError> {
    registry.register(ListSurveysTool { backend: backend.clone() })?;
    registry.register(GetSurveyTool { backend: backend.clone() })?;
    registry.register(SurveyStatsTool { backend: backend.clone() })?;
    registry.register(SendInvitationsTool { backend: backend.clone() })?;
    registry.register(SendRemindersTool { backend: backend.clone() })?;
    registry.register(CloseSurveyTool { backend: backend.clone() })?;
    registry.register(ChangeStageTool { backend: backend.clone() })?;
    registry.register(TriggerReportTool { backend: backend.clone() })?;
    registry.register(AssignSurveyTool { backend })?;
    Ok(())
}

// ---------- 内存后端 ----------

/// 内存调研后端：按 tenant 过滤可见性（tenant 为空的调用者可见全部）
#[derive(Default)]
pub struct InMemorySurveyBackend {
    surveys: RwLock<HashMap<String, SurveySummary>>,
    dispatches: RwLock<Vec<DispatchReceipt>>,
}

impl InMemorySurveyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条调研
    pub async fn insert(&self, survey: SurveySummary) {
        self.surveys.write().await.insert(survey.id.clone(), survey);
    }

    /// 已发出的邀请 / 提醒
    pub async fn dispatches(&self) -> Vec<DispatchReceipt> {
        self.dispatches.read().await.clone()
    }

    fn visible(ctx: &ToolContext, survey: &SurveySummary) -> bool {
        ctx.tenant_id
            .as_deref()
            .map_or(true, |tenant| tenant == survey.company_id)
    }

    async fn find(&self, ctx: &ToolContext, survey_id: &str) -> Result<SurveySummary, String> {
        self.surveys
            .read()
            .await
            .get(survey_id)
            .filter(|s| Self::visible(ctx, s))
            .cloned()
            .ok_or_else(|| format!("survey {survey_id} not found"))
    }

    async fn dispatch(&self, survey_id: &str, kind: &str, recipients: u32) -> DispatchReceipt {
        let receipt = DispatchReceipt {
            survey_id: survey_id.to_string(),
            kind: kind.to_string(),
            recipients,
        };
        self.dispatches.write().await.push(receipt.clone());
        receipt
    }
}

#[async_trait]
impl SurveyBackend for InMemorySurveyBackend {
    async fn list_surveys(
        &self,
        ctx: &ToolContext,
        stage: Option<SurveyStage>,
    ) -> Result<Vec<SurveySummary>, String> {
        let mut surveys: Vec<SurveySummary> = self
            .surveys
            .read()
            .await
            .values()
            .filter(|s| Self::visible(ctx, s))
            .filter(|s| stage.map_or(true, |stage| s.stage == stage))
            .cloned()
            .collect();
        surveys.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(surveys)
    }

    async fn get_survey(&self, ctx: &ToolContext, survey_id: &str) -> Result<SurveySummary, String> {
        self.find(ctx, survey_id).await
    }

    async fn response_stats(&self, ctx: &ToolContext, survey_id: &str) -> Result<ResponseStats, String> {
        let survey = self.find(ctx, survey_id).await?;
        let response_rate = if survey.participants == 0 {
            0.0
        } else {
            f64::from(survey.responses) / f64::from(survey.participants)
        };
        Ok(ResponseStats {
            survey_id: survey.id,
            participants: survey.participants,
            responses: survey.responses,
            response_rate,
        })
    }

    async fn send_invitations(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        participant_ids: Option<&[String]>,
    ) -> Result<DispatchReceipt, String> {
        let survey = self.find(ctx, survey_id).await?;
        if survey.stage != SurveyStage::Open {
            return Err(format!("survey {survey_id} is not open"));
        }
        let recipients = participant_ids.map_or(survey.participants, |ids| ids.len() as u32);
        Ok(self.dispatch(survey_id, "invitation", recipients).await)
    }

    async fn send_reminders(&self, ctx: &ToolContext, survey_id: &str) -> Result<DispatchReceipt, String> {
        let survey = self.find(ctx, survey_id).await?;
        if survey.stage != SurveyStage::Open {
            return Err(format!("survey {survey_id} is not open"));
        }
        let pending = survey.participants.saturating_sub(survey.responses);
        Ok(self.dispatch(survey_id, "reminder", pending).await)
    }

    async fn change_stage(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        stage: SurveyStage,
    ) -> Result<SurveySummary, String> {
        self.find(ctx, survey_id).await?;
        let mut surveys = self.surveys.write().await;
        let survey = surveys
            .get_mut(survey_id)
            .ok_or_else(|| format!("survey {survey_id} not found"))?;
        if survey.stage == stage {
            return Err(format!("survey {survey_id} is already {}", stage.as_str()));
        }
        if survey.stage == SurveyStage::Archived {
            return Err(format!("survey {survey_id} is archived"));
        }
        survey.stage = stage;
        Ok(survey.clone())
    }

    async fn trigger_report(&self, ctx: &ToolContext, survey_id: &str) -> Result<ReportJob, String> {
        self.find(ctx, survey_id).await?;
        Ok(ReportJob {
            survey_id: survey_id.to_string(),
            job_id: format!("report_{}", uuid::Uuid::new_v4()),
        })
    }

    async fn assign_to_company(
        &self,
        ctx: &ToolContext,
        survey_id: &str,
        company_id: &str,
    ) -> Result<SurveySummary, String> {
        self.find(ctx, survey_id).await?;
        let mut surveys = self.surveys.write().await;
        let survey = surveys
            .get_mut(survey_id)
            .ok_or_else(|| format!("survey {survey_id} not found"))?;
        survey.company_id = company_id.to_string();
        Ok(survey.clone())
    }
}
