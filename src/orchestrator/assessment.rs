//! 测评会话编排 - 编排层
//!
//! ## 职责
//!
//! 对上层调用方暴露完整的会话接口：
//!
//! 1. **开始 / 恢复会话**：`start_session`、`check_recovery`、`resume_session`
//! 2. **提交回答**：`AssessmentSession::submit_answer`，先更新本地状态，再后台保存
//! 3. **结束会话**：`finalize_session`，分组 → 评分 → 聚合 → 保存报告 → 标记完成
//!
//! ## 设计特点
//!
//! - **本地状态优先**：保存失败只记日志，不回滚会话状态
//! - **资源所有者**：唯一同时持有存储、对象存储和评分服务的模块
//! - **兜底报告**：评分全部失败时沿用历史报告，否则按完成度给出占位分

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppResult, SessionError, StoreError, StoreResult};
use crate::infrastructure::{
    DocumentFilter, DocumentStore, JsonFileDocumentStore, LocalObjectStorage, ObjectStorage,
    OpenAiScoringService, ScoringService,
};
use crate::models::{
    AssessmentReport, CompetencyScore, ConversationEntry, MediaRef, ReportSource, SaveOptions,
    SaveOutcome, Scenario, SessionRecovery, StoredSubmission, DEFAULT_CANDIDATE_NAME,
    REPORTS_COLLECTION,
};
use crate::services::aggregation::{round_one_decimal, UNSPECIFIED_COMPETENCY};
use crate::services::{
    group_linked, AnswerQualityEvaluator, CompetencyAggregator, ProgressivePersistence, RetryPolicy,
    SessionRecoveryResolver,
};
use crate::utils::logging;
use crate::workflow::{FollowUpController, NextStep, SessionState};

/// 占位报告的满分基准
const PLACEHOLDER_BASE_SCORE: f64 = 5.0;

/// 测评引擎
///
/// 持有所有外部依赖，可被多个会话共享（内部全部为 `Arc`）。
#[derive(Clone)]
pub struct AssessmentEngine {
    config: Config,
    scenarios: Arc<Vec<Scenario>>,
    store: Arc<dyn DocumentStore>,
    controller: FollowUpController,
    persistence: ProgressivePersistence,
    recovery: SessionRecoveryResolver,
    aggregator: CompetencyAggregator,
}

impl AssessmentEngine {
    /// # 参数
    /// - `config`: 程序配置
    /// - `scenarios`: 题库（按展示顺序）
    /// - `store`: 文档存储
    /// - `storage`: 媒体对象存储
    /// - `scoring`: 外部评分服务
    pub fn new(
        config: Config,
        scenarios: Vec<Scenario>,
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        scoring: Arc<dyn ScoringService>,
    ) -> Self {
        let evaluator = AnswerQualityEvaluator::new(scoring, RetryPolicy::from_config(&config));
        Self {
            controller: FollowUpController::new(evaluator.clone()),
            persistence: ProgressivePersistence::new(store.clone(), storage, &config),
            recovery: SessionRecoveryResolver::new(store.clone(), &config),
            aggregator: CompetencyAggregator::new(evaluator, config.aggregation_concurrency),
            scenarios: Arc::new(scenarios),
            store,
            config,
        }
    }

    /// 使用文件存储、本地媒体目录和 OpenAI 兼容评分服务创建引擎
    pub fn from_config(config: Config, scenarios: Vec<Scenario>) -> Self {
        let store = Arc::new(JsonFileDocumentStore::new(&config.data_dir));
        let storage = Arc::new(LocalObjectStorage::new(
            &config.media_dir,
            config.media_base_url.clone(),
        ));
        let scoring = Arc::new(OpenAiScoringService::new(&config));
        Self::new(config, scenarios, store, storage, scoring)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn persistence(&self) -> &ProgressivePersistence {
        &self.persistence
    }

    /// 开始新会话
    pub fn start_session(
        &self,
        user_id: &str,
        candidate_name: Option<String>,
    ) -> AssessmentSession {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut state = SessionState::new(
            session_id,
            user_id,
            self.scenarios.to_vec(),
            self.config.max_follow_ups,
        );
        if let Some(name) = candidate_name {
            state = state.with_candidate_name(name);
        }

        logging::log_session_start(state.session_id(), user_id, state.len());
        self.session_from_state(state)
    }

    /// 查找候选人可恢复的会话
    pub async fn check_recovery(&self, user_id: &str) -> AppResult<Option<SessionRecovery>> {
        Ok(self.recovery.check_incomplete_session(user_id).await?)
    }

    /// 从部分提交记录还原会话的对话条目
    pub async fn restore_entries(&self, session_id: &str) -> AppResult<Vec<ConversationEntry>> {
        let progress = self
            .recovery
            .get_session_progress(session_id)
            .await?
            .ok_or_else(|| SessionError::NothingToResume(session_id.to_string()))?;
        Ok(merge_submissions(&self.scenarios, &progress.submissions))
    }

    /// 恢复中断的会话，定位到第一道未作答的题目
    pub async fn resume_session(&self, session_id: &str) -> AppResult<AssessmentSession> {
        let progress = self
            .recovery
            .get_session_progress(session_id)
            .await?
            .ok_or_else(|| SessionError::NothingToResume(session_id.to_string()))?;

        let first = progress
            .submissions
            .first()
            .ok_or_else(|| SessionError::NothingToResume(session_id.to_string()))?;
        let user_id = first.record.user_id.clone();
        let candidate_name = Some(first.record.candidate_name.clone())
            .filter(|name| name != DEFAULT_CANDIDATE_NAME);

        let entries = merge_submissions(&self.scenarios, &progress.submissions);
        let next_index = entries
            .iter()
            .position(|e| !e.is_answered())
            .unwrap_or(entries.len());

        info!(
            "🔄 恢复会话 {}: 已答 {}/{}, 从第 {} 题继续",
            session_id,
            entries.len() - entries.iter().filter(|e| !e.is_answered()).count(),
            entries.len(),
            next_index + 1
        );

        let mut state = SessionState::restore(
            session_id,
            user_id,
            self.scenarios.to_vec(),
            entries,
            self.config.max_follow_ups,
            next_index,
        );
        if let Some(name) = candidate_name {
            state = state.with_candidate_name(name);
        }
        Ok(self.session_from_state(state))
    }

    /// 结束会话：等待后台保存完成后生成报告
    pub async fn finalize_session(&self, session: &mut AssessmentSession) -> AssessmentReport {
        let outcomes = session.flush_pending_saves().await;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            warn!(
                "⚠️ 会话 {} 有 {} 条回答未能保存，报告仍按本地状态生成",
                session.session_id(),
                failed
            );
        }

        let state = session.state();
        self.finalize_history(state.session_id(), state.user_id(), state.entries())
            .await
    }

    /// 由完整的对话历史生成报告
    ///
    /// # 返回
    /// 总是返回一份非空报告：实时评分 → 历史报告 → 完成度占位
    pub async fn finalize_history(
        &self,
        session_id: &str,
        user_id: &str,
        history: &[ConversationEntry],
    ) -> AssessmentReport {
        let grouping = group_linked(history);
        let aggregation = self.aggregator.aggregate(&grouping).await;
        let answered = history.iter().filter(|e| e.is_answered()).count();

        let report = if !aggregation.is_empty() {
            AssessmentReport {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                competencies: aggregation.scores,
                narrative: aggregation.narrative,
                source: ReportSource::Evaluated,
                answered_questions: answered,
                total_questions: history.len(),
                generated_at: Utc::now(),
            }
        } else {
            warn!("⚠️ 会话 {} 没有任何成功的评分，使用兜底报告", session_id);
            match self.latest_report(session_id).await {
                Some(mut prior) => {
                    prior.source = ReportSource::PriorReport;
                    prior
                }
                None => placeholder_report(session_id, user_id, history),
            }
        };

        if report.source != ReportSource::PriorReport {
            if let Err(e) = self.save_report(&report).await {
                error!("❌ 保存报告失败 [会话 {}]: {}", session_id, e);
            }
        }

        if let Err(e) = self.persistence.mark_session_complete(session_id).await {
            error!("❌ 标记会话完成失败 [会话 {}]: {}", session_id, e);
        }

        logging::log_report(&report);
        report
    }

    fn session_from_state(&self, state: SessionState) -> AssessmentSession {
        AssessmentSession {
            state,
            controller: self.controller.clone(),
            persistence: self.persistence.clone(),
            upload_immediately: true,
            pending_saves: Vec::new(),
        }
    }

    async fn save_report(&self, report: &AssessmentReport) -> StoreResult<String> {
        let doc = match serde_json::to_value(report)? {
            Value::Object(map) => map,
            _ => return Err(StoreError::Unavailable("报告不是 JSON 对象".into())),
        };
        self.store.insert(REPORTS_COLLECTION, doc).await
    }

    /// 同一会话最近一次保存的报告
    async fn latest_report(&self, session_id: &str) -> Option<AssessmentReport> {
        let docs = match self
            .store
            .find(
                REPORTS_COLLECTION,
                &DocumentFilter::new().eq("sessionId", session_id),
            )
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!("⚠️ 读取历史报告失败 [会话 {}]: {}", session_id, e);
                return None;
            }
        };

        docs.into_iter()
            .filter_map(|doc| serde_json::from_value::<AssessmentReport>(Value::Object(doc.data)).ok())
            .filter(|report| !report.competencies.is_empty())
            .max_by_key(|report| report.generated_at)
    }
}

/// 进行中的会话
pub struct AssessmentSession {
    state: SessionState,
    controller: FollowUpController,
    persistence: ProgressivePersistence,
    upload_immediately: bool,
    pending_saves: Vec<JoinHandle<SaveOutcome>>,
}

impl AssessmentSession {
    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// 当前应回答的题目
    pub fn current_step(&self) -> NextStep {
        match self.state.state().index() {
            Some(index) => NextStep::Question(index),
            None => NextStep::Done,
        }
    }

    /// 关闭大体积媒体的即时上传
    pub fn set_upload_immediately(&mut self, upload: bool) {
        self.upload_immediately = upload;
    }

    /// 提交回答
    ///
    /// 先推进本地状态（可能插入追问），再在后台保存这条回答。
    ///
    /// # 返回
    /// 下一道题的位置，或 `NextStep::Done`
    pub async fn submit_answer(
        &mut self,
        index: usize,
        text: impl Into<String>,
        media: Option<MediaRef>,
    ) -> AppResult<NextStep> {
        let transition = self
            .controller
            .submit_answer(&mut self.state, index, text.into(), media)
            .await?;

        if let Some(entry) = self.state.entry(index).cloned() {
            let persistence = self.persistence.clone();
            let session_id = self.state.session_id().to_string();
            let user_id = self.state.user_id().to_string();
            let total_questions = self.state.len();
            let options = SaveOptions {
                upload_immediately: self.upload_immediately,
                candidate_name: self.state.candidate_name().map(str::to_string),
                answer_duration_secs: self
                    .state
                    .answer_duration(index)
                    .map(|d| d.num_milliseconds() as f64 / 1000.0),
            };

            self.pending_saves.push(tokio::spawn(async move {
                let outcome = persistence
                    .save_question_answer(
                        &session_id,
                        &user_id,
                        index,
                        total_questions,
                        &entry,
                        options,
                    )
                    .await;
                if let SaveOutcome::Failed {
                    error,
                    retry_after_seconds,
                    ..
                } = &outcome
                {
                    warn!(
                        "⚠️ 第 {} 题保存失败，{} 秒后可重试 [会话 {}]: {}",
                        index + 1,
                        retry_after_seconds,
                        session_id,
                        error
                    );
                }
                outcome
            }));
        }

        Ok(transition.next)
    }

    /// 尚未完成的后台保存数量
    pub fn pending_saves(&self) -> usize {
        self.pending_saves
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// 等待所有后台保存完成
    pub async fn flush_pending_saves(&mut self) -> Vec<SaveOutcome> {
        let handles = std::mem::take(&mut self.pending_saves);
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => SaveOutcome::Failed {
                    error: format!("保存任务异常退出: {}", e),
                    should_retry: true,
                    retry_after_seconds: 0,
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// 把部分提交记录合并回题库顺序
///
/// 有场景ID的记录覆盖对应题目的回答，追问插在原始题目的追问块末尾；
/// 没有ID的旧记录按题干匹配，匹配不到时追加在末尾。
fn merge_submissions(
    scenarios: &[Scenario],
    submissions: &[StoredSubmission],
) -> Vec<ConversationEntry> {
    let mut entries: Vec<ConversationEntry> =
        scenarios.iter().map(ConversationEntry::from_scenario).collect();

    for submission in submissions {
        let restored = submission.record.to_entry();

        let existing = match restored.scenario_id {
            Some(id) => entries.iter().position(|e| e.scenario_id == Some(id)),
            None => entries
                .iter()
                .position(|e| e.scenario_id.is_none() && e.question == restored.question)
                .or_else(|| {
                    entries
                        .iter()
                        .position(|e| !e.is_answered() && restored.question.contains(e.question.trim()))
                }),
        };

        if let Some(position) = existing {
            let entry = &mut entries[position];
            entry.answer = restored.answer;
            if restored.media.is_some() {
                entry.media = restored.media;
            }
            continue;
        }

        match restored.parent_scenario_id {
            Some(parent) => {
                let mut position = entries
                    .iter()
                    .position(|e| e.scenario_id == Some(parent))
                    .map(|p| p + 1)
                    .unwrap_or(entries.len());
                while entries
                    .get(position)
                    .map(|e| e.is_follow_up() && e.root_scenario_id() == Some(parent))
                    .unwrap_or(false)
                {
                    position += 1;
                }
                entries.insert(position, restored);
            }
            None => entries.push(restored),
        }
    }

    entries
}

/// 按完成度生成占位报告
fn placeholder_report(
    session_id: &str,
    user_id: &str,
    history: &[ConversationEntry],
) -> AssessmentReport {
    let total = history.len();
    let answered = history.iter().filter(|e| e.is_answered()).count();
    let score = if total == 0 {
        0.0
    } else {
        round_one_decimal(PLACEHOLDER_BASE_SCORE * answered as f64 / total as f64)
    };

    let mut names: BTreeSet<&str> = history
        .iter()
        .filter(|e| e.is_answered())
        .map(|e| e.assessed_competency.trim())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        names.insert(UNSPECIFIED_COMPETENCY);
    }

    AssessmentReport {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        competencies: names
            .into_iter()
            .map(|name| CompetencyScore {
                name: name.to_string(),
                score,
            })
            .collect(),
        narrative: format!(
            "Automated scoring was unavailable for this session. Scores reflect completion only: {} of {} questions answered.",
            answered, total
        ),
        source: ReportSource::Placeholder,
        answered_questions: answered,
        total_questions: total,
        generated_at: Utc::now(),
    }
}
