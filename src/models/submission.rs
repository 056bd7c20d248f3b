use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::scenario::{ConversationEntry, MediaRef, ScenarioId};

/// 部分提交记录所在的集合
pub const SUBMISSIONS_COLLECTION: &str = "partial_submissions";

/// 候选人姓名缺失时的占位值
pub const DEFAULT_CANDIDATE_NAME: &str = "Anonymous Candidate";

/// 每次提交回答时持久化的一条记录
///
/// 字段名与文档存储中的形状一致（camelCase），值为空的字段不会写入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSubmission {
    pub session_id: String,
    pub user_id: String,
    pub question_index: usize,
    pub total_questions: usize,
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default = "default_candidate_name")]
    pub candidate_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scenario_id: Option<ScenarioId>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "competency")]
    pub assessed_competency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_response_rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_response_rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_duration_secs: Option<f64>,
    /// 写入时为 RFC 3339 字符串；读取时可能是任意形状，统一交给 `parse_timestamp`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub timestamp: Value,
    #[serde(default)]
    pub is_complete: bool,
}

fn default_candidate_name() -> String {
    DEFAULT_CANDIDATE_NAME.to_string()
}

impl PartialSubmission {
    /// 还原为对话条目
    pub fn to_entry(&self) -> ConversationEntry {
        ConversationEntry {
            scenario_id: self.scenario_id,
            parent_scenario_id: self.parent_scenario_id,
            question: self.question.clone(),
            answer: Some(self.answer.clone()),
            media: self.media.clone(),
            situation: self.situation.clone().unwrap_or_default(),
            best_response_rationale: self.best_response_rationale.clone().unwrap_or_default(),
            worst_response_rationale: self.worst_response_rationale.clone().unwrap_or_default(),
            assessed_competency: self.assessed_competency.clone().unwrap_or_default(),
        }
    }
}

/// 从存储读出的记录，附带解析后的活动时间
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSubmission {
    pub id: String,
    pub record: PartialSubmission,
    /// 无法解析时为 None
    pub activity_at: Option<DateTime<Utc>>,
}

/// 会话恢复信息（派生数据，不落库）
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecovery {
    pub session_id: String,
    pub total_questions: usize,
    pub completed_questions: usize,
    pub last_question_index: usize,
    pub can_resume: bool,
    /// 按题目索引升序排列
    pub partial_submissions: Vec<StoredSubmission>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// 单个会话的进度
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub session_id: String,
    pub total_questions: usize,
    /// 已作答的题目索引（升序、去重）
    pub completed_indices: Vec<usize>,
    pub next_question_index: usize,
    pub can_continue: bool,
    /// 按题目索引升序排列
    pub submissions: Vec<StoredSubmission>,
}

/// 保存结果
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved {
        submission_id: String,
    },
    Failed {
        error: String,
        should_retry: bool,
        retry_after_seconds: u64,
    },
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }

    pub fn submission_id(&self) -> Option<&str> {
        match self {
            SaveOutcome::Saved { submission_id } => Some(submission_id),
            SaveOutcome::Failed { .. } => None,
        }
    }
}

/// 保存选项
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// 是否立即把大体积的内联媒体上传到对象存储
    pub upload_immediately: bool,
    pub candidate_name: Option<String>,
    pub answer_duration_secs: Option<f64>,
}

/// 过期清理统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    /// 没有任何可解析时间戳、因此跳过的记录
    pub skipped: usize,
}
