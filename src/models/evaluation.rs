use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 最终报告所在的集合
pub const REPORTS_COLLECTION: &str = "assessment_reports";

/// 完整度检查请求
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessRequest {
    pub situation: String,
    pub question: String,
    pub best_response_rationale: String,
    pub assessed_competency: String,
    pub candidate_answer: String,
    /// 原始题目编号（从 1 开始）
    pub question_number: usize,
    pub follow_up_count: u32,
    pub max_follow_ups: u32,
}

/// 完整度判断结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessVerdict {
    pub is_complete: bool,
    /// 0..=10
    pub completion_score: f64,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub follow_up_question: Option<String>,
    #[serde(default)]
    pub rationale: String,
}

impl CompletenessVerdict {
    /// 直接判定为完整（不生成追问）
    pub fn complete(completion_score: f64, rationale: impl Into<String>) -> Self {
        Self {
            is_complete: true,
            completion_score,
            missing_aspects: Vec::new(),
            follow_up_question: None,
            rationale: rationale.into(),
        }
    }

    /// 需要追问时返回追问题干
    pub fn follow_up(&self) -> Option<&str> {
        if self.is_complete {
            return None;
        }
        self.follow_up_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

/// 同一场景下的一轮问答
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTurn {
    pub question: String,
    pub answer: String,
    pub is_follow_up: bool,
}

/// 能力评分请求：一个场景（或单条问答）针对一个能力维度
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEvaluationRequest {
    pub competency: String,
    pub situation: String,
    pub best_response_rationale: String,
    pub worst_response_rationale: String,
    pub turns: Vec<ThreadTurn>,
}

/// 单次能力评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyEvaluation {
    pub competency: String,
    /// 0..=10
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
}

/// 外部评估的统一结果类型
///
/// 调用方通过模式匹配决定兜底策略，而不是各自约定。
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome<T> {
    /// 评估成功
    Scored(T),
    /// 服务不可用（重试耗尽后仍过载 / 限流 / 超时）
    Unavailable(String),
    /// 服务返回无效内容或其他不可重试错误
    Invalid(String),
}

impl<T> EvaluationOutcome<T> {
    pub fn scored(self) -> Option<T> {
        match self {
            EvaluationOutcome::Scored(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_scored(&self) -> bool {
        matches!(self, EvaluationOutcome::Scored(_))
    }

    /// 失败原因（成功时为 None）
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            EvaluationOutcome::Scored(_) => None,
            EvaluationOutcome::Unavailable(reason) | EvaluationOutcome::Invalid(reason) => {
                Some(reason)
            }
        }
    }
}

/// 能力维度最终得分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencyScore {
    pub name: String,
    /// 0..=10，保留一位小数
    pub score: f64,
}

/// 报告来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportSource {
    /// 本次实时评分
    Evaluated,
    /// 评分全部失败，沿用之前保存的报告
    PriorReport,
    /// 评分全部失败且没有历史报告，按完成度给出占位分
    Placeholder,
}

/// 最终测评报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentReport {
    pub session_id: String,
    pub user_id: String,
    pub competencies: Vec<CompetencyScore>,
    pub narrative: String,
    pub source: ReportSource,
    pub answered_questions: usize,
    pub total_questions: usize,
    pub generated_at: DateTime<Utc>,
}
