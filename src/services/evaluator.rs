//! 回答质量评估服务 - 业务能力层
//!
//! 包装外部评分服务：所有调用都经过重试策略，失败统一折叠为 [`EvaluationOutcome`]。
//! 完整度检查采用"失败放行"策略，评估失败永远不会阻塞候选人作答。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ScoringError;
use crate::infrastructure::ScoringService;
use crate::models::{
    CompetencyEvaluation, CompletenessRequest, CompletenessVerdict, EvaluationOutcome,
    ThreadEvaluationRequest,
};
use crate::services::retry::RetryPolicy;

/// 达到追问上限时的固定说明
pub const FOLLOW_UP_LIMIT_RATIONALE: &str = "maximum follow-up limit reached";

/// 评估服务不可用时的说明
pub const UNAVAILABLE_RATIONALE: &str =
    "answer quality evaluation was unavailable; the answer was accepted as complete";

/// 其他错误时的说明
pub const ERROR_RATIONALE: &str =
    "answer quality evaluation failed; the answer was accepted as complete";

/// 追问上限时的完整度分数（中间值）
const LIMIT_COMPLETION_SCORE: f64 = 5.0;
/// 服务不可用时的完整度分数（中高值）
const UNAVAILABLE_COMPLETION_SCORE: f64 = 7.0;
/// 其他错误时的完整度分数
const ERROR_COMPLETION_SCORE: f64 = 5.0;

/// 回答质量评估服务
#[derive(Clone)]
pub struct AnswerQualityEvaluator {
    scoring: Arc<dyn ScoringService>,
    retry: RetryPolicy,
}

impl AnswerQualityEvaluator {
    pub fn new(scoring: Arc<dyn ScoringService>, retry: RetryPolicy) -> Self {
        Self { scoring, retry }
    }

    /// 调用外部服务判断回答是否完整，结果折叠为 [`EvaluationOutcome`]
    ///
    /// 不做追问上限检查；调用方若需要上限短路，请使用 [`Self::check_completeness`]。
    pub async fn assess_completeness(
        &self,
        request: &CompletenessRequest,
    ) -> EvaluationOutcome<CompletenessVerdict> {
        let label = format!("完整度检查 [第 {} 题]", request.question_number);
        let result = self
            .retry
            .run(&label, ScoringError::class, || {
                self.scoring.check_completeness(request)
            })
            .await;

        match result {
            Ok(mut verdict) => {
                verdict.completion_score = clamp_score(verdict.completion_score);
                if !verdict.is_complete && verdict.follow_up().is_none() {
                    debug!("追问内容为空，按完整处理");
                    verdict.is_complete = true;
                    verdict.follow_up_question = None;
                }
                EvaluationOutcome::Scored(verdict)
            }
            Err(e) => fold_error(e),
        }
    }

    /// 完整度检查（失败放行）
    ///
    /// # 返回
    /// 总是返回一个判断结果：
    /// - 已达追问上限：直接判定完整，不调用外部服务
    /// - 服务不可用：判定完整，分数 7.0
    /// - 其他错误：判定完整，分数 5.0
    pub async fn check_completeness(&self, request: &CompletenessRequest) -> CompletenessVerdict {
        if request.follow_up_count >= request.max_follow_ups {
            info!(
                "第 {} 题已达追问上限 ({}/{}), 跳过完整度检查",
                request.question_number, request.follow_up_count, request.max_follow_ups
            );
            return CompletenessVerdict::complete(LIMIT_COMPLETION_SCORE, FOLLOW_UP_LIMIT_RATIONALE);
        }

        match self.assess_completeness(request).await {
            EvaluationOutcome::Scored(verdict) => verdict,
            EvaluationOutcome::Unavailable(reason) => {
                warn!("⚠️ 评估服务不可用，放行第 {} 题: {}", request.question_number, reason);
                CompletenessVerdict::complete(UNAVAILABLE_COMPLETION_SCORE, UNAVAILABLE_RATIONALE)
            }
            EvaluationOutcome::Invalid(reason) => {
                warn!("⚠️ 评估失败，放行第 {} 题: {}", request.question_number, reason);
                CompletenessVerdict::complete(ERROR_COMPLETION_SCORE, ERROR_RATIONALE)
            }
        }
    }

    /// 针对一个能力维度评估一段问答
    pub async fn evaluate_thread(
        &self,
        request: &ThreadEvaluationRequest,
    ) -> EvaluationOutcome<CompetencyEvaluation> {
        let label = format!("能力评分 [{}]", request.competency);
        let result = self
            .retry
            .run(&label, ScoringError::class, || self.scoring.evaluate_thread(request))
            .await;

        match result {
            Ok(mut evaluation) => {
                if !evaluation.score.is_finite() {
                    return EvaluationOutcome::Invalid(format!(
                        "评分不是有效数字: {}",
                        evaluation.score
                    ));
                }
                evaluation.score = clamp_score(evaluation.score);
                if evaluation.competency.trim().is_empty() {
                    evaluation.competency = request.competency.clone();
                }
                EvaluationOutcome::Scored(evaluation)
            }
            Err(e) => fold_error(e),
        }
    }
}

fn fold_error<T>(error: ScoringError) -> EvaluationOutcome<T> {
    if error.is_unavailable() {
        EvaluationOutcome::Unavailable(error.to_string())
    } else {
        EvaluationOutcome::Invalid(error.to_string())
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 10.0)
    } else {
        0.0
    }
}
