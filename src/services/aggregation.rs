//! 能力维度聚合 - 业务能力层
//!
//! 对分组后的场景簇逐一评分，再按能力维度取平均分。
//!
//! 评分粒度：
//! - 簇内只有一个能力维度：整段对话一次评分，失败后退回逐条评分
//! - 簇内有多个能力维度：逐条评分，每条只对应自己的维度
//! - 未分组条目：逐条评分
//!
//! 最终失败的评分只记日志并丢弃，不影响其他簇。

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::models::{
    CompetencyEvaluation, CompetencyScore, ConversationEntry, EvaluationOutcome,
    ThreadEvaluationRequest, ThreadTurn,
};
use crate::services::evaluator::AnswerQualityEvaluator;
use crate::services::grouping::{self, GroupingResult, ScenarioCluster};

/// 条目未标注能力维度时使用的名称
pub const UNSPECIFIED_COMPETENCY: &str = "General";

/// 聚合结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationResult {
    /// 按能力名称排序
    pub scores: Vec<CompetencyScore>,
    /// 所有成功的单次评分
    pub evaluations: Vec<CompetencyEvaluation>,
    pub narrative: String,
    /// 最终失败、被丢弃的评分单元数量
    pub dropped: usize,
}

impl AggregationResult {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// 一次评分调用的粒度
enum EvaluationUnit<'a> {
    Holistic(&'a ScenarioCluster),
    Entry(&'a ConversationEntry),
}

/// 能力维度聚合服务
#[derive(Clone)]
pub struct CompetencyAggregator {
    evaluator: AnswerQualityEvaluator,
    concurrency: usize,
}

impl CompetencyAggregator {
    /// # 参数
    /// - `evaluator`: 评分服务（已带重试）
    /// - `concurrency`: 同时评分的单元数量，最少为 1
    pub fn new(evaluator: AnswerQualityEvaluator, concurrency: usize) -> Self {
        Self {
            evaluator,
            concurrency: concurrency.max(1),
        }
    }

    /// 对分组结果评分并聚合
    pub async fn aggregate(&self, grouping: &GroupingResult) -> AggregationResult {
        let mut units = Vec::new();
        for cluster in &grouping.clusters {
            if cluster.single_competency().is_some() {
                units.push(EvaluationUnit::Holistic(cluster));
            } else {
                debug!("场景簇 {} 涉及多个能力维度，逐条评分", cluster.id);
                units.extend(cluster.entries.iter().map(EvaluationUnit::Entry));
            }
        }
        units.extend(grouping.ungrouped.iter().map(EvaluationUnit::Entry));

        info!(
            "📊 开始能力评分: {} 个场景簇, {} 条未分组, 共 {} 个评分单元",
            grouping.clusters.len(),
            grouping.ungrouped.len(),
            units.len()
        );

        let results: Vec<(Vec<CompetencyEvaluation>, usize)> = stream::iter(units)
            .map(|unit| self.evaluate_unit(unit))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut evaluations = Vec::new();
        let mut dropped = 0;
        for (scored, failed) in results {
            evaluations.extend(scored);
            dropped += failed;
        }

        let scores = aggregate_scores(&evaluations);
        let narrative = compose_narrative(&scores, &evaluations);
        info!(
            "✓ 能力评分完成: {} 次成功, {} 个单元失败, {} 个能力维度",
            evaluations.len(),
            dropped,
            scores.len()
        );

        AggregationResult {
            scores,
            evaluations,
            narrative,
            dropped,
        }
    }

    /// 返回（成功的评分, 失败的单元数）
    async fn evaluate_unit(&self, unit: EvaluationUnit<'_>) -> (Vec<CompetencyEvaluation>, usize) {
        match unit {
            EvaluationUnit::Entry(entry) => match self.evaluate_entry(entry).await {
                Some(evaluation) => (vec![evaluation], 0),
                None => (Vec::new(), 1),
            },
            EvaluationUnit::Holistic(cluster) => {
                let request = thread_request(&cluster.entries);
                match self.evaluator.evaluate_thread(&request).await {
                    EvaluationOutcome::Scored(evaluation) => (vec![evaluation], 0),
                    outcome => {
                        warn!(
                            "⚠️ 场景簇 {} 整体评分失败，改为逐条评分: {}",
                            cluster.id,
                            outcome.failure_reason().unwrap_or_default()
                        );
                        let mut scored = Vec::new();
                        let mut failed = 0;
                        for entry in &cluster.entries {
                            match self.evaluate_entry(entry).await {
                                Some(evaluation) => scored.push(evaluation),
                                None => failed += 1,
                            }
                        }
                        (scored, failed)
                    }
                }
            }
        }
    }

    async fn evaluate_entry(&self, entry: &ConversationEntry) -> Option<CompetencyEvaluation> {
        let request = thread_request(std::slice::from_ref(entry));
        match self.evaluator.evaluate_thread(&request).await {
            EvaluationOutcome::Scored(evaluation) => Some(evaluation),
            outcome => {
                error!(
                    "❌ 丢弃评分 [{}]: {}",
                    request.competency,
                    outcome.failure_reason().unwrap_or_default()
                );
                None
            }
        }
    }
}

/// 由同一能力维度的若干条目构建评分请求
fn thread_request(entries: &[ConversationEntry]) -> ThreadEvaluationRequest {
    let first_non_empty = |field: fn(&ConversationEntry) -> &str| {
        entries
            .iter()
            .map(field)
            .find(|value| !value.trim().is_empty())
            .unwrap_or_default()
            .to_string()
    };

    let competency = first_non_empty(|e| e.assessed_competency.as_str());
    ThreadEvaluationRequest {
        competency: if competency.is_empty() {
            UNSPECIFIED_COMPETENCY.to_string()
        } else {
            competency
        },
        situation: first_non_empty(|e| e.situation.as_str()),
        best_response_rationale: first_non_empty(|e| e.best_response_rationale.as_str()),
        worst_response_rationale: first_non_empty(|e| e.worst_response_rationale.as_str()),
        turns: entries
            .iter()
            .map(|entry| ThreadTurn {
                question: entry.question.clone(),
                answer: entry.answer.clone().unwrap_or_default(),
                is_follow_up: entry.is_follow_up() || grouping::is_follow_up(&entry.question),
            })
            .collect(),
    }
}

/// 按能力维度取平均分，保留一位小数
pub fn aggregate_scores(evaluations: &[CompetencyEvaluation]) -> Vec<CompetencyScore> {
    let mut by_competency: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for evaluation in evaluations {
        by_competency
            .entry(evaluation.competency.as_str())
            .or_default()
            .push(evaluation.score);
    }

    by_competency
        .into_iter()
        .map(|(name, scores)| CompetencyScore {
            name: name.to_string(),
            score: round_one_decimal(scores.iter().sum::<f64>() / scores.len() as f64),
        })
        .collect()
}

/// 由各维度的评分理由拼出报告正文
pub fn compose_narrative(scores: &[CompetencyScore], evaluations: &[CompetencyEvaluation]) -> String {
    scores
        .iter()
        .map(|score| {
            let rationales: Vec<&str> = evaluations
                .iter()
                .filter(|e| e.competency == score.name)
                .map(|e| e.rationale.trim())
                .filter(|r| !r.is_empty())
                .collect();
            if rationales.is_empty() {
                format!("{} ({:.1}/10)", score.name, score.score)
            } else {
                format!("{} ({:.1}/10): {}", score.name, score.score, rationales.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
