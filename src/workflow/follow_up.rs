//! 追问流程 - 流程层
//!
//! 核心职责：决定"一次作答之后"会话往哪里走
//!
//! 流程顺序：
//! 1. 找到条目对应的场景（先按ID，旧数据按文本包含匹配）→ 找不到直接前进
//! 2. 条目本身是追问 → 直接前进（追问的回答不会再生成追问）
//! 3. 原始题目已达追问上限 → 直接前进，不调用评估
//! 4. 调用完整度评估 → 不完整且给出追问时插入追问，否则前进
//!
//! 追问插在原始题目已有追问块的末尾：第一次追问紧跟原始题目，
//! 再次回答原始题目产生的 `1.b)` 排在 `1.a)` 之后，保持追问按字母顺序。

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::models::{CompletenessRequest, ConversationEntry, MediaRef, Scenario};
use crate::services::evaluator::AnswerQualityEvaluator;
use crate::services::grouping::FOLLOW_UP_MARKER;
use crate::utils::truncate_text;
use crate::workflow::session_state::{ControllerState, SessionState};

/// 题干开头已有的追问标记
static LEADING_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\.[a-z]\)\s*").expect("leading marker pattern"));

/// 作答后的下一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// 下一道要回答的题目位置
    Question(usize),
    Done,
}

/// 一次作答的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NextStep,
    /// 新插入追问的位置
    pub inserted_follow_up: Option<usize>,
}

impl Transition {
    fn advance(next: NextStep) -> Self {
        Self {
            next,
            inserted_follow_up: None,
        }
    }
}

/// 追问控制器
///
/// - 持有评估能力，不持有会话状态
/// - 会话状态由调用方以 `&mut` 传入
#[derive(Clone)]
pub struct FollowUpController {
    evaluator: AnswerQualityEvaluator,
}

impl FollowUpController {
    pub fn new(evaluator: AnswerQualityEvaluator) -> Self {
        Self { evaluator }
    }

    /// 提交第 `index` 题的回答并推进状态机
    ///
    /// # 参数
    /// - `state`: 会话状态
    /// - `index`: 题目位置
    /// - `answer`: 回答文本
    /// - `media`: 附带的媒体（可选）
    ///
    /// 插入的追问位于原始题目及其已有追问之后（第一次追问即 `index + 1`），
    /// 返回的下一步指向这条新追问。
    ///
    /// # 返回
    /// 下一步；只有索引非法或会话已结束时返回错误
    pub async fn submit_answer(
        &self,
        state: &mut SessionState,
        index: usize,
        answer: String,
        media: Option<MediaRef>,
    ) -> Result<Transition, SessionError> {
        state.check_index(index)?;

        debug!(
            "{} 第 {} 题作答: {}",
            state,
            index + 1,
            truncate_text(&answer, 60)
        );
        state.record_answer(index, answer, media);
        state.set_state(ControllerState::Evaluating(index));

        let entry = match state.entry(index) {
            Some(entry) => entry.clone(),
            None => return Ok(advance(state, index)),
        };

        // 1. 找到原始场景
        let Some(scenario) = resolve_scenario(state, &entry).cloned() else {
            info!("{} 第 {} 题未匹配到场景，直接前进", state, index + 1);
            return Ok(advance(state, index));
        };

        // 2. 追问的回答不再生成追问
        if entry.is_follow_up() || scenario.is_follow_up() || FOLLOW_UP_MARKER.is_match(&entry.question) {
            debug!("{} 第 {} 题是追问，直接前进", state, index + 1);
            return Ok(advance(state, index));
        }

        // 3. 追问上限
        let Some(base_number) = state.base_question_number(scenario.id) else {
            return Ok(advance(state, index));
        };
        let count = state.follow_up_count(base_number);
        let max = state.max_follow_ups();
        if max == 0 || count >= max {
            debug!(
                "{} 第 {} 题追问已达上限 ({}/{})，直接前进",
                state, base_number, count, max
            );
            return Ok(advance(state, index));
        }

        // 4. 完整度评估
        let request = CompletenessRequest {
            situation: scenario.situation.clone(),
            question: scenario.question.clone(),
            best_response_rationale: scenario.best_response_rationale.clone(),
            assessed_competency: scenario.assessed_competency.clone(),
            candidate_answer: entry.answer.clone().unwrap_or_default(),
            question_number: base_number,
            follow_up_count: count,
            max_follow_ups: max,
        };
        let verdict = self.evaluator.check_completeness(&request).await;

        let Some(follow_up_text) = verdict.follow_up() else {
            info!(
                "{} 第 {} 题回答完整 (完整度 {:.1})",
                state, base_number, verdict.completion_score
            );
            return Ok(advance(state, index));
        };

        let label = normalize_follow_up_label(base_number, count, follow_up_text);
        let follow_up = scenario.derive_follow_up(count + 1, label);
        let position = follow_up_position(state, index, scenario.id);

        state.insert_entry(position, ConversationEntry::from_scenario(&follow_up));
        let total = state.increment_follow_up(base_number);
        state.set_state(ControllerState::FollowUpInserted(position));
        info!(
            "{} ➕ 第 {} 题插入追问 ({}/{}): {}",
            state,
            base_number,
            total,
            max,
            truncate_text(&follow_up.question, 60)
        );

        state.set_state(ControllerState::AwaitingAnswer(position));
        state.mark_presented(position);
        Ok(Transition {
            next: NextStep::Question(position),
            inserted_follow_up: Some(position),
        })
    }
}

/// 前进到下一题；最后一题之后结束
fn advance(state: &mut SessionState, index: usize) -> Transition {
    state.set_state(ControllerState::Advancing(index));

    if index + 1 >= state.len() {
        state.set_state(ControllerState::Done);
        info!("{} ✓ 全部题目已作答", state);
        return Transition::advance(NextStep::Done);
    }

    let next = index + 1;
    state.set_state(ControllerState::AwaitingAnswer(next));
    state.mark_presented(next);
    Transition::advance(NextStep::Question(next))
}

/// 条目对应的场景：优先按ID，旧数据按文本包含匹配
fn resolve_scenario<'a>(state: &'a SessionState, entry: &ConversationEntry) -> Option<&'a Scenario> {
    if let Some(id) = entry.scenario_id {
        if let Some(scenario) = state.scenario_by_id(id) {
            return Some(scenario);
        }
        // 追问ID不在题库中，挂到原始题目上
        if let Some(parent) = entry.parent_scenario_id {
            return state.scenario_by_id(parent);
        }
    }

    let text = format!("{}\n{}", entry.situation, entry.question);
    state.scenarios().iter().find(|scenario| {
        let question = scenario.question.trim();
        let situation = scenario.situation.trim();
        !question.is_empty()
            && text.contains(question)
            && (situation.is_empty() || text.contains(situation) || entry.situation.trim().is_empty())
    })
}

/// 追问插入位置：紧跟在原始题目已有的追问之后
fn follow_up_position(state: &SessionState, index: usize, root: u32) -> usize {
    let mut position = index + 1;
    while let Some(entry) = state.entry(position) {
        if entry.is_follow_up() && entry.root_scenario_id() == Some(root) {
            position += 1;
        } else {
            break;
        }
    }
    position
}

/// 规范化追问题号为 `"{原始题号}.{字母})"`
///
/// 已有正确前缀时保持不变；其他追问前缀会被替换，没有前缀时补上。
/// `count` 是原始题目已有的追问数，对应的条目插在这些追问之后。
pub fn normalize_follow_up_label(base_number: usize, count: u32, text: &str) -> String {
    let letter = char::from(b'a' + count.min(25) as u8);
    let prefix = format!("{}.{})", base_number, letter);

    let trimmed = text.trim();
    if trimmed.starts_with(&prefix) {
        return trimmed.to_string();
    }

    let body = LEADING_MARKER.replace(trimmed, "");
    format!("{} {}", prefix, body.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoringError;
    use crate::infrastructure::fakes::{FailingScoring, ScriptedScoring};
    use crate::services::retry::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn scenario(id: u32, question: &str) -> Scenario {
        Scenario {
            id,
            situation: format!("Situation for {}", id),
            question: question.to_string(),
            best_response_rationale: "best".to_string(),
            worst_response_rationale: "worst".to_string(),
            assessed_competency: "Teamwork".to_string(),
            parent_id: None,
        }
    }

    fn bank() -> Vec<Scenario> {
        vec![
            scenario(1, "How do you handle a missed deadline?"),
            scenario(2, "How do you onboard a new teammate?"),
        ]
    }

    fn controller(scoring: Arc<ScriptedScoring>) -> FollowUpController {
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        FollowUpController::new(AnswerQualityEvaluator::new(scoring, retry))
    }

    async fn submit(
        controller: &FollowUpController,
        state: &mut SessionState,
        index: usize,
    ) -> Transition {
        controller
            .submit_answer(state, index, format!("answer {}", index), None)
            .await
            .unwrap()
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(
            normalize_follow_up_label(1, 0, "What specific steps?"),
            "1.a) What specific steps?"
        );
        assert_eq!(
            normalize_follow_up_label(1, 1, "1.a) Who else would you involve?"),
            "1.b) Who else would you involve?"
        );
        assert_eq!(
            normalize_follow_up_label(3, 1, " 3.b) Already labelled "),
            "3.b) Already labelled"
        );
    }

    #[tokio::test]
    async fn test_two_follow_ups_then_cap_skips_evaluation() {
        let scoring = Arc::new(ScriptedScoring::new());
        scoring.push_incomplete("What specific steps would you take?");
        scoring.push_incomplete("1.a) Who else would you involve?");
        let controller = controller(scoring.clone());
        let mut state = SessionState::new("s1", "u1", bank(), 2);

        // 第一次作答：插入 1.a)
        let t = submit(&controller, &mut state, 0).await;
        assert_eq!(t.next, NextStep::Question(1));
        assert_eq!(t.inserted_follow_up, Some(1));
        assert_eq!(state.entries()[1].question, "1.a) What specific steps would you take?");
        assert_eq!(state.entries()[1].parent_scenario_id, Some(1));
        assert_eq!(state.entries()[1].scenario_id, Some(1001));

        // 追问的回答不调用评估
        let t = submit(&controller, &mut state, 1).await;
        assert_eq!(t.next, NextStep::Question(2));
        assert_eq!(scoring.completeness_calls(), 1);

        // 再次回答原始题目：插入 1.b)，排在 1.a) 之后
        let t = submit(&controller, &mut state, 0).await;
        assert_eq!(t.next, NextStep::Question(2));
        assert_eq!(state.entries()[2].question, "1.b) Who else would you involve?");
        assert_eq!(state.entries()[2].scenario_id, Some(2001));
        assert_eq!(state.follow_up_count(1), 2);
        assert_eq!(scoring.completeness_calls(), 2);

        // 第三次：已达上限，不调用评估
        let t = submit(&controller, &mut state, 0).await;
        assert_eq!(t.inserted_follow_up, None);
        assert_eq!(scoring.completeness_calls(), 2);
        assert_eq!(state.follow_up_count(1), 2);
        assert_eq!(state.len(), 4);
        assert_eq!(state.entries()[3].scenario_id, Some(2));
    }

    #[tokio::test]
    async fn test_last_question_transitions_to_done() {
        let scoring = Arc::new(ScriptedScoring::new());
        let controller = controller(scoring);
        let mut state = SessionState::new("s1", "u1", bank(), 2);

        assert_eq!(submit(&controller, &mut state, 0).await.next, NextStep::Question(1));
        assert_eq!(submit(&controller, &mut state, 1).await.next, NextStep::Done);
        assert!(state.is_done());

        let err = controller
            .submit_answer(&mut state, 1, "again".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn test_zero_max_follow_ups_never_evaluates() {
        let scoring = Arc::new(ScriptedScoring::new());
        scoring.push_incomplete("never asked");
        let controller = controller(scoring.clone());
        let mut state = SessionState::new("s1", "u1", bank(), 0);

        submit(&controller, &mut state, 0).await;
        assert_eq!(scoring.completeness_calls(), 0);
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_legacy_entry_advances_without_evaluation() {
        let scoring = Arc::new(ScriptedScoring::new());
        let controller = controller(scoring.clone());
        let entries = vec![
            ConversationEntry {
                question: "A question that is not in the bank".to_string(),
                ..ConversationEntry::default()
            },
            ConversationEntry {
                situation: "Situation for 2".to_string(),
                question: "Scenario 2: How do you onboard a new teammate?".to_string(),
                ..ConversationEntry::default()
            },
        ];
        let mut state = SessionState::restore("s1", "u1", bank(), entries, 2, 0);

        let t = submit(&controller, &mut state, 0).await;
        assert_eq!(t.next, NextStep::Question(1));
        assert_eq!(scoring.completeness_calls(), 0);

        // 文本包含匹配成功的旧条目照常评估
        scoring.push_incomplete("What would you prepare beforehand?");
        let t = submit(&controller, &mut state, 1).await;
        assert_eq!(t.inserted_follow_up, Some(2));
        assert_eq!(scoring.completeness_calls(), 1);
        assert_eq!(state.entries()[2].question, "2.a) What would you prepare beforehand?");
    }

    #[tokio::test]
    async fn test_evaluator_failure_advances() {
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1));
        let controller = FollowUpController::new(AnswerQualityEvaluator::new(
            Arc::new(FailingScoring(ScoringError::Overloaded("busy".into()))),
            retry,
        ));
        let mut state = SessionState::new("s1", "u1", bank(), 2);

        let t = submit(&controller, &mut state, 0).await;
        assert_eq!(t, Transition::advance(NextStep::Question(1)));
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let controller = controller(Arc::new(ScriptedScoring::new()));
        let mut state = SessionState::new("s1", "u1", bank(), 2);

        let err = controller
            .submit_answer(&mut state, 5, "x".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::IndexOutOfRange { index: 5, total: 2 }));
    }
}
