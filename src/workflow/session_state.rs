//! 会话状态
//!
//! 一个进行中的测评会话的全部可变状态：对话条目、每道原始题目的追问计数、
//! 状态机位置以及每道题的展示 / 作答时间。只由追问控制器修改。

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::SessionError;
use crate::models::{ConversationEntry, MediaRef, Scenario, ScenarioId};

/// 题干开头的追问标记，捕获原始题号
static LEADING_MARKER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\.[a-z]\)").expect("leading marker pattern"));

/// 追问控制器的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// 等待第 i 题的回答
    AwaitingAnswer(usize),
    /// 正在评估第 i 题的回答
    Evaluating(usize),
    /// 已在第 i 个位置插入追问
    FollowUpInserted(usize),
    /// 正在从第 i 题前进
    Advancing(usize),
    /// 全部题目已作答
    Done,
}

impl ControllerState {
    /// 当前题目位置（结束时为 None）
    pub fn index(&self) -> Option<usize> {
        match *self {
            ControllerState::AwaitingAnswer(i)
            | ControllerState::Evaluating(i)
            | ControllerState::FollowUpInserted(i)
            | ControllerState::Advancing(i) => Some(i),
            ControllerState::Done => None,
        }
    }
}

/// 单道题的计时
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QuestionTiming {
    presented_at: Option<DateTime<Utc>>,
    answered_at: Option<DateTime<Utc>>,
}

/// 会话状态
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: String,
    user_id: String,
    candidate_name: Option<String>,
    /// 原始题库（不含追问）
    scenarios: Vec<Scenario>,
    entries: Vec<ConversationEntry>,
    /// 与 `entries` 一一对应
    timings: Vec<QuestionTiming>,
    /// 原始题号（从 1 开始）→ 已生成的追问数量
    follow_up_counts: BTreeMap<usize, u32>,
    max_follow_ups: u32,
    state: ControllerState,
}

impl SessionState {
    /// 创建新会话，每个场景对应一道题
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        scenarios: Vec<Scenario>,
        max_follow_ups: u32,
    ) -> Self {
        let entries = scenarios.iter().map(ConversationEntry::from_scenario).collect();
        Self::restore(session_id, user_id, scenarios, entries, max_follow_ups, 0)
    }

    /// 用已有的对话条目重建会话
    ///
    /// 追问计数根据条目中的追问重新统计，当前位置为 `next_index`。
    pub fn restore(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        scenarios: Vec<Scenario>,
        entries: Vec<ConversationEntry>,
        max_follow_ups: u32,
        next_index: usize,
    ) -> Self {
        let mut state = Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            candidate_name: None,
            scenarios,
            timings: vec![QuestionTiming::default(); entries.len()],
            entries,
            follow_up_counts: BTreeMap::new(),
            max_follow_ups,
            state: ControllerState::Done,
        };

        for i in 0..state.entries.len() {
            if let Some(base) = state.follow_up_base_number(&state.entries[i]) {
                *state.follow_up_counts.entry(base).or_insert(0) += 1;
            }
        }

        if next_index < state.entries.len() {
            state.state = ControllerState::AwaitingAnswer(next_index);
            state.mark_presented(next_index);
        }
        state
    }

    pub fn with_candidate_name(mut self, name: impl Into<String>) -> Self {
        self.candidate_name = Some(name.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn candidate_name(&self) -> Option<&str> {
        self.candidate_name.as_deref()
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&ConversationEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ControllerState::Done
    }

    pub fn max_follow_ups(&self) -> u32 {
        self.max_follow_ups
    }

    /// 原始题目已生成的追问数量
    pub fn follow_up_count(&self, base_question_number: usize) -> u32 {
        self.follow_up_counts
            .get(&base_question_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn answered_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_answered()).count()
    }

    /// 场景在题库中的位置（从 1 开始）；追问返回其原始题目的位置
    pub fn base_question_number(&self, scenario_id: ScenarioId) -> Option<usize> {
        let root = self
            .scenario_by_id(scenario_id)
            .map(Scenario::root_id)
            .unwrap_or(scenario_id);
        self.scenarios
            .iter()
            .position(|s| s.id == root)
            .map(|p| p + 1)
    }

    pub fn scenario_by_id(&self, id: ScenarioId) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    /// 第 `index` 题从展示到作答的耗时
    pub fn answer_duration(&self, index: usize) -> Option<Duration> {
        let timing = self.timings.get(index)?;
        Some(timing.answered_at? - timing.presented_at?)
    }

    pub(crate) fn check_index(&self, index: usize) -> Result<(), SessionError> {
        if self.is_done() {
            return Err(SessionError::AlreadyFinished(self.session_id.clone()));
        }
        if index >= self.entries.len() {
            return Err(SessionError::IndexOutOfRange {
                index,
                total: self.entries.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn record_answer(&mut self, index: usize, answer: String, media: Option<MediaRef>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.answer = Some(answer);
            if media.is_some() {
                entry.media = media;
            }
        }
        if let Some(timing) = self.timings.get_mut(index) {
            timing.answered_at = Some(Utc::now());
        }
    }

    pub(crate) fn insert_entry(&mut self, position: usize, entry: ConversationEntry) {
        let position = position.min(self.entries.len());
        self.entries.insert(position, entry);
        self.timings.insert(position, QuestionTiming::default());
    }

    pub(crate) fn increment_follow_up(&mut self, base_question_number: usize) -> u32 {
        let count = self.follow_up_counts.entry(base_question_number).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn set_state(&mut self, state: ControllerState) {
        self.state = state;
    }

    pub(crate) fn mark_presented(&mut self, index: usize) {
        if let Some(timing) = self.timings.get_mut(index) {
            timing.presented_at.get_or_insert_with(Utc::now);
        }
    }

    /// 追问条目所属的原始题号
    fn follow_up_base_number(&self, entry: &ConversationEntry) -> Option<usize> {
        if let Some(parent) = entry.parent_scenario_id {
            return self.base_question_number(parent);
        }
        LEADING_MARKER_NUMBER
            .captures(&entry.question)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[会话 {}]", self.session_id)
    }
}
