//! 测试替身：按脚本返回结果的评分服务

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ScoringError, ScoringResult};
use crate::infrastructure::scoring::ScoringService;
use crate::models::{
    CompetencyEvaluation, CompletenessRequest, CompletenessVerdict, ThreadEvaluationRequest,
};

type EvaluationResponder =
    Box<dyn Fn(&ThreadEvaluationRequest) -> ScoringResult<CompetencyEvaluation> + Send + Sync>;

pub struct ScriptedScoring {
    completeness: Mutex<VecDeque<ScoringResult<CompletenessVerdict>>>,
    responder: EvaluationResponder,
    pub completeness_calls: AtomicUsize,
    pub evaluation_calls: AtomicUsize,
    pub thread_requests: Mutex<Vec<ThreadEvaluationRequest>>,
}

impl ScriptedScoring {
    /// 完整度检查脚本用完后一律判定为完整；评分一律 5 分
    pub fn new() -> Self {
        Self::with_responder(|request| {
            Ok(CompetencyEvaluation {
                competency: request.competency.clone(),
                score: 5.0,
                rationale: "scripted".to_string(),
            })
        })
    }

    pub fn with_responder(
        responder: impl Fn(&ThreadEvaluationRequest) -> ScoringResult<CompetencyEvaluation>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            completeness: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            completeness_calls: AtomicUsize::new(0),
            evaluation_calls: AtomicUsize::new(0),
            thread_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_completeness(&self, result: ScoringResult<CompletenessVerdict>) {
        self.completeness.lock().unwrap().push_back(result);
    }

    pub fn push_incomplete(&self, follow_up: &str) {
        self.push_completeness(Ok(incomplete(follow_up)));
    }

    pub fn completeness_calls(&self) -> usize {
        self.completeness_calls.load(Ordering::SeqCst)
    }

    pub fn evaluation_calls(&self) -> usize {
        self.evaluation_calls.load(Ordering::SeqCst)
    }
}

pub fn incomplete(follow_up: &str) -> CompletenessVerdict {
    CompletenessVerdict {
        is_complete: false,
        completion_score: 3.0,
        missing_aspects: vec!["specific steps".to_string()],
        follow_up_question: Some(follow_up.to_string()),
        rationale: "answer lacks detail".to_string(),
    }
}

#[async_trait]
impl ScoringService for ScriptedScoring {
    async fn check_completeness(
        &self,
        _request: &CompletenessRequest,
    ) -> ScoringResult<CompletenessVerdict> {
        self.completeness_calls.fetch_add(1, Ordering::SeqCst);
        self.completeness
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CompletenessVerdict::complete(8.0, "scripted complete")))
    }

    async fn evaluate_thread(
        &self,
        request: &ThreadEvaluationRequest,
    ) -> ScoringResult<CompetencyEvaluation> {
        self.evaluation_calls.fetch_add(1, Ordering::SeqCst);
        self.thread_requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

/// 总是返回指定错误的评分服务
pub struct FailingScoring(pub ScoringError);

#[async_trait]
impl ScoringService for FailingScoring {
    async fn check_completeness(
        &self,
        _request: &CompletenessRequest,
    ) -> ScoringResult<CompletenessVerdict> {
        Err(self.0.clone())
    }

    async fn evaluate_thread(
        &self,
        _request: &ThreadEvaluationRequest,
    ) -> ScoringResult<CompetencyEvaluation> {
        Err(self.0.clone())
    }
}
