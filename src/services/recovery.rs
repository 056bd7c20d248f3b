//! 会话恢复 - 业务能力层
//!
//! 从部分提交记录中找回候选人中断的会话。
//! 同样的存储内容总是得到同样的结果：时间戳解析不会失败，无法解析的记录排在最后。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::StoreResult;
use crate::infrastructure::{DocumentFilter, DocumentStore};
use crate::models::{ProgressInfo, SessionRecovery, StoredSubmission, SUBMISSIONS_COLLECTION};
use crate::services::persistence::decode_submission;
use crate::utils::SENTINEL;

/// 会话恢复服务
#[derive(Clone)]
pub struct SessionRecoveryResolver {
    store: Arc<dyn DocumentStore>,
    resume_window: Duration,
}

impl SessionRecoveryResolver {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        Self {
            store,
            resume_window: config.resume_window(),
        }
    }

    /// 查找候选人最近一次未完成的会话
    pub async fn check_incomplete_session(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<SessionRecovery>> {
        self.check_incomplete_session_at(user_id, Utc::now()).await
    }

    /// 以指定时间为"现在"查找未完成的会话
    ///
    /// # 返回
    /// 最近活动的会话；没有任何未完成记录时返回 None
    pub async fn check_incomplete_session_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SessionRecovery>> {
        let filter = DocumentFilter::new()
            .eq("userId", user_id)
            .eq("isComplete", false);
        let docs = self.store.find(SUBMISSIONS_COLLECTION, &filter).await?;

        let mut sessions: BTreeMap<String, Vec<StoredSubmission>> = BTreeMap::new();
        for submission in docs.into_iter().filter_map(decode_submission) {
            sessions
                .entry(submission.record.session_id.clone())
                .or_default()
                .push(submission);
        }

        // 时间相同时取会话ID较小者
        let selected = sessions
            .into_iter()
            .map(|(session_id, submissions)| {
                let last = submissions.iter().filter_map(|s| s.activity_at).max();
                (session_id, submissions, last)
            })
            .max_by(|(id_a, _, last_a), (id_b, _, last_b)| {
                last_a
                    .unwrap_or(SENTINEL)
                    .cmp(&last_b.unwrap_or(SENTINEL))
                    .then_with(|| id_b.cmp(id_a))
            });

        let Some((session_id, mut submissions, last_activity_at)) = selected else {
            debug!("候选人 {} 没有未完成的会话", user_id);
            return Ok(None);
        };

        sort_by_index(&mut submissions);

        let can_resume = last_activity_at
            .map(|last| now - last < self.resume_window)
            .unwrap_or(false);
        let recovery = SessionRecovery {
            total_questions: submissions
                .iter()
                .map(|s| s.record.total_questions)
                .max()
                .unwrap_or(0),
            completed_questions: submissions.len(),
            last_question_index: submissions
                .iter()
                .map(|s| s.record.question_index)
                .max()
                .unwrap_or(0),
            can_resume,
            started_at: submissions.iter().filter_map(|s| s.activity_at).min(),
            last_activity_at,
            partial_submissions: submissions,
            session_id,
        };

        info!(
            "🔄 找到未完成的会话 {} (已答 {}/{}, 可恢复: {})",
            recovery.session_id,
            recovery.completed_questions,
            recovery.total_questions,
            if recovery.can_resume { "是" } else { "否" }
        );
        Ok(Some(recovery))
    }

    /// 查询单个会话的进度
    pub async fn get_session_progress(&self, session_id: &str) -> StoreResult<Option<ProgressInfo>> {
        let docs = self
            .store
            .find(
                SUBMISSIONS_COLLECTION,
                &DocumentFilter::new().eq("sessionId", session_id),
            )
            .await?;

        let mut submissions: Vec<StoredSubmission> =
            docs.into_iter().filter_map(decode_submission).collect();
        if submissions.is_empty() {
            return Ok(None);
        }
        sort_by_index(&mut submissions);

        let total_questions = submissions
            .iter()
            .map(|s| s.record.total_questions)
            .max()
            .unwrap_or(0);
        let completed: BTreeSet<usize> =
            submissions.iter().map(|s| s.record.question_index).collect();
        let next_question_index = (0..total_questions)
            .find(|i| !completed.contains(i))
            .unwrap_or(total_questions);

        Ok(Some(ProgressInfo {
            session_id: session_id.to_string(),
            total_questions,
            completed_indices: completed.into_iter().collect(),
            next_question_index,
            can_continue: next_question_index < total_questions,
            submissions,
        }))
    }
}

fn sort_by_index(submissions: &mut [StoredSubmission]) {
    submissions.sort_by(|a, b| {
        a.record
            .question_index
            .cmp(&b.record.question_index)
            .then_with(|| {
                a.activity_at
                    .unwrap_or(SENTINEL)
                    .cmp(&b.activity_at.unwrap_or(SENTINEL))
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}
