//! 渐进式持久化服务 - 业务能力层
//!
//! 每提交一道题就写入一条部分提交记录，而不是等到会话结束。
//! 保存失败只返回 [`SaveOutcome::Failed`]，从不向上抛出，本地会话状态不受影响。

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{StorageError, StorageResult, StoreError, StoreResult};
use crate::infrastructure::{DocumentFilter, DocumentStore, JsonMap, ObjectStorage, StoredDocument};
use crate::models::{
    CleanupReport, ConversationEntry, MediaRef, PartialSubmission, SaveOptions, SaveOutcome,
    StoredSubmission, DEFAULT_CANDIDATE_NAME, SUBMISSIONS_COLLECTION,
};
use crate::utils::timestamp::best_record_timestamp;

/// 渐进式持久化服务
#[derive(Clone)]
pub struct ProgressivePersistence {
    store: Arc<dyn DocumentStore>,
    storage: Arc<dyn ObjectStorage>,
    inline_media_threshold: usize,
    retry_after_secs: u64,
    expiry: Duration,
}

impl ProgressivePersistence {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            storage,
            inline_media_threshold: config.inline_media_threshold_bytes,
            retry_after_secs: config.persistence_retry_after_secs,
            expiry: config.submission_expiry(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// 保存一道题的回答
    ///
    /// # 参数
    /// - `session_id`: 会话ID
    /// - `user_id`: 候选人ID
    /// - `question_index`: 题目在对话中的位置
    /// - `total_questions`: 当前题目总数（含已插入的追问）
    /// - `entry`: 对话条目
    /// - `options`: 媒体上传、候选人姓名、作答时长
    ///
    /// # 返回
    /// 成功返回文档ID；失败时返回建议的重试等待时间
    pub async fn save_question_answer(
        &self,
        session_id: &str,
        user_id: &str,
        question_index: usize,
        total_questions: usize,
        entry: &ConversationEntry,
        options: SaveOptions,
    ) -> SaveOutcome {
        let media = match &entry.media {
            Some(media) => Some(
                self.prepare_media(user_id, session_id, question_index, media, options.upload_immediately)
                    .await,
            ),
            None => None,
        };

        let submission = PartialSubmission {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            question_index,
            total_questions,
            question: entry.question.clone(),
            answer: entry.answer.clone().unwrap_or_default(),
            candidate_name: options
                .candidate_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CANDIDATE_NAME.to_string()),
            scenario_id: entry.scenario_id,
            parent_scenario_id: entry.parent_scenario_id,
            assessed_competency: non_empty(&entry.assessed_competency),
            situation: non_empty(&entry.situation),
            best_response_rationale: non_empty(&entry.best_response_rationale),
            worst_response_rationale: non_empty(&entry.worst_response_rationale),
            media,
            answer_duration_secs: options.answer_duration_secs.filter(|secs| secs.is_finite()),
            timestamp: Value::String(Utc::now().to_rfc3339()),
            is_complete: false,
        };

        match self.write_submission(&submission).await {
            Ok(submission_id) => {
                debug!(
                    "💾 已保存第 {} 题 [会话 {}] -> {}",
                    question_index + 1,
                    session_id,
                    submission_id
                );
                SaveOutcome::Saved { submission_id }
            }
            Err(e) => {
                error!(
                    "❌ 保存第 {} 题失败 [会话 {}]: {}",
                    question_index + 1,
                    session_id,
                    e
                );
                SaveOutcome::Failed {
                    error: e.to_string(),
                    should_retry: true,
                    retry_after_seconds: self.retry_after_secs,
                }
            }
        }
    }

    async fn write_submission(&self, submission: &PartialSubmission) -> StoreResult<String> {
        let mut value = serde_json::to_value(submission)?;
        strip_nulls(&mut value);
        let doc = match value {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Unavailable(format!(
                    "提交记录不是 JSON 对象: {}",
                    other
                )))
            }
        };
        self.store.insert(SUBMISSIONS_COLLECTION, doc).await
    }

    /// 大体积内联媒体转存到对象存储；失败时保留内联数据
    async fn prepare_media(
        &self,
        user_id: &str,
        session_id: &str,
        question_index: usize,
        media: &MediaRef,
        upload_immediately: bool,
    ) -> MediaRef {
        let MediaRef::Inline { data_url } = media else {
            return media.clone();
        };
        if !upload_immediately || media.inline_len() <= self.inline_media_threshold {
            return media.clone();
        }

        match self
            .upload_inline(user_id, session_id, question_index, data_url)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!("⚠️ 媒体上传失败，保留内联数据 [会话 {}]: {}", session_id, e);
                media.clone()
            }
        }
    }

    async fn upload_inline(
        &self,
        user_id: &str,
        session_id: &str,
        question_index: usize,
        data_url: &str,
    ) -> StorageResult<MediaRef> {
        let (content_type, bytes) = decode_data_url(data_url)?;
        let path = format!(
            "assessments/{}/{}/q{}-{}.{}",
            user_id,
            session_id,
            question_index,
            uuid::Uuid::new_v4().simple(),
            extension_for(&content_type)
        );
        let size_bytes = bytes.len();
        let url = self.storage.put(&path, bytes, &content_type).await?;
        info!("📤 媒体已转存: {} ({} 字节)", url, size_bytes);

        Ok(MediaRef::Stored {
            url,
            content_type,
            size_bytes,
        })
    }

    /// 把会话的所有记录标记为已完成
    ///
    /// # 返回
    /// 被更新的记录数量
    pub async fn mark_session_complete(&self, session_id: &str) -> StoreResult<usize> {
        let docs = self
            .store
            .find(
                SUBMISSIONS_COLLECTION,
                &DocumentFilter::new().eq("sessionId", session_id),
            )
            .await?;

        let mut patch = JsonMap::new();
        patch.insert("isComplete".to_string(), Value::Bool(true));

        for doc in &docs {
            self.store
                .update(SUBMISSIONS_COLLECTION, &doc.id, patch.clone())
                .await?;
        }

        info!("✓ 会话 {} 已标记完成 ({} 条记录)", session_id, docs.len());
        Ok(docs.len())
    }

    /// 删除过期的部分提交记录
    pub async fn cleanup_expired_sessions(&self) -> StoreResult<CleanupReport> {
        self.cleanup_expired_sessions_at(Utc::now()).await
    }

    /// 以指定时间为"现在"清理过期记录
    ///
    /// 记录时间按 `timestamp` → `createdAt` → 存储创建时间 的顺序取值，
    /// 都不可用时跳过，不会误删。
    pub async fn cleanup_expired_sessions_at(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<CleanupReport> {
        let docs = self
            .store
            .find(SUBMISSIONS_COLLECTION, &DocumentFilter::new())
            .await?;
        let cutoff = now - self.expiry;

        let mut report = CleanupReport {
            scanned: docs.len(),
            ..CleanupReport::default()
        };

        for doc in docs {
            let Some(ts) = best_record_timestamp(&doc.data, doc.created_at) else {
                report.skipped += 1;
                continue;
            };
            if ts >= cutoff {
                continue;
            }
            match self.store.delete(SUBMISSIONS_COLLECTION, &doc.id).await {
                Ok(()) => report.deleted += 1,
                Err(e) => error!("❌ 删除过期记录 {} 失败: {}", doc.id, e),
            }
        }

        if report.deleted > 0 || report.skipped > 0 {
            info!(
                "🧹 过期清理: 扫描 {} 条, 删除 {} 条, 跳过 {} 条",
                report.scanned, report.deleted, report.skipped
            );
        }
        Ok(report)
    }
}

/// 把存储文档解析为提交记录；形状不符的文档返回 None
pub fn decode_submission(doc: StoredDocument) -> Option<StoredSubmission> {
    let activity_at = best_record_timestamp(&doc.data, doc.created_at);
    match serde_json::from_value::<PartialSubmission>(Value::Object(doc.data)) {
        Ok(record) => Some(StoredSubmission {
            id: doc.id,
            record,
            activity_at,
        }),
        Err(e) => {
            warn!("⚠️ 跳过无法解析的提交记录 {}: {}", doc.id, e);
            None
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// 递归删除值为 null 的键
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// 解析 `data:<mime>[;param];base64,<payload>`
fn decode_data_url(data_url: &str) -> StorageResult<(String, Vec<u8>)> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| StorageError::InvalidPayload("缺少 data: 前缀".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| StorageError::InvalidPayload("缺少数据分隔符".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(StorageError::InvalidPayload(
            "只支持 base64 编码的媒体".to_string(),
        ));
    }

    let mime = header.split(';').next().unwrap_or_default().trim();
    let content_type = if mime.is_empty() {
        "application/octet-stream".to_string()
    } else {
        mime.to_string()
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| StorageError::InvalidPayload(e.to_string()))?;
    Ok((content_type, bytes))
}

fn extension_for(content_type: &str) -> String {
    let subtype = content_type.split('/').nth(1).unwrap_or("bin");
    match subtype {
        "mpeg" => "mp3".to_string(),
        "quicktime" => "mov".to_string(),
        "octet-stream" => "bin".to_string(),
        other => {
            let cleaned: String = other
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if cleaned.is_empty() {
                "bin".to_string()
            } else {
                cleaned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{LocalObjectStorage, MemoryDocumentStore};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn insert(&self, _collection: &str, _doc: JsonMap) -> StoreResult<String> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn get(&self, _c: &str, _id: &str) -> StoreResult<Option<StoredDocument>> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn update(&self, _c: &str, _id: &str, _patch: JsonMap) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn delete(&self, _c: &str, _id: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn find(&self, _c: &str, _f: &DocumentFilter) -> StoreResult<Vec<StoredDocument>> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    struct RejectingStorage;

    #[async_trait]
    impl ObjectStorage for RejectingStorage {
        async fn put(&self, path: &str, _bytes: Vec<u8>, _ct: &str) -> StorageResult<String> {
            Err(StorageError::upload_failed(path, "quota exceeded"))
        }
    }

    fn entry(answer: Option<&str>) -> ConversationEntry {
        ConversationEntry {
            scenario_id: Some(1),
            question: "How do you handle an unhappy customer?".to_string(),
            answer: answer.map(str::to_string),
            assessed_competency: "Customer Focus".to_string(),
            ..ConversationEntry::default()
        }
    }

    fn small_threshold_config() -> Config {
        Config {
            inline_media_threshold_bytes: 16,
            ..Config::default()
        }
    }

    fn data_url(len: usize) -> String {
        let payload = base64::engine::general_purpose::STANDARD.encode(vec![7u8; len]);
        format!("data:video/webm;codecs=vp8;base64,{}", payload)
    }

    #[tokio::test]
    async fn test_save_defaults_and_strips_absent_fields() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().unwrap();
        let persistence = ProgressivePersistence::new(
            store.clone(),
            Arc::new(LocalObjectStorage::new(dir.path(), None)),
            &Config::default(),
        );

        let outcome = persistence
            .save_question_answer("s1", "u1", 0, 3, &entry(None), SaveOptions::default())
            .await;
        let id = outcome.submission_id().unwrap().to_string();

        let doc = store.get(SUBMISSIONS_COLLECTION, &id).await.unwrap().unwrap();
        assert_eq!(doc.data["answer"], "");
        assert_eq!(doc.data["candidateName"], DEFAULT_CANDIDATE_NAME);
        assert_eq!(doc.data["assessedCompetency"], "Customer Focus");
        assert_eq!(doc.data["isComplete"], false);
        assert!(doc.data.values().all(|v| !v.is_null()));
        assert!(!doc.data.contains_key("situation"));
        assert!(!doc.data.contains_key("media"));
        assert!(doc.data["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_store_failure_returns_retry_hint() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ProgressivePersistence::new(
            Arc::new(BrokenStore),
            Arc::new(LocalObjectStorage::new(dir.path(), None)),
            &Config::default(),
        );

        let outcome = persistence
            .save_question_answer("s1", "u1", 0, 1, &entry(Some("a")), SaveOptions::default())
            .await;

        match outcome {
            SaveOutcome::Failed {
                should_retry,
                retry_after_seconds,
                ..
            } => {
                assert!(should_retry);
                assert_eq!(retry_after_seconds, 5);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_inline_media_is_uploaded() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dir = tempfile::tempdir().unwrap();
        let persistence = ProgressivePersistence::new(
            store.clone(),
            Arc::new(LocalObjectStorage::new(
                dir.path(),
                Some("https://cdn.test".to_string()),
            )),
            &small_threshold_config(),
        );

        let mut with_media = entry(Some("see video"));
        with_media.media = Some(MediaRef::Inline {
            data_url: data_url(64),
        });
        let options = SaveOptions {
            upload_immediately: true,
            answer_duration_secs: Some(42.5),
            ..SaveOptions::default()
        };

        let outcome = persistence
            .save_question_answer("s1", "u1", 2, 3, &with_media, options)
            .await;
        let id = outcome.submission_id().unwrap().to_string();
        let doc = store.get(SUBMISSIONS_COLLECTION, &id).await.unwrap().unwrap();

        let media = &doc.data["media"];
        assert_eq!(media["kind"], "stored");
        assert_eq!(media["contentType"], "video/webm");
        assert_eq!(media["sizeBytes"], 64);
        let url = media["url"].as_str().unwrap();
        assert!(url.starts_with("https://cdn.test/assessments/u1/s1/q2-"));
        assert!(url.ends_with(".webm"));
        assert_eq!(doc.data["answerDurationSecs"], json!(42.5));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_inline_payload() {
        let store = Arc::new(MemoryDocumentStore::new());
        let persistence = ProgressivePersistence::new(
            store.clone(),
            Arc::new(RejectingStorage),
            &small_threshold_config(),
        );

        let mut with_media = entry(Some("see video"));
        let inline = data_url(64);
        with_media.media = Some(MediaRef::Inline {
            data_url: inline.clone(),
        });
        let options = SaveOptions {
            upload_immediately: true,
            ..SaveOptions::default()
        };

        let outcome = persistence
            .save_question_answer("s1", "u1", 0, 1, &with_media, options)
            .await;
        let id = outcome.submission_id().unwrap().to_string();
        let doc = store.get(SUBMISSIONS_COLLECTION, &id).await.unwrap().unwrap();

        assert_eq!(doc.data["media"]["kind"], "inline");
        assert_eq!(doc.data["media"]["dataUrl"], inline.as_str());
    }

    #[tokio::test]
    async fn test_mark_session_complete_only_touches_that_session() {
        let store = Arc::new(MemoryDocumentStore::new());
        let persistence = ProgressivePersistence::new(
            store.clone(),
            Arc::new(RejectingStorage),
            &Config::default(),
        );
        for (session, index) in [("s1", 0), ("s1", 1), ("s2", 0)] {
            let outcome = persistence
                .save_question_answer(session, "u1", index, 2, &entry(Some("a")), SaveOptions::default())
                .await;
            assert!(outcome.is_success());
        }

        assert_eq!(persistence.mark_session_complete("s1").await.unwrap(), 2);

        let open = store
            .find(
                SUBMISSIONS_COLLECTION,
                &DocumentFilter::new().eq("isComplete", false),
            )
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].data["sessionId"], "s2");
    }

    #[tokio::test]
    async fn test_cleanup_uses_fallback_timestamps_and_skips_unknown() {
        let store = Arc::new(MemoryDocumentStore::new());
        let now = DateTime::parse_from_rfc3339("2026-10-18T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let old = now - Duration::days(8);
        let fresh = now - Duration::days(2);

        let doc = |v: Value| v.as_object().cloned().unwrap();
        store
            .insert_with_id(
                SUBMISSIONS_COLLECTION,
                "old-ts",
                doc(json!({"sessionId": "a", "timestamp": old.to_rfc3339()})),
                None,
            )
            .await;
        store
            .insert_with_id(
                SUBMISSIONS_COLLECTION,
                "old-created",
                doc(json!({"sessionId": "b", "timestamp": "garbage", "createdAt": {"seconds": old.timestamp()}})),
                None,
            )
            .await;
        store
            .insert_with_id(
                SUBMISSIONS_COLLECTION,
                "old-store-time",
                doc(json!({"sessionId": "c"})),
                Some(old),
            )
            .await;
        store
            .insert_with_id(
                SUBMISSIONS_COLLECTION,
                "fresh",
                doc(json!({"sessionId": "d", "timestamp": fresh.timestamp_millis()})),
                None,
            )
            .await;
        store
            .insert_with_id(
                SUBMISSIONS_COLLECTION,
                "unknown",
                doc(json!({"sessionId": "e", "timestamp": null})),
                None,
            )
            .await;

        let persistence =
            ProgressivePersistence::new(store.clone(), Arc::new(RejectingStorage), &Config::default());
        let report = persistence.cleanup_expired_sessions_at(now).await.unwrap();

        assert_eq!(
            report,
            CleanupReport {
                scanned: 5,
                deleted: 3,
                skipped: 1
            }
        );
        assert_eq!(store.len(SUBMISSIONS_COLLECTION).await, 2);
        assert!(store.get(SUBMISSIONS_COLLECTION, "fresh").await.unwrap().is_some());
        assert!(store.get(SUBMISSIONS_COLLECTION, "unknown").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_negative_expiry_never_deletes_fresh_records() {
        let store = Arc::new(MemoryDocumentStore::new());
        let config = Config {
            submission_expiry_days: -1,
            ..Config::default()
        };
        let persistence =
            ProgressivePersistence::new(store.clone(), Arc::new(RejectingStorage), &config);

        let outcome = persistence
            .save_question_answer("s1", "u1", 0, 1, &entry(Some("a")), SaveOptions::default())
            .await;
        assert!(outcome.is_success());

        let report = persistence.cleanup_expired_sessions().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(store.len(SUBMISSIONS_COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_uses_creation_time_after_completion_update() {
        let dir = tempfile::tempdir().unwrap();
        let created = Utc::now() - Duration::days(10);
        std::fs::create_dir_all(dir.path().join(SUBMISSIONS_COLLECTION)).unwrap();
        std::fs::write(
            dir.path().join(SUBMISSIONS_COLLECTION).join("no-ts.json"),
            serde_json::to_vec(&json!({
                "_meta": {"createdAt": created.to_rfc3339()},
                "document": {"sessionId": "s1", "isComplete": false}
            }))
            .unwrap(),
        )
        .unwrap();

        let store = Arc::new(crate::infrastructure::JsonFileDocumentStore::new(dir.path()));
        let persistence =
            ProgressivePersistence::new(store.clone(), Arc::new(RejectingStorage), &Config::default());

        // 标记完成会重写文件，但不能刷新创建时间
        assert_eq!(persistence.mark_session_complete("s1").await.unwrap(), 1);
        let report = persistence.cleanup_expired_sessions().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(store
            .get(SUBMISSIONS_COLLECTION, "no-ts")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_data_url() {
        let (content_type, bytes) = decode_data_url("data:audio/mpeg;base64,AAEC").unwrap();
        assert_eq!(content_type, "audio/mpeg");
        assert_eq!(bytes, vec![0, 1, 2]);
        assert_eq!(extension_for(&content_type), "mp3");

        assert!(decode_data_url("https://not-inline").is_err());
        assert!(decode_data_url("data:text/plain,hello").is_err());
    }
}
