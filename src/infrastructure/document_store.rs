//! 文档存储 - 基础设施层
//!
//! 只暴露"按集合读写 JSON 文档"的能力，不认识提交记录 / 报告等业务类型。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// JSON 文档
pub type JsonMap = Map<String, Value>;

/// 从存储读出的文档
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: JsonMap,
    /// 存储层记录的创建时间（不一定可用）
    pub created_at: Option<DateTime<Utc>>,
}

/// 查询条件：多个字段相等条件的合取，空条件匹配全部文档
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    conditions: Vec<(String, Value)>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个 `field == value` 条件
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &JsonMap) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// 文档存储
///
/// 不假设跨文档事务；每个操作只作用于单个文档或一次查询。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 插入文档，返回生成的文档ID
    async fn insert(&self, collection: &str, doc: JsonMap) -> StoreResult<String>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// 浅合并更新：`patch` 中的键覆盖原文档
    async fn update(&self, collection: &str, id: &str, patch: JsonMap) -> StoreResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    async fn find(&self, collection: &str, filter: &DocumentFilter)
        -> StoreResult<Vec<StoredDocument>>;
}

fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ========== 内存实现 ==========

/// 内存文档存储（测试与单进程场景）
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, StoredDocument>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定ID和创建时间写入文档（用于导入历史数据）
    pub async fn insert_with_id(
        &self,
        collection: &str,
        id: &str,
        data: JsonMap,
        created_at: Option<DateTime<Utc>>,
    ) {
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_default().insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                data,
                created_at,
            },
        );
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, collection: &str, doc: JsonMap) -> StoreResult<String> {
        let id = new_document_id();
        self.insert_with_id(collection, &id, doc, Some(Utc::now()))
            .await;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn update(&self, collection: &str, id: &str, patch: JsonMap) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        doc.data.extend(patch);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        if let Some(c) = collections.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> StoreResult<Vec<StoredDocument>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|doc| filter.matches(&doc.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ========== 文件实现 ==========

/// 文件中的文档外壳
///
/// 创建时间与文档内容分开保存；更新只替换 `document`，`createdAt` 保持不变。
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEnvelope {
    #[serde(rename = "_meta")]
    meta: FileMeta,
    document: JsonMap,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileMeta {
    created_at: DateTime<Utc>,
}

/// JSON 文件存储
///
/// 每个文档对应 `<root>/<collection>/<id>.json`，写入先落临时文件再重命名。
/// 没有外壳的旧文件按整份文档读取，创建时间取文件元数据。
pub struct JsonFileDocumentStore {
    root: PathBuf,
}

impl JsonFileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{}.json", id))
    }

    async fn write_document(
        &self,
        collection: &str,
        id: &str,
        data: JsonMap,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))?;

        let path = self.document_path(collection, id);
        let tmp_path = path.with_extension("json.tmp");
        let envelope = FileEnvelope {
            meta: FileMeta { created_at },
            document: data,
        };
        let content = serde_json::to_vec_pretty(&envelope)?;

        fs::write(&tmp_path, content)
            .await
            .map_err(|e| StoreError::io(tmp_path.display().to_string(), e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;

        debug!("文档已写入: {}", path.display());
        Ok(())
    }

    async fn read_document(&self, path: &Path) -> StoreResult<Option<StoredDocument>> {
        let id = match path.file_stem().and_then(|s| s.to_str()) {
            Some(id) => id.to_string(),
            None => return Ok(None),
        };

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
        };

        let raw: JsonMap = match serde_json::from_slice(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️ 跳过无法解析的文档 {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        if let Ok(envelope) = serde_json::from_value::<FileEnvelope>(Value::Object(raw.clone())) {
            return Ok(Some(StoredDocument {
                id,
                data: envelope.document,
                created_at: Some(envelope.meta.created_at),
            }));
        }

        // 旧格式：整个文件就是文档
        let created_at = fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.created().or_else(|_| m.modified()).ok())
            .map(DateTime::<Utc>::from);

        Ok(Some(StoredDocument {
            id,
            data: raw,
            created_at,
        }))
    }
}

#[async_trait]
impl DocumentStore for JsonFileDocumentStore {
    async fn insert(&self, collection: &str, doc: JsonMap) -> StoreResult<String> {
        let id = new_document_id();
        self.write_document(collection, &id, doc, Utc::now()).await?;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.read_document(&self.document_path(collection, id)).await
    }

    async fn update(&self, collection: &str, id: &str, patch: JsonMap) -> StoreResult<()> {
        let mut doc = self
            .get(collection, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        doc.data.extend(patch);
        // 旧文件第一次更新时把元数据时间固定下来
        let created_at = doc.created_at.unwrap_or_else(Utc::now);
        self.write_document(collection, id, doc.data, created_at)
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let path = self.document_path(collection, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> StoreResult<Vec<StoredDocument>> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir.display().to_string(), e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::new();
        for path in paths {
            if let Some(doc) = self.read_document(&path).await? {
                if filter.matches(&doc.data) {
                    documents.push(doc);
                }
            }
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    async fn exercise_store(store: &dyn DocumentStore) {
        let a = store
            .insert("items", doc(json!({"sessionId": "s1", "isComplete": false})))
            .await
            .unwrap();
        let _b = store
            .insert("items", doc(json!({"sessionId": "s2", "isComplete": false})))
            .await
            .unwrap();

        let s1 = store
            .find("items", &DocumentFilter::new().eq("sessionId", "s1"))
            .await
            .unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].id, a);

        store
            .update("items", &a, doc(json!({"isComplete": true})))
            .await
            .unwrap();
        let done = store
            .find("items", &DocumentFilter::new().eq("isComplete", true))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data["sessionId"], "s1");

        assert_eq!(store.find("items", &DocumentFilter::new()).await.unwrap().len(), 2);
        assert!(store.find("missing", &DocumentFilter::new()).await.unwrap().is_empty());

        store.delete("items", &a).await.unwrap();
        assert!(store.get("items", &a).await.unwrap().is_none());
        assert!(matches!(
            store.update("items", &a, JsonMap::new()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        exercise_store(&MemoryDocumentStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&JsonFileDocumentStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupted_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::new(dir.path());
        store
            .insert("items", doc(json!({"ok": true})))
            .await
            .unwrap();
        std::fs::write(dir.path().join("items").join("broken.json"), b"{not json").unwrap();

        let all = store.find("items", &DocumentFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].created_at.is_some());
    }

    #[tokio::test]
    async fn test_file_store_update_keeps_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::new(dir.path());
        let id = store
            .insert("items", doc(json!({"isComplete": false})))
            .await
            .unwrap();
        let created = store.get("items", &id).await.unwrap().unwrap().created_at;
        assert!(created.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store
            .update("items", &id, doc(json!({"isComplete": true})))
            .await
            .unwrap();

        let updated = store.get("items", &id).await.unwrap().unwrap();
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.data, doc(json!({"isComplete": true})));
    }

    #[tokio::test]
    async fn test_file_store_reads_legacy_bare_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("items")).unwrap();
        std::fs::write(
            dir.path().join("items").join("legacy.json"),
            br#"{"sessionId": "old", "document": 1}"#,
        )
        .unwrap();

        let legacy = store.get("items", "legacy").await.unwrap().unwrap();
        assert_eq!(legacy.data["sessionId"], "old");
        assert_eq!(legacy.data["document"], 1);
        assert!(legacy.created_at.is_some());

        // 第一次更新后改为外壳格式，内容不变
        store
            .update("items", "legacy", doc(json!({"isComplete": true})))
            .await
            .unwrap();
        let raw: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("items").join("legacy.json")).unwrap())
                .unwrap();
        assert!(raw["_meta"]["createdAt"].is_string());
        assert_eq!(raw["document"]["sessionId"], "old");
        let again = store.get("items", "legacy").await.unwrap().unwrap();
        assert_eq!(again.created_at, legacy.created_at);
    }
}
