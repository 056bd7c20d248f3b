//! 基础设施层
//!
//! 持有外部资源（文档存储、对象存储、评分服务），只暴露能力，不处理业务流程。

pub mod document_store;
#[cfg(test)]
pub(crate) mod fakes;
pub mod object_storage;
pub mod scoring;

pub use document_store::{
    DocumentFilter, DocumentStore, JsonFileDocumentStore, JsonMap, MemoryDocumentStore,
    StoredDocument,
};
pub use object_storage::{HttpObjectStorage, LocalObjectStorage, ObjectStorage};
pub use scoring::{OpenAiScoringService, ScoringService};
