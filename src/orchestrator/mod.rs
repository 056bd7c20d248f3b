//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层对上层调用方暴露会话接口，并负责后台调度。
//!
//! ## 模块划分
//!
//! ### `assessment` - 测评会话
//! - 开始、恢复、结束会话
//! - 提交回答（本地状态优先，后台保存）
//! - 生成并保存最终报告
//!
//! ### `cleanup` - 过期清理调度
//! - 按间隔删除过期的部分提交记录
//!
//! ## 层次关系
//!
//! ```text
//! assessment / cleanup
//!     ↓
//! workflow::FollowUpController (处理单次作答)
//!     ↓
//! services (能力层：evaluator / persistence / recovery / grouping / aggregation)
//!     ↓
//! infrastructure (基础设施：DocumentStore / ObjectStorage / ScoringService)
//! ```

pub mod assessment;
pub mod cleanup;

pub use assessment::{AssessmentEngine, AssessmentSession};
pub use cleanup::CleanupScheduler;
