//! 业务能力层
//!
//! 每个服务只提供一种能力，不关心会话流程。

pub mod aggregation;
pub mod evaluator;
pub mod grouping;
pub mod persistence;
pub mod recovery;
pub mod retry;

pub use aggregation::{AggregationResult, CompetencyAggregator};
pub use evaluator::AnswerQualityEvaluator;
pub use grouping::{group, group_linked, is_follow_up, GroupingResult, ScenarioCluster};
pub use persistence::ProgressivePersistence;
pub use recovery::SessionRecoveryResolver;
pub use retry::RetryPolicy;
