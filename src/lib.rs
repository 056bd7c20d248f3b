//! # Adaptive Assessment
//!
//! 一个多轮自适应情境判断测评引擎
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有外部资源，只暴露能力
//! - `DocumentStore` - 按集合读写 JSON 文档（内存 / 文件实现）
//! - `ObjectStorage` - 媒体文件上传（本地目录 / HTTP PUT）
//! - `ScoringService` - 外部 AI 评分服务（OpenAI 兼容接口）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `RetryPolicy` - 指数退避重试
//! - `AnswerQualityEvaluator` - 完整度检查与能力评分（失败放行）
//! - `ProgressivePersistence` - 逐题保存、标记完成、过期清理
//! - `SessionRecoveryResolver` - 找回中断的会话
//! - `grouping` - 把问答还原为场景簇
//! - `CompetencyAggregator` - 按能力维度聚合评分
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次作答"之后的流程
//! - `SessionState` - 会话状态（条目、追问计数、计时）
//! - `FollowUpController` - 追问状态机
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/assessment` - 开始 / 恢复 / 提交 / 结束会话
//! - `orchestrator/cleanup` - 过期记录清理调度
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{
    AssessmentReport, CompetencyScore, ConversationEntry, MediaRef, Scenario, SessionRecovery,
};
pub use orchestrator::{AssessmentEngine, AssessmentSession, CleanupScheduler};
pub use workflow::{NextStep, SessionState};
