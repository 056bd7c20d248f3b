/// 日志工具模块
///
/// 提供日志初始化和格式化输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::{AssessmentReport, ReportSource};

/// 初始化全局日志
///
/// 优先读取 `RUST_LOG`，否则默认 `info`。重复调用不会报错。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录会话开始信息
///
/// # 参数
/// - `session_id`: 会话ID
/// - `user_id`: 候选人ID
/// - `total_questions`: 初始题目数量
pub fn log_session_start(session_id: &str, user_id: &str, total_questions: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 测评会话开始 [会话 {}]", session_id);
    info!("👤 候选人: {}", user_id);
    info!("📋 初始题目数量: {}", total_questions);
    info!("{}", "=".repeat(60));
}

/// 记录最终报告
pub fn log_report(report: &AssessmentReport) {
    info!("\n{}", "=".repeat(60));
    info!("📊 测评报告 [会话 {}]", report.session_id);
    let source = match report.source {
        ReportSource::Evaluated => "实时评分",
        ReportSource::PriorReport => "历史报告",
        ReportSource::Placeholder => "完成度占位",
    };
    info!("来源: {}", source);
    for competency in &report.competencies {
        info!("  - {}: {:.1}/10", competency.name, competency.score);
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("团队合作非常重要", 4), "团队合作...");
    }
}
