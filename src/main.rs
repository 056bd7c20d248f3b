use std::path::Path;
use std::sync::Arc;

use adaptive_assessment::infrastructure::{JsonFileDocumentStore, LocalObjectStorage};
use adaptive_assessment::models::load_all_scenario_banks;
use adaptive_assessment::services::ProgressivePersistence;
use adaptive_assessment::utils::logging;
use adaptive_assessment::{CleanupScheduler, Config};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = load_config()?;

    // 检查题库
    let bank_dir = std::env::var("SCENARIO_DIR").unwrap_or_else(|_| "scenarios".to_string());
    match load_all_scenario_banks(&bank_dir).await {
        Ok(scenarios) => info!("📚 题库已加载: {} 个场景", scenarios.len()),
        Err(e) => warn!("⚠️ 题库加载失败 ({}): {}", bank_dir, e),
    }

    // 启动过期清理
    let persistence = ProgressivePersistence::new(
        Arc::new(JsonFileDocumentStore::new(&config.data_dir)),
        Arc::new(LocalObjectStorage::new(
            &config.media_dir,
            config.media_base_url.clone(),
        )),
        &config,
    );
    let scheduler = CleanupScheduler::new(persistence, config.cleanup_interval());

    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("⚠️ 无法监听退出信号: {}", e);
            }
        })
        .await;

    Ok(())
}

/// `ASSESSMENT_CONFIG` 指定的文件 → 默认配置文件 → 环境变量
fn load_config() -> Result<Config> {
    let path = std::env::var("ASSESSMENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&path).exists() {
        Config::from_toml_file(&path).with_context(|| format!("加载配置文件失败: {}", path))?
    } else {
        let config = Config::from_env();
        config.validate().context("环境变量配置非法")?;
        config
    };
    info!("⚙️ 配置已加载 (追问上限 {}, 数据目录 {})", config.max_follow_ups, config.data_dir);
    Ok(config)
}
