use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 追问题号只用一个字母（a-z）
pub const MAX_FOLLOW_UPS_LIMIT: u32 = 26;
/// 部分提交记录最长保留十年
pub const MAX_EXPIRY_DAYS: i64 = 3_650;
/// 可恢复窗口最长一年
pub const MAX_RESUME_WINDOW_HOURS: i64 = 24 * 365;
/// 清理间隔最长一周
pub const MAX_CLEANUP_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 追问配置 ---
    /// 每道原始题目最多生成的追问数量（0 表示关闭追问）
    pub max_follow_ups: u32,

    // --- 重试配置 ---
    /// 外部评分服务最大尝试次数
    pub retry_max_attempts: u32,
    /// 指数退避的基础等待时间（毫秒）
    pub retry_base_delay_ms: u64,
    /// 单次等待时间上限（毫秒）
    pub retry_max_delay_ms: u64,

    // --- 持久化配置 ---
    /// 内联媒体超过该字节数时上传到对象存储
    pub inline_media_threshold_bytes: usize,
    /// 可恢复会话的时间窗口（小时）
    pub resume_window_hours: i64,
    /// 部分提交记录的过期天数
    pub submission_expiry_days: i64,
    /// 过期清理任务的执行间隔（分钟）
    pub cleanup_interval_minutes: u64,
    /// 保存失败时建议调用方等待的秒数
    pub persistence_retry_after_secs: u64,
    /// 文档存储目录
    pub data_dir: String,
    /// 媒体文件存储目录
    pub media_dir: String,
    /// 媒体文件对外访问地址（可选）
    pub media_base_url: Option<String>,

    // --- 聚合配置 ---
    /// 同时评估的场景簇数量
    pub aggregation_concurrency: usize,

    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_follow_ups: 2,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 8_000,
            inline_media_threshold_bytes: 512 * 1024,
            resume_window_hours: 24,
            submission_expiry_days: 7,
            cleanup_interval_minutes: 360,
            persistence_retry_after_secs: 5,
            data_dir: "assessment_data".to_string(),
            media_dir: "assessment_media".to_string(),
            media_base_url: None,
            aggregation_concurrency: 2,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.2,
        }
    }
}

impl Config {
    /// 从环境变量加载配置，缺失或无法解析的值使用默认值
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载配置（所有键均可省略），再叠加环境变量
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        // 环境变量叠加之后再校验
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML 字符串
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
            path: String::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        Self {
            max_follow_ups: env_or("MAX_FOLLOW_UPS", self.max_follow_ups),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", self.retry_max_attempts),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", self.retry_base_delay_ms),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", self.retry_max_delay_ms),
            inline_media_threshold_bytes: env_or(
                "INLINE_MEDIA_THRESHOLD_BYTES",
                self.inline_media_threshold_bytes,
            ),
            resume_window_hours: env_or("RESUME_WINDOW_HOURS", self.resume_window_hours),
            submission_expiry_days: env_or("SUBMISSION_EXPIRY_DAYS", self.submission_expiry_days),
            cleanup_interval_minutes: env_or(
                "CLEANUP_INTERVAL_MINUTES",
                self.cleanup_interval_minutes,
            ),
            persistence_retry_after_secs: env_or(
                "PERSISTENCE_RETRY_AFTER_SECS",
                self.persistence_retry_after_secs,
            ),
            data_dir: std::env::var("DATA_DIR").unwrap_or(self.data_dir),
            media_dir: std::env::var("MEDIA_DIR").unwrap_or(self.media_dir),
            media_base_url: std::env::var("MEDIA_BASE_URL").ok().or(self.media_base_url),
            aggregation_concurrency: env_or(
                "AGGREGATION_CONCURRENCY",
                self.aggregation_concurrency,
            ),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            llm_temperature: env_or("LLM_TEMPERATURE", self.llm_temperature),
        }
    }

    /// 校验配置的取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_attempts".to_string(),
                message: "至少需要尝试 1 次".to_string(),
            });
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_delay_ms".to_string(),
                message: "不能小于 retry_base_delay_ms".to_string(),
            });
        }
        if self.aggregation_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "aggregation_concurrency".to_string(),
                message: "必须大于 0".to_string(),
            });
        }
        if self.max_follow_ups > MAX_FOLLOW_UPS_LIMIT {
            return Err(out_of_range("max_follow_ups", 0, MAX_FOLLOW_UPS_LIMIT));
        }
        if !(1..=MAX_EXPIRY_DAYS).contains(&self.submission_expiry_days) {
            return Err(out_of_range("submission_expiry_days", 1, MAX_EXPIRY_DAYS));
        }
        if !(1..=MAX_RESUME_WINDOW_HOURS).contains(&self.resume_window_hours) {
            return Err(out_of_range("resume_window_hours", 1, MAX_RESUME_WINDOW_HOURS));
        }
        if !(1..=MAX_CLEANUP_INTERVAL_MINUTES).contains(&self.cleanup_interval_minutes) {
            return Err(out_of_range(
                "cleanup_interval_minutes",
                1,
                MAX_CLEANUP_INTERVAL_MINUTES,
            ));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        let minutes = self
            .cleanup_interval_minutes
            .clamp(1, MAX_CLEANUP_INTERVAL_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    /// 部分提交记录的保留时长（未经校验的值也会被收敛到合法范围）
    pub fn submission_expiry(&self) -> chrono::Duration {
        chrono::Duration::days(self.submission_expiry_days.clamp(1, MAX_EXPIRY_DAYS))
    }

    /// 可恢复会话的时间窗口
    pub fn resume_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.resume_window_hours.clamp(1, MAX_RESUME_WINDOW_HOURS))
    }
}

fn out_of_range<T: std::fmt::Display>(key: &str, min: T, max: T) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("取值必须在 {} 到 {} 之间", min, max),
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
