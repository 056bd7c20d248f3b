use std::time::Duration;

use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 文档存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 对象存储（媒体上传）错误
    #[error("对象存储错误: {0}")]
    Storage(#[from] StorageError),
    /// 外部评分服务错误
    #[error("评分服务错误: {0}")]
    Scoring(#[from] ScoringError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 会话状态错误（调用方传入了非法的题目索引等）
    #[error("会话错误: {0}")]
    Session(#[from] SessionError),
}

/// 文档存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 存储暂时不可用
    #[error("存储不可用: {0}")]
    Unavailable(String),
    /// 文档不存在
    #[error("文档不存在: {collection}/{id}")]
    NotFound { collection: String, id: String },
    /// JSON 序列化 / 反序列化失败
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
    /// 文件读写失败
    #[error("文件读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 对象存储错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 上传失败
    #[error("上传失败 ({path}): {message}")]
    UploadFailed { path: String, message: String },
    /// 内联媒体格式无法解析
    #[error("无效的媒体数据: {0}")]
    InvalidPayload(String),
    /// 本地写入失败
    #[error("写入媒体文件失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 外部评分服务错误
#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    /// 服务过载
    #[error("评分服务过载: {0}")]
    Overloaded(String),
    /// 请求频率限制
    #[error("评分服务限流, 建议等待: {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    /// 请求超时
    #[error("评分服务请求超时")]
    Timeout,
    /// 网关类错误
    #[error("评分服务网关错误 (状态码: {status})")]
    Gateway { status: u16 },
    /// 返回内容为空或无法解析
    #[error("评分服务返回内容无效: {0}")]
    Malformed(String),
    /// 请求本身构建失败
    #[error("评分请求构建失败: {0}")]
    InvalidRequest(String),
    /// 其他 API 错误
    #[error("评分服务 API 错误: {0}")]
    Api(String),
}

/// 错误分类：是否值得重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl ScoringError {
    /// 重试策略唯一使用的分类函数
    pub fn class(&self) -> ErrorClass {
        match self {
            ScoringError::Overloaded(_)
            | ScoringError::RateLimited { .. }
            | ScoringError::Timeout
            | ScoringError::Gateway { .. } => ErrorClass::Retryable,
            ScoringError::Malformed(_) | ScoringError::InvalidRequest(_) | ScoringError::Api(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// 是否属于"服务不可用 / 过载"类错误
    pub fn is_unavailable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// 根据 HTTP 状态码构建错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 => ScoringError::Timeout,
            429 => ScoringError::RateLimited { retry_after: None },
            529 => ScoringError::Overloaded(message.into()),
            500 | 502 | 503 | 504 => ScoringError::Gateway { status },
            _ => ScoringError::Api(message.into()),
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("无法读取配置文件 {path}: {message}")]
    ReadFailed { path: String, message: String },
    /// 配置文件解析失败
    #[error("配置文件解析失败 {path}: {message}")]
    ParseFailed { path: String, message: String },
    /// 配置值非法
    #[error("配置项 {key} 非法: {message}")]
    InvalidValue { key: String, message: String },
}

/// 会话错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 题目索引超出范围
    #[error("题目索引 {index} 超出范围 [0, {total})")]
    IndexOutOfRange { index: usize, total: usize },
    /// 会话已经结束
    #[error("会话 {0} 已结束")]
    AlreadyFinished(String),
    /// 没有可恢复的记录
    #[error("会话 {0} 没有可恢复的记录")]
    NothingToResume(String),
}

// ========== 便捷构造函数 ==========

impl StoreError {
    /// 创建文件读写错误
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl StorageError {
    /// 创建上传失败错误
    pub fn upload_failed(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StorageError::UploadFailed {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
/// 文档存储结果类型
pub type StoreResult<T> = Result<T, StoreError>;
/// 对象存储结果类型
pub type StorageResult<T> = Result<T, StorageError>;
/// 评分服务结果类型
pub type ScoringResult<T> = Result<T, ScoringError>;
