//! 外部评分服务 - 基础设施层
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容任意 OpenAI API 风格的服务端点
//!
//! 这里只负责"发请求 + 解析结构化结果 + 错误分类"，
//! 重试与兜底由上层的 `AnswerQualityEvaluator` 决定。

use std::sync::LazyLock;

use async_openai::{
    config::OpenAIConfig,
    error::{ApiError, OpenAIError},
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ScoringError, ScoringResult};
use crate::models::{
    CompetencyEvaluation, CompletenessRequest, CompletenessVerdict, ThreadEvaluationRequest,
};

/// 外部评分服务
#[async_trait]
pub trait ScoringService: Send + Sync {
    /// 判断回答是否完整，必要时给出追问
    async fn check_completeness(
        &self,
        request: &CompletenessRequest,
    ) -> ScoringResult<CompletenessVerdict>;

    /// 对一个场景的整段问答按能力维度打分
    async fn evaluate_thread(
        &self,
        request: &ThreadEvaluationRequest,
    ) -> ScoringResult<CompetencyEvaluation>;
}

/// 基于 OpenAI 兼容接口的评分服务
pub struct OpenAiScoringService {
    client: Client<OpenAIConfig>,
    model_name: String,
    temperature: f32,
}

impl OpenAiScoringService {
    /// 创建新的评分服务
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            temperature: config.llm_temperature,
        }
    }

    /// 通用的 LLM 调用
    ///
    /// # 返回
    /// 返回去掉首尾空白的响应内容；内容为空视为 `Malformed`
    async fn send_to_llm(&self, user_message: &str, system_message: &str) -> ScoringResult<String> {
        debug!("调用评分服务，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_message)
            .build()
            .map_err(|e| ScoringError::InvalidRequest(e.to_string()))?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(|e| ScoringError::InvalidRequest(e.to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(self.temperature)
            .max_tokens(1024u32)
            .build()
            .map_err(|e| ScoringError::InvalidRequest(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("评分服务调用失败: {}", e);
            classify_openai_error(&e)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ScoringError::Malformed("评分服务返回内容为空".to_string()))?;

        debug!("评分服务调用成功");
        Ok(content)
    }
}

#[async_trait]
impl ScoringService for OpenAiScoringService {
    async fn check_completeness(
        &self,
        request: &CompletenessRequest,
    ) -> ScoringResult<CompletenessVerdict> {
        let prompt = build_completeness_prompt(request);
        let response = self.send_to_llm(&prompt, COMPLETENESS_SYSTEM_PROMPT).await?;
        parse_completeness_response(&response)
    }

    async fn evaluate_thread(
        &self,
        request: &ThreadEvaluationRequest,
    ) -> ScoringResult<CompetencyEvaluation> {
        let prompt = build_thread_prompt(request);
        let response = self.send_to_llm(&prompt, EVALUATION_SYSTEM_PROMPT).await?;
        parse_evaluation_response(&response, &request.competency)
    }
}

// ========== 提示词 ==========

const COMPLETENESS_SYSTEM_PROMPT: &str = "You review answers to situational judgement questions. \
You decide whether an answer addresses the scenario completely enough to be scored, and if not, \
you write one short follow-up question that asks only for what is missing. \
Respond with a single JSON object and nothing else.";

const EVALUATION_SYSTEM_PROMPT: &str = "You are an assessor scoring situational judgement answers \
against one named competency. Use the best and worst response rationales as anchors. \
Respond with a single JSON object and nothing else.";

fn build_completeness_prompt(request: &CompletenessRequest) -> String {
    let payload = serde_json::to_string_pretty(request).unwrap_or_default();
    format!(
        r#"Evaluate whether the candidate's answer is complete.

Input:
{}

Return JSON with exactly these keys:
{{
  "isComplete": true | false,
  "completionScore": number from 0 to 10,
  "missingAspects": [string],
  "followUpQuestion": string or null,
  "rationale": string
}}

Rules:
- This is follow-up {} of at most {} for question {}.
- If the answer is incomplete, "followUpQuestion" must be a single concise question.
- If the answer is complete, "followUpQuestion" must be null."#,
        payload,
        request.follow_up_count + 1,
        request.max_follow_ups,
        request.question_number
    )
}

fn build_thread_prompt(request: &ThreadEvaluationRequest) -> String {
    let payload = serde_json::to_string_pretty(request).unwrap_or_default();
    format!(
        r#"Score the candidate on the competency "{}" using the whole conversation below.
Turns flagged "isFollowUp" are follow-up questions about the same scenario.

Input:
{}

Return JSON with exactly these keys:
{{
  "score": number from 0 to 10,
  "rationale": string
}}"#,
        request.competency, payload
    )
}

// ========== 响应解析 ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCompleteness {
    is_complete: Option<bool>,
    completion_score: Option<f64>,
    #[serde(default)]
    missing_aspects: Vec<String>,
    follow_up_question: Option<String>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    score: Option<f64>,
    #[serde(default)]
    rationale: String,
}

/// 从模型输出中取出 JSON 对象（去掉代码块标记和前后说明文字）
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

pub fn parse_completeness_response(response: &str) -> ScoringResult<CompletenessVerdict> {
    let json = extract_json_object(response)
        .ok_or_else(|| ScoringError::Malformed(format!("未找到 JSON: {}", preview(response))))?;
    let raw: RawCompleteness = serde_json::from_str(json)
        .map_err(|e| ScoringError::Malformed(format!("JSON 解析失败: {}", e)))?;

    let is_complete = raw
        .is_complete
        .ok_or_else(|| ScoringError::Malformed("缺少 isComplete 字段".to_string()))?;
    let completion_score = raw.completion_score.unwrap_or(if is_complete { 7.0 } else { 4.0 });

    Ok(CompletenessVerdict {
        is_complete,
        completion_score,
        missing_aspects: raw.missing_aspects,
        follow_up_question: raw.follow_up_question,
        rationale: raw.rationale,
    })
}

pub fn parse_evaluation_response(
    response: &str,
    competency: &str,
) -> ScoringResult<CompetencyEvaluation> {
    let json = extract_json_object(response)
        .ok_or_else(|| ScoringError::Malformed(format!("未找到 JSON: {}", preview(response))))?;
    let raw: RawEvaluation = serde_json::from_str(json)
        .map_err(|e| ScoringError::Malformed(format!("JSON 解析失败: {}", e)))?;

    let score = raw
        .score
        .filter(|s| s.is_finite())
        .ok_or_else(|| ScoringError::Malformed("缺少有效的 score 字段".to_string()))?;

    Ok(CompetencyEvaluation {
        competency: competency.to_string(),
        score,
        rationale: raw.rationale,
    })
}

/// 只有紧跟在 status / http / code 之后的三位数才视为状态码
static STATUS_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:status(?:\s*code)?|http(?:\s*error)?|code)\s*[:=]?\s*(\d{3})\b")
        .expect("status code pattern")
});

/// 把客户端错误映射为评分错误
///
/// 优先使用 HTTP 状态码和 API 错误码，拿不到时才看错误文本。
fn classify_openai_error(error: &OpenAIError) -> ScoringError {
    match error {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                ScoringError::Timeout
            } else if let Some(status) = e.status() {
                ScoringError::from_status(status.as_u16(), e.to_string())
            } else {
                classify_error_message(&e.to_string())
            }
        }
        OpenAIError::ApiError(api) => classify_api_error(api),
        OpenAIError::InvalidArgument(message) => ScoringError::InvalidRequest(message.clone()),
        other => classify_error_message(&other.to_string()),
    }
}

/// 按 API 返回的错误码 / 错误类型分类
fn classify_api_error(api: &ApiError) -> ScoringError {
    let code = api.code.as_ref().map(|c| c.to_string()).unwrap_or_default();
    let kind = api.r#type.as_deref().unwrap_or_default();
    classify_api_code(&code, kind, &api.message)
}

/// # 参数
/// - `code`: API 错误码（如 `rate_limit_exceeded`）
/// - `kind`: API 错误类型（如 `server_error`）
/// - `message`: 错误描述，错误码无法识别时使用
pub fn classify_api_code(code: &str, kind: &str, message: &str) -> ScoringError {
    let tags = format!("{} {}", code, kind).to_lowercase();

    if tags.contains("insufficient_quota") || tags.contains("invalid") {
        ScoringError::Api(message.to_string())
    } else if tags.contains("rate_limit") {
        ScoringError::RateLimited { retry_after: None }
    } else if tags.contains("overloaded") {
        ScoringError::Overloaded(message.to_string())
    } else if tags.contains("timeout") {
        ScoringError::Timeout
    } else if tags.contains("service_unavailable") {
        ScoringError::Gateway { status: 503 }
    } else if tags.contains("server_error") {
        ScoringError::Gateway { status: 500 }
    } else {
        classify_error_message(message)
    }
}

/// 根据错误文本推断错误类别（没有结构化信息时的兜底）
pub fn classify_error_message(message: &str) -> ScoringError {
    let lower = message.to_lowercase();

    if lower.contains("overloaded") {
        ScoringError::Overloaded(message.to_string())
    } else if lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
    {
        ScoringError::RateLimited { retry_after: None }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ScoringError::Timeout
    } else if lower.contains("bad gateway") {
        ScoringError::Gateway { status: 502 }
    } else if lower.contains("service unavailable") {
        ScoringError::Gateway { status: 503 }
    } else if lower.contains("internal server error") {
        ScoringError::Gateway { status: 500 }
    } else if let Some(status) = STATUS_IN_TEXT
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
    {
        ScoringError::from_status(status, message)
    } else {
        ScoringError::Api(message.to_string())
    }
}

fn preview(text: &str) -> String {
    crate::utils::truncate_text(text, 80)
}
