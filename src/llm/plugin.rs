// LLM插件系统 - 定义分析器接口和模型输出解析

use async_trait::async_trait;
use llm_json::{loads, repair_json, RepairOptions};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

use super::prompt::PromptTemplate;
use crate::models::ConversationRecord;

/// 分析器错误
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("API 请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API 返回错误状态 {status}: {body}")]
    Api { status: u16, body: String },

    #[error("模型返回空结果")]
    EmptyResponse,

    #[error("无法解析模型返回的 JSON: {message}")]
    Parse {
        message: String,
        raw_response: String,
    },
}

impl AnalyzerError {
    /// 解析失败时保留的原始响应
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Self::Parse { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }
}

/// 对话分析器接口（每个模型提供商一个实现）
#[async_trait]
pub trait DialogueAnalyzer: Send + Sync {
    /// 分析单条对话记录
    ///
    /// # 参数
    /// * `record` - 对话记录
    /// * `template` - 系统提示词模板
    ///
    /// # 返回
    /// * 模型输出的结构化 JSON（对象或数组）
    async fn analyze(
        &self,
        record: &ConversationRecord,
        template: &PromptTemplate,
    ) -> Result<Value, AnalyzerError>;

    /// 获取提供商名称
    fn name(&self) -> &str;

    /// 当前使用的模型
    fn model(&self) -> &str;
}

fn fenced_json_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("fenced json regex is valid")
    })
}

fn fenced_block(raw: &str) -> Option<&str> {
    fenced_json_regex()
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str().trim())
}

/// 从第一个 `open` 到最后一个 `close` 的片段
fn span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// 严格解析：整段、对象片段、数组片段中取能解析为容器的最长者
///
/// 最长者包含其余候选，例如 `[{..}]` 取数组，`注意[1]：{..}` 取对象。
fn parse_strict(text: &str) -> Option<Value> {
    [Some(text), span(text, '{', '}'), span(text, '[', ']')]
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            serde_json::from_str::<Value>(candidate)
                .ok()
                .filter(|v| v.is_object() || v.is_array())
                .map(|v| (candidate.len(), v))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, value)| value)
}

/// 需要修复时的候选片段
///
/// 优先从第一个 `{` 开始；只有紧跟 `{` 的 `[` 出现在前面时才按数组处理，
/// 这样 `[分析结果] {..` 这类前缀不会被当成结果。缺少结尾时取到文本末尾。
fn repair_candidate(text: &str) -> &str {
    let object = text.find('{');
    let array = text.find('[');

    let start = match (object, array) {
        (Some(o), Some(a)) if a < o && text[a + 1..].trim_start().starts_with('{') => a,
        (Some(o), _) => o,
        (None, Some(a)) => a,
        (None, None) => return text,
    };

    let close = if text[start..].starts_with('[') { ']' } else { '}' };
    match text.rfind(close) {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    }
}

fn repair_value(text: &str, raw: &str) -> Result<Value, AnalyzerError> {
    let candidate = repair_candidate(text);
    debug!("直接解析失败，尝试修复 JSON 片段 ({} 字节)", candidate.len());
    let repaired =
        repair_json(candidate, &RepairOptions::default()).map_err(|e| AnalyzerError::Parse {
            message: format!("无法修复 JSON: {}", e),
            raw_response: raw.to_string(),
        })?;
    loads(&repaired, &RepairOptions::default()).map_err(|e| AnalyzerError::Parse {
        message: format!("解析修复后的 JSON 失败: {}", e),
        raw_response: raw.to_string(),
    })
}

/// 解析模型输出为结构化 JSON
///
/// 优先取 ```json 代码块，先严格解析，失败后再用 llm_json 修复。
/// 结果必须是对象或数组，标量视为解析失败。
pub fn parse_model_json(raw: &str) -> Result<Value, AnalyzerError> {
    let text = fenced_block(raw).unwrap_or_else(|| raw.trim());
    if text.is_empty() {
        return Err(AnalyzerError::EmptyResponse);
    }

    let value = match parse_strict(text) {
        Some(value) => value,
        None => match serde_json::from_str::<Value>(text) {
            // 合法但不是容器的 JSON（如纯数字）无需修复
            Ok(scalar) => scalar,
            Err(_) => repair_value(text, raw)?,
        },
    };

    match value {
        Value::Object(_) | Value::Array(_) => Ok(value),
        other => {
            warn!("模型返回的 JSON 不是对象或数组: {}", other);
            Err(AnalyzerError::Parse {
                message: "LLM response is not a JSON object or array".to_string(),
                raw_response: raw.to_string(),
            })
        }
    }
}
