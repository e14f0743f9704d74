// DeepSeek 提供商实现 - 使用 OpenAI 兼容的 chat/completions 接口

use super::plugin::*;
use super::prompt::PromptTemplate;
use crate::models::ConversationRecord;
use crate::settings::DeepSeekConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// 固定的用户消息，主要信息已在系统提示词中
const USER_INSTRUCTION: &str = "请根据系统提示中的信息进行分析并按要求格式输出。";

/// DeepSeek提供商（同样适用于其他 OpenAI 兼容服务）
pub struct DeepSeekAnalyzer {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

impl DeepSeekAnalyzer {
    /// 创建分析器（接受共享的HTTP客户端以复用连接池）
    pub fn new(client: Client, config: &DeepSeekConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    fn build_request_body(&self, system_prompt: String) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": USER_INSTRUCTION}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        })
    }

    /// 调用 chat/completions，返回模型文本
    async fn call_chat_api(&self, system_prompt: String) -> Result<String, AnalyzerError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let request_body = self.build_request_body(system_prompt);

        debug!("调用DeepSeek API: model={}, endpoint={}", self.model, endpoint);

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("DeepSeek API错误 ({}): {}", status, error_text);
            return Err(AnalyzerError::Api {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let response_text = response.text().await?;
        let response_data: ChatResponse =
            serde_json::from_str(&response_text).map_err(|e| AnalyzerError::Parse {
                message: format!("响应结构不符合预期: {}", e),
                raw_response: response_text.clone(),
            })?;

        let choice = response_data
            .choices
            .into_iter()
            .next()
            .ok_or(AnalyzerError::EmptyResponse)?;

        if choice.finish_reason.as_deref() == Some("length") {
            warn!("LLM 响应因达到 token 限制而被截断 (finish_reason=length)");
        }

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(AnalyzerError::EmptyResponse),
        }
    }
}

#[async_trait]
impl DialogueAnalyzer for DeepSeekAnalyzer {
    async fn analyze(
        &self,
        record: &ConversationRecord,
        template: &PromptTemplate,
    ) -> Result<Value, AnalyzerError> {
        let system_prompt = template.render(&record.to_prompt_json());

        info!("发送分析请求到 DeepSeek: 编号={}", record.number);
        let content = self.call_chat_api(system_prompt).await?;
        let value = parse_model_json(&content)?;
        debug!("DeepSeek 返回解析成功: 编号={}", record.number);
        Ok(value)
    }

    fn name(&self) -> &str {
        "DeepSeek"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// chat/completions 响应结构
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>, // 完成原因：stop, length, etc
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
