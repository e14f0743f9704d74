// Google Gemini 提供商实现 - 使用 generateContent REST 接口

use super::plugin::*;
use super::prompt::PromptTemplate;
use crate::models::ConversationRecord;
use crate::settings::GeminiConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Gemini提供商
pub struct GeminiAnalyzer {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiAnalyzer {
    /// 创建分析器（接受共享的HTTP客户端以复用连接池）
    pub fn new(client: Client, config: &GeminiConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }

    /// 调用 generateContent，返回拼接后的模型文本
    async fn generate_content(&self, prompt: String) -> Result<String, AnalyzerError> {
        let endpoint = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request_body = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": prompt}]
                }
            ],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens
            }
        });

        debug!("调用Gemini API: model={}", self.model);

        let response = self
            .client
            .post(&endpoint)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("Gemini API错误 ({}): {}", status, error_text);
            return Err(AnalyzerError::Api {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let response_text = response.text().await?;
        let response_data: GenerateContentResponse = serde_json::from_str(&response_text)
            .map_err(|e| AnalyzerError::Parse {
                message: format!("响应结构不符合预期: {}", e),
                raw_response: response_text.clone(),
            })?;

        let candidate = response_data
            .candidates
            .into_iter()
            .next()
            .ok_or(AnalyzerError::EmptyResponse)?;

        if candidate.finish_reason.as_deref() == Some("MAX_TOKENS") {
            warn!("Gemini 响应因达到 token 限制而被截断 (finishReason=MAX_TOKENS)");
        }

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AnalyzerError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl DialogueAnalyzer for GeminiAnalyzer {
    async fn analyze(
        &self,
        record: &ConversationRecord,
        template: &PromptTemplate,
    ) -> Result<Value, AnalyzerError> {
        let prompt = template.render(&record.to_prompt_json());

        info!("发送分析请求到 Gemini: 编号={}", record.number);
        let text = self.generate_content(prompt).await?;
        parse_model_json(&text)
    }

    fn name(&self) -> &str {
        "Gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// generateContent 响应结构
#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn analyzer(base_url: &str) -> GeminiAnalyzer {
        let config = GeminiConfig {
            api_key: "g-key".to_string(),
            model: "gemini-test".to_string(),
            base_url: base_url.to_string(),
        };
        GeminiAnalyzer::new(Client::new(), &config)
    }

    fn record() -> ConversationRecord {
        let mut fields = Map::new();
        fields.insert("编号".to_string(), json!(3));
        ConversationRecord::from_fields(None, fields)
    }

    #[tokio::test]
    async fn test_analyze_joins_parts_and_strips_fence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{"text": "```json\n{\"情绪\": "}, {"text": "\"平稳\"}\n```"}]
                    },
                    "finishReason": "STOP"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let template = PromptTemplate::new("{{TRANSACTION}}").unwrap();
        let value = analyzer(&server.uri())
            .analyze(&record(), &template)
            .await
            .unwrap();

        assert_eq!(value, json!({"情绪": "平稳"}));

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("\"编号\":\"3\""));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[tokio::test]
    async fn test_analyze_without_candidates_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let template = PromptTemplate::new("{{TRANSACTION}}").unwrap();
        let err = analyzer(&server.uri())
            .analyze(&record(), &template)
            .await
            .unwrap_err();

        assert!(matches!(err, AnalyzerError::EmptyResponse));
    }
}
