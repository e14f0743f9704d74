// LLM模块 - 按配置选择对话分析器

pub mod deepseek;
pub mod gemini;
pub mod plugin;
pub mod prompt;

pub use deepseek::DeepSeekAnalyzer;
pub use gemini::GeminiAnalyzer;
pub use plugin::{parse_model_json, AnalyzerError, DialogueAnalyzer};
pub use prompt::{PromptTemplate, TRANSACTION_PLACEHOLDER};

use crate::settings::{AppConfig, ProviderKind};
use std::sync::Arc;
use tracing::info;

/// 根据配置创建分析器（启动时选择一次）
pub fn build_analyzer(config: &AppConfig, client: reqwest::Client) -> Arc<dyn DialogueAnalyzer> {
    let analyzer: Arc<dyn DialogueAnalyzer> = match &config.provider {
        ProviderKind::Gemini(gemini) => Arc::new(GeminiAnalyzer::new(client, gemini)),
        ProviderKind::DeepSeek(deepseek) => Arc::new(DeepSeekAnalyzer::new(client, deepseek)),
    };

    info!(
        "已选择 LLM 提供商: {} (model={})",
        analyzer.name(),
        analyzer.model()
    );
    analyzer
}
