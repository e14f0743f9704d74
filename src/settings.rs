// 配置加载 - 启动时从环境变量构建并校验配置，之后只读传递

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 多维表格单次批量写入的上限
pub const MAX_BATCH_SIZE: usize = 500;

fn default_batch_size() -> usize {
    10
}

fn default_max_workers() -> usize {
    4
}

fn default_gemini_model() -> String {
    "gemini-2.5-pro-preview-03-25".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_deepseek_model() -> String {
    "deepseek-chat".to_string()
}

fn default_deepseek_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_feishu_base_url() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

/// 配置错误（启动阶段即终止）
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("缺少必需的环境变量: {0}")]
    Missing(&'static str),

    #[error("环境变量 {name} 的值无效: {value} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("未知的模型提供商: {0}（可选 gemini | deepseek | openai）")]
    UnknownProvider(String),

    #[error("读取 .env 文件失败: {0}")]
    EnvFile(String),

    #[error("飞书认证未配置: 需要 FEISHU_APP_ID + FEISHU_APP_SECRET 或 FEISHU_BEARER_TOKEN")]
    MissingFeishuAuth,
}

/// Gemini配置
#[derive(Debug, Clone, PartialEq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// DeepSeek配置（OpenAI 兼容接口）
#[derive(Debug, Clone, PartialEq)]
pub struct DeepSeekConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// 选中的模型提供商
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderKind {
    Gemini(GeminiConfig),
    DeepSeek(DeepSeekConfig),
}

/// 飞书认证方式
#[derive(Debug, Clone, PartialEq)]
pub struct FeishuAuth {
    /// 应用凭证（用于获取 tenant_access_token）
    pub app_credentials: Option<(String, String)>,
    /// 静态 Bearer Token（备用）
    pub bearer_token: Option<String>,
}

/// 飞书多维表格配置
#[derive(Debug, Clone, PartialEq)]
pub struct FeishuConfig {
    pub base_url: String,
    pub auth: FeishuAuth,
    /// 源表
    pub app_token: String,
    pub table_id: String,
    pub view_id: String,
    /// 目标表
    pub target_app_token: String,
    pub target_table_id: String,
}

/// 应用配置
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub provider: ProviderKind,
    pub feishu: FeishuConfig,
    /// 每批记录数
    pub batch_size: usize,
    /// 并发批次数
    pub max_workers: usize,
    /// 系统提示词文件
    pub prompt_file: PathBuf,
    /// 本地输出文件（JSON Lines）
    pub output_file: PathBuf,
    /// HTTP 请求超时
    pub http_timeout: Duration,
    /// 日志目录（为空时使用平台默认目录）
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// 从进程环境变量加载（先尝试读取 .env）
    pub fn from_env() -> Result<Self, ConfigError> {
        check_env_file(dotenvy::dotenv())?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载，空白值视为未设置
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let provider_name = get("MODEL_PROVIDER").unwrap_or_else(|| "deepseek".to_string());
        let provider = match provider_name.to_lowercase().as_str() {
            "gemini" => ProviderKind::Gemini(GeminiConfig {
                api_key: require("GOOGLE_API_KEY")?,
                model: get("GEMINI_MODEL").unwrap_or_else(default_gemini_model),
                base_url: get("GEMINI_BASE_URL").unwrap_or_else(default_gemini_base_url),
            }),
            // "openai" 是 DeepSeek 的别名（因为使用 OpenAI 兼容接口）
            "deepseek" | "openai" => ProviderKind::DeepSeek(DeepSeekConfig {
                api_key: require("DEEPSEEK_API_KEY")?,
                model: get("DEEPSEEK_MODEL").unwrap_or_else(default_deepseek_model),
                base_url: get("DEEPSEEK_BASE_URL").unwrap_or_else(default_deepseek_base_url),
            }),
            _ => return Err(ConfigError::UnknownProvider(provider_name)),
        };

        let app_credentials = match (get("FEISHU_APP_ID"), get("FEISHU_APP_SECRET")) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        };
        let bearer_token = get("FEISHU_BEARER_TOKEN");
        if app_credentials.is_none() && bearer_token.is_none() {
            return Err(ConfigError::MissingFeishuAuth);
        }

        let app_token = require("FEISHU_APP_TOKEN")?;
        let feishu = FeishuConfig {
            base_url: get("FEISHU_BASE_URL").unwrap_or_else(default_feishu_base_url),
            auth: FeishuAuth {
                app_credentials,
                bearer_token,
            },
            table_id: require("FEISHU_TABLE_ID")?,
            view_id: require("FEISHU_VIEW_ID")?,
            target_app_token: get("FEISHU_TARGET_APP_TOKEN").unwrap_or_else(|| app_token.clone()),
            target_table_id: require("FEISHU_TARGET_TABLE_ID")?,
            app_token,
        };

        let batch_size = parse_number(&get, "BATCH_SIZE", default_batch_size())?;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                value: batch_size.to_string(),
                reason: format!("必须在 1..={} 之间", MAX_BATCH_SIZE),
            });
        }

        let max_workers = parse_number(&get, "MAX_WORKERS", default_max_workers())?;
        if max_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_WORKERS",
                value: "0".to_string(),
                reason: "至少为 1".to_string(),
            });
        }

        let http_timeout = Duration::from_secs(parse_number(&get, "HTTP_TIMEOUT_SECS", 300)?);

        Ok(Self {
            provider,
            feishu,
            batch_size,
            max_workers,
            prompt_file: get("PROMPT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("prompts/system_prompt.txt")),
            output_file: get("OUTPUT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output/analysis_results.jsonl")),
            http_timeout,
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }

    /// 提供商名称（用于日志）
    pub fn provider_name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Gemini(_) => "gemini",
            ProviderKind::DeepSeek(_) => "deepseek",
        }
    }
}

/// 没有 .env 文件不算错误，格式错误或无法读取则报告
fn check_env_file<T>(loaded: Result<T, dotenvy::Error>) -> Result<(), ConfigError> {
    match loaded {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(ConfigError::EnvFile(e.to_string())),
    }
}

fn parse_number<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
