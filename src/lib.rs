// 对话分析器 - 从飞书多维表格读取对话，调用 LLM 分析后批量回写

pub mod analysis;
pub mod feishu;
pub mod llm;
pub mod logger;
pub mod models;
pub mod settings;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use analysis::{BatchOrchestrator, LocalOutput, WriteTarget};
use feishu::{BitableClient, RecordStore};
use llm::PromptTemplate;
use models::RunSummary;
use settings::AppConfig;

/// 每个主机保留的空闲连接数
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// 创建共享的 HTTP 客户端
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .context("创建 HTTP 客户端失败")
}

/// 按已校验的配置执行一次完整的分析流程
pub async fn run_with_config(config: &AppConfig) -> Result<RunSummary> {
    let run_id = uuid::Uuid::new_v4().to_string();
    info!(
        "运行开始 run_id={}, 提供商={}, 批大小={}, 并发={}",
        run_id,
        config.provider_name(),
        config.batch_size,
        config.max_workers
    );

    let template = PromptTemplate::load(&config.prompt_file)?;
    let output = Arc::new(LocalOutput::open(&config.output_file, &run_id).await?);
    info!("本地结果文件: {}", output.path().display());

    let client = build_http_client(config.http_timeout)?;
    let store: Arc<dyn RecordStore> = Arc::new(BitableClient::new(
        client.clone(),
        &config.feishu.base_url,
        config.feishu.auth.clone(),
    )?);
    let analyzer = llm::build_analyzer(config, client);

    let feishu = &config.feishu;
    let records = store
        .fetch(&feishu.app_token, &feishu.table_id, &feishu.view_id)
        .await
        .context("读取源数据失败")?;
    info!("共读取 {} 条记录", records.len());

    let orchestrator = BatchOrchestrator::new(
        analyzer,
        store,
        output,
        template,
        WriteTarget {
            app_token: feishu.target_app_token.clone(),
            table_id: feishu.target_table_id.clone(),
        },
        config.batch_size,
        config.max_workers,
    );

    let summary = orchestrator.run(records).await;
    info!("运行结束 run_id={}", run_id);
    Ok(summary)
}

/// 程序入口：读取配置、初始化日志并执行
///
/// 配置错误发生在日志初始化之前，只输出到 stderr。
pub async fn run() -> Result<RunSummary> {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置错误: {}", e);
            return Err(e.into());
        }
    };

    let _guard = logger::init(config.log_dir.as_deref())?;

    match run_with_config(&config).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            error!("运行失败: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use settings::{DeepSeekConfig, FeishuAuth, FeishuConfig, ProviderKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, dir: &std::path::Path) -> AppConfig {
        let prompt_file = dir.join("prompt.txt");
        std::fs::write(&prompt_file, "分析以下对话：{{TRANSACTION}}").unwrap();

        AppConfig {
            provider: ProviderKind::DeepSeek(DeepSeekConfig {
                api_key: "sk-test".to_string(),
                model: "deepseek-chat".to_string(),
                base_url: server.uri(),
            }),
            feishu: FeishuConfig {
                base_url: server.uri(),
                auth: FeishuAuth {
                    app_credentials: None,
                    bearer_token: Some("static".to_string()),
                },
                app_token: "src_app".to_string(),
                table_id: "src_tbl".to_string(),
                view_id: "vew".to_string(),
                target_app_token: "dst_app".to_string(),
                target_table_id: "dst_tbl".to_string(),
            },
            batch_size: 2,
            max_workers: 2,
            prompt_file,
            output_file: dir.join("out").join("results.jsonl"),
            http_timeout: Duration::from_secs(5),
            log_dir: None,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/bitable/v1/apps/src_app/tables/src_tbl/records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "msg": "success",
                "data": {
                    "has_more": false,
                    "items": [
                        {"record_id": "r1", "fields": {"编号": "1", "round5": "你好"}},
                        {"record_id": "r2", "fields": {"编号": "2", "round5": "退款"}},
                        {"record_id": "r3", "fields": {"编号": "3", "round5": "投诉"}}
                    ]
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "```json\n{\"意图\": \"咨询\"}\n```"},
                    "finish_reason": "stop"
                }]
            })))
            .expect(3)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/bitable/v1/apps/dst_app/tables/dst_tbl/records/batch_create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "msg": "success",
                "data": {"records": []}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let config = config(&server, dir.path());
        let summary = run_with_config(&config).await.unwrap();

        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.total_batches, 2);
        assert_eq!(summary.succeeded_batches, 2);
        assert_eq!(summary.analysis_failures, 0);

        let content = std::fs::read_to_string(&config.output_file).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/bitable/v1/apps/src_app/tables/src_tbl/records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 91402,
                "msg": "NOTEXIST"
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let config = config(&server, dir.path());
        assert!(run_with_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_prompt_placeholder_is_fatal() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let config = config(&server, dir.path());
        std::fs::write(&config.prompt_file, "没有占位符").unwrap();

        assert!(run_with_config(&config).await.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
