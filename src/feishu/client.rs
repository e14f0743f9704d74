// 飞书多维表格 API 客户端
// 负责获取 tenant_access_token、分页读取记录和批量写入结果

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::RecordStore;
use crate::models::{ConversationRecord, FIELD_NUMBER, FIELD_ROUND10, FIELD_ROUND5};
use crate::settings::FeishuAuth;

/// 单页读取条数
const PAGE_SIZE: u32 = 100;
/// token 提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
/// 字段名不存在
const CODE_FIELD_NAME_NOT_FOUND: i64 = 1254045;
/// token 缺失或无效
const TOKEN_INVALID_CODES: [i64; 2] = [99991661, 10014];

/// 通用响应外壳
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct ListRecordsData {
    #[serde(default)]
    items: Option<Vec<RecordItem>>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordItem {
    record_id: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// 多维表格客户端
pub struct BitableClient {
    client: Client,
    base_url: String,
    auth: FeishuAuth,
    token_cache: RwLock<Option<CachedToken>>,
}

impl BitableClient {
    /// 创建新的客户端（接受共享的HTTP客户端）
    pub fn new(client: Client, base_url: &str, auth: FeishuAuth) -> Result<Self> {
        if auth.app_credentials.is_none() && auth.bearer_token.is_none() {
            return Err(anyhow!("飞书认证未配置"));
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            token_cache: RwLock::new(None),
        })
    }

    /// 获取访问 token：优先使用应用凭证换取的 tenant_access_token，失败时回退到静态 Bearer Token
    async fn access_token(&self) -> Result<String> {
        if let Some((app_id, app_secret)) = &self.auth.app_credentials {
            if let Some(cached) = self.token_cache.read().await.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }

            let mut cache = self.token_cache.write().await;
            // 可能已被其他批次刷新
            if let Some(cached) = cache.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }

            match self.request_tenant_token(app_id, app_secret).await {
                Ok((token, expire)) => {
                    let ttl = Duration::from_secs(expire).saturating_sub(TOKEN_REFRESH_MARGIN);
                    *cache = Some(CachedToken {
                        token: token.clone(),
                        expires_at: Instant::now() + ttl,
                    });
                    info!("已获取 tenant_access_token (有效期 {} 秒)", expire);
                    return Ok(token);
                }
                Err(e) => {
                    warn!("获取 tenant_access_token 失败，尝试使用 Bearer Token: {:#}", e);
                }
            }
        }

        self.auth
            .bearer_token
            .clone()
            .ok_or_else(|| anyhow!("飞书认证失败: 无法获取 tenant_access_token 且未配置 Bearer Token"))
    }

    async fn request_tenant_token(&self, app_id: &str, app_secret: &str) -> Result<(String, u64)> {
        let url = format!("{}/auth/v3/tenant_access_token/internal", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "app_id": app_id, "app_secret": app_secret }))
            .send()
            .await
            .context("请求 tenant_access_token 失败")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("获取 tenant_access_token HTTP {}: {}", status, body));
        }

        let parsed: TenantTokenResponse =
            serde_json::from_str(&body).with_context(|| format!("无法解析 token 响应: {}", body))?;
        if parsed.code != 0 {
            return Err(anyhow!(
                "获取 tenant_access_token 失败, code: {}, msg: {}",
                parsed.code,
                parsed.msg
            ));
        }

        let token = parsed
            .tenant_access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("token 响应中缺少 tenant_access_token"))?;
        Ok((token, parsed.expire))
    }

    /// 分页读取视图中的全部记录
    pub async fn list_records(
        &self,
        app_token: &str,
        table_id: &str,
        view_id: &str,
    ) -> Result<Vec<ConversationRecord>> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/bitable/v1/apps/{}/tables/{}/records",
            self.base_url, app_token, table_id
        );
        let field_names = json!([FIELD_NUMBER, FIELD_ROUND5, FIELD_ROUND10]).to_string();

        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("view_id", view_id.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
                ("user_id_type", "open_id".to_string()),
                ("field_names", field_names.clone()),
            ];
            if let Some(pt) = &page_token {
                query.push(("page_token", pt.clone()));
            }

            info!(
                "读取多维表格: App={}, Table={}, View={}, PageToken={:?}",
                app_token, table_id, view_id, page_token
            );

            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .query(&query)
                .send()
                .await
                .context("读取多维表格请求失败")?;

            let status = response.status();
            let body = response.text().await?;
            let parsed: ApiResponse<ListRecordsData> = serde_json::from_str(&body)
                .with_context(|| format!("无法解析读取响应 (HTTP {}): {}", status, body))?;

            if parsed.code != 0 {
                if TOKEN_INVALID_CODES.contains(&parsed.code) {
                    error!("飞书 API 错误: 访问 token 缺失或无效");
                }
                return Err(anyhow!(
                    "读取多维表格失败, code: {}, msg: {}",
                    parsed.code,
                    parsed.msg
                ));
            }

            let data = parsed.data.unwrap_or(ListRecordsData {
                items: None,
                has_more: false,
                page_token: None,
            });
            let items = data.items.unwrap_or_default();
            let fetched = items.len();
            records.extend(
                items
                    .into_iter()
                    .map(|item| ConversationRecord::from_fields(item.record_id, item.fields)),
            );
            info!("本页读取 {} 条，累计 {} 条", fetched, records.len());

            match data.page_token {
                Some(next) if data.has_more && !next.is_empty() => page_token = Some(next),
                _ => {
                    debug!("没有更多分页");
                    break;
                }
            }
        }

        Ok(records)
    }

    /// 批量写入记录
    pub async fn batch_create(
        &self,
        app_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Result<()> {
        if rows.is_empty() {
            warn!("没有需要写入多维表格的记录");
            return Ok(());
        }

        let token = self.access_token().await?;
        let url = format!(
            "{}/bitable/v1/apps/{}/tables/{}/records/batch_create",
            self.base_url, app_token, table_id
        );
        let payload = json!({
            "records": rows.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>()
        });

        info!(
            "写入 {} 条记录到多维表格: App={}, Table={}",
            rows.len(),
            app_token,
            table_id
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("写入多维表格请求失败")?;

        let status = response.status();
        let body = response.text().await?;
        let parsed: ApiResponse<Value> = serde_json::from_str(&body)
            .with_context(|| format!("无法解析写入响应 (HTTP {}): {}", status, body))?;

        if parsed.code != 0 {
            if parsed.code == CODE_FIELD_NAME_NOT_FOUND {
                let names: BTreeSet<&str> = rows
                    .iter()
                    .flat_map(|fields| fields.keys().map(String::as_str))
                    .collect();
                error!(
                    "目标表中不存在部分字段 (FieldNameNotFound)，本批尝试写入的字段: {:?}",
                    names
                );
            }
            return Err(anyhow!(
                "写入多维表格失败, code: {}, msg: {}",
                parsed.code,
                parsed.msg
            ));
        }

        info!("成功写入 {} 条记录", rows.len());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for BitableClient {
    async fn fetch(
        &self,
        app_token: &str,
        table_id: &str,
        view_id: &str,
    ) -> Result<Vec<ConversationRecord>> {
        self.list_records(app_token, table_id, view_id).await
    }

    async fn write(
        &self,
        app_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Result<()> {
        self.batch_create(app_token, table_id, rows).await
    }
}
