// 飞书集成模块
// 提供多维表格的读取与结果回写

pub mod client;

pub use client::BitableClient;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::ConversationRecord;

/// 远程表格存储接口（认证与 token 刷新由实现内部处理）
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 读取指定视图中的全部记录
    async fn fetch(
        &self,
        app_token: &str,
        table_id: &str,
        view_id: &str,
    ) -> Result<Vec<ConversationRecord>>;

    /// 将一批记录写入目标表，一次调用对应一次写入尝试
    async fn write(
        &self,
        app_token: &str,
        table_id: &str,
        rows: &[Map<String, Value>],
    ) -> Result<()>;
}
