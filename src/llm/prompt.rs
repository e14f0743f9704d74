// 提示词模板 - 从文件加载系统提示词，并替换对话占位符

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// 对话内容占位符
pub const TRANSACTION_PLACEHOLDER: &str = "{{TRANSACTION}}";

/// 系统提示词模板
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// 由文本创建模板，模板中必须包含占位符
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if !text.contains(TRANSACTION_PLACEHOLDER) {
            return Err(anyhow!("提示词模板缺少占位符 {}", TRANSACTION_PLACEHOLDER));
        }
        Ok(Self { text })
    }

    /// 从文件加载模板
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取提示词文件失败: {}", path.display()))?;
        Self::new(text)
    }

    /// 用序列化后的对话替换占位符
    pub fn render(&self, transaction: &str) -> String {
        self.text.replace(TRANSACTION_PLACEHOLDER, transaction)
    }
}
