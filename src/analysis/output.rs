//! 本地结果输出
//!
//! 以 JSON Lines 追加写入分析结果，多个批次共享同一个文件句柄，
//! 每个批次在一次加锁内写完自己的全部行。

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::AnalysisResult;

#[derive(Serialize)]
struct OutputLine<'a> {
    run_id: &'a str,
    batch_index: usize,
    #[serde(flatten)]
    result: &'a AnalysisResult,
}

/// 追加写入的本地输出文件
pub struct LocalOutput {
    path: PathBuf,
    run_id: String,
    file: Mutex<File>,
}

impl LocalOutput {
    /// 打开（必要时创建）输出文件
    pub async fn open(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建输出目录失败: {}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("打开输出文件失败: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一个批次的结果，每条结果一行
    pub async fn append(&self, batch_index: usize, results: &[AnalysisResult]) -> Result<()> {
        let mut buffer = String::new();
        for result in results {
            let line = OutputLine {
                run_id: &self.run_id,
                batch_index,
                result,
            };
            buffer.push_str(&serde_json::to_string(&line)?);
            buffer.push('\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(buffer.as_bytes())
            .await
            .with_context(|| format!("写入输出文件失败: {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConversationRecord;
    use serde_json::{json, Map, Value};

    fn record(number: &str) -> ConversationRecord {
        let mut fields = Map::new();
        fields.insert("编号".to_string(), json!(number));
        ConversationRecord::from_fields(None, fields)
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let output = LocalOutput::open(&path, "run-1").await.unwrap();

        output
            .append(
                0,
                &[
                    AnalysisResult::success(&record("1"), json!({"意图": "咨询"})),
                    AnalysisResult::failed(&record("2"), "超时", None),
                ],
            )
            .await
            .unwrap();
        output
            .append(1, &[AnalysisResult::success(&record("3"), json!([]))])
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[0]["analysis"]["意图"], "咨询");
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[1]["error"], "超时");
        assert_eq!(lines[2]["batch_index"], 1);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        for run in ["a", "b"] {
            let output = LocalOutput::open(&path, run).await.unwrap();
            output
                .append(0, &[AnalysisResult::success(&record("1"), json!({}))])
                .await
                .unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
