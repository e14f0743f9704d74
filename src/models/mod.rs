// 数据模型模块 - 定义对话记录、分析结果和批次统计

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// 编号列名
pub const FIELD_NUMBER: &str = "编号";
/// 第5轮对话列名
pub const FIELD_ROUND5: &str = "round5";
/// 第10轮对话列名
pub const FIELD_ROUND10: &str = "round10";

/// 对话记录（从多维表格读取，读取后不再修改）
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    /// 多维表格中的记录ID
    pub record_id: Option<String>,
    /// 编号
    pub number: String,
    /// 第5轮对话片段
    pub round5: String,
    /// 第10轮对话片段
    pub round10: String,
    /// 其他透传列
    pub extra: Map<String, Value>,
}

impl ConversationRecord {
    /// 由多维表格的 fields 构建记录
    pub fn from_fields(record_id: Option<String>, mut fields: Map<String, Value>) -> Self {
        let number = fields
            .remove(FIELD_NUMBER)
            .map(|v| cell_to_text(&v))
            .unwrap_or_default();
        let round5 = fields
            .remove(FIELD_ROUND5)
            .map(|v| cell_to_text(&v))
            .unwrap_or_default();
        let round10 = fields
            .remove(FIELD_ROUND10)
            .map(|v| cell_to_text(&v))
            .unwrap_or_default();

        Self {
            record_id,
            number,
            round5,
            round10,
            extra: fields,
        }
    }

    /// 序列化为提示词中使用的 JSON（列名 -> 值）
    pub fn to_prompt_json(&self) -> String {
        let mut map = Map::new();
        map.insert(FIELD_NUMBER.to_string(), Value::String(self.number.clone()));
        map.insert(FIELD_ROUND5.to_string(), Value::String(self.round5.clone()));
        map.insert(FIELD_ROUND10.to_string(), Value::String(self.round10.clone()));
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map).to_string()
    }
}

/// 将多维表格单元格的值归一化为文本
///
/// 文本列可能返回字符串，也可能返回富文本片段数组
/// `[{"type": "text", "text": "..."}]`，这里统一拼接成字符串。
pub fn cell_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map
                    .get("text")
                    .map(cell_to_text)
                    .unwrap_or_else(|| item.to_string()),
                other => cell_to_text(other),
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Object(map) => match map.get("text") {
            Some(text) => cell_to_text(text),
            None => value.to_string(),
        },
    }
}

/// 单条记录的分析结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    /// 分析成功，携带模型返回的结构化 JSON
    Success { analysis: Value },
    /// 分析失败，携带错误信息
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_response: Option<String>,
    },
}

/// 分析结果（每条对话记录恰好产生一条）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    /// 编号
    pub number: String,
    /// 源记录ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// 分析完成时间
    pub analyzed_at: DateTime<Local>,
    #[serde(flatten)]
    pub outcome: AnalysisOutcome,
}

impl AnalysisResult {
    pub fn success(record: &ConversationRecord, analysis: Value) -> Self {
        Self {
            number: record.number.clone(),
            record_id: record.record_id.clone(),
            analyzed_at: Local::now(),
            outcome: AnalysisOutcome::Success { analysis },
        }
    }

    pub fn failed(
        record: &ConversationRecord,
        error: impl Into<String>,
        raw_response: Option<String>,
    ) -> Self {
        Self {
            number: record.number.clone(),
            record_id: record.record_id.clone(),
            analyzed_at: Local::now(),
            outcome: AnalysisOutcome::Failed {
                error: error.into(),
                raw_response,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AnalysisOutcome::Success { .. })
    }

    /// 转换为写入多维表格的一行 fields
    ///
    /// 对象结果展开为列，嵌套值编码为 JSON 字符串；
    /// 非对象结果整体写入 `analysis` 列；失败结果写入 `error` 列。
    pub fn to_table_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(FIELD_NUMBER.to_string(), Value::String(self.number.clone()));

        match &self.outcome {
            AnalysisOutcome::Success {
                analysis: Value::Object(map),
            } => {
                for (key, value) in map {
                    if key == FIELD_NUMBER {
                        continue;
                    }
                    fields.insert(key.clone(), flatten_cell(value));
                }
            }
            AnalysisOutcome::Success { analysis } => {
                fields.insert("analysis".to_string(), Value::String(analysis.to_string()));
            }
            AnalysisOutcome::Failed {
                error,
                raw_response,
            } => {
                fields.insert("error".to_string(), Value::String(error.clone()));
                if let Some(raw) = raw_response {
                    fields.insert("raw_response".to_string(), Value::String(raw.clone()));
                }
            }
        }

        fields
    }
}

fn flatten_cell(value: &Value) -> Value {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => value.clone(),
        other => Value::String(other.to_string()),
    }
}

/// 单个批次的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 批次序号（从0开始）
    pub index: usize,
    /// 批次内记录数
    pub records: usize,
    /// 分析失败的记录数
    pub analysis_failures: usize,
    /// 远程写入是否成功（批次成功的唯一依据）
    pub remote_written: bool,
    /// 本地追加是否成功
    pub local_written: bool,
    /// 远程写入失败原因
    pub remote_error: Option<String>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.remote_written
    }
}

/// 整次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_records: usize,
    pub total_batches: usize,
    pub succeeded_batches: usize,
    pub failed_batches: usize,
    pub analysis_failures: usize,
    pub local_write_failures: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    /// 汇总各批次结果
    pub fn tally(total_records: usize, outcomes: &[BatchOutcome], elapsed: Duration) -> Self {
        let succeeded_batches = outcomes.iter().filter(|o| o.succeeded()).count();
        Self {
            total_records,
            total_batches: outcomes.len(),
            succeeded_batches,
            failed_batches: outcomes.len() - succeeded_batches,
            analysis_failures: outcomes.iter().map(|o| o.analysis_failures).sum(),
            local_write_failures: outcomes.iter().filter(|o| !o.local_written).count(),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("需要对象"),
        }
    }

    #[test]
    fn test_record_from_rich_text_fields() {
        let record = ConversationRecord::from_fields(
            Some("rec001".to_string()),
            fields(json!({
                "编号": 7,
                "round5": [{"type": "text", "text": "用户："}, {"type": "text", "text": "你好"}],
                "round10": "客服：您好",
                "渠道": "app"
            })),
        );

        assert_eq!(record.number, "7");
        assert_eq!(record.round5, "用户：你好");
        assert_eq!(record.round10, "客服：您好");
        assert_eq!(record.extra.get("渠道"), Some(&json!("app")));
    }

    #[test]
    fn test_prompt_json_keeps_chinese_and_extra_columns() {
        let record = ConversationRecord::from_fields(
            None,
            fields(json!({"编号": "A1", "round5": "你好", "渠道": "web"})),
        );
        let parsed: Value = serde_json::from_str(&record.to_prompt_json()).unwrap();

        assert_eq!(parsed["编号"], "A1");
        assert_eq!(parsed["round5"], "你好");
        assert_eq!(parsed["round10"], "");
        assert_eq!(parsed["渠道"], "web");
        assert!(record.to_prompt_json().contains("你好"));
    }

    #[test]
    fn test_table_fields_for_object_analysis() {
        let record = ConversationRecord::from_fields(None, fields(json!({"编号": "3"})));
        let result = AnalysisResult::success(
            &record,
            json!({"意图": "退款", "置信度": 0.9, "标签": ["售后", "紧急"]}),
        );
        let row = result.to_table_fields();

        assert_eq!(row["编号"], "3");
        assert_eq!(row["意图"], "退款");
        assert_eq!(row["置信度"], json!(0.9));
        assert_eq!(row["标签"], json!(r#"["售后","紧急"]"#));
    }

    #[test]
    fn test_table_fields_for_failure() {
        let record = ConversationRecord::from_fields(None, fields(json!({"编号": "5"})));
        let result = AnalysisResult::failed(&record, "解析失败", Some("not json".to_string()));
        let row = result.to_table_fields();

        assert!(!result.is_success());
        assert_eq!(row["error"], "解析失败");
        assert_eq!(row["raw_response"], "not json");
    }

    #[test]
    fn test_result_serializes_status_tag() {
        let record = ConversationRecord::from_fields(None, fields(json!({"编号": "9"})));
        let value = serde_json::to_value(AnalysisResult::success(&record, json!([1, 2]))).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["number"], "9");
        assert_eq!(value["analysis"], json!([1, 2]));
    }

    #[test]
    fn test_summary_tally() {
        let outcome = |index, remote_written, local_written| BatchOutcome {
            index,
            records: 3,
            analysis_failures: 1,
            remote_written,
            local_written,
            remote_error: None,
        };
        let summary = RunSummary::tally(
            9,
            &[outcome(0, true, true), outcome(1, false, true), outcome(2, true, false)],
            Duration::from_secs(1),
        );

        assert_eq!(summary.total_batches, 3);
        assert_eq!(summary.succeeded_batches, 2);
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.analysis_failures, 3);
        assert_eq!(summary.local_write_failures, 1);
    }
}
