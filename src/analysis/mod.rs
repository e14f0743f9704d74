//! 批量分析编排
//!
//! 将记录切分为固定大小的批次，批次之间并发执行（并发数受限），
//! 批次内逐条调用分析器。每个批次分析完成后先尝试写入远程表格，
//! 再追加到本地文件；批次成功与否只取决于远程写入结果。

pub mod output;

pub use output::LocalOutput;

use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::feishu::RecordStore;
use crate::llm::{DialogueAnalyzer, PromptTemplate};
use crate::models::{AnalysisResult, BatchOutcome, ConversationRecord, RunSummary};

/// 一个批次
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub records: Vec<ConversationRecord>,
}

/// 按固定大小切分记录，保持原有顺序，最后一批可能不足
pub fn partition(records: Vec<ConversationRecord>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);

    for record in records {
        current.push(record);
        if current.len() == batch_size {
            batches.push(Batch {
                index: batches.len(),
                records: std::mem::replace(&mut current, Vec::with_capacity(batch_size)),
            });
        }
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            records: current,
        });
    }

    batches
}

/// 结果写入目标
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub app_token: String,
    pub table_id: String,
}

/// 批次任务共享的上下文
struct BatchContext {
    analyzer: Arc<dyn DialogueAnalyzer>,
    store: Arc<dyn RecordStore>,
    output: Arc<LocalOutput>,
    template: PromptTemplate,
    target: WriteTarget,
}

/// 批量编排器
pub struct BatchOrchestrator {
    ctx: Arc<BatchContext>,
    batch_size: usize,
    max_workers: usize,
}

impl BatchOrchestrator {
    pub fn new(
        analyzer: Arc<dyn DialogueAnalyzer>,
        store: Arc<dyn RecordStore>,
        output: Arc<LocalOutput>,
        template: PromptTemplate,
        target: WriteTarget,
        batch_size: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            ctx: Arc::new(BatchContext {
                analyzer,
                store,
                output,
                template,
                target,
            }),
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// 处理全部记录，等待所有批次完成后汇总
    pub async fn run(&self, records: Vec<ConversationRecord>) -> RunSummary {
        let started = Instant::now();
        let total_records = records.len();
        let batches = partition(records, self.batch_size);

        info!(
            "开始批量分析: {} 条记录, {} 个批次 (每批 {} 条, 并发 {})",
            total_records,
            batches.len(),
            self.batch_size,
            self.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles: Vec<(usize, usize, JoinHandle<BatchOutcome>)> =
            Vec::with_capacity(batches.len());

        for batch in batches {
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            let index = batch.index;
            let size = batch.records.len();

            let handle = tokio::spawn(async move {
                // 信号量不会被关闭
                let _permit = semaphore.acquire_owned().await.ok();
                process_batch(&ctx, batch).await
            });
            handles.push((index, size, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, size, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("批次 {} 执行异常: {}", index, e);
                    outcomes.push(BatchOutcome {
                        index,
                        records: size,
                        analysis_failures: size,
                        remote_written: false,
                        local_written: false,
                        remote_error: Some(e.to_string()),
                    });
                }
            }
        }

        for outcome in outcomes.iter().filter(|o| !o.succeeded()) {
            warn!(
                "批次 {} ({} 条) 未写入多维表格: {}",
                outcome.index,
                outcome.records,
                outcome.remote_error.as_deref().unwrap_or("未知原因")
            );
        }

        let summary = RunSummary::tally(total_records, &outcomes, started.elapsed());
        info!(
            "批量分析完成: 共 {} 个批次, 成功 {}, 失败 {}; 分析失败 {} 条, 本地写入失败 {} 批, 耗时 {:.1}s",
            summary.total_batches,
            summary.succeeded_batches,
            summary.failed_batches,
            summary.analysis_failures,
            summary.local_write_failures,
            summary.elapsed.as_secs_f64()
        );
        summary
    }
}

/// 分析单条记录，失败（包括分析器 panic）时转换为带错误标记的结果
async fn analyze_record(ctx: &BatchContext, record: &ConversationRecord) -> AnalysisResult {
    let call = AssertUnwindSafe(ctx.analyzer.analyze(record, &ctx.template))
        .catch_unwind()
        .await;

    match call {
        Ok(Ok(analysis)) => AnalysisResult::success(record, analysis),
        Ok(Err(e)) => {
            warn!("记录 {} 分析失败: {}", record.number, e);
            let raw = e.raw_response().map(str::to_string);
            AnalysisResult::failed(record, e.to_string(), raw)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("记录 {} 分析时发生 panic: {}", record.number, message);
            AnalysisResult::failed(record, format!("分析器异常: {}", message), None)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn process_batch(ctx: &BatchContext, batch: Batch) -> BatchOutcome {
    info!("批次 {} 开始处理 ({} 条)", batch.index, batch.records.len());

    let mut results = Vec::with_capacity(batch.records.len());
    for record in &batch.records {
        results.push(analyze_record(ctx, record).await);
    }
    let analysis_failures = results.iter().filter(|r| !r.is_success()).count();

    let rows: Vec<_> = results.iter().map(AnalysisResult::to_table_fields).collect();
    let (remote_written, remote_error) = match ctx
        .store
        .write(&ctx.target.app_token, &ctx.target.table_id, &rows)
        .await
    {
        Ok(()) => (true, None),
        Err(e) => {
            error!("批次 {} 写入多维表格失败: {:#}", batch.index, e);
            (false, Some(format!("{:#}", e)))
        }
    };

    // 本地输出不受远程写入结果影响
    let local_written = match ctx.output.append(batch.index, &results).await {
        Ok(()) => true,
        Err(e) => {
            error!("批次 {} 写入本地文件失败: {:#}", batch.index, e);
            false
        }
    };

    info!(
        "批次 {} 完成: 远程写入={}, 分析失败 {} / {}",
        batch.index,
        if remote_written { "成功" } else { "失败" },
        analysis_failures,
        results.len()
    );

    BatchOutcome {
        index: batch.index,
        records: results.len(),
        analysis_failures,
        remote_written,
        local_written,
        remote_error,
    }
}
