//! 调用记录存储。两种实现共用一个接口：
//! - memory：仅进程内保存（重启丢失），用于测试与无状态部署；
//! - jsonl：追加写入 `DATA_DIR/usage.jsonl`，启动时回放到内存索引。

use crate::usage::record::UsageRecord;
use crate::usage::reporter::month_start;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

pub const USAGE_FILE: &str = "usage.jsonl";
/// 内存中最多保留的记录数。
///
/// 只淘汰本月（UTC）之前的记录；本月记录全部保留，月度费用按它们汇总。
pub const DEFAULT_MEMORY_CAPACITY: usize = 500_000;

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()>;

    /// `timestamp >= from` 的所有记录，按写入顺序。
    async fn since(&self, from: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>>;

    async fn len(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageStoreKind {
    #[default]
    Memory,
    Jsonl,
}

impl UsageStoreKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "jsonl" | "file" => Self::Jsonl,
            _ => Self::Memory,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Jsonl => "jsonl",
        }
    }
}

pub async fn open(
    kind: UsageStoreKind,
    data_dir: impl AsRef<Path>,
) -> anyhow::Result<std::sync::Arc<dyn UsageStore>> {
    Ok(match kind {
        UsageStoreKind::Memory => std::sync::Arc::new(MemoryUsageStore::default()),
        UsageStoreKind::Jsonl => {
            std::sync::Arc::new(JsonlUsageStore::open(data_dir.as_ref().join(USAGE_FILE)).await?)
        }
    })
}

#[derive(Debug)]
pub struct MemoryUsageStore {
    records: RwLock<VecDeque<UsageRecord>>,
    capacity: usize,
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryUsageStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// 超出容量时从队首淘汰上个月及更早的记录。
    async fn push(&self, record: UsageRecord) {
        let cutoff = month_start(Utc::now());
        let mut records = self.records.write().await;
        while records.len() >= self.capacity
            && records.front().is_some_and(|r| r.timestamp < cutoff)
        {
            records.pop_front();
        }
        records.push_back(record);
    }

    async fn collect_since(&self, from: DateTime<Utc>) -> Vec<UsageRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= from)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.push(record).await;
        Ok(())
    }

    async fn since(&self, from: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>> {
        Ok(self.collect_since(from).await)
    }

    async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

/// 追加写文件 + 内存索引。文件写入串行化，单行损坏时跳过并告警。
#[derive(Debug)]
pub struct JsonlUsageStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    index: MemoryUsageStore,
}

impl JsonlUsageStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("创建数据目录失败")?;
        }

        let index = MemoryUsageStore::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut skipped = 0usize;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match sonic_rs::from_str::<UsageRecord>(line) {
                        Ok(r) => index.push(r).await,
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    tracing::warn!(path = %path.display(), skipped, "usage.jsonl 中存在无法解析的行");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("读取 usage.jsonl 失败"),
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let mut line = sonic_rs::to_string(record)
            .map_err(|e| anyhow!(e))
            .context("序列化调用记录失败")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("打开 usage.jsonl 失败")?;
        file.write_all(line.as_bytes())
            .await
            .context("写入 usage.jsonl 失败")?;
        file.flush().await.context("写入 usage.jsonl 失败")
    }
}

#[async_trait]
impl UsageStore for JsonlUsageStore {
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.write_line(&record).await?;
        self.index.push(record).await;
        Ok(())
    }

    async fn since(&self, from: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>> {
        Ok(self.index.collect_since(from).await)
    }

    async fn len(&self) -> usize {
        self.index.len().await
    }
}
