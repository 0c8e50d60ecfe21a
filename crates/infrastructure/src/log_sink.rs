use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use crawlhub_core::traits::{LogSink, LogSinkFactory};
use crawlhub_core::SchedulerResult;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use uuid::Uuid;

/// 写入单个文件的任务日志
pub struct FileLogSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileLogSink {
    pub async fn open(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn write_line(&self, line: &str) -> SchedulerResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&self) -> SchedulerResult<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

/// 在 `log_root/<task_id>.log` 创建日志文件
pub struct FileLogSinkFactory {
    root: PathBuf,
}

impl FileLogSinkFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn log_path(&self, task_id: Uuid) -> PathBuf {
        self.root.join(format!("{task_id}.log"))
    }
}

#[async_trait]
impl LogSinkFactory for FileLogSinkFactory {
    async fn create(&self, task_id: Uuid) -> SchedulerResult<Arc<dyn LogSink>> {
        let sink = FileLogSink::open(self.log_path(task_id)).await?;
        Ok(Arc::new(sink))
    }
}
