use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crawlhub_core::SchedulerResult;
use tokio::fs;
use tracing::debug;

/// 把爬虫源目录同步到任务工作目录
///
/// 只复制目标中不存在、大小不同或源文件更新过的文件，不删除目标中多余的文件。
/// 返回复制的文件数。
pub async fn sync_dir(source: &Path, target: &Path) -> SchedulerResult<usize> {
    let mut copied = 0;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((src_dir, dst_dir)) = pending.pop() {
        fs::create_dir_all(&dst_dir).await?;

        let mut entries = fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let src = entry.path();
            let dst = dst_dir.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push((src, dst));
            } else if file_type.is_file() && needs_copy(&src, &dst).await? {
                fs::copy(&src, &dst).await?;
                copied += 1;
            }
        }
    }

    debug!(
        source = %source.display(),
        target = %target.display(),
        copied,
        "Workspace synchronized"
    );
    Ok(copied)
}

async fn needs_copy(src: &Path, dst: &Path) -> SchedulerResult<bool> {
    let src_meta = fs::metadata(src).await?;
    let dst_meta = match fs::metadata(dst).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }
    let src_modified = src_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let dst_modified = dst_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(src_modified > dst_modified)
}
