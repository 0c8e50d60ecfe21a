use std::process::Stdio;

use crawlhub_core::traits::{CommandSpec, ProcessBuilder};
use crawlhub_core::{SchedulerError, SchedulerResult};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::debug;

/// 基于 `sh -c` 和进程组信号的进程构建器
#[derive(Debug, Clone, Default)]
pub struct SystemProcessBuilder;

impl SystemProcessBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessBuilder for SystemProcessBuilder {
    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command_line)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn set_process_group(&self, cmd: &mut Command) {
        cmd.process_group(0);
    }

    fn kill_tree(&self, pid: u32, force: bool) -> SchedulerResult<()> {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        let pgid = Pid::from_raw(pid as i32);

        let result = match killpg(pgid, signal) {
            Ok(()) => Ok(()),
            // 进程组已经不存在，再尝试单个进程
            Err(Errno::ESRCH) => match kill(pgid, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(SchedulerError::Internal(format!(
                    "failed to send {signal:?} to pid {pid}: {e}"
                ))),
            },
            Err(e) => Err(SchedulerError::Internal(format!(
                "failed to send {signal:?} to process group {pid}: {e}"
            ))),
        };
        if result.is_ok() {
            debug!(pid, signal = ?signal, "Signal sent to process group");
        }
        result
    }

    fn pid_exists(&self, pid: u32) -> bool {
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn group_exists(&self, pgid: u32) -> bool {
        match killpg(Pid::from_raw(pgid as i32), None) {
            Ok(()) | Err(Errno::EPERM) => group_has_live_member(pgid),
            Err(_) => false,
        }
    }
}

/// 进程组里只剩未回收的僵尸进程时也能收到信号，按 `/proc` 再确认一次
#[cfg(target_os = "linux")]
fn group_has_live_member(pgid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .any(|(state, pgrp)| pgrp == pgid && state != 'Z' && state != 'X')
}

#[cfg(not(target_os = "linux"))]
fn group_has_live_member(_pgid: u32) -> bool {
    true
}

/// 从 `/proc/<pid>/stat` 中取出进程状态和进程组号
///
/// 进程名可能包含空格和括号，字段从最后一个 `)` 之后开始解析。
#[cfg(target_os = "linux")]
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn spec(command_line: &str) -> CommandSpec {
        CommandSpec {
            command_line: command_line.to_string(),
            cwd: std::env::temp_dir(),
            env: vec![
                ("CRAWLHUB_TASK_ID".to_string(), "first".to_string()),
                ("CRAWLHUB_TASK_ID".to_string(), "second".to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn test_later_env_entries_win() {
        let builder = SystemProcessBuilder::new();
        let output = builder
            .build_command(&spec("printf %s \"$CRAWLHUB_TASK_ID\""))
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "second");
    }

    #[tokio::test]
    async fn test_kill_tree_terminates_group() {
        let builder = SystemProcessBuilder::new();
        let mut cmd = builder.build_command(&spec("sleep 30"));
        builder.set_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(builder.pid_exists(pid));

        builder.kill_tree(pid, false).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.code().is_none());
        assert!(!builder.pid_exists(pid));
    }

    #[tokio::test]
    async fn test_group_outlives_its_leader() {
        let builder = SystemProcessBuilder::new();
        // 组长立即退出，后台的sleep留在同一进程组
        let mut cmd = builder.build_command(&spec("sleep 30 & echo started"));
        builder.set_process_group(&mut cmd);
        let mut child = cmd.stdout(Stdio::null()).spawn().unwrap();
        let pid = child.id().unwrap();

        child.wait().await.unwrap();
        assert!(!builder.pid_exists(pid));
        assert!(builder.group_exists(pid));

        builder.kill_tree(pid, true).unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if !builder.group_exists(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat() {
        let stat = "1234 (my (odd) proc) S 1 1230 1230 0 -1 4194560";
        assert_eq!(parse_stat(stat), Some(('S', 1230)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_missing_process_is_not_an_error() {
        let builder = SystemProcessBuilder::new();
        // pid_max 上限之外，不可能存在
        let pid = 4_194_305;
        assert!(!builder.pid_exists(pid));
        assert!(!builder.group_exists(pid));
        assert!(builder.kill_tree(pid, true).is_ok());
    }
}
