//! 进程构建接口
//!
//! Runner不直接依赖操作系统调用：命令的构建、进程组设置、信号发送和
//! 进程存活检查都经由 [`ProcessBuilder`]，测试可以替换其中任意一步。

use std::path::PathBuf;

use tokio::process::Command;

use crate::SchedulerResult;

/// 待执行命令的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// 完整命令行，由shell解释
    pub command_line: String,
    pub cwd: PathBuf,
    /// 按顺序应用，后写入的同名变量覆盖先写入的
    pub env: Vec<(String, String)>,
}

pub trait ProcessBuilder: Send + Sync {
    /// 构建命令，stdout/stderr 由调用方设置为管道
    fn build_command(&self, spec: &CommandSpec) -> Command;

    /// 让子进程成为新进程组的组长，取消时可以整组发送信号
    fn set_process_group(&self, cmd: &mut Command);

    /// 向以 `pid` 为组长的进程组发送信号，`force` 为 true 时发送 SIGKILL，否则 SIGTERM
    fn kill_tree(&self, pid: u32, force: bool) -> SchedulerResult<()>;

    fn pid_exists(&self, pid: u32) -> bool;

    /// 以 `pgid` 为组号的进程组中是否还有存活进程
    ///
    /// 组长退出后，同组的子孙进程仍会让此方法返回 `true`。
    fn group_exists(&self, pgid: u32) -> bool;
}
