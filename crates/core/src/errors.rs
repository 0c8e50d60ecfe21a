use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("爬虫未找到: {id}")]
    SpiderNotFound { id: Uuid },

    #[error("节点未找到: {key}")]
    NodeNotFound { key: String },

    #[error("节点注册被拒绝: {0}")]
    Forbidden(String),

    #[error("认证失败: {0}")]
    Unauthorized(String),

    #[error("没有可用的Runner")]
    NoAvailableRunners,

    #[error("任务Runner已存在: {id}")]
    RunnerAlreadyExists { id: Uuid },

    #[error("任务Runner不存在: {id}")]
    RunnerNotFound { id: Uuid },

    #[error("节点订阅不存在: {key}")]
    SubscriptionNotFound { key: String },

    #[error("没有可分配的节点: 任务 {task_id}")]
    NoEligibleNode { task_id: Uuid },

    #[error("任务 {id} 当前状态 {status:?} 不允许该操作")]
    InvalidTaskState { id: Uuid, status: TaskStatus },

    #[error("无法取消任务: {0}")]
    UnableToCancel(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务已取消")]
    TaskCancelled,

    #[error("任务进程丢失: pid={pid}")]
    ProcessLost { pid: u32 },

    #[error("连接错误: {0}")]
    Connection(String),

    #[error("消息流错误: {0}")]
    Stream(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

impl SchedulerError {
    /// 准入类错误：同步返回给调用方，核心层不会自动重试
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            SchedulerError::Forbidden(_)
                | SchedulerError::NoAvailableRunners
                | SchedulerError::RunnerAlreadyExists { .. }
                | SchedulerError::NoEligibleNode { .. }
                | SchedulerError::SubscriptionNotFound { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::TaskNotFound { .. }
                | SchedulerError::SpiderNotFound { .. }
                | SchedulerError::NodeNotFound { .. }
                | SchedulerError::RunnerNotFound { .. }
        )
    }
}

/// RPC错误应答体，master侧由 `SchedulerError` 生成，worker侧还原为 `SchedulerError`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl From<&SchedulerError> for ErrorBody {
    fn from(err: &SchedulerError) -> Self {
        let (code, subject) = match err {
            SchedulerError::TaskNotFound { id } => ("task_not_found", Some(id.to_string())),
            SchedulerError::SpiderNotFound { id } => ("spider_not_found", Some(id.to_string())),
            SchedulerError::NodeNotFound { key } => ("node_not_found", Some(key.clone())),
            SchedulerError::Forbidden(key) => ("forbidden", Some(key.clone())),
            SchedulerError::Unauthorized(reason) => ("unauthorized", Some(reason.clone())),
            SchedulerError::SubscriptionNotFound { key } => {
                ("subscription_not_found", Some(key.clone()))
            }
            SchedulerError::InvalidTaskState { id, .. } => {
                ("invalid_task_state", Some(id.to_string()))
            }
            _ => ("internal", None),
        };
        Self {
            code: code.to_string(),
            message: err.to_string(),
            subject,
        }
    }
}

impl ErrorBody {
    /// 还原为类型化错误，无法识别的错误码归入 `Internal`
    pub fn into_error(self) -> SchedulerError {
        let subject = self.subject.clone().unwrap_or_default();
        let uuid = subject.parse::<Uuid>().ok();
        match (self.code.as_str(), uuid) {
            ("task_not_found", Some(id)) => SchedulerError::TaskNotFound { id },
            ("spider_not_found", Some(id)) => SchedulerError::SpiderNotFound { id },
            ("node_not_found", _) => SchedulerError::NodeNotFound { key: subject },
            ("forbidden", _) => SchedulerError::Forbidden(subject),
            ("unauthorized", _) => SchedulerError::Unauthorized(subject),
            ("subscription_not_found", _) => SchedulerError::SubscriptionNotFound { key: subject },
            _ => SchedulerError::Internal(self.message),
        }
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_restores_typed_errors() {
        let id = Uuid::new_v4();
        let body = ErrorBody::from(&SchedulerError::TaskNotFound { id });
        assert_eq!(body.code, "task_not_found");
        assert!(matches!(body.into_error(), SchedulerError::TaskNotFound { id: got } if got == id));

        let body = ErrorBody::from(&SchedulerError::Forbidden("worker-9".to_string()));
        assert!(matches!(body.into_error(), SchedulerError::Forbidden(key) if key == "worker-9"));
    }

    #[test]
    fn test_unknown_error_becomes_internal() {
        let body = ErrorBody::from(&SchedulerError::NoAvailableRunners);
        assert_eq!(body.code, "internal");
        assert!(matches!(body.into_error(), SchedulerError::Internal(_)));
    }

    #[test]
    fn test_admission_classification() {
        assert!(SchedulerError::NoAvailableRunners.is_admission());
        assert!(SchedulerError::Forbidden("x".into()).is_admission());
        assert!(!SchedulerError::Cancelled.is_admission());
        assert!(SchedulerError::RunnerNotFound { id: Uuid::new_v4() }.is_not_found());
    }
}
