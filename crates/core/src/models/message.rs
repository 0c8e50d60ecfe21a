use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, SchedulerError};

/// 消息流信封，master与worker之间的所有推送都使用此格式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub code: StreamMessageCode,
    pub node_key: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMessageCode {
    Connect,
    Disconnect,
    Ping,
    SendEvent,
    Run,
    Cancel,
}

/// RUN / CANCEL 消息载荷
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCommand {
    pub task_id: Uuid,
}

impl StreamMessage {
    pub fn new(code: StreamMessageCode, node_key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            code,
            node_key: node_key.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connect(node_key: impl Into<String>) -> Self {
        Self::new(StreamMessageCode::Connect, node_key, serde_json::Value::Null)
    }

    pub fn disconnect(node_key: impl Into<String>) -> Self {
        Self::new(StreamMessageCode::Disconnect, node_key, serde_json::Value::Null)
    }

    pub fn ping(node_key: impl Into<String>) -> Self {
        Self::new(StreamMessageCode::Ping, node_key, serde_json::Value::Null)
    }

    pub fn run(node_key: impl Into<String>, task_id: Uuid) -> Self {
        Self::task_command(StreamMessageCode::Run, node_key, task_id)
    }

    pub fn cancel(node_key: impl Into<String>, task_id: Uuid) -> Self {
        Self::task_command(StreamMessageCode::Cancel, node_key, task_id)
    }

    fn task_command(code: StreamMessageCode, node_key: impl Into<String>, task_id: Uuid) -> Self {
        let data = serde_json::to_value(TaskCommand { task_id }).unwrap_or(serde_json::Value::Null);
        Self::new(code, node_key, data)
    }

    /// 解析载荷
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            SchedulerError::Serialization(format!("解析{:?}消息载荷失败: {e}", self.code))
        })
    }

    pub fn task_id(&self) -> Result<Uuid> {
        self.payload::<TaskCommand>().map(|c| c.task_id)
    }

    pub fn serialize(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 简单应答，对应注册/心跳/取消订阅
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub status: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
