use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 爬虫定义：执行命令、默认参数以及需要同步到工作目录的源文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Spider {
    pub id: Uuid,
    pub name: String,
    pub cmd: String,
    pub param: Option<String>,
    pub source_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Spider {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cmd: cmd.into(),
            param: None,
            source_dir: None,
            env: HashMap::new(),
        }
    }
}
