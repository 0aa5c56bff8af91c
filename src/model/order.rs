use crate::model::wish::host_of;
use crate::model::{LoaderKind, Wish};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 批量下载组ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// 下载指令
///
/// 由 Wish 解析而来、可以直接派发给 Loader 的具体指令。
/// 只在派发前由协调器修改（文件名、大小），派发后不再变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// 指令ID
    pub id: String,
    /// 使用的 Loader 变体
    pub kind: LoaderKind,
    /// 源地址
    pub source: String,
    /// 目标目录（绝对路径）
    pub folder: PathBuf,
    /// 目标文件名
    pub filename: String,
    /// MIME（响应头到达后可能被细化）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// 预期大小
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// 所属下载组，None 表示不属于任何组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    /// 附加轨道地址
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux_urls: Vec<String>,
    /// Referer 头
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// 产生此指令的 Wish（剥离凭证后可能为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wish: Option<Wish>,
    /// 是否为暂停后的续传派发（沿用原目标路径）
    #[serde(default)]
    pub resume: bool,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
}

impl Order {
    pub fn new(kind: LoaderKind, source: impl Into<String>, folder: PathBuf, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source: source.into(),
            folder,
            filename: filename.into(),
            mime: None,
            expected_size: None,
            group: None,
            aux_urls: Vec::new(),
            referer: None,
            wish: None,
            resume: false,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 完整目标路径
    pub fn destination(&self) -> PathBuf {
        self.folder.join(&self.filename)
    }

    /// 源地址主机名
    pub fn host(&self) -> Option<String> {
        host_of(&self.source)
    }

    /// 剥离凭证：如果反向引用的 Wish 地址里带密码，整个反向引用置空
    pub fn strip_credentials(&mut self) {
        if self.wish.as_ref().is_some_and(|w| w.has_inline_credentials()) {
            self.wish = None;
        }
    }

    /// 用于重试的 Wish（优先使用原始 Wish）
    pub fn retry_wish(&self) -> Wish {
        let mut wish = match &self.wish {
            Some(w) => w.clone(),
            None => Wish::from_order(self),
        };
        wish.held = false;
        wish
    }

    /// 用于续传的副本：新ID，沿用目标路径
    pub fn resumed(&self) -> Self {
        let mut order = self.clone();
        order.id = Uuid::new_v4().to_string();
        order.resume = true;
        order
    }
}
