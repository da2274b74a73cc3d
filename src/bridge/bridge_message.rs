use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;

/// Extra: 文件附件
pub const EXTRA_FILE: &str = "file";
/// Extra: 超出大小限制未下载的文件
pub const EXTRA_FILE_FAILURE_SIZE: &str = "file_failure_size";
/// Extra: 平台原样透传的附件
pub const EXTRA_ATTACHMENTS: &str = "attachments";

/// 桥内通用消息
///
/// 由桥在接收平台消息时创建，只有路由会修改它（填充 gateway、头像）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, rename = "userid")]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    /**
     * 头像链接
     */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub channel: String,
    /**
     * 桥实例: `<protocol>.<name>`
     */
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub gateway: String,
    /**
     * 回复或话题的父消息id (来源平台的原生id)
     */
    #[serde(default, rename = "parent_id")]
    pub parent_id: String,
    /**
     * 来源平台的原生消息id
     */
    #[serde(default)]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub event: Event,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Vec<ExtraPayload>>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            user_id: String::new(),
            username: String::new(),
            avatar: None,
            text: String::new(),
            channel: String::new(),
            account: String::new(),
            protocol: String::new(),
            gateway: String::new(),
            parent_id: String::new(),
            id: String::new(),
            timestamp: Utc::now(),
            event: Event::Post,
            extra: HashMap::new(),
        }
    }
}

impl Message {
    /// 文本消息
    pub fn text(channel: &str, username: &str, text: &str) -> Self {
        Message {
            channel: channel.to_string(),
            username: username.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// 追加一条 Extra
    pub fn push_extra(&mut self, kind: &str, payload: ExtraPayload) {
        self.extra.entry(kind.to_string()).or_default().push(payload);
    }

    /// 追加一个文件附件
    pub fn push_file(&mut self, file: FileInfo) {
        self.push_extra(EXTRA_FILE, ExtraPayload::File(file));
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.extra
            .get(EXTRA_FILE)
            .into_iter()
            .flatten()
            .filter_map(|payload| match payload {
                ExtraPayload::File(file) => Some(file),
                _ => None,
            })
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut FileInfo> {
        self.extra
            .get_mut(EXTRA_FILE)
            .into_iter()
            .flatten()
            .filter_map(|payload| match payload {
                ExtraPayload::File(file) => Some(file),
                _ => None,
            })
    }

    /// 是否带有附件 (文件、超限文件或透传附件)
    pub fn has_attachments(&self) -> bool {
        [EXTRA_FILE, EXTRA_FILE_FAILURE_SIZE, EXTRA_ATTACHMENTS]
            .iter()
            .any(|kind| self.extra.get(*kind).map_or(false, |list| !list.is_empty()))
    }

    pub fn has_file_failures(&self) -> bool {
        self.extra
            .get(EXTRA_FILE_FAILURE_SIZE)
            .map_or(false, |list| !list.is_empty())
    }
}

/// 消息事件
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// 普通消息
    #[default]
    #[serde(rename = "")]
    Post,
    #[serde(rename = "msg_edit")]
    Edit,
    #[serde(rename = "msg_delete")]
    Delete,
    #[serde(rename = "join_leave")]
    JoinLeave,
    #[serde(rename = "topic_change")]
    TopicChange,
    /// `/me` 动作
    #[serde(rename = "user_action")]
    UserAction,
    #[serde(rename = "user_typing")]
    UserTyping,
    /// 桥下载了用户头像，交给路由上传并缓存
    #[serde(rename = "avatar_download")]
    AvatarDownload,
    #[serde(rename = "file_failure_size")]
    FileFailureSize,
}

impl Event {
    /// 编辑/删除需要通过消息id关联目标平台的消息
    pub fn needs_correlation(&self) -> bool {
        matches!(self, Event::Edit | Event::Delete)
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let name = match self {
            Event::Post => "post",
            Event::Edit => "msg_edit",
            Event::Delete => "msg_delete",
            Event::JoinLeave => "join_leave",
            Event::TopicChange => "topic_change",
            Event::UserAction => "user_action",
            Event::UserTyping => "user_typing",
            Event::AvatarDownload => "avatar_download",
            Event::FileFailureSize => "file_failure_size",
        };
        write!(f, "{}", name)
    }
}

/// Extra 中的具体内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtraPayload {
    File(FileInfo),
    FileFailure(FileFailure),
    /**
     * 平台自定义的附件, 路由不解析
     */
    Attachment { value: serde_json::Value },
}

/// 文件附件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /**
     * 原始数据; 不参与序列化
     */
    #[serde(skip)]
    pub data: Option<Arc<Vec<u8>>>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub size: u64,
    /**
     * 内容哈希; 上传成功之前为空
     */
    #[serde(default)]
    pub sha: String,
    /**
     * 是否是用户头像
     */
    #[serde(default)]
    pub avatar: bool,
    /**
     * 平台内的文件id
     */
    #[serde(default)]
    pub native_id: String,
}

impl FileInfo {
    pub fn with_data(name: &str, data: Vec<u8>) -> Self {
        FileInfo {
            name: name.to_string(),
            size: data.len() as u64,
            data: Some(Arc::new(data)),
            ..Default::default()
        }
    }
}

/// 超出 MediaDownloadSize 的文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFailure {
    pub name: String,
    pub size: u64,
    pub limit: u64,
}
