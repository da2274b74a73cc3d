use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, BridgeRules, GeneralConfig};
use crate::gateway::avatar_cache::AvatarCache;

pub mod bridge_message;
pub mod error;
pub mod helper;
#[cfg(test)]
pub mod mock;

pub use bridge_message::{
    Event, ExtraPayload, FileFailure, FileInfo, Message, EXTRA_ATTACHMENTS, EXTRA_FILE,
    EXTRA_FILE_FAILURE_SIZE,
};
pub use error::{BridgeError, BridgeResult};

/// 频道标识: 桥实例 + 频道名
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub account: String,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(account: &str, channel: &str) -> Self {
        ChannelKey {
            account: account.to_string(),
            channel: channel.to_string(),
        }
    }

    /// 消息的来源频道
    pub fn origin(msg: &Message) -> Self {
        ChannelKey::new(&msg.account, &msg.channel)
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}:{}", self.account, self.channel)
    }
}

/// # 桥接口
/// 每个平台实现一个; 路由只依赖这个接口。
///
/// 桥在 `connect` 中启动自己的接收方式 (回调、长轮询、内置 webhook 服务),
/// 收到的平台消息转换为 [`Message`] 后通过 [`BridgeClient::send`] 投递给路由。
#[async_trait]
pub trait Bridger: Send + Sync {
    /// 连接平台并开始接收消息。失败只影响当前桥实例
    async fn connect(&self, config: &BridgeConfig) -> BridgeResult<()>;

    /// 连接成功后加入网关中配置的频道
    async fn join_channel(&self, _channel: &str) -> BridgeResult<()> {
        Ok(())
    }

    /// 发送消息, 返回平台分配的消息id
    async fn send(&self, msg: &Message) -> BridgeResult<String>;

    async fn edit_message(&self, _remote_id: &str, _msg: &Message) -> BridgeResult<()> {
        Err(BridgeError::Unsupported("edit_message"))
    }

    async fn delete_message(&self, _channel: &str, _remote_id: &str) -> BridgeResult<()> {
        Err(BridgeError::Unsupported("delete_message"))
    }

    /// 平台文件id 转 可直接下载的链接
    async fn get_file_direct_url(&self, _id: &str) -> Option<String> {
        None
    }

    async fn disconnect(&self) -> BridgeResult<()>;
}

/// 根据上下文创建桥
pub type BridgeFactory = Arc<dyn Fn(BridgeContext) -> Arc<dyn Bridger> + Send + Sync>;

/// 创建桥时交给它的上下文
#[derive(Clone)]
pub struct BridgeContext {
    pub account: String,
    pub protocol: String,
    pub general: Arc<GeneralConfig>,
    /// 向路由投递消息
    pub client: BridgeClient,
    /// 只属于当前桥实例的头像缓存
    pub avatars: Arc<AvatarCache>,
    pub shutdown: CancellationToken,
}

/// 桥向路由投递消息的句柄
///
/// 队列无界, 投递永远不会等待下游。
#[derive(Clone)]
pub struct BridgeClient {
    pub account: String,
    pub protocol: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl BridgeClient {
    pub fn new(account: &str, protocol: &str, sender: mpsc::UnboundedSender<Message>) -> Self {
        BridgeClient {
            account: account.to_string(),
            protocol: protocol.to_string(),
            sender,
        }
    }

    /**
     * 向路由发送消息
     */
    pub fn send(&self, mut message: Message) -> bool {
        message.account = self.account.clone();
        if message.protocol.is_empty() {
            message.protocol = self.protocol.clone();
        }
        tracing::debug!(
            "[{}] {} 发送消息到路由 (channel: {}, event: {})",
            self.account,
            message.username,
            message.channel,
            message.event
        );
        if self.sender.send(message).is_err() {
            tracing::error!("[{}] 消息中转异常: 路由已关闭", self.account);
            return false;
        }
        true
    }
}

/// 路由持有的桥实例
pub struct Bridge {
    /// `<protocol>.<name>`
    pub account: String,
    pub protocol: String,
    pub name: String,
    pub config: BridgeConfig,
    pub rules: BridgeRules,
    pub avatars: Arc<AvatarCache>,
    pub bridger: Arc<dyn Bridger>,
}

impl Bridge {
    /// 频道名规范化: irc 频道不区分大小写, api 桥只有一个频道, discord 频道写作 `ID:<id>` 或 `<id>`
    pub fn normalize_channel(account: &str, channel: &str) -> String {
        if account.starts_with("api.") {
            return "api".to_string();
        }
        if account.starts_with("discord.") {
            return channel.trim_start_matches("ID:").to_string();
        }
        if account.starts_with("irc.") {
            return channel.to_lowercase();
        }
        channel.to_string()
    }

    pub fn is_api(&self) -> bool {
        self.protocol == "api"
    }
}

#[cfg(test)]
mod ts_bridge {
    use super::*;

    #[test]
    fn channel_key_display() {
        let key = ChannelKey::new("irc.libera", "#a");
        assert_eq!(key.to_string(), "irc.libera:#a");
        let msg = Message {
            account: "irc.libera".to_string(),
            channel: "#a".to_string(),
            ..Default::default()
        };
        assert_eq!(ChannelKey::origin(&msg), key);
    }

    #[test]
    fn normalize_channel() {
        assert_eq!(Bridge::normalize_channel("irc.libera", "#Rust"), "#rust");
        assert_eq!(Bridge::normalize_channel("api.local", "anything"), "api");
        assert_eq!(Bridge::normalize_channel("discord.main", "General"), "General");
        assert_eq!(Bridge::normalize_channel("discord.main", "ID:1234"), "1234");
    }

    #[tokio::test]
    async fn client_stamps_account() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = BridgeClient::new("telegram.main", "telegram", tx);
        assert!(client.send(Message::text("-100", "bob", "hi")));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.account, "telegram.main");
        assert_eq!(msg.protocol, "telegram");

        drop(rx);
        assert!(!client.send(Message::text("-100", "bob", "lost")));
    }
}
