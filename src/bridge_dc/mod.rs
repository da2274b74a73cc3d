//! Discord 桥
//!
//! 配置了 `WebhookURL` 时通过 webhook 发送, 显示远端用户的名字和头像; 否则由机器人直接发送。

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use serenity::client::bridge::gateway::ShardManager;
use serenity::http::{Http, HttpError};
use serenity::model::channel::AttachmentType;
use serenity::model::id::{ChannelId, MessageId};
use serenity::model::webhook::Webhook;
use serenity::prelude::*;
use tokio::sync::OnceCell;

use crate::bridge::{BridgeContext, BridgeError, BridgeResult, Bridger, Message};
use crate::config::BridgeConfig;

pub mod handler;

pub use handler::Handler;

struct DcApi {
    http: Arc<Http>,
    webhook: Option<Webhook>,
    shard_manager: Arc<Mutex<ShardManager>>,
}

pub struct DiscordBridge {
    ctx: BridgeContext,
    api: OnceCell<DcApi>,
}

impl DiscordBridge {
    pub fn new(ctx: BridgeContext) -> Self {
        DiscordBridge {
            ctx,
            api: OnceCell::new(),
        }
    }

    fn api(&self) -> BridgeResult<&DcApi> {
        self.api
            .get()
            .ok_or_else(|| BridgeError::transient("[DC] 还没有连接"))
    }
}

impl DcApi {
    /// 只有 webhook 所在的频道才通过 webhook 发送
    fn webhook_for(&self, channel: ChannelId) -> Option<&Webhook> {
        self.webhook
            .as_ref()
            .filter(|webhook| webhook.channel_id == Some(channel))
    }
}

/// `ID:<id>` 或 `<id>`
pub fn parse_channel(channel: &str) -> BridgeResult<ChannelId> {
    channel
        .trim_start_matches("ID:")
        .parse::<u64>()
        .map(ChannelId)
        .map_err(|_| BridgeError::permanent(format!("无效的频道: {}", channel)))
}

fn parse_message_id(id: &str) -> BridgeResult<MessageId> {
    id.parse::<u64>()
        .map(MessageId)
        .map_err(|_| BridgeError::permanent(format!("无效的消息id: {}", id)))
}

/// 按平台返回的状态码区分暂时/永久失败
pub fn classify(err: SerenityError) -> BridgeError {
    match err {
        SerenityError::Http(err) => match *err {
            HttpError::UnsuccessfulRequest(resp) => {
                BridgeError::from_status(resp.status_code.as_u16(), resp.error.message)
            }
            HttpError::Request(err) => BridgeError::transient(err),
            err => BridgeError::permanent(err),
        },
        SerenityError::Io(err) => BridgeError::transient(err),
        err => BridgeError::permanent(err),
    }
}

/// 消息正文和需要上传的附件
///
/// 已经有链接的附件追加到正文, 只有原始数据的附件直接上传
pub fn outgoing(msg: &Message, with_username: bool) -> (String, Vec<AttachmentType<'static>>) {
    let mut content = if with_username {
        format!("{}{}", msg.username, msg.text)
    } else {
        msg.text.clone()
    };
    let mut files = vec![];
    for file in msg.files() {
        if !file.url.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&file.url);
        } else if let Some(data) = &file.data {
            files.push(AttachmentType::Bytes {
                data: Cow::Owned(data.to_vec()),
                filename: file.name.clone(),
            });
        }
    }
    (content, files)
}

#[async_trait]
impl Bridger for DiscordBridge {
    async fn connect(&self, config: &BridgeConfig) -> BridgeResult<()> {
        tracing::info!("[DC] 初始化DC桥 {}", self.ctx.account);
        if config.token.is_empty() {
            return Err(BridgeError::connect("没有配置 Token"));
        }
        let http = Arc::new(Http::new(&config.token));
        let me = http
            .get_current_user()
            .await
            .map_err(|err| BridgeError::connect(format!("[DC] 验证 Token 失败: {}", err)))?;
        let webhook = if config.webhook_url.is_empty() {
            None
        } else {
            Some(
                Webhook::from_url(&http, &config.webhook_url)
                    .await
                    .map_err(|err| BridgeError::connect(format!("[DC] webhook 无效: {}", err)))?,
            )
        };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_MEMBERS
            | GatewayIntents::MESSAGE_CONTENT;
        let handler = Handler {
            ctx: self.ctx.clone(),
            bot_id: me.id,
            webhook_id: webhook.as_ref().map(|webhook| webhook.id),
        };
        let mut client = Client::builder(&config.token, intents)
            .event_handler(handler)
            .await
            .map_err(BridgeError::connect)?;
        let shard_manager = client.shard_manager.clone();

        let shutdown = self.ctx.shutdown.clone();
        let shards = shard_manager.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = client.start() => {
                    if let Err(err) = result {
                        tracing::error!("[DC] Discord客户端退出: {}", err);
                    }
                },
                _ = shutdown.cancelled() => {
                    shards.lock().await.shutdown_all().await;
                },
            }
        });

        let api = DcApi {
            http,
            webhook,
            shard_manager,
        };
        if self.api.set(api).is_err() {
            tracing::warn!("[DC] {} 重复连接", self.ctx.account);
        }
        Ok(())
    }

    async fn send(&self, msg: &Message) -> BridgeResult<String> {
        let api = self.api()?;
        let channel = parse_channel(&msg.channel)?;

        if let Some(webhook) = api.webhook_for(channel) {
            let (content, files) = outgoing(msg, false);
            let sent = webhook
                .execute(&api.http, true, |w| {
                    w.username(&msg.username).content(content).add_files(files);
                    if let Some(avatar) = &msg.avatar {
                        w.avatar_url(avatar);
                    }
                    w
                })
                .await
                .map_err(classify)?;
            return sent
                .map(|sent| sent.id.0.to_string())
                .ok_or_else(|| BridgeError::permanent("webhook 没有返回消息id"));
        }

        let (content, files) = outgoing(msg, true);
        let parent = msg.parent_id.parse::<u64>().ok().map(MessageId);
        let sent = channel
            .send_message(&api.http, |m| {
                m.content(content).add_files(files);
                if let Some(parent) = parent {
                    m.reference_message((channel, parent));
                }
                m
            })
            .await
            .map_err(classify)?;
        Ok(sent.id.0.to_string())
    }

    async fn edit_message(&self, remote_id: &str, msg: &Message) -> BridgeResult<()> {
        let api = self.api()?;
        let channel = parse_channel(&msg.channel)?;
        let message_id = parse_message_id(remote_id)?;
        if let Some(webhook) = api.webhook_for(channel) {
            let (content, _) = outgoing(msg, false);
            webhook
                .edit_message(&api.http, message_id, |m| m.content(content))
                .await
                .map_err(classify)?;
            return Ok(());
        }
        let (content, _) = outgoing(msg, true);
        channel
            .edit_message(&api.http, message_id, |m| m.content(content))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_message(&self, channel: &str, remote_id: &str) -> BridgeResult<()> {
        let api = self.api()?;
        parse_channel(channel)?
            .delete_message(&api.http, parse_message_id(remote_id)?)
            .await
            .map_err(classify)
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        if let Ok(api) = self.api() {
            api.shard_manager.lock().await.shutdown_all().await;
        }
        tracing::info!("[DC] {} 断开连接", self.ctx.account);
        Ok(())
    }
}
