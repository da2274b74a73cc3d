use chrono::{TimeZone, Utc};
use serenity::async_trait;
use serenity::model::channel::{Message as DcMessage, MessageType};
use serenity::model::event::MessageUpdateEvent;
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId, WebhookId};
use serenity::model::user::User;
use serenity::prelude::*;
use tracing::{debug, error, info, instrument};

use crate::bridge::helper::{download_file, handle_download_data, handle_download_size, spawn_avatar_download};
use crate::bridge::{BridgeContext, Event, Message};

pub struct Handler {
    pub ctx: BridgeContext,
    pub bot_id: UserId,
    /// 自己的 webhook 发出的消息也要忽略
    pub webhook_id: Option<WebhookId>,
}

impl Handler {
    /// webhook 消息的作者id 就是 webhook id
    fn is_own(&self, author: &User) -> bool {
        author.id == self.bot_id || self.webhook_id.map_or(false, |id| id.0 == author.id.0)
    }

    /// 下载附件, 超过大小限制的记为失败
    async fn attach_files(&self, dc_msg: &DcMessage, msg: &mut Message) {
        let limit = self.ctx.general.media_download_size;
        for attachment in &dc_msg.attachments {
            if !handle_download_size(msg, &attachment.filename, attachment.size, limit) {
                continue;
            }
            match download_file(&attachment.url).await {
                Ok(data) => {
                    handle_download_data(msg, &attachment.filename, "", &attachment.url, data);
                    if let Some(file) = msg.files_mut().last() {
                        file.native_id = attachment.id.0.to_string();
                    }
                }
                Err(err) => error!("[DC] 下载附件 {} 失败: {:?}", attachment.filename, err),
            }
        }
    }
}

/// 头像链接换成小尺寸的 png
pub fn avatar_png(url: &str) -> String {
    url.replace(".webp?size=1024", ".png?size=64")
}

/// 平台消息转换为桥消息, 不处理附件
pub fn to_message(dc_msg: &DcMessage) -> Message {
    let username = dc_msg
        .member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .unwrap_or_else(|| dc_msg.author.name.clone());
    let mut msg = Message {
        channel: dc_msg.channel_id.0.to_string(),
        id: dc_msg.id.0.to_string(),
        user_id: dc_msg.author.id.0.to_string(),
        username,
        text: dc_msg.content.clone(),
        timestamp: Utc
            .timestamp_opt(dc_msg.timestamp.unix_timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now),
        ..Default::default()
    };
    if let Some(parent) = dc_msg
        .message_reference
        .as_ref()
        .and_then(|reference| reference.message_id)
    {
        msg.parent_id = parent.0.to_string();
    }
    if dc_msg.kind == MessageType::MemberJoin {
        msg.event = Event::JoinLeave;
        msg.text = format!("{} 加入了服务器", dc_msg.author.name);
    }
    msg
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("[DC] {} 已连接", ready.user.name);
    }

    #[instrument(skip_all, name = "bridge_dc_recv")]
    async fn message(&self, _ctx: Context, dc_msg: DcMessage) {
        if self.is_own(&dc_msg.author) {
            // 自己发出的消息, 不要继续以免消息循环
            return;
        }
        let mut msg = to_message(&dc_msg);
        debug!("[DC] 收到 {} 的消息: {}", msg.username, msg.text);
        self.attach_files(&dc_msg, &mut msg).await;
        if let Some(url) = dc_msg.author.avatar_url() {
            let url = avatar_png(&url);
            spawn_avatar_download(&self.ctx, &msg.channel, &msg.user_id, async move { Ok(Some(url)) });
        }
        self.ctx.client.send(msg);
    }

    async fn message_update(&self, _ctx: Context, event: MessageUpdateEvent) {
        // 嵌入内容的更新没有作者和文本
        let (Some(author), Some(content)) = (event.author, event.content) else {
            return;
        };
        if self.is_own(&author) {
            return;
        }
        let msg = Message {
            channel: event.channel_id.0.to_string(),
            id: event.id.0.to_string(),
            user_id: author.id.0.to_string(),
            username: author.name,
            text: content,
            event: Event::Edit,
            ..Default::default()
        };
        self.ctx.client.send(msg);
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.ctx.client.send(Message {
            channel: channel_id.0.to_string(),
            id: deleted_message_id.0.to_string(),
            event: Event::Delete,
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn avatar_is_png() {
        assert_eq!(
            avatar_png("https://cdn.discordapp.com/avatars/1/abc.webp?size=1024"),
            "https://cdn.discordapp.com/avatars/1/abc.png?size=64"
        );
    }
}
