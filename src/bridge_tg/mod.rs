//! Telegram 桥
//!
//! 使用 Bot API: `getUpdates` 长轮询接收消息, `sendMessage`/`sendDocument`/`sendMediaGroup` 发送,
//! `editMessageText`/`deleteMessage` 同步编辑和删除。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::bridge::helper::{download_file, handle_download_data, handle_download_size, spawn_avatar_download};
use crate::bridge::{BridgeContext, BridgeError, BridgeResult, Bridger, Event, FileInfo, Message};
use crate::config::BridgeConfig;

const TELEGRAM_API: &str = "https://api.telegram.org";
/// 长轮询等待时间
const POLL_TIMEOUT_SECS: u64 = 25;
const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;
/// 说明文字的长度上限
const CAPTION_LIMIT: usize = 1024;
/// 一个媒体组最多的文件数
const MEDIA_GROUP_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    edited_message: Option<TgMessage>,
    channel_post: Option<TgMessage>,
    edited_channel_post: Option<TgMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    date: i64,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<TgPhotoSize>>,
    document: Option<TgDocument>,
    reply_to_message: Option<Box<TgMessage>>,
    new_chat_members: Option<Vec<TgUser>>,
    left_chat_member: Option<TgUser>,
    new_chat_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: String,
    last_name: Option<String>,
    username: Option<String>,
}

impl TgUser {
    fn display_name(&self) -> String {
        if let Some(username) = &self.username {
            return username.clone();
        }
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct TgPhotoSize {
    file_id: String,
    file_unique_id: String,
    file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct TgDocument {
    file_id: String,
    file_name: Option<String>,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUserProfilePhotos {
    photos: Vec<Vec<TgPhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct TgSentMessage {
    message_id: i64,
}

/// 连接后才能确定的 api 信息
#[derive(Clone)]
struct TgApi {
    http: reqwest::Client,
    /// `<server>/bot<token>`
    base: String,
    /// `<server>/file/bot<token>`
    file_base: String,
    html: bool,
    /// 不下载文件, 由路由查询文件链接
    insecure_url: bool,
}

impl TgApi {
    fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        if config.token.is_empty() {
            return Err(BridgeError::connect("没有配置 Token"));
        }
        let server = if config.server.is_empty() {
            TELEGRAM_API
        } else {
            config.server.trim_end_matches('/')
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .map_err(BridgeError::connect)?;
        Ok(TgApi {
            http,
            base: format!("{}/bot{}", server, config.token),
            file_base: format!("{}/file/bot{}", server, config.token),
            html: config.message_format.eq_ignore_ascii_case("html"),
            insecure_url: config.use_insecure_url,
        })
    }

    /// 调用 Bot API, 按返回的错误码区分暂时/永久失败
    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> BridgeResult<T> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base, method))
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        decode(method, status, &body)
    }

    /// 带文件的请求
    async fn upload<T: DeserializeOwned>(&self, method: &str, form: Form) -> BridgeResult<T> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base, method))
            .multipart(form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        decode(method, status, &body)
    }

    async fn file_url(&self, file_id: &str) -> BridgeResult<Option<String>> {
        let file: TgFile = self.call("getFile", json!({ "file_id": file_id })).await?;
        Ok(file
            .file_path
            .map(|path| format!("{}/{}", self.file_base, path)))
    }

    async fn avatar_url(&self, user_id: i64) -> BridgeResult<Option<String>> {
        let photos: TgUserProfilePhotos = self
            .call("getUserProfilePhotos", json!({ "user_id": user_id, "limit": 1 }))
            .await?;
        let Some(photo) = photos.photos.first().and_then(|sizes| sizes.first()) else {
            return Ok(None);
        };
        self.file_url(&photo.file_id).await
    }

    /// # 发送一条桥消息
    /// 按 [`plan_send`] 拆分的请求依次发送, 返回第一个请求的消息id。
    /// 已经有内容发出后再失败不会重试, 避免重复发送。
    async fn send(&self, msg: &Message) -> BridgeResult<String> {
        let reply_to = msg.parent_id.parse::<i64>().ok();
        let mut first_id: Option<i64> = None;
        for request in plan_send(msg, self.html) {
            let reply_to = if first_id.is_none() { reply_to } else { None };
            match (self.execute(&msg.channel, request, reply_to).await, first_id) {
                (Ok(id), None) => first_id = Some(id),
                (Ok(_), Some(_)) => {}
                (Err(err), None) => return Err(err),
                (Err(err), Some(id)) => {
                    return Err(BridgeError::permanent(format!("消息 {} 只发送了一部分: {}", id, err)));
                }
            }
        }
        first_id
            .map(|id| id.to_string())
            .ok_or_else(|| BridgeError::permanent("没有可发送的内容"))
    }

    async fn execute(&self, chat_id: &str, request: TgRequest, reply_to: Option<i64>) -> BridgeResult<i64> {
        match request {
            TgRequest::Text(text) => {
                let mut body = json!({
                    "chat_id": chat_id,
                    "text": text,
                });
                if self.html {
                    body["parse_mode"] = json!("HTML");
                }
                if let Some(parent) = reply_to {
                    body["reply_to_message_id"] = json!(parent);
                    body["allow_sending_without_reply"] = json!(true);
                }
                let sent: TgSentMessage = self.call("sendMessage", body).await?;
                Ok(sent.message_id)
            }
            TgRequest::Document { file, caption } => {
                let mut form = base_form(chat_id, reply_to)
                    .text("caption", caption)
                    .part("document", file_part(&file));
                if self.html {
                    form = form.text("parse_mode", "HTML");
                }
                let sent: TgSentMessage = self.upload("sendDocument", form).await?;
                Ok(sent.message_id)
            }
            TgRequest::MediaGroup { files, caption } => {
                let media: Vec<serde_json::Value> = (0..files.len())
                    .map(|i| {
                        let mut item = json!({ "type": "document", "media": format!("attach://file{}", i) });
                        // 说明文字只放在第一个文件上
                        if i == 0 && !caption.is_empty() {
                            item["caption"] = json!(caption);
                            if self.html {
                                item["parse_mode"] = json!("HTML");
                            }
                        }
                        item
                    })
                    .collect();
                let mut form = base_form(chat_id, reply_to).text("media", serde_json::Value::Array(media).to_string());
                for (i, file) in files.iter().enumerate() {
                    form = form.part(format!("file{}", i), file_part(file));
                }
                let sent: Vec<TgSentMessage> = self.upload("sendMediaGroup", form).await?;
                sent.first()
                    .map(|sent| sent.message_id)
                    .ok_or_else(|| BridgeError::permanent("sendMediaGroup 没有返回消息"))
            }
        }
    }

    async fn edit(&self, remote_id: &str, msg: &Message) -> BridgeResult<()> {
        let message_id: i64 = remote_id
            .parse()
            .map_err(|_| BridgeError::permanent(format!("无效的消息id: {}", remote_id)))?;
        let text = format_text(msg, self.html);
        let mut body = json!({
            "chat_id": msg.channel,
            "message_id": message_id,
            "text": text,
        });
        if self.html {
            body["parse_mode"] = json!("HTML");
        }
        match self.call::<serde_json::Value>("editMessageText", body.clone()).await {
            Ok(_) => Ok(()),
            // 以文件发送的消息只能修改说明文字
            Err(BridgeError::Permanent(reason)) if reason.contains("no text in the message") => {
                if let Some(fields) = body.as_object_mut() {
                    if let Some(text) = fields.remove("text") {
                        fields.insert("caption".to_string(), text);
                    }
                }
                let _: serde_json::Value = self.call("editMessageCaption", body).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// 解析 Bot API 的返回
///
/// 代理或网关返回的错误页面不是 json, 这时按 http 状态码分类
fn decode<T: DeserializeOwned>(method: &str, status: u16, body: &[u8]) -> BridgeResult<T> {
    let resp: TgResponse<T> = match serde_json::from_slice(body) {
        Ok(resp) => resp,
        Err(err) if (200..300).contains(&status) => {
            return Err(BridgeError::permanent(format!("{} 返回无法解析: {}", method, err)));
        }
        Err(_) => {
            let page: String = String::from_utf8_lossy(body).chars().take(200).collect();
            return Err(BridgeError::from_status(status, page));
        }
    };
    if !resp.ok {
        let description = resp.description.unwrap_or_else(|| "未知错误".to_string());
        return Err(BridgeError::from_status(resp.error_code.unwrap_or(status), description));
    }
    resp.result
        .ok_or_else(|| BridgeError::permanent(format!("{} 没有返回结果", method)))
}

fn base_form(chat_id: &str, reply_to: Option<i64>) -> Form {
    let form = Form::new().text("chat_id", chat_id.to_string());
    match reply_to {
        Some(parent) => form
            .text("reply_to_message_id", parent.to_string())
            .text("allow_sending_without_reply", "true"),
        None => form,
    }
}

fn file_part(file: &RawFile) -> Part {
    Part::bytes(file.data.to_vec()).file_name(file.name.clone())
}

/// 需要直接上传的文件
#[derive(Debug, Clone)]
struct RawFile {
    name: String,
    data: Arc<Vec<u8>>,
}

/// 一次发送拆分成的 Bot API 请求
#[derive(Debug)]
enum TgRequest {
    Text(String),
    Document { file: RawFile, caption: String },
    MediaGroup { files: Vec<RawFile>, caption: String },
}

/// # 规划一条消息的发送请求
/// 没有文件时发送文本; 文件作为文档发送, 正文放在说明文字里。
/// 通常只有一个请求, 正文超过说明文字上限或文件超过一组的数量时才会拆分。
fn plan_send(msg: &Message, html: bool) -> Vec<TgRequest> {
    let raw: Vec<RawFile> = msg
        .files()
        .filter(|file| file.url.is_empty())
        .filter_map(|file| {
            Some(RawFile {
                name: file.name.clone(),
                data: file.data.clone()?,
            })
        })
        .collect();
    if raw.is_empty() {
        return vec![TgRequest::Text(format_text(msg, html))];
    }

    let body = if msg.text.is_empty() {
        msg.files()
            .filter(|file| file.url.is_empty())
            .map(|file| file.comment.as_str())
            .find(|comment| !comment.is_empty())
            .unwrap_or_default()
    } else {
        msg.text.as_str()
    };
    let text = compose(msg, body, html);
    let mut requests = vec![];
    let mut caption = if text.chars().count() <= CAPTION_LIMIT {
        text
    } else {
        requests.push(TgRequest::Text(text));
        String::new()
    };
    for chunk in raw.chunks(MEDIA_GROUP_LIMIT) {
        let caption = std::mem::take(&mut caption);
        match chunk {
            [file] => requests.push(TgRequest::Document {
                file: file.clone(),
                caption,
            }),
            files => requests.push(TgRequest::MediaGroup {
                files: files.to_vec(),
                caption,
            }),
        }
    }
    requests
}

struct TgInner {
    ctx: BridgeContext,
    api: OnceCell<TgApi>,
}

pub struct TelegramBridge {
    inner: Arc<TgInner>,
}

impl TelegramBridge {
    pub fn new(ctx: BridgeContext) -> Self {
        TelegramBridge {
            inner: Arc::new(TgInner {
                ctx,
                api: OnceCell::new(),
            }),
        }
    }

    fn api(&self) -> BridgeResult<&TgApi> {
        self.inner
            .api
            .get()
            .ok_or_else(|| BridgeError::transient("[TG] 还没有连接"))
    }
}

impl TgInner {
    /// 长轮询, 出错时指数退避
    #[instrument(name = "bridge_tg_recv", skip_all, fields(account = %self.ctx.account))]
    async fn poll_loop(self: Arc<Self>) {
        let Some(api) = self.api.get() else {
            return;
        };
        let mut offset: Option<i64> = None;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        loop {
            let mut body = json!({
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "edited_message", "channel_post", "edited_channel_post"],
            });
            if let Some(offset) = offset {
                body["offset"] = json!(offset);
            }
            let result = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    tracing::info!("[TG] 停止接收消息");
                    return;
                }
                result = api.call::<Vec<TgUpdate>>("getUpdates", body) => result,
            };
            match result {
                Ok(updates) => {
                    backoff_ms = INITIAL_BACKOFF_MS;
                    for update in updates {
                        offset = Some(update.update_id.saturating_add(1));
                        self.handle_update(api, update).await;
                    }
                }
                Err(err) => {
                    tracing::warn!("[TG] 获取消息失败, {}ms 后重试: {}", backoff_ms, err);
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn handle_update(&self, api: &TgApi, update: TgUpdate) {
        let (tg_msg, edited) = match update {
            TgUpdate { message: Some(msg), .. } | TgUpdate { channel_post: Some(msg), .. } => (msg, false),
            TgUpdate { edited_message: Some(msg), .. }
            | TgUpdate {
                edited_channel_post: Some(msg),
                ..
            } => (msg, true),
            _ => return,
        };
        if tg_msg.from.as_ref().map_or(false, |user| user.is_bot) {
            return;
        }
        let Some(mut msg) = to_message(&tg_msg, edited) else {
            return;
        };
        tracing::debug!("[TG] 收到 {} 的消息: {}", msg.username, msg.text);
        if !edited {
            self.attach_files(api, &tg_msg, &mut msg).await;
        }
        if let Some(user) = &tg_msg.from {
            let user_id = user.id;
            let api = api.clone();
            spawn_avatar_download(&self.ctx, &msg.channel, &msg.user_id, async move {
                Ok(api.avatar_url(user_id).await?)
            });
        }
        self.ctx.client.send(msg);
    }

    /// 下载图片和文件
    async fn attach_files(&self, api: &TgApi, tg_msg: &TgMessage, msg: &mut Message) {
        let mut files: Vec<(String, String, u64)> = vec![];
        if let Some(photo) = tg_msg.photo.as_ref().and_then(|sizes| sizes.last()) {
            files.push((
                photo.file_id.clone(),
                format!("{}.jpg", photo.file_unique_id),
                photo.file_size.unwrap_or(0),
            ));
        }
        if let Some(doc) = &tg_msg.document {
            files.push((
                doc.file_id.clone(),
                doc.file_name.clone().unwrap_or_else(|| doc.file_id.clone()),
                doc.file_size.unwrap_or(0),
            ));
        }
        let limit = self.ctx.general.media_download_size;
        let caption = tg_msg.caption.clone().unwrap_or_default();
        for (file_id, name, size) in files {
            if api.insecure_url {
                msg.push_file(FileInfo {
                    name,
                    comment: caption.clone(),
                    size,
                    native_id: file_id,
                    ..Default::default()
                });
                continue;
            }
            if !handle_download_size(msg, &name, size, limit) {
                continue;
            }
            let url = match api.file_url(&file_id).await {
                Ok(Some(url)) => url,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!("[TG] 获取文件 {} 失败: {}", name, err);
                    continue;
                }
            };
            match download_file(&url).await {
                // 链接中带有 token, 不能转发出去
                Ok(data) => {
                    handle_download_data(msg, &name, &caption, "", data);
                    if let Some(file) = msg.files_mut().last() {
                        file.native_id = file_id;
                    }
                }
                Err(err) => tracing::error!("[TG] 下载文件 {} 失败: {:?}", name, err),
            }
        }
    }
}

/// 平台消息转换为桥消息, 不处理附件
fn to_message(tg_msg: &TgMessage, edited: bool) -> Option<Message> {
    let mut msg = Message {
        channel: tg_msg.chat.id.to_string(),
        id: tg_msg.message_id.to_string(),
        text: tg_msg
            .text
            .clone()
            .or_else(|| tg_msg.caption.clone())
            .unwrap_or_default(),
        timestamp: Utc
            .timestamp_opt(tg_msg.date, 0)
            .single()
            .unwrap_or_else(Utc::now),
        ..Default::default()
    };
    if let Some(user) = &tg_msg.from {
        msg.user_id = user.id.to_string();
        msg.username = user.display_name();
    }
    if let Some(reply) = &tg_msg.reply_to_message {
        msg.parent_id = reply.message_id.to_string();
    }
    if edited {
        msg.event = Event::Edit;
    } else if let Some(members) = &tg_msg.new_chat_members {
        let names: Vec<String> = members.iter().map(TgUser::display_name).collect();
        msg.event = Event::JoinLeave;
        msg.text = format!("{} 加入了群组", names.join(", "));
    } else if let Some(member) = &tg_msg.left_chat_member {
        msg.event = Event::JoinLeave;
        msg.text = format!("{} 离开了群组", member.display_name());
    } else if let Some(title) = &tg_msg.new_chat_title {
        msg.event = Event::TopicChange;
        msg.text = format!("群组名称修改为 {}", title);
    }
    Some(msg)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// 发送的文本: 用户名 + 内容 + 已上传附件的链接
fn format_text(msg: &Message, html: bool) -> String {
    compose(msg, &msg.text, html)
}

fn compose(msg: &Message, body: &str, html: bool) -> String {
    let mut text = if html {
        format!("<b>{}</b>{}", escape_html(&msg.username), escape_html(body))
    } else {
        format!("{}{}", msg.username, body)
    };
    for file in msg.files().filter(|file| !file.url.is_empty()) {
        text.push('\n');
        if html {
            text.push_str(&escape_html(&file.url));
        } else {
            text.push_str(&file.url);
        }
    }
    text
}

#[async_trait]
impl Bridger for TelegramBridge {
    async fn connect(&self, config: &BridgeConfig) -> BridgeResult<()> {
        tracing::info!("[TG] 初始化TG桥 {}", self.inner.ctx.account);
        let api = self
            .inner
            .api
            .get_or_try_init(|| async { TgApi::new(config) })
            .await?;
        let me: TgUser = api
            .call("getMe", json!({}))
            .await
            .map_err(|err| BridgeError::connect(format!("[TG] 验证 Token 失败: {}", err)))?;
        tracing::info!("[TG] 机器人 {} 已登录", me.display_name());
        tokio::spawn(self.inner.clone().poll_loop());
        Ok(())
    }

    async fn send(&self, msg: &Message) -> BridgeResult<String> {
        self.api()?.send(msg).await
    }

    async fn edit_message(&self, remote_id: &str, msg: &Message) -> BridgeResult<()> {
        self.api()?.edit(remote_id, msg).await
    }

    async fn delete_message(&self, channel: &str, remote_id: &str) -> BridgeResult<()> {
        let api = self.api()?;
        let message_id: i64 = remote_id
            .parse()
            .map_err(|_| BridgeError::permanent(format!("无效的消息id: {}", remote_id)))?;
        let _: bool = api
            .call("deleteMessage", json!({ "chat_id": channel, "message_id": message_id }))
            .await?;
        Ok(())
    }

    async fn get_file_direct_url(&self, id: &str) -> Option<String> {
        let api = self.api().ok()?;
        match api.file_url(id).await {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!("[TG] 获取文件链接失败: {}", err);
                None
            }
        }
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        tracing::info!("[TG] {} 断开连接", self.inner.ctx.account);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::GeneralConfig;
    use crate::gateway::retry::RetryPolicy;

    fn tg_message(json: serde_json::Value) -> TgMessage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn plain_message() {
        let tg = tg_message(json!({
            "message_id": 7,
            "date": 1700000000,
            "chat": {"id": -100123},
            "from": {"id": 42, "is_bot": false, "first_name": "Bob", "last_name": "Lee"},
            "text": "hi",
            "reply_to_message": {"message_id": 5, "chat": {"id": -100123}}
        }));
        let msg = to_message(&tg, false).unwrap();
        assert_eq!(msg.channel, "-100123");
        assert_eq!(msg.id, "7");
        assert_eq!(msg.user_id, "42");
        assert_eq!(msg.username, "Bob Lee");
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.parent_id, "5");
        assert_eq!(msg.event, Event::Post);
        assert_eq!(msg.timestamp.timestamp(), 1700000000);
    }

    #[test]
    fn edited_and_join_events() {
        let tg = tg_message(json!({
            "message_id": 7,
            "chat": {"id": 1},
            "from": {"id": 42, "first_name": "Bob", "username": "bob"},
            "text": "fixed"
        }));
        let msg = to_message(&tg, true).unwrap();
        assert_eq!(msg.event, Event::Edit);
        assert_eq!(msg.username, "bob");

        let tg = tg_message(json!({
            "message_id": 8,
            "chat": {"id": 1},
            "new_chat_members": [{"id": 43, "first_name": "Ann"}]
        }));
        let msg = to_message(&tg, false).unwrap();
        assert_eq!(msg.event, Event::JoinLeave);
        assert!(msg.text.contains("Ann"));
    }

    #[test]
    fn caption_becomes_text() {
        let tg = tg_message(json!({
            "message_id": 9,
            "chat": {"id": 1},
            "caption": "look",
            "photo": [{"file_id": "f1", "file_unique_id": "u1", "file_size": 10}]
        }));
        assert_eq!(to_message(&tg, false).unwrap().text, "look");
    }

    #[test]
    fn text_formatting() {
        let mut msg = Message::text("1", "<bob> ", "a & b");
        assert_eq!(format_text(&msg, false), "<bob> a & b");
        assert_eq!(format_text(&msg, true), "<b>&lt;bob&gt; </b>a &amp; b");

        msg.push_file(FileInfo {
            name: "a.png".to_string(),
            url: "https://media/abc/a.png".to_string(),
            ..Default::default()
        });
        assert_eq!(format_text(&msg, false), "<bob> a & b\nhttps://media/abc/a.png");
    }

    #[test]
    fn api_urls() {
        let config = BridgeConfig {
            token: "123:abc".to_string(),
            server: "http://localhost:8081/".to_string(),
            message_format: "HTML".to_string(),
            ..Default::default()
        };
        let api = TgApi::new(&config).unwrap();
        assert_eq!(api.base, "http://localhost:8081/bot123:abc");
        assert_eq!(api.file_base, "http://localhost:8081/file/bot123:abc");
        assert!(api.html);
        assert!(TgApi::new(&BridgeConfig::default()).is_err());
    }

    #[test]
    fn error_response_is_classified() {
        let body = json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 5"
        })
        .to_string();
        let err = decode::<TgSentMessage>("sendMessage", 429, body.as_bytes()).unwrap_err();
        assert!(err.is_transient());

        let body = json!({"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}).to_string();
        let err = decode::<TgSentMessage>("sendMessage", 400, body.as_bytes()).unwrap_err();
        assert!(!err.is_transient());

        let body = json!({"ok": true, "result": {"message_id": 3}}).to_string();
        let sent = decode::<TgSentMessage>("sendMessage", 200, body.as_bytes()).unwrap();
        assert_eq!(sent.message_id, 3);
    }

    #[test]
    fn error_page_uses_http_status() {
        let err = decode::<TgSentMessage>("sendMessage", 502, b"<html>502 Bad Gateway</html>").unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("502"));

        let err = decode::<TgSentMessage>("sendMessage", 403, b"<html>Forbidden</html>").unwrap_err();
        assert!(!err.is_transient());
        // 状态正常但内容无法解析
        let err = decode::<TgSentMessage>("sendMessage", 200, b"not json").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn text_only_is_one_message() {
        let msg = Message::text("1", "bob: ", "hi");
        let requests = plan_send(&msg, false);
        assert_eq!(requests.len(), 1);
        assert!(matches!(&requests[0], TgRequest::Text(text) if text == "bob: hi"));
    }

    #[test]
    fn single_file_carries_text_as_caption() {
        let mut msg = Message::text("1", "bob: ", "look");
        msg.push_file(FileInfo {
            name: "b.png".to_string(),
            url: "https://media/abc/b.png".to_string(),
            ..Default::default()
        });
        msg.push_file(FileInfo::with_data("a.txt", b"hello".to_vec()));
        let requests = plan_send(&msg, false);
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            TgRequest::Document { file, caption } => {
                assert_eq!(file.name, "a.txt");
                assert_eq!(caption, "bob: look\nhttps://media/abc/b.png");
            }
            other => panic!("unexpected request: {:?}", other),
        }

        // 没有正文时使用文件的说明
        let mut msg = Message::text("1", "bob: ", "");
        let mut file = FileInfo::with_data("a.txt", b"hello".to_vec());
        file.comment = "notes".to_string();
        msg.push_file(file);
        assert!(matches!(
            &plan_send(&msg, false)[0],
            TgRequest::Document { caption, .. } if caption == "bob: notes"
        ));
    }

    #[test]
    fn several_files_become_one_group() {
        let mut msg = Message::text("1", "bob: ", "album");
        for i in 0..3 {
            msg.push_file(FileInfo::with_data(&format!("{i}.txt"), vec![i]));
        }
        let requests = plan_send(&msg, false);
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            &requests[0],
            TgRequest::MediaGroup { files, caption } if files.len() == 3 && caption == "bob: album"
        ));

        // 超过一组的上限时拆分, 说明文字只出现一次
        let mut msg = Message::text("1", "bob: ", "many");
        for i in 0..11 {
            msg.push_file(FileInfo::with_data(&format!("{i}.txt"), vec![i]));
        }
        let requests = plan_send(&msg, false);
        assert_eq!(requests.len(), 2);
        assert!(matches!(&requests[0], TgRequest::MediaGroup { files, caption } if files.len() == 10 && caption == "bob: many"));
        assert!(matches!(&requests[1], TgRequest::Document { caption, .. } if caption.is_empty()));
    }

    #[test]
    fn long_text_is_sent_before_files() {
        let mut msg = Message::text("1", "bob: ", &"x".repeat(CAPTION_LIMIT + 1));
        msg.push_file(FileInfo::with_data("a.txt", b"hello".to_vec()));
        let requests = plan_send(&msg, false);
        assert_eq!(requests.len(), 2);
        assert!(matches!(&requests[0], TgRequest::Text(_)));
        assert!(matches!(&requests[1], TgRequest::Document { caption, .. } if caption.is_empty()));
    }

    type Calls = Arc<std::sync::Mutex<HashMap<String, usize>>>;

    /// 本地的 Bot API: 第一次 sendDocument 被限流, getMe 总是返回网关错误页面
    async fn bot_api(State(calls): State<Calls>, Path(method): Path<String>) -> (StatusCode, String) {
        let count = {
            let mut calls = calls.lock().unwrap();
            let count = calls.entry(method.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match (method.as_str(), count) {
            ("sendDocument", 1) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({"ok": false, "error_code": 429, "description": "Too Many Requests: retry after 1"}).to_string(),
            ),
            ("getMe", _) => (StatusCode::BAD_GATEWAY, "<html>502 Bad Gateway</html>".to_string()),
            (_, count) => (
                StatusCode::OK,
                json!({"ok": true, "result": {"message_id": 100 + count}}).to_string(),
            ),
        }
    }

    async fn local_bot_api() -> (TgApi, Calls) {
        let calls = Calls::default();
        let app = axum::Router::new()
            .route("/botTOKEN/:method", post(bot_api))
            .with_state(calls.clone());
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        let config = BridgeConfig {
            token: "TOKEN".to_string(),
            server: format!("http://{}", addr),
            ..Default::default()
        };
        (TgApi::new(&config).unwrap(), calls)
    }

    #[tokio::test]
    async fn retried_send_uploads_file_once_per_attempt() {
        let (api, calls) = local_bot_api().await;
        let mut msg = Message::text("1", "bob: ", "look");
        msg.push_file(FileInfo::with_data("a.txt", b"hello".to_vec()));
        let policy = RetryPolicy::from_config(&GeneralConfig {
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..Default::default()
        });

        let id = policy
            .run("[TG] 发送", &CancellationToken::new(), || api.send(&msg))
            .await
            .unwrap();
        assert_eq!(id, "102");
        let calls = calls.lock().unwrap();
        // 第一次被限流, 第二次成功; 正文随文件发送
        assert_eq!(calls.get("sendDocument"), Some(&2));
        assert_eq!(calls.get("sendMessage"), None);
    }

    #[tokio::test]
    async fn bad_gateway_page_is_transient() {
        let (api, _calls) = local_bot_api().await;
        let err = api.call::<TgUser>("getMe", json!({})).await.unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }
}
