//! 各个桥共用的工具: 下载文件, 附件大小检查, 头像下载

use std::future::Future;
use std::time::Duration;

use lazy_static::lazy_static;

use super::{BridgeContext, Event, ExtraPayload, FileFailure, FileInfo, Message, EXTRA_FILE_FAILURE_SIZE};

lazy_static! {
    static ref HTTP: reqwest::Client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default();
}

/// 下载文件到内存
pub async fn download_file(url: &str) -> anyhow::Result<Vec<u8>> {
    let response = HTTP.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

/// # 检查附件大小
/// 超过 `MediaDownloadSize` 时把消息标记为 `FileFailureSize` 并记录文件信息。
/// ### Return
/// 可以下载时返回 true
pub fn handle_download_size(msg: &mut Message, name: &str, size: u64, limit: u64) -> bool {
    if size <= limit {
        return true;
    }
    tracing::info!("[{}] 文件 {} 大小 {} 超过限制 {}, 不下载", msg.account, name, size, limit);
    msg.event = Event::FileFailureSize;
    msg.push_extra(
        EXTRA_FILE_FAILURE_SIZE,
        ExtraPayload::FileFailure(FileFailure {
            name: name.to_string(),
            size,
            limit,
        }),
    );
    false
}

/// 把下载好的文件附加到消息
pub fn handle_download_data(msg: &mut Message, name: &str, comment: &str, url: &str, data: Vec<u8>) {
    let mut file = FileInfo::with_data(name, data);
    file.comment = comment.to_string();
    file.url = url.to_string();
    msg.push_file(file);
}

/// 头像消息, 交给路由上传
pub fn avatar_message(channel: &str, user_id: &str, data: Vec<u8>) -> Message {
    let mut msg = Message {
        channel: channel.to_string(),
        user_id: user_id.to_string(),
        event: Event::AvatarDownload,
        ..Default::default()
    };
    let mut file = FileInfo::with_data(&format!("{user_id}.png"), data);
    file.avatar = true;
    msg.push_file(file);
    msg
}

/// # 后台下载用户头像
/// 缓存中已有该用户的头像 (或正在下载) 时什么都不做, 不阻塞消息接收。
/// ### Arguments
/// - `resolve` 查询头像链接; 用户没有头像时返回 None
pub fn spawn_avatar_download<F>(ctx: &BridgeContext, channel: &str, user_id: &str, resolve: F)
where
    F: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    if user_id.is_empty() || !ctx.avatars.claim_download(user_id) {
        return;
    }
    let client = ctx.client.clone();
    let limit = ctx.general.media_download_size;
    let channel = channel.to_string();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        let url = match resolve.await {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("[{}] 查询用户 {} 的头像失败: {:?}", client.account, user_id, err);
                return;
            }
        };
        match download_file(&url).await {
            Ok(data) if data.len() as u64 > limit => {
                tracing::info!("[{}] 用户 {} 的头像过大, 跳过", client.account, user_id);
            }
            Ok(data) => {
                client.send(avatar_message(&channel, &user_id, data));
            }
            Err(err) => {
                tracing::warn!("[{}] 下载用户 {} 的头像失败: {:?}", client.account, user_id, err);
            }
        }
    });
}
