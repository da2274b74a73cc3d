//! 路由
//!
//! 所有桥把消息投递到同一个队列, 路由逐条处理:
//! 校验来源 -> 改写 -> 上传附件/头像 -> 按网关配置分发到目标频道。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Bridge, BridgeClient, BridgeContext, BridgeFactory, ChannelKey, Event, Message};
use crate::config::{split_account, Config, ConfigError, GeneralConfig};

pub mod avatar_cache;
pub mod dispatch;
pub mod media;
pub mod message_map;
pub mod retry;
pub mod route;

use avatar_cache::{AvatarCache, AvatarEntry};
use dispatch::{Delivery, Dispatcher};
use media::Media;
use message_map::MessageIdMap;
use retry::RetryPolicy;
use route::Gateway;

/// 桥连接失败后的重连间隔
const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// 一条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// 被忽略
    Ignored(&'static str),
    /// 头像已缓存, 不分发
    Avatar,
    /// 编辑/删除找不到原消息的投递记录
    CorrelationMiss,
    /// 已交给这些目标
    Routed(Vec<ChannelKey>),
}

pub struct Router {
    general: Arc<GeneralConfig>,
    gateways: Vec<Gateway>,
    bridges: HashMap<String, Arc<Bridge>>,
    message_map: Arc<MessageIdMap>,
    media: Option<Media>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Router {
    /// # 根据配置创建路由和所有桥
    /// ### Arguments
    /// - `factories` 协议 => 桥的构造函数
    /// ### Return
    /// 路由和桥消息的接收端
    pub fn new(
        config: &Config,
        factories: &HashMap<String, BridgeFactory>,
        shutdown: CancellationToken,
    ) -> Result<(Router, mpsc::UnboundedReceiver<Message>), ConfigError> {
        let mut rules = config.validate(|protocol| factories.contains_key(protocol))?;
        let general = Arc::new(config.general.clone());
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut bridges = HashMap::new();
        let mut accounts: Vec<String> = rules.keys().cloned().collect();
        accounts.sort();
        for account in accounts {
            let (protocol, name) =
                split_account(&account).ok_or_else(|| ConfigError::InvalidAccount(account.clone()))?;
            let factory = factories
                .get(protocol)
                .ok_or_else(|| ConfigError::UnknownProtocol(protocol.to_string()))?;
            let bridge_config = config
                .bridge(&account)
                .cloned()
                .ok_or_else(|| ConfigError::InvalidAccount(account.clone()))?;
            let avatars = Arc::new(AvatarCache::new(&account, general.avatar_reupload_on_change));
            let bridger = factory(BridgeContext {
                account: account.clone(),
                protocol: protocol.to_string(),
                general: general.clone(),
                client: BridgeClient::new(&account, protocol, sender.clone()),
                avatars: avatars.clone(),
                shutdown: shutdown.child_token(),
            });
            tracing::info!("创建桥 {}", account);
            let bridge = Bridge {
                account: account.clone(),
                protocol: protocol.to_string(),
                name: name.to_string(),
                config: bridge_config,
                rules: rules.remove(&account).unwrap_or_default(),
                avatars,
                bridger,
            };
            bridges.insert(account, Arc::new(bridge));
        }

        let gateways: Vec<Gateway> = config.enabled_gateways().map(Gateway::new).collect();
        let message_map = Arc::new(MessageIdMap::new(
            general.message_map_size,
            Duration::from_secs(general.message_map_ttl_secs),
        ));
        let media = Media::from_config(&general).map_err(|err| ConfigError::Media(format!("{:#}", err)))?;
        let dispatcher = Dispatcher::new(
            message_map.clone(),
            RetryPolicy::from_config(&general),
            shutdown.clone(),
        );
        let router = Router {
            general,
            gateways,
            bridges,
            message_map,
            media,
            dispatcher,
            shutdown,
        };
        Ok((router, receiver))
    }

    /// 替换媒体存储
    #[cfg(test)]
    pub fn with_media(mut self, media: Option<Media>) -> Self {
        self.media = media;
        self
    }

    #[cfg(test)]
    pub fn message_map(&self) -> &MessageIdMap {
        &self.message_map
    }

    #[cfg(test)]
    pub fn bridge(&self, account: &str) -> Option<&Arc<Bridge>> {
        self.bridges.get(account)
    }

    /// 每个桥在独立任务中连接, 连接失败只影响自己
    pub fn start(&self) {
        for bridge in self.bridges.values() {
            let mut channels: Vec<String> = self
                .gateways
                .iter()
                .flat_map(|gateway| gateway.channels_of(&bridge.account))
                .map(str::to_string)
                .collect();
            channels.sort();
            channels.dedup();
            tokio::spawn(supervise(bridge.clone(), channels, self.shutdown.clone()));
        }
    }

    /// # 处理队列中的消息, 直到收到关闭信号或队列关闭
    /// 退出前等待正在投递的消息, 然后断开所有桥。
    pub async fn run(&self, mut receiver: mpsc::UnboundedReceiver<Message>) {
        tracing::info!("路由启动, 网关数量: {}", self.gateways.len());
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = receiver.recv() => match msg {
                    Some(msg) => {
                        self.process(msg).await;
                    }
                    None => break,
                },
            }
        }
        receiver.close();
        self.stop().await;
    }

    async fn stop(&self) {
        let grace = Duration::from_secs(self.general.shutdown_grace_secs);
        self.dispatcher.drain(grace).await;
        for bridge in self.bridges.values() {
            if let Err(err) = bridge.bridger.disconnect().await {
                tracing::warn!("[{}] 断开连接失败: {}", bridge.account, err);
            }
        }
        tracing::info!("路由已停止");
    }

    /// 等待已经分发的消息全部投递完成
    #[cfg(test)]
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// # 处理一条消息
    /// 返回后消息已经交给目标的投递队列, 投递本身异步进行。
    pub async fn process(&self, mut msg: Message) -> Dispatch {
        let Some(origin) = self.bridges.get(&msg.account).cloned() else {
            tracing::warn!("收到未知桥 {} 的消息, 忽略", msg.account);
            return Dispatch::Ignored("未知的桥");
        };
        msg.channel = Bridge::normalize_channel(&msg.account, &msg.channel);

        if msg.event == Event::AvatarDownload {
            self.cache_avatar(&origin, &msg).await;
            return Dispatch::Avatar;
        }
        if let Some(reason) = route::ignore_reason(&origin, &msg) {
            tracing::debug!("[{}] 忽略 {} 的消息: {}", origin.account, msg.username, reason);
            return Dispatch::Ignored(reason);
        }

        msg.text = route::replace_text(&origin, &msg.text);
        if msg.avatar.is_none() {
            msg.avatar = origin.avatars.lookup(&msg.user_id).map(|entry| entry.url);
        }
        if msg.event != Event::Delete {
            self.upload_files(&origin, &mut msg).await;
        }

        let origin_key = ChannelKey::origin(&msg);
        let correlated = msg.event.needs_correlation();
        let mut seen = HashSet::new();
        let mut routed = vec![];
        let mut matched = false;
        for gateway in &self.gateways {
            if origin.is_api() && !msg.gateway.is_empty() && msg.gateway != gateway.name {
                continue;
            }
            if !gateway.accepts(&origin_key) {
                continue;
            }
            let known = if correlated {
                match self
                    .message_map
                    .targets(&gateway.name, &origin_key.account, &msg.id)
                    .await
                {
                    Some(targets) if !targets.is_empty() => Some(targets),
                    _ => continue,
                }
            } else {
                None
            };
            matched = true;

            let mut targets = vec![];
            for target_key in gateway.destinations(&origin_key) {
                if let Some(known) = &known {
                    if !known.contains(target_key) {
                        continue;
                    }
                }
                let Some(target) = self.bridges.get(&target_key.account) else {
                    continue;
                };
                if !route::accepts_event(target, &msg) {
                    continue;
                }
                if !seen.insert(target_key.clone()) {
                    tracing::debug!("[{}] {} 已经在其它网关中投递过, 跳过", gateway.name, target_key);
                    continue;
                }
                targets.push((target_key.clone(), target.clone()));
            }

            if !correlated && !targets.is_empty() {
                let keys: Vec<ChannelKey> = targets.iter().map(|(key, _)| key.clone()).collect();
                self.message_map
                    .open(&gateway.name, &origin_key, &msg.id, &keys)
                    .await;
            }
            for (target_key, target) in targets {
                let message = route::prepare(&self.general, &gateway.name, &origin, &target, &target_key, &msg);
                tracing::debug!(
                    "[{}] {} => {}: {}",
                    gateway.name,
                    origin_key,
                    target_key,
                    message.text
                );
                routed.push(target_key.clone());
                self.dispatcher
                    .dispatch(Delivery {
                        gateway: gateway.name.clone(),
                        origin: origin_key.clone(),
                        origin_id: msg.id.clone(),
                        target: target_key,
                        thread: route::preserve_threading(&self.general, &target),
                        bridge: target,
                        message,
                    })
                    .await;
            }
        }

        if correlated && !matched {
            tracing::warn!(
                "[{}] {} 找不到消息 {} 的投递记录, 丢弃{}",
                origin.account,
                origin_key,
                msg.id,
                msg.event
            );
            return Dispatch::CorrelationMiss;
        }
        Dispatch::Routed(routed)
    }

    /// 附件只上传一次, 之后每个目标和每次重试都复用上传结果
    ///
    /// 没有下载内容的附件向来源桥查询直接链接
    async fn upload_files(&self, origin: &Bridge, msg: &mut Message) {
        for file in msg.files_mut() {
            if file.data.is_none() && file.url.is_empty() && !file.native_id.is_empty() {
                match origin.bridger.get_file_direct_url(&file.native_id).await {
                    Some(url) => file.url = url,
                    None => tracing::warn!("[{}] 文件 {} 没有可用的链接", origin.account, file.name),
                }
                continue;
            }
            let Some(media) = &self.media else {
                continue;
            };
            if let Err(err) = media.upload(file).await {
                tracing::error!("[{}] 上传文件 {} 失败: {:?}", origin.account, file.name, err);
            }
        }
    }

    /// 头像内容没有变化时不重复上传
    async fn cache_avatar(&self, origin: &Bridge, msg: &Message) {
        for file in msg.files().filter(|file| file.avatar) {
            let Some(data) = &file.data else {
                continue;
            };
            let sha = media::short_sha(data);
            if origin.avatars.is_current(&msg.user_id, &sha) {
                tracing::debug!("[{}] 用户 {} 的头像没有变化", origin.account, msg.user_id);
                continue;
            }
            let Some(media) = &self.media else {
                tracing::debug!("[{}] 没有配置媒体服务器, 不缓存头像", origin.account);
                return;
            };
            let mut upload = file.clone();
            match media.upload(&mut upload).await {
                Ok(()) => origin.avatars.store(
                    &msg.user_id,
                    AvatarEntry {
                        sha: upload.sha,
                        url: upload.url,
                    },
                ),
                Err(err) => tracing::error!(
                    "[{}] 上传用户 {} 的头像失败: {:?}",
                    origin.account,
                    msg.user_id,
                    err
                ),
            }
        }
    }
}

/// # 连接桥并加入频道
/// 连接失败按 5s 起翻倍、最多 60s 的间隔重试, 直到成功或关闭。
async fn supervise(bridge: Arc<Bridge>, channels: Vec<String>, shutdown: CancellationToken) {
    let mut delay = RECONNECT_INITIAL;
    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = bridge.bridger.connect(&bridge.config) => result,
        };
        match connected {
            Ok(()) => break,
            Err(err) => {
                tracing::error!("[{}] 连接失败, {:?} 后重试: {}", bridge.account, delay, err);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(RECONNECT_MAX);
            }
        }
    }
    tracing::info!("[{}] 已连接", bridge.account);
    for channel in channels {
        match bridge.bridger.join_channel(&channel).await {
            Ok(()) => tracing::info!("[{}] 加入频道 {}", bridge.account, channel),
            Err(err) => tracing::error!("[{}] 加入频道 {} 失败: {}", bridge.account, channel, err),
        }
    }
}
