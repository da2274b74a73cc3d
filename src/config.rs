//! 配置文件
//!
//! `.toml` 用 toml 解析, 其它后缀按 json 解析。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("配置文件格式错误 {path}: {message}")]
    Parse { path: String, message: String },
    #[error("账号 '{0}' 格式错误, 应为 <协议>.<名称>")]
    InvalidAccount(String),
    #[error("网关 '{gateway}' 引用了未配置的桥 '{account}'")]
    UnknownAccount { gateway: String, account: String },
    #[error("协议 '{0}' 没有对应的桥实现")]
    UnknownProtocol(String),
    #[error("存在同名网关: {0}")]
    DuplicateGateway(String),
    #[error("网关 '{0}' 没有配置任何频道")]
    EmptyGateway(String),
    #[error("{field} 不是有效的地址 '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("媒体存储初始化失败: {0}")]
    Media(String),
    #[error("{account} 的正则 '{pattern}' 无效: {source}")]
    Regex {
        account: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default, rename = "gateway")]
    pub gateways: Vec<GatewayConfig>,
    /// `[<protocol>.<name>]` 桥实例配置
    #[serde(flatten)]
    pub protocols: HashMap<String, HashMap<String, BridgeConfig>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_toml = path.extension().map_or(false, |ext| ext == "toml");
        Self::parse(&file, is_toml).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn parse(content: &str, is_toml: bool) -> Result<Self, String> {
        if is_toml {
            toml::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(content).map_err(|e| e.to_string())
        }
    }

    /// 根据账号查询桥配置
    pub fn bridge(&self, account: &str) -> Option<&BridgeConfig> {
        let (protocol, name) = split_account(account)?;
        self.protocols.get(protocol)?.get(name)
    }

    /// 启用的网关
    pub fn enabled_gateways(&self) -> impl Iterator<Item = &GatewayConfig> {
        self.gateways.iter().filter(|gw| gw.enable)
    }

    /// # 校验配置
    /// ### Arguments
    /// - `has_protocol` 判断协议是否有对应的桥实现
    /// ### Return
    /// 每个启用网关引用到的桥的规则
    pub fn validate(
        &self,
        has_protocol: impl Fn(&str) -> bool,
    ) -> Result<HashMap<String, BridgeRules>, ConfigError> {
        self.general.validate()?;
        let mut names = HashSet::new();
        let mut rules = HashMap::new();
        for gateway in self.enabled_gateways() {
            if !names.insert(gateway.name.as_str()) {
                return Err(ConfigError::DuplicateGateway(gateway.name.clone()));
            }
            if gateway.entries().next().is_none() {
                return Err(ConfigError::EmptyGateway(gateway.name.clone()));
            }
            for (entry, _) in gateway.entries() {
                let (protocol, _) = split_account(&entry.account)
                    .ok_or_else(|| ConfigError::InvalidAccount(entry.account.clone()))?;
                let bridge = self
                    .bridge(&entry.account)
                    .ok_or_else(|| ConfigError::UnknownAccount {
                        gateway: gateway.name.clone(),
                        account: entry.account.clone(),
                    })?;
                if !has_protocol(protocol) {
                    return Err(ConfigError::UnknownProtocol(protocol.to_string()));
                }
                if !rules.contains_key(&entry.account) {
                    rules.insert(entry.account.clone(), bridge.compile(&entry.account)?);
                }
            }
        }
        Ok(rules)
    }
}

/// 拆分账号 `telegram.main` => (`telegram`, `main`)
pub fn split_account(account: &str) -> Option<(&str, &str)> {
    let (protocol, name) = account.split_once('.')?;
    if protocol.is_empty() || name.is_empty() {
        return None;
    }
    Some((protocol, name))
}

/// `[general]`
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, rename_all = "PascalCase")]
pub struct GeneralConfig {
    pub remote_nick_format: String,
    pub strip_nick: bool,
    pub preserve_threading: bool,
    #[serde(rename = "IconURL")]
    pub icon_url: String,
    /// 媒体服务器上传地址 (PUT)
    pub media_server_upload: String,
    /// 本地媒体目录, 与 MediaServerUpload 二选一
    pub media_download_path: String,
    /// 上传后对外的下载地址前缀
    pub media_server_download: String,
    /// 下载附件的大小上限 (字节)
    pub media_download_size: u64,
    /// 头像变化后是否重新上传; false 时首次上传后永久缓存
    pub avatar_reupload_on_change: bool,
    pub retry_max: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    /// 0.0 ~ 1.0, 退避时间的随机浮动比例
    pub retry_jitter: f64,
    pub message_map_size: usize,
    #[serde(rename = "MessageMapTTLSecs")]
    pub message_map_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            remote_nick_format: String::new(),
            strip_nick: false,
            preserve_threading: false,
            icon_url: String::new(),
            media_server_upload: String::new(),
            media_download_path: String::new(),
            media_server_download: String::new(),
            media_download_size: 1_000_000,
            avatar_reupload_on_change: false,
            retry_max: 3,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            retry_multiplier: 2.0,
            retry_jitter: 0.2,
            message_map_size: 5000,
            message_map_ttl_secs: 24 * 60 * 60,
            shutdown_grace_secs: 10,
            log_dir: "./logs".to_string(),
        }
    }
}

impl GeneralConfig {
    /// 媒体服务器地址必须能解析
    fn validate(&self) -> Result<(), ConfigError> {
        let urls = [
            ("MediaServerUpload", &self.media_server_upload),
            ("MediaServerDownload", &self.media_server_download),
        ];
        for (field, value) in urls {
            if value.is_empty() {
                continue;
            }
            url::Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// `[<protocol>.<name>]` 单个桥实例的配置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "PascalCase")]
pub struct BridgeConfig {
    pub token: String,
    pub server: String,
    pub bind_address: String,
    /// api 桥的消息缓冲区大小
    pub buffer: usize,
    /// 消息格式: "HTML" / "Markdown" / 空为纯文本
    pub message_format: String,
    pub label: String,
    pub remote_nick_format: String,
    /// 空格分隔
    pub ignore_nicks: String,
    /// 空格分隔的正则
    pub ignore_messages: String,
    pub replace_messages: Vec<(String, String)>,
    pub replace_nicks: Vec<(String, String)>,
    pub show_join_part: bool,
    pub show_topic_change: bool,
    pub strip_nick: bool,
    pub preserve_threading: bool,
    #[serde(rename = "IconURL")]
    pub icon_url: String,
    /// discord 通过 webhook 发送, 可以显示远端用户的名字和头像
    #[serde(rename = "WebhookURL")]
    pub webhook_url: String,
    /// telegram 不下载文件, 直接转发带 token 的文件链接
    #[serde(rename = "UseInsecureURL")]
    pub use_insecure_url: bool,
    pub edit_suffix: String,
    pub edit_disable: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            token: String::new(),
            server: String::new(),
            bind_address: String::new(),
            buffer: 1000,
            message_format: String::new(),
            label: String::new(),
            remote_nick_format: String::new(),
            ignore_nicks: String::new(),
            ignore_messages: String::new(),
            replace_messages: vec![],
            replace_nicks: vec![],
            show_join_part: false,
            show_topic_change: false,
            strip_nick: false,
            preserve_threading: false,
            icon_url: String::new(),
            webhook_url: String::new(),
            use_insecure_url: false,
            edit_suffix: String::new(),
            edit_disable: false,
        }
    }
}

impl BridgeConfig {
    /// 启动时编译正则, 之后每条消息复用
    pub fn compile(&self, account: &str) -> Result<BridgeRules, ConfigError> {
        let regex = |pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::Regex {
                account: account.to_string(),
                pattern: pattern.to_string(),
                source,
            })
        };
        let mut rules = BridgeRules {
            ignore_nicks: self
                .ignore_nicks
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ..Default::default()
        };
        for pattern in self.ignore_messages.split_whitespace() {
            rules.ignore_messages.push(regex(pattern)?);
        }
        for (search, replace) in &self.replace_messages {
            rules.replace_messages.push((regex(search)?, replace.clone()));
        }
        for (search, replace) in &self.replace_nicks {
            rules.replace_nicks.push((regex(search)?, replace.clone()));
        }
        Ok(rules)
    }
}

/// 编译后的过滤/替换规则
#[derive(Debug, Clone, Default)]
pub struct BridgeRules {
    pub ignore_nicks: Vec<String>,
    pub ignore_messages: Vec<Regex>,
    pub replace_messages: Vec<(Regex, String)>,
    pub replace_nicks: Vec<(Regex, String)>,
}

/// `[[gateway]]`
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    #[serde(default = "enable_by_default")]
    pub enable: bool,
    #[serde(default, rename = "in")]
    pub inbound: Vec<ChannelEntry>,
    #[serde(default, rename = "out")]
    pub outbound: Vec<ChannelEntry>,
    #[serde(default)]
    pub inout: Vec<ChannelEntry>,
}

fn enable_by_default() -> bool {
    true
}

impl GatewayConfig {
    pub fn entries(&self) -> impl Iterator<Item = (&ChannelEntry, Direction)> {
        self.inbound
            .iter()
            .map(|entry| (entry, Direction::In))
            .chain(self.outbound.iter().map(|entry| (entry, Direction::Out)))
            .chain(self.inout.iter().map(|entry| (entry, Direction::InOut)))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub account: String,
    pub channel: String,
}

/// 频道在网关中的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    /// 该频道的消息可以进入网关
    pub fn is_in(&self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    /// 网关的消息可以发往该频道
    pub fn is_out(&self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }

    /// 同一频道在网关中出现多次时合并方向
    pub fn merge(self, other: Direction) -> Direction {
        if self == other {
            self
        } else {
            Direction::InOut
        }
    }
}
