//! 网关内的路由规则: 来源/目标频道, 忽略规则, 按目标改写消息

use crate::bridge::{Bridge, ChannelKey, Event, Message};
use crate::config::{Direction, GatewayConfig, GeneralConfig};

/// 一个启用的网关
#[derive(Debug, Clone)]
pub struct Gateway {
    pub name: String,
    /// 按配置顺序, 同一频道只出现一次
    channels: Vec<(ChannelKey, Direction)>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let mut channels: Vec<(ChannelKey, Direction)> = vec![];
        for (entry, direction) in config.entries() {
            let key = ChannelKey::new(
                &entry.account,
                &Bridge::normalize_channel(&entry.account, &entry.channel),
            );
            match channels.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, existing)) => *existing = existing.merge(direction),
                None => channels.push((key, direction)),
            }
        }
        Gateway {
            name: config.name.clone(),
            channels,
        }
    }

    /// 该频道的消息可以进入网关
    pub fn accepts(&self, origin: &ChannelKey) -> bool {
        self.channels
            .iter()
            .any(|(key, direction)| key == origin && direction.is_in())
    }

    /// 消息要发往的频道, 不包括来源频道
    pub fn destinations<'a>(&'a self, origin: &'a ChannelKey) -> impl Iterator<Item = &'a ChannelKey> + 'a {
        self.channels
            .iter()
            .filter(move |(key, direction)| direction.is_out() && key != origin)
            .map(|(key, _)| key)
    }

    /// 桥实例在网关中的频道
    pub fn channels_of<'a>(&'a self, account: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.channels
            .iter()
            .filter(move |(key, _)| key.account == account)
            .map(|(key, _)| key.channel.as_str())
    }
}

/// # 判断来源消息是否应该忽略
/// ### Return
/// 忽略的原因
pub fn ignore_reason(origin: &Bridge, msg: &Message) -> Option<&'static str> {
    if msg.channel.is_empty() {
        return Some("没有频道");
    }
    if msg.event == Event::Delete {
        return None;
    }
    if msg.text.trim().is_empty() && !msg.has_attachments() && msg.event != Event::UserTyping {
        return Some("空消息");
    }
    if msg.event == Event::FileFailureSize && msg.text.trim().is_empty() {
        return Some("文件过大且没有文本");
    }
    if origin.rules.ignore_nicks.iter().any(|nick| *nick == msg.username) {
        return Some("IgnoreNicks");
    }
    if origin
        .rules
        .ignore_messages
        .iter()
        .any(|pattern| pattern.is_match(&msg.text))
    {
        return Some("IgnoreMessages");
    }
    None
}

/// 来源桥的 ReplaceMessages
pub fn replace_text(origin: &Bridge, text: &str) -> String {
    let mut text = text.to_string();
    for (pattern, replace) in &origin.rules.replace_messages {
        text = pattern.replace_all(&text, replace.as_str()).into_owned();
    }
    text
}

/// 目标是否接收该事件
pub fn accepts_event(target: &Bridge, msg: &Message) -> bool {
    match msg.event {
        Event::JoinLeave => target.config.show_join_part,
        Event::TopicChange => target.config.show_topic_change,
        Event::Edit => !target.config.edit_disable,
        _ => true,
    }
}

/// # 用户名改写
/// StripNick, 来源桥的 ReplaceNicks, 再按目标 (或全局) 的 RemoteNickFormat 格式化
pub fn format_username(general: &GeneralConfig, gateway: &str, origin: &Bridge, target: &Bridge, msg: &Message) -> String {
    let mut nick = msg.username.clone();
    if general.strip_nick || origin.config.strip_nick {
        nick.retain(|c| c.is_alphanumeric());
    }
    for (pattern, replace) in &origin.rules.replace_nicks {
        nick = pattern.replace_all(&nick, replace.as_str()).into_owned();
    }
    let format = if target.config.remote_nick_format.is_empty() {
        &general.remote_nick_format
    } else {
        &target.config.remote_nick_format
    };
    if format.is_empty() {
        return nick;
    }
    format
        .replace("{NOPINGNICK}", &no_ping(&nick))
        .replace("{BRIDGE}", &origin.name)
        .replace("{PROTOCOL}", &origin.protocol)
        .replace("{GATEWAY}", gateway)
        .replace("{LABEL}", &origin.config.label)
        .replace("{CHANNEL}", &msg.channel)
        .replace("{NICK}", &nick)
}

/// 第一个字符后插入零宽空格, 避免目标平台提醒同名用户
fn no_ping(nick: &str) -> String {
    let mut chars = nick.chars();
    match chars.next() {
        Some(first) => format!("{}\u{200b}{}", first, chars.as_str()),
        None => String::new(),
    }
}

/// 没有头像时使用 IconURL
pub fn fallback_avatar(general: &GeneralConfig, target: &Bridge, msg: &Message) -> Option<String> {
    let icon = if general.icon_url.is_empty() {
        &target.config.icon_url
    } else {
        &general.icon_url
    };
    if icon.is_empty() {
        return None;
    }
    Some(icon.replace("{NICK}", &msg.username))
}

/// 是否保留回复关系
pub fn preserve_threading(general: &GeneralConfig, target: &Bridge) -> bool {
    general.preserve_threading || target.config.preserve_threading
}

/// # 为目标生成消息
/// 来源的 account/protocol 保留, 频道换成目标频道
pub fn prepare(
    general: &GeneralConfig,
    gateway: &str,
    origin: &Bridge,
    target: &Bridge,
    target_key: &ChannelKey,
    msg: &Message,
) -> Message {
    let mut out = msg.clone();
    out.gateway = gateway.to_string();
    out.channel = target_key.channel.clone();
    out.username = format_username(general, gateway, origin, target, msg);
    if out.avatar.is_none() {
        out.avatar = fallback_avatar(general, target, msg);
    }
    if !preserve_threading(general, target) {
        out.parent_id.clear();
    }
    if msg.event == Event::Edit && !target.config.edit_suffix.is_empty() {
        out.text.push_str(&target.config.edit_suffix);
    }
    out
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::config::{BridgeConfig, ChannelEntry};
    use crate::gateway::avatar_cache::AvatarCache;

    fn bridge(account: &str, config: BridgeConfig) -> Bridge {
        let (protocol, name) = account.split_once('.').unwrap();
        Bridge {
            account: account.to_string(),
            protocol: protocol.to_string(),
            name: name.to_string(),
            rules: config.compile(account).unwrap(),
            config,
            avatars: Arc::new(AvatarCache::new(account, false)),
            bridger: MockBridge::new(account),
        }
    }

    fn entry(account: &str, channel: &str) -> ChannelEntry {
        ChannelEntry {
            account: account.to_string(),
            channel: channel.to_string(),
        }
    }

    #[test]
    fn destinations_exclude_origin_and_inbound_only() {
        let gateway = Gateway::new(&GatewayConfig {
            name: "g1".to_string(),
            enable: true,
            inbound: vec![entry("irc.a", "#A"), entry("api.local", "whatever")],
            outbound: vec![entry("telegram.a", "chat1")],
            inout: vec![entry("discord.a", "ID:1")],
        });
        let irc = ChannelKey::new("irc.a", "#a");
        assert!(gateway.accepts(&irc));
        assert!(gateway.accepts(&ChannelKey::new("api.local", "api")));
        assert!(!gateway.accepts(&ChannelKey::new("telegram.a", "chat1")));

        let targets: Vec<_> = gateway.destinations(&irc).cloned().collect();
        assert_eq!(
            targets,
            vec![ChannelKey::new("telegram.a", "chat1"), ChannelKey::new("discord.a", "1")]
        );
        let discord = ChannelKey::new("discord.a", "1");
        assert_eq!(gateway.destinations(&discord).count(), 1);
        assert_eq!(gateway.channels_of("irc.a").collect::<Vec<_>>(), vec!["#a"]);
    }

    #[test]
    fn same_channel_in_and_out_merges() {
        let gateway = Gateway::new(&GatewayConfig {
            name: "g1".to_string(),
            enable: true,
            inbound: vec![entry("irc.a", "#a")],
            outbound: vec![entry("irc.a", "#a"), entry("telegram.a", "chat1")],
            inout: vec![],
        });
        let irc = ChannelKey::new("irc.a", "#a");
        assert!(gateway.accepts(&irc));
        let telegram = ChannelKey::new("telegram.a", "chat1");
        assert_eq!(gateway.destinations(&telegram).collect::<Vec<_>>(), vec![&irc]);
    }

    #[test]
    fn ignore_rules() {
        let origin = bridge(
            "irc.a",
            BridgeConfig {
                ignore_nicks: "spammer".to_string(),
                ignore_messages: "^~".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(ignore_reason(&origin, &Message::text("#a", "bob", "hi")), None);
        assert!(ignore_reason(&origin, &Message::text("#a", "bob", "  ")).is_some());
        assert!(ignore_reason(&origin, &Message::text("#a", "spammer", "hi")).is_some());
        assert!(ignore_reason(&origin, &Message::text("#a", "bob", "~secret")).is_some());
        assert!(ignore_reason(&origin, &Message::text("", "bob", "hi")).is_some());

        let mut delete = Message::text("#a", "bob", "");
        delete.event = Event::Delete;
        assert_eq!(ignore_reason(&origin, &delete), None);

        let mut attachment = Message::text("#a", "bob", "");
        attachment.push_file(crate::bridge::FileInfo::with_data("a.png", vec![1]));
        assert_eq!(ignore_reason(&origin, &attachment), None);
    }

    #[test]
    fn username_format() {
        let general = GeneralConfig {
            remote_nick_format: "[{PROTOCOL}/{BRIDGE}] <{NICK}> ".to_string(),
            ..Default::default()
        };
        let origin = bridge(
            "irc.libera",
            BridgeConfig {
                replace_nicks: vec![("^bob$".to_string(), "robert".to_string())],
                label: "L".to_string(),
                ..Default::default()
            },
        );
        let target = bridge("telegram.main", BridgeConfig::default());
        let msg = Message::text("#a", "bob", "hi");
        assert_eq!(
            format_username(&general, "g1", &origin, &target, &msg),
            "[irc/libera] <robert> "
        );

        let target = bridge(
            "discord.main",
            BridgeConfig {
                remote_nick_format: "{NOPINGNICK}@{LABEL}{CHANNEL}{GATEWAY}".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(
            format_username(&general, "g1", &origin, &target, &msg),
            "r\u{200b}obert@L#ag1"
        );

        let plain = GeneralConfig::default();
        let target = bridge("telegram.main", BridgeConfig::default());
        assert_eq!(format_username(&plain, "g1", &origin, &target, &msg), "robert");
    }

    #[test]
    fn prepare_for_target() {
        let general = GeneralConfig {
            icon_url: "https://icons/{NICK}.png".to_string(),
            ..Default::default()
        };
        let origin = bridge("irc.a", BridgeConfig::default());
        let target = bridge(
            "telegram.a",
            BridgeConfig {
                edit_suffix: " (edited)".to_string(),
                ..Default::default()
            },
        );
        let mut msg = Message::text("#a", "bob", "hi");
        msg.account = "irc.a".to_string();
        msg.parent_id = "p1".to_string();
        msg.event = Event::Edit;

        let key = ChannelKey::new("telegram.a", "chat1");
        let out = prepare(&general, "g1", &origin, &target, &key, &msg);
        assert_eq!(out.channel, "chat1");
        assert_eq!(out.gateway, "g1");
        assert_eq!(out.account, "irc.a");
        assert_eq!(out.text, "hi (edited)");
        assert_eq!(out.avatar.as_deref(), Some("https://icons/bob.png"));
        assert!(out.parent_id.is_empty());

        let threaded = bridge(
            "telegram.a",
            BridgeConfig {
                preserve_threading: true,
                ..Default::default()
            },
        );
        let out = prepare(&general, "g1", &origin, &threaded, &key, &msg);
        assert_eq!(out.parent_id, "p1");
    }

    #[test]
    fn event_filter() {
        let quiet = bridge("telegram.a", BridgeConfig::default());
        let mut msg = Message::text("#a", "bob", "bob joined");
        msg.event = Event::JoinLeave;
        assert!(!accepts_event(&quiet, &msg));
        let chatty = bridge(
            "telegram.a",
            BridgeConfig {
                show_join_part: true,
                ..Default::default()
            },
        );
        assert!(accepts_event(&chatty, &msg));
    }
}
