//! 头像缓存
//!
//! 每个桥实例一份, 由路由创建后同时交给桥和路由使用。
//! 头像链接不能跨平台复用, 所以不做全局缓存。

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// 同一用户两次下载头像的最小间隔
const DOWNLOAD_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarEntry {
    /// 头像内容哈希
    pub sha: String,
    /// 上传后的链接
    pub url: String,
}

#[derive(Debug)]
pub struct AvatarCache {
    account: String,
    /// 头像变化后重新上传; 关闭时首次上传后永久缓存
    reupload_on_change: bool,
    interval: Duration,
    entries: DashMap<String, AvatarEntry>,
    /// 正在或最近下载过头像的用户
    claims: DashMap<String, Instant>,
}

impl AvatarCache {
    pub fn new(account: &str, reupload_on_change: bool) -> Self {
        AvatarCache {
            account: account.to_string(),
            reupload_on_change,
            interval: DOWNLOAD_INTERVAL,
            entries: DashMap::new(),
            claims: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn lookup(&self, user_id: &str) -> Option<AvatarEntry> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    /// 上传成功后记录
    pub fn store(&self, user_id: &str, entry: AvatarEntry) {
        tracing::debug!("[{}] 缓存用户 {} 的头像 {}", self.account, user_id, entry.sha);
        self.entries.insert(user_id.to_string(), entry);
    }

    /// 缓存中的头像与新计算的哈希一致, 无需再上传
    pub fn is_current(&self, user_id: &str, sha: &str) -> bool {
        self.entries
            .get(user_id)
            .map_or(false, |entry| entry.sha == sha)
    }

    /// # 桥在收到用户消息时调用, 判断是否要下载头像
    /// 返回 true 时调用方负责下载并投递 `AvatarDownload` 消息。
    /// 同一用户在间隔内只会返回一次 true。
    pub fn claim_download(&self, user_id: &str) -> bool {
        if !self.reupload_on_change && self.entries.contains_key(user_id) {
            return false;
        }
        let now = Instant::now();
        match self.claims.entry(user_id.to_string()) {
            Entry::Occupied(mut claimed) => {
                if now.duration_since(*claimed.get()) < self.interval {
                    return false;
                }
                claimed.insert(now);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(sha: &str) -> AvatarEntry {
        AvatarEntry {
            sha: sha.to_string(),
            url: format!("https://media/{sha}/u.png"),
        }
    }

    #[test]
    fn store_and_lookup() {
        let cache = AvatarCache::new("telegram.main", false);
        assert!(cache.lookup("42").is_none());
        cache.store("42", entry("aaaa"));
        assert_eq!(cache.lookup("42").unwrap().sha, "aaaa");
        assert!(cache.is_current("42", "aaaa"));
        assert!(!cache.is_current("42", "bbbb"));
        assert!(!cache.is_current("43", "aaaa"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn claim_once_then_cache_forever() {
        let cache = AvatarCache::new("telegram.main", false).with_interval(Duration::ZERO);
        assert!(cache.claim_download("42"));
        cache.store("42", entry("aaaa"));
        // 已缓存, 不再下载
        assert!(!cache.claim_download("42"));
        assert!(!cache.claim_download("42"));
    }

    #[test]
    fn claim_is_exclusive_within_interval() {
        let cache = AvatarCache::new("telegram.main", false);
        assert!(cache.claim_download("42"));
        // 下载还没完成, 第二条消息不再重复下载
        assert!(!cache.claim_download("42"));
        assert!(cache.claim_download("43"));
    }

    #[test]
    fn reupload_on_change_claims_again() {
        let cache = AvatarCache::new("telegram.main", true).with_interval(Duration::ZERO);
        assert!(cache.claim_download("42"));
        cache.store("42", entry("aaaa"));
        assert!(cache.claim_download("42"));
    }
}
