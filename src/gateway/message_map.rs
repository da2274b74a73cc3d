//! 消息id关联表
//!
//! (网关, 来源桥, 来源消息id) => 每个目标频道分配的消息id。
//! 只用于把编辑/删除同步到目标平台, 按容量和存活时间淘汰。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bridge::ChannelKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MessageKey {
    gateway: String,
    account: String,
    id: String,
}

impl MessageKey {
    fn new(gateway: &str, account: &str, id: &str) -> Self {
        MessageKey {
            gateway: gateway.to_string(),
            account: account.to_string(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug)]
struct MessageRefs {
    origin: ChannelKey,
    created: Instant,
    /// `None` 表示已派发但还没有投递结果
    targets: HashMap<ChannelKey, Option<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<MessageKey, MessageRefs>,
    /// 插入顺序, 用于淘汰
    order: VecDeque<(MessageKey, Instant)>,
}

impl Inner {
    fn evict(&mut self, capacity: usize, ttl: Duration, now: Instant) {
        while let Some((key, created)) = self.order.front() {
            let live = match self.entries.get(key) {
                Some(refs) => refs.created == *created,
                None => false,
            };
            let expired = now.duration_since(*created) >= ttl;
            if live && !expired && self.entries.len() <= capacity {
                break;
            }
            if let Some((key, created)) = self.order.pop_front() {
                if live && self.entries.get(&key).map_or(false, |r| r.created == created) {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn entry(&mut self, key: MessageKey, origin: &ChannelKey, now: Instant) -> &mut MessageRefs {
        let order = &mut self.order;
        self.entries.entry(key.clone()).or_insert_with(|| {
            order.push_back((key, now));
            MessageRefs {
                origin: origin.clone(),
                created: now,
                targets: HashMap::new(),
            }
        })
    }
}

pub struct MessageIdMap {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl MessageIdMap {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        MessageIdMap {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn is_live(&self, refs: &MessageRefs, now: Instant) -> bool {
        now.duration_since(refs.created) < self.ttl
    }

    /// # 派发消息前登记目标
    /// 之后的编辑/删除会按登记的目标派发, 即使第一次投递还没有完成。
    pub async fn open(&self, gateway: &str, origin: &ChannelKey, origin_id: &str, targets: &[ChannelKey]) {
        if origin_id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let refs = inner.entry(MessageKey::new(gateway, &origin.account, origin_id), origin, now);
        for target in targets {
            refs.targets.entry(target.clone()).or_insert(None);
        }
        inner.evict(self.capacity, self.ttl, now);
    }

    /// 记录目标平台分配的消息id
    pub async fn record(
        &self,
        gateway: &str,
        origin: &ChannelKey,
        origin_id: &str,
        target: &ChannelKey,
        target_id: &str,
    ) {
        if origin_id.is_empty() || target_id.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let refs = inner.entry(MessageKey::new(gateway, &origin.account, origin_id), origin, now);
        refs.targets.insert(target.clone(), Some(target_id.to_string()));
        inner.evict(self.capacity, self.ttl, now);
    }

    /// 投递失败, 不再等待该目标的消息id
    pub async fn abandon(&self, gateway: &str, origin_account: &str, origin_id: &str, target: &ChannelKey) {
        let mut inner = self.inner.lock().await;
        let key = MessageKey::new(gateway, origin_account, origin_id);
        let empty = match inner.entries.get_mut(&key) {
            Some(refs) => {
                if let Some(None) = refs.targets.get(target) {
                    refs.targets.remove(target);
                }
                refs.targets.is_empty()
            }
            None => false,
        };
        // 没有任何目标投递成功, 视为从未转发
        if empty {
            inner.entries.remove(&key);
        }
    }

    /// 已投递的目标及其消息id
    pub async fn lookup(&self, gateway: &str, origin_account: &str, origin_id: &str) -> HashMap<ChannelKey, String> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        match inner.entries.get(&MessageKey::new(gateway, origin_account, origin_id)) {
            Some(refs) if self.is_live(refs, now) => refs
                .targets
                .iter()
                .filter_map(|(target, id)| Some((target.clone(), id.clone()?)))
                .collect(),
            _ => HashMap::new(),
        }
    }

    /// 登记过的全部目标 (包括投递中的); 没有记录时返回 None
    pub async fn targets(&self, gateway: &str, origin_account: &str, origin_id: &str) -> Option<Vec<ChannelKey>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let refs = inner
            .entries
            .get(&MessageKey::new(gateway, origin_account, origin_id))
            .filter(|refs| self.is_live(refs, now))?;
        let mut targets: Vec<ChannelKey> = refs.targets.keys().cloned().collect();
        targets.sort();
        Some(targets)
    }

    /// 目标频道上的消息id
    pub async fn resolve(
        &self,
        gateway: &str,
        origin_account: &str,
        origin_id: &str,
        target: &ChannelKey,
    ) -> Option<String> {
        self.lookup(gateway, origin_account, origin_id)
            .await
            .remove(target)
    }

    /// # 回复的父消息id 转换为目标频道上的id
    /// ### Arguments
    /// - `origin` 回复消息所在的频道
    /// - `parent_id` 来源平台上的父消息id; 它可能是来源平台的原创消息, 也可能是桥转发过去的消息
    /// - `target` 目标频道
    pub async fn translate(
        &self,
        gateway: &str,
        origin: &ChannelKey,
        parent_id: &str,
        target: &ChannelKey,
    ) -> Option<String> {
        if parent_id.is_empty() {
            return None;
        }
        let now = Instant::now();
        let inner = self.inner.lock().await;
        // 父消息是来源平台上的原创消息
        if let Some(refs) = inner
            .entries
            .get(&MessageKey::new(gateway, &origin.account, parent_id))
            .filter(|refs| self.is_live(refs, now))
        {
            return refs.targets.get(target).cloned().flatten();
        }
        // 父消息是桥转发到来源平台的消息, 找到它的原始消息
        for (key, refs) in inner.entries.iter() {
            if key.gateway != gateway || !self.is_live(refs, now) {
                continue;
            }
            let delivered = refs.targets.get(origin).cloned().flatten();
            if delivered.as_deref() != Some(parent_id) {
                continue;
            }
            if &refs.origin == target {
                return Some(key.id.clone());
            }
            return refs.targets.get(target).cloned().flatten();
        }
        None
    }

    /// 目标消息已删除; 所有目标都删除后整条记录移除
    pub async fn forget_target(&self, gateway: &str, origin_account: &str, origin_id: &str, target: &ChannelKey) {
        let mut inner = self.inner.lock().await;
        let key = MessageKey::new(gateway, origin_account, origin_id);
        let empty = match inner.entries.get_mut(&key) {
            Some(refs) => {
                refs.targets.remove(target);
                refs.targets.is_empty()
            }
            None => false,
        };
        if empty {
            inner.entries.remove(&key);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}
