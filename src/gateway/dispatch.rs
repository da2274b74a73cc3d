//! 投递
//!
//! 每个目标频道一个 worker, 按入队顺序逐条投递, 所以同一来源发往同一目标的消息保持顺序。
//! 不同目标之间并发。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::message_map::MessageIdMap;
use super::retry::RetryPolicy;
use crate::bridge::{Bridge, ChannelKey, Event, Message};

/// 一次出站操作
pub struct Delivery {
    pub gateway: String,
    pub origin: ChannelKey,
    /// 来源平台的消息id
    pub origin_id: String,
    pub target: ChannelKey,
    pub bridge: Arc<Bridge>,
    /// 已经为目标格式化好的消息; 重试时原样复用
    pub message: Message,
    /// 投递时把 parent_id 转换为目标平台上的id
    pub thread: bool,
}

enum Job {
    Deliver(Box<Delivery>),
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

struct Worker {
    map: Arc<MessageIdMap>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self, target: ChannelKey, mut rx: mpsc::UnboundedReceiver<Job>) {
        tracing::debug!("[{}] 投递任务启动", target);
        while let Some(job) = rx.recv().await {
            match job {
                Job::Deliver(delivery) => self.deliver(*delivery).await,
                #[cfg(test)]
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("[{}] 投递任务结束", target);
    }

    async fn deliver(&self, mut delivery: Delivery) {
        match delivery.message.event {
            Event::Edit => self.edit(&delivery).await,
            Event::Delete => self.delete(&delivery).await,
            _ => {
                if delivery.thread {
                    self.resolve_parent(&mut delivery).await;
                }
                self.send(&delivery).await
            }
        }
    }

    async fn resolve_parent(&self, delivery: &mut Delivery) {
        let parent = std::mem::take(&mut delivery.message.parent_id);
        if parent.is_empty() {
            return;
        }
        match self
            .map
            .translate(&delivery.gateway, &delivery.origin, &parent, &delivery.target)
            .await
        {
            Some(id) => delivery.message.parent_id = id,
            None => tracing::debug!(
                "[{}] 找不到父消息 {} 在 {} 上的id, 作为普通消息发送",
                delivery.gateway,
                parent,
                delivery.target
            ),
        }
    }

    async fn send(&self, delivery: &Delivery) {
        let label = format!("[{}] 发送到 {}", delivery.gateway, delivery.target);
        let bridger = &delivery.bridge.bridger;
        let message = &delivery.message;
        match self
            .policy
            .run(&label, &self.shutdown, || bridger.send(message))
            .await
        {
            Ok(remote_id) => {
                tracing::debug!("{} 成功, 消息id: {}", label, remote_id);
                self.map
                    .record(
                        &delivery.gateway,
                        &delivery.origin,
                        &delivery.origin_id,
                        &delivery.target,
                        &remote_id,
                    )
                    .await;
            }
            Err(err) => {
                tracing::error!("{} 失败, 消息已丢弃: {}", label, err);
                self.map
                    .abandon(
                        &delivery.gateway,
                        &delivery.origin.account,
                        &delivery.origin_id,
                        &delivery.target,
                    )
                    .await;
            }
        }
    }

    /// 目标平台上的消息id; 第一次投递失败时没有
    async fn remote_id(&self, delivery: &Delivery) -> Option<String> {
        let remote_id = self
            .map
            .resolve(
                &delivery.gateway,
                &delivery.origin.account,
                &delivery.origin_id,
                &delivery.target,
            )
            .await;
        if remote_id.is_none() {
            tracing::warn!(
                "[{}] {} 没有消息 {} 的投递记录, 忽略{}",
                delivery.gateway,
                delivery.target,
                delivery.origin_id,
                delivery.message.event
            );
        }
        remote_id
    }

    async fn edit(&self, delivery: &Delivery) {
        let Some(remote_id) = self.remote_id(delivery).await else {
            return;
        };
        let label = format!("[{}] 编辑 {} 上的消息 {}", delivery.gateway, delivery.target, remote_id);
        let bridger = &delivery.bridge.bridger;
        let message = &delivery.message;
        let remote = remote_id.as_str();
        if let Err(err) = self
            .policy
            .run(&label, &self.shutdown, || bridger.edit_message(remote, message))
            .await
        {
            tracing::error!("{} 失败: {}", label, err);
        }
    }

    async fn delete(&self, delivery: &Delivery) {
        let Some(remote_id) = self.remote_id(delivery).await else {
            return;
        };
        let label = format!("[{}] 删除 {} 上的消息 {}", delivery.gateway, delivery.target, remote_id);
        let bridger = &delivery.bridge.bridger;
        let channel = delivery.target.channel.as_str();
        let remote = remote_id.as_str();
        match self
            .policy
            .run(&label, &self.shutdown, || bridger.delete_message(channel, remote))
            .await
        {
            Ok(()) => {
                self.map
                    .forget_target(
                        &delivery.gateway,
                        &delivery.origin.account,
                        &delivery.origin_id,
                        &delivery.target,
                    )
                    .await;
            }
            Err(err) => tracing::error!("{} 失败: {}", label, err),
        }
    }
}

/// 管理所有目标频道的 worker
pub struct Dispatcher {
    map: Arc<MessageIdMap>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<ChannelKey, mpsc::UnboundedSender<Job>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(map: Arc<MessageIdMap>, policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Dispatcher {
            map,
            policy,
            shutdown,
            workers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// 交给目标频道的 worker, 不等待投递结果
    pub async fn dispatch(&self, delivery: Delivery) {
        let mut workers = self.workers.lock().await;
        let target = delivery.target.clone();
        let mut job = Job::Deliver(Box::new(delivery));
        if let Some(sender) = workers.get(&target) {
            match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            map: self.map.clone(),
            policy: self.policy.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.tasks.lock().await.spawn(worker.run(target.clone(), receiver));
        if sender.send(job).is_err() {
            tracing::error!("[{}] 投递任务已退出", target);
        }
        workers.insert(target, sender);
    }

    /// 等待已经入队的投递全部完成
    #[cfg(test)]
    pub async fn flush(&self) {
        let mut pending = vec![];
        for sender in self.workers.lock().await.values() {
            let (done, wait) = tokio::sync::oneshot::channel();
            if sender.send(Job::Flush(done)).is_ok() {
                pending.push(wait);
            }
        }
        for wait in pending {
            let _ = wait.await;
        }
    }

    /// # 关闭
    /// 不再接受新的投递, 在 `grace` 内等待队列中的投递完成, 超时后中止。
    pub async fn drain(&self, grace: Duration) {
        self.workers.lock().await.clear();
        let mut tasks = self.tasks.lock().await;
        let remaining = tasks.len();
        if remaining == 0 {
            return;
        }
        tracing::info!("等待 {} 个投递任务结束", remaining);
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            tracing::warn!("投递任务在 {:?} 内没有结束, 强制中止", grace);
            tasks.abort_all();
        }
    }
}
