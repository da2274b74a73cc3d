//! 测试用的桥: 记录所有调用, 可以预设失败

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BridgeContext, BridgeError, BridgeFactory, BridgeResult, Bridger, Message};
use crate::config::BridgeConfig;

#[derive(Debug, Clone)]
pub enum Call {
    Connect,
    Join(String),
    Send(Message),
    Edit(String, Message),
    Delete(String, String),
    Disconnect,
}

pub struct MockBridge {
    pub account: String,
    calls: Mutex<Vec<Call>>,
    send_failures: Mutex<VecDeque<BridgeError>>,
    connect_failures: Mutex<u32>,
    counter: AtomicU64,
}

impl MockBridge {
    pub fn new(account: &str) -> Arc<Self> {
        Arc::new(MockBridge {
            account: account.to_string(),
            calls: Mutex::new(vec![]),
            send_failures: Mutex::new(VecDeque::new()),
            connect_failures: Mutex::new(0),
            counter: AtomicU64::new(0),
        })
    }

    /// 接下来的 send/edit/delete 依次返回这些错误
    pub fn fail_next(&self, err: BridgeError) {
        self.send_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_connect(&self, times: u32) {
        *self.connect_failures.lock().unwrap() = times;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<Message> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(String, Message)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Edit(id, msg) => Some((id, msg)),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete(channel, id) => Some((channel, id)),
                _ => None,
            })
            .collect()
    }

    pub fn joined(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Join(channel) => Some(channel),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) -> BridgeResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.send_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Bridger for MockBridge {
    async fn connect(&self, _config: &BridgeConfig) -> BridgeResult<()> {
        self.calls.lock().unwrap().push(Call::Connect);
        let mut failures = self.connect_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BridgeError::connect("mock"));
        }
        Ok(())
    }

    async fn join_channel(&self, channel: &str) -> BridgeResult<()> {
        self.calls.lock().unwrap().push(Call::Join(channel.to_string()));
        Ok(())
    }

    async fn send(&self, msg: &Message) -> BridgeResult<String> {
        self.record(Call::Send(msg.clone()))?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-{}", self.account, n))
    }

    async fn edit_message(&self, remote_id: &str, msg: &Message) -> BridgeResult<()> {
        self.record(Call::Edit(remote_id.to_string(), msg.clone()))
    }

    async fn delete_message(&self, channel: &str, remote_id: &str) -> BridgeResult<()> {
        self.record(Call::Delete(channel.to_string(), remote_id.to_string()))
    }

    async fn get_file_direct_url(&self, id: &str) -> Option<String> {
        Some(format!("https://files.{}/{}", self.account, id))
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        self.calls.lock().unwrap().push(Call::Disconnect);
        Ok(())
    }
}

/// 按账号创建/获取 [`MockBridge`]
#[derive(Clone, Default)]
pub struct MockRegistry {
    bridges: Arc<DashMap<String, Arc<MockBridge>>>,
}

impl MockRegistry {
    pub fn get(&self, account: &str) -> Arc<MockBridge> {
        self.bridges
            .entry(account.to_string())
            .or_insert_with(|| MockBridge::new(account))
            .clone()
    }

    pub fn factory(&self) -> BridgeFactory {
        let registry = self.clone();
        Arc::new(move |ctx: BridgeContext| registry.get(&ctx.account) as Arc<dyn Bridger>)
    }
}
