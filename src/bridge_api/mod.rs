//! http 接口桥
//!
//! - `POST /api/message` 外部系统发送消息到网关
//! - `GET /api/messages` 取出网关转发过来的消息
//! - `GET /api/health`

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::instrument;

use crate::bridge::{BridgeContext, BridgeError, BridgeResult, Bridger, Event, Message};
use crate::config::BridgeConfig;

/// 接口桥的频道固定为 api
pub const API_CHANNEL: &str = "api";

pub struct ApiState {
    token: String,
    capacity: usize,
    /// 等待外部取走的消息
    buffer: Mutex<VecDeque<Message>>,
    inbound: mpsc::UnboundedSender<Message>,
}

impl ApiState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.token.is_empty() {
            return true;
        }
        let expect = format!("Bearer {}", self.token);
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value == expect)
    }

    async fn push(&self, msg: Message) {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(msg);
    }
}

/// 外部发送过来的消息
pub struct ApiReceiver {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl ApiReceiver {
    /// 等待下一条消息, 服务关闭后返回 None
    pub async fn receive(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

pub struct ApiBridge {
    ctx: BridgeContext,
    state: Mutex<Option<Arc<ApiState>>>,
}

impl ApiBridge {
    pub fn new(ctx: BridgeContext) -> Self {
        ApiBridge {
            ctx,
            state: Mutex::new(None),
        }
    }

    /// 创建接口状态, 返回外部消息的接收端
    pub fn state(config: &BridgeConfig) -> (Arc<ApiState>, ApiReceiver) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let state = ApiState {
            token: config.token.clone(),
            capacity: config.buffer.max(1),
            buffer: Mutex::new(VecDeque::new()),
            inbound,
        };
        (Arc::new(state), ApiReceiver { receiver })
    }

    pub fn routes(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/api/health", get(health))
            .route("/api/message", post(post_message))
            .route("/api/messages", get(get_messages))
            .with_state(state)
    }

    async fn buffer(&self, msg: Message) -> BridgeResult<()> {
        match self.state.lock().await.as_ref() {
            Some(state) => {
                state.push(msg).await;
                Ok(())
            }
            None => Err(BridgeError::transient("接口服务还没有启动")),
        }
    }
}

#[async_trait]
impl Bridger for ApiBridge {
    async fn connect(&self, config: &BridgeConfig) -> BridgeResult<()> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| BridgeError::connect(format!("BindAddress '{}' 无效: {}", config.bind_address, e)))?;
        let server = axum::Server::try_bind(&addr).map_err(BridgeError::connect)?;
        let (state, mut receiver) = Self::state(config);
        let app = Self::routes(state.clone());

        let shutdown = self.ctx.shutdown.clone();
        let account = self.ctx.account.clone();
        tokio::spawn(async move {
            tracing::info!("[API] {} 监听 {}", account, addr);
            let serve = server
                .serve(app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                tracing::error!("[API] {} 服务异常退出: {}", account, err);
            }
        });

        let client = self.ctx.client.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.receive().await {
                client.send(msg);
            }
        });
        *self.state.lock().await = Some(state);
        Ok(())
    }

    async fn send(&self, msg: &Message) -> BridgeResult<String> {
        let mut out = msg.clone();
        out.id = uuid::Uuid::new_v4().to_string();
        let id = out.id.clone();
        self.buffer(out).await?;
        Ok(id)
    }

    async fn edit_message(&self, remote_id: &str, msg: &Message) -> BridgeResult<()> {
        let mut out = msg.clone();
        out.id = remote_id.to_string();
        out.event = Event::Edit;
        self.buffer(out).await
    }

    async fn delete_message(&self, channel: &str, remote_id: &str) -> BridgeResult<()> {
        self.buffer(Message {
            id: remote_id.to_string(),
            channel: channel.to_string(),
            event: Event::Delete,
            ..Default::default()
        })
        .await
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        self.state.lock().await.take();
        Ok(())
    }
}

async fn health() -> &'static str {
    "OK"
}

/// 外部系统发送消息
#[instrument(name = "bridge_api_recv", skip_all)]
async fn post_message(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(mut msg): Json<Message>,
) -> Result<Json<Message>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    msg.channel = API_CHANNEL.to_string();
    msg.protocol = "api".to_string();
    msg.timestamp = Utc::now();
    if msg.id.is_empty() {
        msg.id = uuid::Uuid::new_v4().to_string();
    }
    tracing::debug!("[API] 收到 {} 的消息: {}", msg.username, msg.text);
    state
        .inbound
        .send(msg.clone())
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(msg))
}

/// 取出缓冲区中的全部消息
async fn get_messages(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let messages: Vec<Message> = state.buffer.lock().await.drain(..).collect();
    Ok(Json(messages))
}

#[cfg(test)]
mod test {
    use axum::http::HeaderValue;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bridge::BridgeClient;
    use crate::config::GeneralConfig;
    use crate::gateway::avatar_cache::AvatarCache;

    fn config(token: &str, buffer: usize) -> BridgeConfig {
        BridgeConfig {
            token: token.to_string(),
            buffer,
            ..Default::default()
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn post_requires_token() {
        let (state, mut receiver) = ApiBridge::state(&config("secret", 10));
        let msg = Message::text("whatever", "bob", "hi");

        let denied = post_message(State(state.clone()), HeaderMap::new(), Json(msg.clone())).await;
        assert_eq!(denied.unwrap_err(), StatusCode::UNAUTHORIZED);

        let Json(accepted) = post_message(State(state), bearer("secret"), Json(msg)).await.unwrap();
        assert_eq!(accepted.channel, API_CHANNEL);
        assert!(!accepted.id.is_empty());

        let received = receiver.receive().await.unwrap();
        assert_eq!(received.text, "hi");
        assert_eq!(received.protocol, "api");
    }

    #[tokio::test]
    async fn buffer_is_a_ring() {
        let (state, _receiver) = ApiBridge::state(&config("", 2));
        for text in ["a", "b", "c"] {
            state.push(Message::text("api", "bob", text)).await;
        }
        let Json(messages) = get_messages(State(state.clone()), HeaderMap::new()).await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|msg| msg.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);

        // 已经取走
        let Json(messages) = get_messages(State(state), HeaderMap::new()).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn send_before_connect_is_transient() {
        let (sender, _rx) = mpsc::unbounded_channel();
        let bridge = ApiBridge::new(BridgeContext {
            account: "api.local".to_string(),
            protocol: "api".to_string(),
            general: Arc::new(GeneralConfig::default()),
            client: BridgeClient::new("api.local", "api", sender),
            avatars: Arc::new(AvatarCache::new("api.local", false)),
            shutdown: CancellationToken::new(),
        });
        let err = bridge.send(&Message::text("api", "bob", "hi")).await.unwrap_err();
        assert!(err.is_transient());

        let (state, _receiver) = ApiBridge::state(&config("", 10));
        *bridge.state.lock().await = Some(state.clone());
        let id = bridge.send(&Message::text("api", "bob", "hi")).await.unwrap();
        bridge.delete_message("api", &id).await.unwrap();
        let Json(messages) = get_messages(State(state), HeaderMap::new()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[1].event, Event::Delete);
    }

    #[tokio::test]
    async fn connect_rejects_bad_address() {
        let (sender, _rx) = mpsc::unbounded_channel();
        let bridge = ApiBridge::new(BridgeContext {
            account: "api.local".to_string(),
            protocol: "api".to_string(),
            general: Arc::new(GeneralConfig::default()),
            client: BridgeClient::new("api.local", "api", sender),
            avatars: Arc::new(AvatarCache::new("api.local", false)),
            shutdown: CancellationToken::new(),
        });
        let err = bridge.connect(&BridgeConfig::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connect(_)));
    }
}
