use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use bridge::{BridgeContext, BridgeFactory, Bridger};
use config::Config;
use gateway::Router;

mod bridge;
mod bridge_api;
mod bridge_dc;
mod bridge_tg;
mod config;
mod gateway;
mod logger;

/// 多平台聊天消息网关
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// 配置文件路径 (.toml 或 .json)
    #[arg(short, long)]
    conf: PathBuf,

    /// 输出调试日志
    #[arg(short, long)]
    debug: bool,
}

/// 兼容 `-conf`/`-debug` 的单横线写法
fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| match arg.as_str() {
        "-conf" => "--conf".to_string(),
        "-debug" => "--debug".to_string(),
        _ => match arg.strip_prefix("-conf=") {
            Some(path) => format!("--conf={}", path),
            None => arg,
        },
    })
    .collect()
}

/// 协议 => 桥的构造函数
fn factories() -> HashMap<String, BridgeFactory> {
    let mut factories: HashMap<String, BridgeFactory> = HashMap::new();
    factories.insert(
        "api".to_string(),
        Arc::new(|ctx: BridgeContext| Arc::new(bridge_api::ApiBridge::new(ctx)) as Arc<dyn Bridger>),
    );
    factories.insert(
        "telegram".to_string(),
        Arc::new(|ctx: BridgeContext| Arc::new(bridge_tg::TelegramBridge::new(ctx)) as Arc<dyn Bridger>),
    );
    factories.insert(
        "discord".to_string(),
        Arc::new(|ctx: BridgeContext| Arc::new(bridge_dc::DiscordBridge::new(ctx)) as Arc<dyn Bridger>),
    );
    factories
}

/// Ctrl-C 或 SIGTERM 时通知所有任务退出
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!("无法监听 SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("收到退出信号, 正在关闭...");
    shutdown.cancel();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let (router, receiver) = Router::new(&config, &factories(), shutdown.clone())?;
    router.start();
    tokio::spawn(wait_for_signal(shutdown));
    router.run(receiver).await;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args()));
    let config = match Config::load(&cli.conf) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("配置错误: {}", err);
            return ExitCode::FAILURE;
        }
    };
    // 读取本地时区需要在启动多线程运行时之前
    let _guards = logger::init_logger(&config.general.log_dir, cli.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("创建运行时失败: {}", err);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(serve(config)) {
        Ok(()) => {
            tracing::info!("网关已退出");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("网关启动失败: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        normalize_args(list.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn go_style_flags() {
        let cli = Cli::parse_from(args(&["gateway", "-conf", "gw.toml", "-debug"]));
        assert_eq!(cli.conf, PathBuf::from("gw.toml"));
        assert!(cli.debug);

        let cli = Cli::parse_from(args(&["gateway", "-conf=gw.json"]));
        assert_eq!(cli.conf, PathBuf::from("gw.json"));
        assert!(!cli.debug);
    }

    #[test]
    fn conf_is_required() {
        assert!(Cli::try_parse_from(args(&["gateway", "-d"])).is_err());
        let cli = Cli::try_parse_from(args(&["gateway", "-c", "a.toml"])).unwrap();
        assert_eq!(cli.conf, PathBuf::from("a.toml"));
    }

    #[test]
    fn every_adapter_is_registered() {
        let factories = factories();
        for protocol in ["api", "telegram", "discord"] {
            assert!(factories.contains_key(protocol));
        }
    }
}
