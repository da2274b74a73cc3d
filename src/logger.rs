//! 配置日志追踪

use time::format_description::FormatItem;
use time::macros::format_description;
use time::UtcOffset;
use tracing::{debug, error, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "MSG_GATEWAY";
const F_PFX_NOR: &str = "gateway_log.log";
const F_PFX_ERR: &str = "gateway_err.log";

const FILE_TIME: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
const STDOUT_TIME: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:3]");

/// 配置时区和时间格式
///
/// 多线程运行后无法安全读取本地时区, 必须在创建运行时之前调用
fn get_timer(t_fmt: &'static [FormatItem<'static>]) -> OffsetTime<&'static [FormatItem<'static>]> {
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        eprintln!("读取本地时区异常, 使用UTC: {}", e);
        UtcOffset::UTC
    });
    OffsetTime::new(offset, t_fmt)
}

/// 默认过滤级别; 环境变量 `MSG_GATEWAY` 优先
fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// # 初始化日志
/// ### Arguments
/// - `log_dir` 日志文件目录
/// - `debug` 命令行 `--debug`
/// ### Return
/// 两个日志文件的写入守卫, 需要保持到程序退出
pub fn init_logger(log_dir: &str, debug: bool) -> (WorkerGuard, WorkerGuard) {
    // 日志文件
    let (ff, nl_guard) = tracing_appender::non_blocking(rolling::never(log_dir, F_PFX_NOR));
    let f_normal = fmt::layer()
        .with_ansi(false)
        .with_timer(get_timer(FILE_TIME))
        .with_writer(ff.with_min_level(Level::WARN).with_max_level(Level::INFO));
    let (ff, el_guard) = tracing_appender::non_blocking(rolling::never(log_dir, F_PFX_ERR));
    let f_error = fmt::layer()
        .with_ansi(false)
        .with_timer(get_timer(FILE_TIME))
        .with_writer(ff.with_max_level(Level::ERROR));

    // 标准输出
    let std_out = fmt::layer()
        .with_timer(get_timer(STDOUT_TIME))
        .with_ansi(true)
        .with_writer(std::io::stdout);

    // 注册
    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(ErrorLayer::default())
        .with(std_out)
        .with(f_normal)
        .with(f_error)
        .init();

    // color_eyre 处理 panic
    if let Err(e) = color_eyre::install() {
        error!("color_eyre 配置异常！{:#?}", e);
    }

    debug!("logger ready, dir: {}", log_dir);
    (nl_guard, el_guard)
}
