use crate::core::stage::in_guarded_call;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// 終端機用的精簡格式；stdout 留給輸出的 record，日誌一律寫到 stderr
pub fn init_cli_logger(verbose: bool) {
    let filter = env_filter(if verbose {
        "use_stage=debug,info"
    } else {
        "use_stage=info"
    });

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    tracing_subscriber::registry().with(filter).with(layer).init();
}

/// 每行一筆 JSON，方便交給 log 收集器
pub fn init_json_logger() {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .json()
        .with_current_span(false);

    tracing_subscriber::registry()
        .with(env_filter("use_stage=info"))
        .with(layer)
        .init();
}

/// stage 內被攔截的 panic 已轉成 PluginError 回報，只在 debug 層級記錄；
/// 其他 panic 仍交給原本的 hook
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if in_guarded_call() {
            tracing::debug!("💥 Contained panic: {}", info);
        } else {
            default_hook(info);
        }
    }));
}
