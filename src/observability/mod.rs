//! 可观测性：tracing 订阅者初始化
//!
//! 日志写到 stderr，stdout 留给回答；默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=concierge=debug`）。
//! 工具审计日志以 `tool_audit` 字段输出 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
