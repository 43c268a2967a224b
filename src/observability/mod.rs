//! 可观测性：tracing 订阅器初始化（默认 info，可通过 RUST_LOG 覆盖）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如多个测试）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
