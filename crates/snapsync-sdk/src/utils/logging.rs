//! tracing 初始化

use tracing::Level;

/// 安装 fmt 订阅者；重复调用（或宿主已安装订阅者）时什么都不做
pub fn init_tracing(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}
