//! App 前后台切换
//!
//! 回到前台时取消所有退避并立即调度；切到后台时把 KV 存储刷盘。

use tracing::info;

use crate::error::Result;
use crate::runtime::SyncHandle;

pub struct AppLifecycle {
    handle: SyncHandle,
}

impl AppLifecycle {
    pub fn new(handle: SyncHandle) -> Self {
        Self { handle }
    }

    pub async fn on_background(&self) -> Result<()> {
        info!("App 切换到后台，刷新本地存储");
        self.handle.flush().await
    }

    pub async fn on_foreground(&self) -> Result<()> {
        info!("App 回到前台，重置退避并调度");
        self.handle.reset_backoff()?;
        self.handle.dispatch()
    }
}
