use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::Mutex;
use tracing::info;

use crate::application::lifecycle::{ApplicationEvent, ApplicationListener};
use crate::infrastructure::cache::CacheManager;

/// 起動完了時にキャッシュ名を列挙するリスナー
pub struct StartupListener {
    caches: Arc<CacheManager>,
    clear_on_startup: bool,
}

impl StartupListener {
    pub fn new(caches: Arc<CacheManager>, clear_on_startup: bool) -> Self {
        Self {
            caches,
            clear_on_startup,
        }
    }

    /// 全キャッシュを並行に巡回し、巡回した名前を返す（順序は保証しない）
    pub async fn visit_caches(&self) -> Vec<String> {
        let visited = Mutex::new(Vec::new());
        stream::iter(self.caches.cache_names())
            .for_each_concurrent(None, |name| {
                let visited = &visited;
                async move {
                    if self.clear_on_startup {
                        if let Some(cache) = self.caches.get_cache(&name) {
                            cache.clear().await;
                        }
                    }
                    info!("キャッシュ: {}", name);
                    visited.lock().await.push(name);
                }
            })
            .await;
        visited.into_inner()
    }
}

#[async_trait]
impl ApplicationListener for StartupListener {
    async fn on_application_event(&self, event: &ApplicationEvent) {
        if let ApplicationEvent::ContextRefreshed = event {
            info!("アプリケーションイベントを受信: {:?}", event);
            let visited = self.visit_caches().await;
            info!("{}個のキャッシュを確認しました", visited.len());
        }
    }
}
