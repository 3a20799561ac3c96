//! アプリケーションのライフサイクル
//!
//! 設定から依存関係を組み立て、起動・終了イベントをリスナーへ配信する。

use std::sync::Arc;

use async_trait::async_trait;
use eventstore::ClientSettings;
use snowflake::SnowflakeIdGenerator;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::customer_service::{CustomerService, DefaultCustomerService};
use crate::application::startup_listener::StartupListener;
use crate::domain::customer::CustomerRepository;
use crate::domain::IdGeneratorTask;
use crate::infrastructure::cache::CacheManager;
use crate::infrastructure::customer::EventStoreCustomerRepository;
use crate::infrastructure::memory::InMemoryCustomerRepository;
use crate::{Backend, CrmConfig};

/// アプリケーションイベント
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationEvent {
    /// コンテキストの構築が完了した
    ContextRefreshed,
    /// コンテキストが閉じられた
    ContextClosed,
}

/// アプリケーションイベントのリスナー
#[async_trait]
pub trait ApplicationListener: Send + Sync {
    async fn on_application_event(&self, event: &ApplicationEvent);
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid eventstore url: {0}")]
    EventStoreSettings(String),
    #[error("Failed to create eventstore client: {0}")]
    EventStoreClient(String),
}

pub struct ApplicationContext {
    caches: Arc<CacheManager>,
    service: Arc<dyn CustomerService>,
    listeners: Vec<Arc<dyn ApplicationListener>>,
}

impl ApplicationContext {
    /// 設定されたバックエンドでコンテキストを構築する。tokioランタイム上で呼ぶこと
    pub fn new(config: &CrmConfig) -> Result<Self, ContextError> {
        let repository: Arc<dyn CustomerRepository> = match config.repository.backend {
            Backend::Memory => Arc::new(InMemoryCustomerRepository::new()),
            Backend::EventStore => {
                let settings = config
                    .eventstore
                    .url
                    .parse::<ClientSettings>()
                    .map_err(|e| ContextError::EventStoreSettings(e.to_string()))?;
                let client = eventstore::Client::new(settings)
                    .map_err(|e| ContextError::EventStoreClient(e.to_string()))?;
                Arc::new(EventStoreCustomerRepository::new(client))
            }
        };
        info!("リポジトリ: {:?}", config.repository.backend);
        Ok(Self::with_repository(config, repository))
    }

    pub fn with_repository(config: &CrmConfig, repository: Arc<dyn CustomerRepository>) -> Self {
        let caches = Arc::new(CacheManager::new(config.cache.names.iter().cloned()));
        let id_generator = IdGeneratorTask::spawn(
            SnowflakeIdGenerator::new(config.id.machine_id, config.id.node_id).into(),
        );
        let service: Arc<dyn CustomerService> = Arc::new(DefaultCustomerService::new(
            repository,
            id_generator,
            caches.clone(),
        ));
        let startup = StartupListener::new(caches.clone(), config.cache.clear_on_startup);
        Self {
            caches,
            service,
            listeners: vec![Arc::new(startup)],
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ApplicationListener>) {
        self.listeners.push(listener);
    }

    pub fn service(&self) -> Arc<dyn CustomerService> {
        self.service.clone()
    }

    pub fn caches(&self) -> Arc<CacheManager> {
        self.caches.clone()
    }

    pub async fn publish(&self, event: ApplicationEvent) {
        debug!("イベントを配信: {:?} ({}件のリスナー)", event, self.listeners.len());
        for listener in &self.listeners {
            listener.on_application_event(&event).await;
        }
    }

    pub async fn refresh(&self) {
        self.publish(ApplicationEvent::ContextRefreshed).await
    }

    pub async fn close(&self) {
        self.publish(ApplicationEvent::ContextClosed).await
    }
}
