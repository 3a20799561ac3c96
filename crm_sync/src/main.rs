use std::error::Error;

use async_trait::async_trait;
use crm::{
    domain::{
        customer::{Customer, CustomerEvent, CustomerId},
        Entity,
    },
    infrastructure::is_entity_stream,
    CrmConfig,
};
use eventstore::{ClientSettings, Position, StreamPosition, SubscribeToAllOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn, Level};
use uuid::Uuid;

static VERSION_UID: &str = "eventstore_version";

#[tokio::main]
async fn main() {
    match CrmConfig::load() {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(&config.logger.level))
                .init();
            if let Err(error) = subscribe(&config).await {
                error!("アプリケーションエラー: {}", error);
            }
        }
        Err(error) => {
            tracing_subscriber::fmt::init();
            error!("アプリケーションエラー: {}", error)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EventstoreVersion {
    id: u64,
    event_id: Uuid,
    commit: u64,
    prepare: u64,
}

async fn subscribe(config: &CrmConfig) -> Result<(), Box<dyn Error>> {
    let settings = config.eventstore.url.parse::<ClientSettings>()?;
    let mut client = Client {
        eventstore: eventstore::Client::new(settings)?,
        meilisearch: meilisearch_sdk::Client::new(
            &config.meilisearch.url,
            &config.meilisearch.api_key,
        ),
    };
    let start = match client
        .meilisearch
        .index(VERSION_UID)
        .get_document::<EventstoreVersion>("1")
        .await
    {
        Ok(version) => {
            info!("前回の位置から再開します: {}", version.event_id);
            StreamPosition::Position(Position {
                commit: version.commit,
                prepare: version.prepare,
            })
        }
        Err(e) => {
            warn!("バージョン情報が取得できないため先頭から購読します: {}", e);
            StreamPosition::Start
        }
    };
    let mut sub = client
        .eventstore
        .subscribe_to_all(&SubscribeToAllOptions::default().position(start))
        .await;
    loop {
        let resolved = sub.next().await?;
        let event = resolved.get_original_event();
        if is_entity_stream::<Customer>(&event.stream_id) {
            match CustomerEvent::try_from(&resolved) {
                Ok(customer_event) => {
                    info!("ドメインイベントを受信: {:?}", customer_event);
                    if let Err(e) = client.execute(customer_event).await {
                        error!("イベント実行エラー: {}", e);
                        continue;
                    }
                }
                Err(e) => warn!("イベントを変換できません: {}: {}", event.stream_id, e),
            }
        } else {
            debug!("対象外のイベントを受信: {}", event.stream_id);
        }
        if let Err(e) = client
            .meilisearch
            .index(VERSION_UID)
            .add_documents(
                &[EventstoreVersion {
                    id: 1,
                    event_id: event.id,
                    commit: event.position.commit,
                    prepare: event.position.prepare,
                }],
                Some("id"),
            )
            .await
        {
            error!("バージョン情報保存失敗: {}", e);
        }
    }
}

#[async_trait]
pub trait Execute<E> {
    type Error: Error;
    async fn execute(&mut self, event: E) -> Result<(), Self::Error>;
}

struct Client {
    eventstore: eventstore::Client,
    meilisearch: meilisearch_sdk::Client,
}

/// 検索インデックスへの反映内容
#[derive(Debug, PartialEq)]
enum Projection {
    Add(Customer),
    Update(Value),
    Delete(CustomerId),
    Skip,
}

impl From<CustomerEvent> for Projection {
    fn from(event: CustomerEvent) -> Self {
        match event {
            CustomerEvent::CustomerRegistered {
                id,
                name,
                email,
                registered_at,
            } => match Customer::register(id, name, email, registered_at) {
                Ok(entity) => Projection::Add(entity),
                Err(_) => Projection::Skip,
            },
            CustomerEvent::CustomerNameChanged { id, name } => {
                Projection::Update(json!({ "id": id, "name": name }))
            }
            CustomerEvent::CustomerEmailChanged { id, email } => {
                Projection::Update(json!({ "id": id, "email": email }))
            }
            CustomerEvent::CustomerDeleted { id } => Projection::Delete(id),
        }
    }
}

#[async_trait]
impl Execute<CustomerEvent> for Client {
    type Error = meilisearch_sdk::errors::Error;
    async fn execute(&mut self, event: CustomerEvent) -> Result<(), Self::Error> {
        let index = self.meilisearch.index(Customer::ENTITY_NAME);
        match Projection::from(event) {
            Projection::Add(entity) => {
                index.add_documents(&[entity], Some("id")).await?;
            }
            Projection::Update(document) => {
                index.add_or_update(&[document], Some("id")).await?;
            }
            Projection::Delete(id) => {
                index.delete_document(id).await?;
            }
            Projection::Skip => warn!("不正なエンティティの登録をスキップしました"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn test_projection_registered() {
        let registered_at = Utc.with_ymd_and_hms(2023, 4, 1, 9, 0, 0).unwrap();
        let projection = Projection::from(CustomerEvent::CustomerRegistered {
            id: 1.into(),
            name: "山田太郎".to_owned(),
            email: "taro@example.com".to_owned(),
            registered_at,
        });
        let entity = match projection {
            Projection::Add(entity) => entity,
            other => panic!("expected add: {:?}", other),
        };
        assert_eq!(
            serde_json::to_value(&entity).unwrap(),
            json!({
                "id": 1,
                "name": "山田太郎",
                "email": "taro@example.com",
                "registered_at": "2023-04-01T09:00:00Z",
            })
        );
    }

    #[test]
    fn test_projection_invalid_registration_is_skipped() {
        let projection = Projection::from(CustomerEvent::CustomerRegistered {
            id: 1.into(),
            name: "".to_owned(),
            email: "taro@example.com".to_owned(),
            registered_at: Utc::now(),
        });
        assert_eq!(projection, Projection::Skip);
    }

    #[test]
    fn test_projection_changes() {
        assert_eq!(
            Projection::from(CustomerEvent::CustomerNameChanged {
                id: 2.into(),
                name: "山田花子".to_owned(),
            }),
            Projection::Update(json!({ "id": 2, "name": "山田花子" }))
        );
        assert_eq!(
            Projection::from(CustomerEvent::CustomerEmailChanged {
                id: 2.into(),
                email: "hanako@example.com".to_owned(),
            }),
            Projection::Update(json!({ "id": 2, "email": "hanako@example.com" }))
        );
        assert_eq!(
            Projection::from(CustomerEvent::CustomerDeleted { id: 2.into() }),
            Projection::Delete(2.into())
        );
    }
}
