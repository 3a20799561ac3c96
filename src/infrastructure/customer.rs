use std::collections::BTreeMap;

use async_trait::async_trait;
use eventstore::{
    AppendToStreamOptions, Client, EventData, ExpectedRevision, ReadAllOptions, ResolvedEvent,
};
use tracing::warn;

use crate::domain::customer::{Customer, CustomerEvent, CustomerId, CustomerRepository};
use crate::domain::{Aggregation, DataAccessError, Entity};
use crate::infrastructure::{entity_id, is_entity_stream, stream_name, EventConvertError};
use crate::infrastructure::{from_event, try_from_resolved_event};

#[derive(Clone)]
pub struct EventStoreCustomerRepository {
    client: Client,
}

impl EventStoreCustomerRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CustomerRepository for EventStoreCustomerRepository {
    async fn find_all(&self) -> Result<Vec<Customer>, DataAccessError> {
        let mut stream = self.client.read_all(&ReadAllOptions::default()).await?;
        let mut streams = BTreeMap::new();
        while let Some(e) = stream.next().await? {
            collect_event(&mut streams, &e);
        }
        Ok(streams.into_values().filter_map(Customer::replay).collect())
    }

    async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, DataAccessError> {
        match self
            .client
            .read_stream(stream_name::<Customer>(id), &Default::default())
            .await
        {
            Ok(mut stream) => {
                let mut events = Vec::new();
                loop {
                    match stream.next().await {
                        Ok(Some(e)) => events.push(CustomerEvent::try_from(&e)?),
                        Ok(_) => break,
                        Err(eventstore::Error::ResourceDeleted) => return Ok(None),
                        Err(eventstore::Error::ResourceNotFound) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(Customer::replay(events))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
        let stream_name = stream_name::<Customer>(entity.id());
        entity
            .validate_pending()
            .map_err(|e| DataAccessError::ClientSideError(Box::new(e)))?;
        let rev = match entity.peek() {
            Some(CustomerEvent::CustomerRegistered { .. }) => ExpectedRevision::NoStream,
            Some(_) => ExpectedRevision::StreamExists,
            None => return Ok(false),
        };
        let events = entity
            .pop_all()
            .into_iter()
            .map(EventData::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        self.client
            .append_to_stream(
                &stream_name,
                &AppendToStreamOptions::default().expected_revision(rev),
                events,
            )
            .await?;
        Ok(true)
    }

    async fn delete(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
        let stream_name = stream_name::<Customer>(entity.id());
        entity.clear();
        entity.remove();
        let events = entity
            .pop_all()
            .into_iter()
            .map(EventData::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        match self
            .client
            .append_to_stream(
                &stream_name,
                &AppendToStreamOptions::default().expected_revision(ExpectedRevision::StreamExists),
                events,
            )
            .await
        {
            Ok(_) => {}
            Err(eventstore::Error::WrongExpectedVersion { .. })
            | Err(eventstore::Error::ResourceDeleted)
            | Err(eventstore::Error::ResourceNotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.client
            .delete_stream(&stream_name, &Default::default())
            .await?;
        Ok(true)
    }
}

/// 顧客ストリームのイベントをIDごとに振り分ける。変換できないイベントは読み飛ばす
fn collect_event(streams: &mut BTreeMap<CustomerId, Vec<CustomerEvent>>, e: &ResolvedEvent) {
    let stream_id = &e.get_original_event().stream_id;
    if !is_entity_stream::<Customer>(stream_id) {
        return;
    }
    let Some(id) = entity_id::<CustomerId, u64>(stream_id) else {
        return;
    };
    match CustomerEvent::try_from(e) {
        Ok(event) => streams.entry(id).or_default().push(event),
        Err(err) => warn!("イベントを変換できないためスキップします: {}: {}", stream_id, err),
    }
}

impl TryFrom<CustomerEvent> for EventData {
    type Error = EventConvertError;

    fn try_from(value: CustomerEvent) -> Result<Self, Self::Error> {
        from_event(value)
    }
}

impl TryFrom<&ResolvedEvent> for CustomerEvent {
    type Error = EventConvertError;

    fn try_from(value: &ResolvedEvent) -> Result<Self, Self::Error> {
        try_from_resolved_event(value)
    }
}
