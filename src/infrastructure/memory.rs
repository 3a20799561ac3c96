use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::customer::{Customer, CustomerEvent, CustomerId, CustomerRepository};
use crate::domain::{Aggregation, DataAccessError, Entity};

#[derive(Error, Debug)]
pub enum MemoryStoreError {
    #[error("customer {0} already exists")]
    AlreadyExists(CustomerId),
    #[error("customer {0} does not exist")]
    NotFound(CustomerId),
}

/// プロセス内に顧客を保持するリポジトリ
#[derive(Default)]
pub struct InMemoryCustomerRepository {
    customers: RwLock<BTreeMap<CustomerId, Customer>>,
}

impl InMemoryCustomerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustomerRepository for InMemoryCustomerRepository {
    async fn find_all(&self) -> Result<Vec<Customer>, DataAccessError> {
        Ok(self.customers.read().await.values().cloned().collect())
    }

    async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, DataAccessError> {
        Ok(self.customers.read().await.get(&id).cloned())
    }

    async fn save(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
        let id = entity.id();
        entity
            .validate_pending()
            .map_err(|e| DataAccessError::ClientSideError(Box::new(e)))?;
        let mut customers = self.customers.write().await;
        match entity.peek() {
            Some(CustomerEvent::CustomerRegistered { .. }) if customers.contains_key(&id) => {
                return Err(DataAccessError::WriteError(Box::new(
                    MemoryStoreError::AlreadyExists(id),
                )))
            }
            Some(CustomerEvent::CustomerRegistered { .. }) => {}
            Some(_) if !customers.contains_key(&id) => {
                return Err(DataAccessError::WriteError(Box::new(
                    MemoryStoreError::NotFound(id),
                )))
            }
            Some(_) => {}
            None => return Ok(false),
        }
        let deleted = matches!(
            entity.iter().last(),
            Some(CustomerEvent::CustomerDeleted { .. })
        );
        entity.clear();
        if deleted {
            customers.remove(&id);
        } else {
            customers.insert(id, entity.clone());
        }
        Ok(true)
    }

    async fn delete(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
        let removed = self.customers.write().await.remove(&entity.id());
        entity.clear();
        Ok(removed.is_some())
    }
}
