//! 顧客サービス
//!
//! リポジトリの前段で単体キャッシュ（`customers`）と一覧キャッシュ（`customer_list`）を
//! キャッシュアサイドで扱う。書き込みは一覧キャッシュを必ず破棄する。
//! 読み込み結果は、読み込み中にキーが更新・破棄されていない場合だけキャッシュする。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::customer::{Customer, CustomerError, CustomerId, CustomerRepository};
use crate::domain::{DataAccessError, Entity, IdGeneratorStopped, IdGeneratorTask};
use crate::infrastructure::cache::{Cache, CacheManager};
use crate::{CUSTOMERS_CACHE, CUSTOMER_LIST_CACHE};

const ALL_KEY: &str = "all";

/// 顧客の入力内容
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerForm {
    pub name: String,
    pub email: String,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("customer {0} was not found")]
    NotFound(CustomerId),
    #[error("invalid customer: {0}")]
    Invalid(#[from] CustomerError),
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),
    #[error(transparent)]
    IdGeneration(#[from] IdGeneratorStopped),
}

/// 顧客サービス
#[async_trait]
pub trait CustomerService: Send + Sync {
    /// 全顧客を取得する
    async fn get_all(&self) -> Result<Vec<Customer>, ServiceError>;
    /// 顧客を登録する
    async fn add(&self, form: CustomerForm) -> Result<Customer, ServiceError>;
    /// 顧客を更新する
    async fn update(&self, id: CustomerId, form: CustomerForm) -> Result<Customer, ServiceError>;
    /// 顧客を削除する
    async fn delete(&self, id: CustomerId) -> Result<(), ServiceError>;
    /// 顧客をIDで取得する
    async fn get_customer_by_id(&self, id: CustomerId) -> Result<Customer, ServiceError>;
}

pub struct DefaultCustomerService<R: ?Sized> {
    repository: Arc<R>,
    id_generator: IdGeneratorTask,
    caches: Arc<CacheManager>,
}

impl<R: CustomerRepository + ?Sized> DefaultCustomerService<R> {
    pub fn new(repository: Arc<R>, id_generator: IdGeneratorTask, caches: Arc<CacheManager>) -> Self {
        Self {
            repository,
            id_generator,
            caches,
        }
    }

    fn customers(&self) -> Option<Arc<Cache>> {
        self.caches.get_cache(CUSTOMERS_CACHE)
    }

    fn customer_list(&self) -> Option<Arc<Cache>> {
        self.caches.get_cache(CUSTOMER_LIST_CACHE)
    }

    async fn refresh(&self, customer: &Customer) {
        if let Some(cache) = self.customers() {
            store(&cache, &customer.id().to_string(), customer).await;
        }
        if let Some(cache) = self.customer_list() {
            cache.evict(ALL_KEY).await;
        }
    }

    async fn evict(&self, id: CustomerId) {
        if let Some(cache) = self.customers() {
            cache.evict(&id.to_string()).await;
        }
        if let Some(cache) = self.customer_list() {
            cache.evict(ALL_KEY).await;
        }
    }

    async fn load(&self, id: CustomerId) -> Result<Customer, ServiceError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }
}

#[async_trait]
impl<R: CustomerRepository + ?Sized> CustomerService for DefaultCustomerService<R> {
    async fn get_all(&self) -> Result<Vec<Customer>, ServiceError> {
        let cache = self.customer_list();
        let mut generation = 0;
        if let Some(cache) = &cache {
            if let Some(customers) = lookup::<Vec<Customer>>(cache, ALL_KEY).await {
                return Ok(customers);
            }
            generation = cache.generation(ALL_KEY).await;
        }
        let customers = self.repository.find_all().await?;
        if let Some(cache) = &cache {
            store_if_unchanged(cache, ALL_KEY, &customers, generation).await;
        }
        Ok(customers)
    }

    async fn add(&self, form: CustomerForm) -> Result<Customer, ServiceError> {
        let id: CustomerId = self.id_generator.generate().await?;
        let mut customer = Customer::register(id, form.name, form.email, Utc::now())?;
        self.repository.save(&mut customer).await?;
        info!("顧客を登録しました: {}", id);
        self.refresh(&customer).await;
        Ok(customer)
    }

    async fn update(&self, id: CustomerId, form: CustomerForm) -> Result<Customer, ServiceError> {
        let mut customer = self.load(id).await?;
        if customer.name() != &form.name {
            customer.change_name(form.name)?;
        }
        if customer.email() != &form.email {
            customer.change_email(form.email)?;
        }
        let saved = match self.repository.save(&mut customer).await {
            Ok(saved) => saved,
            Err(e) => {
                // 読み込み後に削除されていれば未登録として扱う
                if let Ok(None) = self.repository.find_by_id(id).await {
                    return Err(ServiceError::NotFound(id));
                }
                return Err(e.into());
            }
        };
        if saved {
            info!("顧客を更新しました: {}", id);
            self.refresh(&customer).await;
        }
        Ok(customer)
    }

    async fn delete(&self, id: CustomerId) -> Result<(), ServiceError> {
        let mut customer = self.load(id).await?;
        if !self.repository.delete(&mut customer).await? {
            return Err(ServiceError::NotFound(id));
        }
        info!("顧客を削除しました: {}", id);
        self.evict(id).await;
        Ok(())
    }

    async fn get_customer_by_id(&self, id: CustomerId) -> Result<Customer, ServiceError> {
        let key = id.to_string();
        let cache = self.customers();
        let mut generation = 0;
        if let Some(cache) = &cache {
            if let Some(customer) = lookup::<Customer>(cache, &key).await {
                return Ok(customer);
            }
            generation = cache.generation(&key).await;
        }
        let customer = self.load(id).await?;
        if let Some(cache) = &cache {
            store_if_unchanged(cache, &key, &customer, generation).await;
        }
        Ok(customer)
    }
}

async fn lookup<T: DeserializeOwned>(cache: &Cache, key: &str) -> Option<T> {
    let value = cache.get(key).await?;
    match serde_json::from_value(value) {
        Ok(v) => {
            debug!("キャッシュヒット: {}[{}]", cache.name(), key);
            Some(v)
        }
        Err(e) => {
            warn!("キャッシュの値を破棄しました: {}[{}]: {}", cache.name(), key, e);
            cache.evict(key).await;
            None
        }
    }
}

async fn store<T: Serialize + ?Sized>(cache: &Cache, key: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(v) => cache.put(key, v).await,
        Err(e) => warn!("キャッシュに保存できません: {}[{}]: {}", cache.name(), key, e),
    }
}

async fn store_if_unchanged<T: Serialize + ?Sized>(
    cache: &Cache,
    key: &str,
    value: &T,
    generation: u64,
) {
    match serde_json::to_value(value) {
        Ok(v) => {
            if !cache.put_if_unchanged(key, v, generation).await {
                debug!("読み込み中に変更されたためキャッシュしません: {}[{}]", cache.name(), key);
            }
        }
        Err(e) => warn!("キャッシュに保存できません: {}[{}]: {}", cache.name(), key, e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use snowflake::SnowflakeIdGenerator;

    use super::*;
    use crate::infrastructure::memory::InMemoryCustomerRepository;

    /// 読み込みの直後に他の操作を割り込ませるリポジトリ
    #[derive(Default)]
    struct InterleavedRepository {
        inner: InMemoryCustomerRepository,
        slow_read: AtomicBool,
        vanish_after_read: AtomicBool,
    }

    impl InterleavedRepository {
        async fn after_read(&self) {
            if self.slow_read.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    #[async_trait]
    impl CustomerRepository for InterleavedRepository {
        async fn find_all(&self) -> Result<Vec<Customer>, DataAccessError> {
            let customers = self.inner.find_all().await?;
            self.after_read().await;
            Ok(customers)
        }

        async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, DataAccessError> {
            let found = self.inner.find_by_id(id).await?;
            self.after_read().await;
            if let Some(customer) = &found {
                if self.vanish_after_read.swap(false, Ordering::SeqCst) {
                    self.inner.delete(&mut customer.clone()).await?;
                }
            }
            Ok(found)
        }

        async fn save(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
            self.inner.save(entity).await
        }

        async fn delete(&self, entity: &mut Customer) -> Result<bool, DataAccessError> {
            self.inner.delete(entity).await
        }
    }

    fn interleaved_service() -> (
        Arc<DefaultCustomerService<InterleavedRepository>>,
        Arc<InterleavedRepository>,
        Arc<CacheManager>,
    ) {
        let repository = Arc::new(InterleavedRepository::default());
        let caches = Arc::new(CacheManager::new([CUSTOMERS_CACHE, CUSTOMER_LIST_CACHE]));
        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        (
            Arc::new(DefaultCustomerService::new(
                repository.clone(),
                ids,
                caches.clone(),
            )),
            repository,
            caches,
        )
    }

    fn service() -> (
        DefaultCustomerService<InMemoryCustomerRepository>,
        Arc<InMemoryCustomerRepository>,
        Arc<CacheManager>,
    ) {
        let repository = Arc::new(InMemoryCustomerRepository::new());
        let caches = Arc::new(CacheManager::new([CUSTOMERS_CACHE, CUSTOMER_LIST_CACHE]));
        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        (
            DefaultCustomerService::new(repository.clone(), ids, caches.clone()),
            repository,
            caches,
        )
    }

    fn form(name: &str, email: &str) -> CustomerForm {
        CustomerForm {
            name: name.to_owned(),
            email: email.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (service, _, _) = service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        assert_eq!(added.name(), "山田太郎");
        let found = service.get_customer_by_id(added.id()).await.unwrap();
        assert_eq!(found, added);
        assert_eq!(service.get_all().await.unwrap(), vec![added]);
    }

    #[tokio::test]
    async fn test_add_invalid() {
        let (service, repository, _) = service();
        let result = service.add(form(" ", "taro@example.com")).await;
        assert!(matches!(
            result,
            Err(ServiceError::Invalid(CustomerError::NameIsBlank))
        ));
        assert!(repository.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update() {
        let (service, _, _) = service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        let updated = service
            .update(added.id(), form("山田太郎", "yamada@example.com"))
            .await
            .unwrap();
        assert_eq!(updated.email(), "yamada@example.com");
        assert_eq!(updated.registered_at(), added.registered_at());
        assert_eq!(
            service.get_customer_by_id(added.id()).await.unwrap(),
            updated
        );

        let invalid = service
            .update(added.id(), form("山田太郎", "broken"))
            .await;
        assert!(matches!(
            invalid,
            Err(ServiceError::Invalid(CustomerError::InvalidEmail))
        ));
        assert_eq!(
            service.get_customer_by_id(added.id()).await.unwrap().email(),
            "yamada@example.com"
        );
    }

    #[tokio::test]
    async fn test_not_found() {
        let (service, _, _) = service();
        let id = CustomerId::from(404);
        assert!(matches!(
            service.get_customer_by_id(id).await,
            Err(ServiceError::NotFound(i)) if i == id
        ));
        assert!(matches!(
            service.update(id, form("A", "a@example.com")).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.delete(id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_evicts_cache() {
        let (service, _, caches) = service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        service.get_all().await.unwrap();
        let customers = caches.get_cache(CUSTOMERS_CACHE).unwrap();
        let list = caches.get_cache(CUSTOMER_LIST_CACHE).unwrap();
        assert!(customers.get(&added.id().to_string()).await.is_some());
        assert!(list.get(ALL_KEY).await.is_some());

        service.delete(added.id()).await.unwrap();
        assert!(customers.is_empty().await);
        assert!(list.is_empty().await);
        assert!(service.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_are_served_from_cache() {
        let (service, repository, _) = service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        assert_eq!(service.get_all().await.unwrap().len(), 1);

        // リポジトリを直接変更してもキャッシュが返る
        let mut stale = added.clone();
        repository.delete(&mut stale).await.unwrap();
        assert_eq!(service.get_all().await.unwrap().len(), 1);
        assert_eq!(
            service.get_customer_by_id(added.id()).await.unwrap(),
            added
        );
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_a_miss() {
        let (service, _, caches) = service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        let customers = caches.get_cache(CUSTOMERS_CACHE).unwrap();
        customers
            .put(added.id().to_string(), json!({"broken": true}))
            .await;
        assert_eq!(
            service.get_customer_by_id(added.id()).await.unwrap(),
            added
        );
    }

    #[tokio::test]
    async fn test_without_caches() {
        let repository = Arc::new(InMemoryCustomerRepository::new());
        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        let service =
            DefaultCustomerService::new(repository, ids, Arc::new(CacheManager::default()));
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        assert_eq!(service.get_all().await.unwrap(), vec![added]);
    }

    #[tokio::test]
    async fn test_read_racing_delete_is_not_cached() {
        let (service, repository, caches) = interleaved_service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();
        let id = added.id();
        caches.clear_all().await;

        repository.slow_read.store(true, Ordering::SeqCst);
        let reader = tokio::spawn({
            let service = service.clone();
            async move { service.get_customer_by_id(id).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.delete(id).await.unwrap();

        // 削除前に読んだ値は返るが、キャッシュには残らない
        assert_eq!(reader.await.unwrap().unwrap(), added);
        let customers = caches.get_cache(CUSTOMERS_CACHE).unwrap();
        assert!(customers.get(&id.to_string()).await.is_none());
        assert!(matches!(
            service.get_customer_by_id(id).await,
            Err(ServiceError::NotFound(i)) if i == id
        ));
    }

    #[tokio::test]
    async fn test_list_read_racing_update_is_not_cached() {
        let (service, repository, _) = interleaved_service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();

        repository.slow_read.store(true, Ordering::SeqCst);
        let reader = tokio::spawn({
            let service = service.clone();
            async move { service.get_all().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        service
            .update(added.id(), form("山田次郎", "taro@example.com"))
            .await
            .unwrap();

        assert_eq!(reader.await.unwrap().unwrap()[0].name(), "山田太郎");
        let names = service
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|c| c.name().clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["山田次郎"]);
    }

    #[tokio::test]
    async fn test_update_of_concurrently_deleted_customer() {
        let (service, repository, _) = interleaved_service();
        let added = service
            .add(form("山田太郎", "taro@example.com"))
            .await
            .unwrap();

        repository.vanish_after_read.store(true, Ordering::SeqCst);
        assert!(matches!(
            service
                .update(added.id(), form("山田次郎", "taro@example.com"))
                .await,
            Err(ServiceError::NotFound(i)) if i == added.id()
        ));
        assert!(repository.find_by_id(added.id()).await.unwrap().is_none());
    }
}
