use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

/// 顧客リポジトリ
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    /// 全顧客をID順で取得する
    async fn find_all(&self) -> Result<Vec<Customer>, DataAccessError>;
    /// 顧客をIDで検索する
    async fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, DataAccessError>;
    /// 顧客を保存する
    async fn save(&self, entity: &mut Customer) -> Result<bool, DataAccessError>;
    /// 顧客を削除する
    async fn delete(&self, entity: &mut Customer) -> Result<bool, DataAccessError>;
}

/// 顧客ID
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Deref,
    Default,
)]
pub struct CustomerId(u64);

impl Id for CustomerId {
    type Inner = u64;
}

/// 顧客イベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerEvent {
    /// 顧客が登録された
    CustomerRegistered {
        id: CustomerId,
        name: String,
        email: String,
        registered_at: DateTime<Utc>,
    },
    /// 顧客名が変更された
    CustomerNameChanged { id: CustomerId, name: String },
    /// メールアドレスが変更された
    CustomerEmailChanged { id: CustomerId, email: String },
    /// 顧客が削除された
    CustomerDeleted { id: CustomerId },
}

impl Event for CustomerEvent {
    type Id = CustomerId;
}

impl CustomerEvent {
    pub fn id(&self) -> CustomerId {
        match self {
            CustomerEvent::CustomerRegistered { id, .. }
            | CustomerEvent::CustomerNameChanged { id, .. }
            | CustomerEvent::CustomerEmailChanged { id, .. }
            | CustomerEvent::CustomerDeleted { id } => *id,
        }
    }
}

/// 顧客エンティティ
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Customer {
    id: CustomerId,
    name: String,
    email: String,
    registered_at: DateTime<Utc>,
    #[serde(skip)]
    events: EventQueue<CustomerEvent>,
}

impl Customer {
    pub fn register(
        id: CustomerId,
        name: String,
        email: String,
        registered_at: DateTime<Utc>,
    ) -> Result<Self, CustomerError> {
        Self::validate_registered(&name, &email)?;
        let mut entity = Customer {
            id,
            name: name.clone(),
            email: email.clone(),
            registered_at,
            ..Default::default()
        };
        entity.events.push(CustomerEvent::CustomerRegistered {
            id,
            name,
            email,
            registered_at,
        });
        Ok(entity)
    }

    /// イベント列から顧客を復元する。イベントが無いか削除済みなら`None`
    pub fn replay<I>(events: I) -> Option<Self>
    where
        I: IntoIterator<Item = CustomerEvent>,
    {
        let mut entity = Customer::default();
        for event in events {
            entity.apply(event);
        }
        match entity.events.iter().last() {
            None | Some(CustomerEvent::CustomerDeleted { .. }) => None,
            Some(_) => {
                entity.clear();
                Some(entity)
            }
        }
    }

    pub fn change_name(&mut self, name: String) -> Result<(), CustomerError> {
        Self::validate_name(&name)?;
        self.name = name.clone();
        self.events
            .push(CustomerEvent::CustomerNameChanged { id: self.id, name });
        Ok(())
    }

    pub fn change_email(&mut self, email: String) -> Result<(), CustomerError> {
        Self::validate_email(&email)?;
        self.email = email.clone();
        self.events
            .push(CustomerEvent::CustomerEmailChanged { id: self.id, email });
        Ok(())
    }

    pub fn remove(&mut self) {
        self.events
            .push(CustomerEvent::CustomerDeleted { id: self.id });
    }

    pub fn name(&self) -> &String {
        &self.name
    }

    pub fn email(&self) -> &String {
        &self.email
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    fn validate_id(&self, id: &CustomerId) -> Result<(), CustomerError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(CustomerError::MismatchedId),
        }
    }

    fn validate_registered(name: &str, email: &str) -> Result<(), CustomerError> {
        Self::validate_name(name)?;
        Self::validate_email(email)
    }

    fn validate_name(name: &str) -> Result<(), CustomerError> {
        match name.trim().is_empty() {
            true => Err(CustomerError::NameIsBlank),
            false => Ok(()),
        }
    }

    fn validate_email(email: &str) -> Result<(), CustomerError> {
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !email.chars().any(char::is_whitespace)
            }
            None => false,
        };
        match valid {
            true => Ok(()),
            false => Err(CustomerError::InvalidEmail),
        }
    }
}

impl Entity for Customer {
    type Id = CustomerId;

    const ENTITY_NAME: &'static str = "customer";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Customer {
    type Event = CustomerEvent;
    type Error = CustomerError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            CustomerEvent::CustomerRegistered { name, email, .. } => {
                Self::validate_registered(name, email)
            }
            CustomerEvent::CustomerNameChanged { id, name } => {
                self.validate_id(id)?;
                Self::validate_name(name)
            }
            CustomerEvent::CustomerEmailChanged { id, email } => {
                self.validate_id(id)?;
                Self::validate_email(email)
            }
            CustomerEvent::CustomerDeleted { id } => self.validate_id(id),
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            CustomerEvent::CustomerRegistered {
                id,
                name,
                email,
                registered_at,
            } => {
                if self.id != id || self.events.is_empty() {
                    if let Ok(entity) = Self::register(id, name, email, registered_at) {
                        *self = entity;
                    }
                }
            }
            CustomerEvent::CustomerNameChanged { id, name } => {
                if self.id == id {
                    if let Err(_e) = self.change_name(name) {}
                }
            }
            CustomerEvent::CustomerEmailChanged { id, email } => {
                if self.id == id {
                    if let Err(_e) = self.change_email(email) {}
                }
            }
            CustomerEvent::CustomerDeleted { id } => {
                if self.id == id {
                    self.remove();
                }
            }
        }
    }

    fn events(&self) -> &EventQueue<Self::Event> {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue<Self::Event> {
        &mut self.events
    }
}

impl PartialEq for Customer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.email == other.email
            && self.registered_at == other.registered_at
    }
}

impl Eq for Customer {}

/// 顧客エラー
#[derive(Error, Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerError {
    /// IDが一致しません
    #[display(fmt = "ID does not match")]
    MismatchedId,
    /// 名前が空欄です
    #[display(fmt = "Name cannot be blank")]
    NameIsBlank,
    /// メールアドレスの形式が不正です
    #[display(fmt = "Email address is invalid")]
    InvalidEmail,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn registered_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_customer_register() {
        let customer = Customer::register(
            CustomerId(10),
            "山田太郎".to_owned(),
            "taro@example.com".to_owned(),
            registered_at(),
        )
        .unwrap();
        assert_eq!(customer.id(), CustomerId(10));
        assert_eq!(customer.name(), "山田太郎");
        assert_eq!(customer.email(), "taro@example.com");
        assert_eq!(customer.registered_at(), registered_at());
        assert!(matches!(
            customer.peek(),
            Some(CustomerEvent::CustomerRegistered { .. })
        ));
    }

    #[test]
    fn test_customer_register_invalid() {
        let blank = Customer::register(
            CustomerId(1),
            "  ".to_owned(),
            "taro@example.com".to_owned(),
            registered_at(),
        );
        assert_eq!(blank.unwrap_err(), CustomerError::NameIsBlank);

        for email in ["taro", "@example.com", "taro@example", "taro@.com", "ta ro@example.com"] {
            let invalid = Customer::register(
                CustomerId(1),
                "山田太郎".to_owned(),
                email.to_owned(),
                registered_at(),
            );
            assert_eq!(invalid.unwrap_err(), CustomerError::InvalidEmail, "{}", email);
        }
    }

    #[test]
    fn test_customer_change() {
        let mut customer = Customer::register(
            CustomerId(10),
            "山田太郎".to_owned(),
            "taro@example.com".to_owned(),
            registered_at(),
        )
        .unwrap();
        customer.clear();
        customer.change_name("山田花子".to_owned()).unwrap();
        customer.change_email("hanako@example.com".to_owned()).unwrap();
        assert_eq!(customer.change_name("".to_owned()), Err(CustomerError::NameIsBlank));
        assert_eq!(customer.name(), "山田花子");
        assert_eq!(
            customer.pop_all(),
            vec![
                CustomerEvent::CustomerNameChanged {
                    id: CustomerId(10),
                    name: "山田花子".to_owned(),
                },
                CustomerEvent::CustomerEmailChanged {
                    id: CustomerId(10),
                    email: "hanako@example.com".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn test_customer_validate_mismatched_id() {
        let customer = Customer::register(
            CustomerId(10),
            "山田太郎".to_owned(),
            "taro@example.com".to_owned(),
            registered_at(),
        )
        .unwrap();
        let event = CustomerEvent::CustomerNameChanged {
            id: CustomerId(11),
            name: "別人".to_owned(),
        };
        assert_eq!(customer.validate(&event), Err(CustomerError::MismatchedId));
    }

    #[test]
    fn test_customer_replay() {
        let events = vec![
            CustomerEvent::CustomerRegistered {
                id: CustomerId(5),
                name: "山田太郎".to_owned(),
                email: "taro@example.com".to_owned(),
                registered_at: registered_at(),
            },
            CustomerEvent::CustomerNameChanged {
                id: CustomerId(5),
                name: "山田次郎".to_owned(),
            },
            CustomerEvent::CustomerEmailChanged {
                id: CustomerId(6),
                email: "other@example.com".to_owned(),
            },
        ];
        let customer = Customer::replay(events.clone()).unwrap();
        assert_eq!(customer.name(), "山田次郎");
        assert_eq!(customer.email(), "taro@example.com");
        assert_eq!(customer.peek(), None);

        let mut deleted = events;
        deleted.push(CustomerEvent::CustomerDeleted { id: CustomerId(5) });
        assert_eq!(Customer::replay(deleted), None);
        assert_eq!(Customer::replay(Vec::new()), None);
    }

    #[test]
    fn test_customer_serialize_skips_events() {
        let customer = Customer::register(
            CustomerId(3),
            "山田太郎".to_owned(),
            "taro@example.com".to_owned(),
            registered_at(),
        )
        .unwrap();
        let json = serde_json::to_value(&customer).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 3,
                "name": "山田太郎",
                "email": "taro@example.com",
                "registered_at": "2023-04-01T09:00:00Z",
            })
        );
        let back: Customer = serde_json::from_value(json).unwrap();
        assert_eq!(back, customer);
    }
}
