use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use crm::application::customer_service::{CustomerForm, CustomerService, ServiceError};
use crm::domain::customer::{Customer, CustomerId};
use serde_json::json;
use tracing::error;

type Service = Arc<dyn CustomerService>;

pub fn router(service: Service) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/customers", get(list).post(create))
        .route("/customers/:id", get(show).put(update).delete(remove))
        .with_state(service)
}

pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::DataAccess(_) | ServiceError::IdGeneration(_) => {
                error!("リクエスト処理エラー: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list(State(service): State<Service>) -> Result<Json<Vec<Customer>>, ApiError> {
    Ok(Json(service.get_all().await?))
}

async fn create(
    State(service): State<Service>,
    Json(form): Json<CustomerForm>,
) -> Result<(StatusCode, Json<Customer>), ApiError> {
    let customer = service.add(form).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

async fn show(
    State(service): State<Service>,
    Path(id): Path<u64>,
) -> Result<Json<Customer>, ApiError> {
    Ok(Json(service.get_customer_by_id(CustomerId::from(id)).await?))
}

async fn update(
    State(service): State<Service>,
    Path(id): Path<u64>,
    Json(form): Json<CustomerForm>,
) -> Result<Json<Customer>, ApiError> {
    Ok(Json(service.update(CustomerId::from(id), form).await?))
}

async fn remove(
    State(service): State<Service>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    service.delete(CustomerId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
