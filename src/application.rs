pub mod customer_service;
pub mod lifecycle;
pub mod startup_listener;
