pub mod appresult;
pub mod auth;
pub mod clubs;
pub mod db;
pub mod discipline;
pub mod notifications;
pub mod registry;
pub mod session;
pub mod stream;

use axum::extract::FromRef;
use sqlx::SqlitePool;

use crate::registry::SubscriberRegistry;

pub use crate::appresult::{AppError, AppResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: SubscriberRegistry,
}
