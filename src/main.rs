use axum::Router;
use huddles::{AppState, auth, clubs, db, notifications, registry::SubscriberRegistry};
use tower_http::cors::CorsLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let database_url = dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".into());
    let db_pool = if database_url == "sqlite::memory:" {
        db::connect_memory().await.unwrap()
    } else {
        db::connect(&database_url).await.unwrap()
    };
    db::init_schema(&db_pool).await.unwrap();

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(2)));

    let app_state = AppState {
        db_pool,
        registry: SubscriberRegistry::new(),
    };

    let app = Router::new()
        .merge(auth::router())
        .nest("/c", clubs::router())
        .nest("/notifications", notifications::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::permissive());

    let bind_addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    tracing::info!("listening on {bind_addr}");
    axum::serve(listener, app).await.unwrap();
}
