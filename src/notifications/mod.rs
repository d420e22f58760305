//! Per-user notification inbox, fanned out through the same stream-session
//! machinery as club chat, on `Topic::Inbox(user)`.

use std::convert::Infallible;

use axum::{
    Json, Router, debug_handler,
    extract::State,
    response::{IntoResponse, sse::{Event, Sse}},
    routing::{get, post},
};
use futures_util::Stream;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppState;
use crate::appresult::AppResult;
use crate::clubs::live::spawn_sse_session;
use crate::db;
use crate::registry::{SubscriberRegistry, Topic};
use crate::session::resolve_identity;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(inbox))
        .route("/live", get(inbox_stream))
        .route("/read", post(mark_read))
}

#[derive(Debug, Serialize)]
pub struct NotificationsSnapshot {
    pub notifications: Vec<NotificationView>,
}

#[derive(Debug, Serialize)]
pub struct NotificationView {
    pub id: Uuid,
    pub body: String,
    #[serde(rename = "isRead")]
    pub is_read: bool,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

pub async fn inbox_snapshot(pool: &SqlitePool, user_id: Uuid) -> AppResult<NotificationsSnapshot> {
    let rows: Vec<(String, String, bool, i64)> = sqlx::query_as(
        "SELECT id, body, is_read, created_at FROM notifications \
         WHERE user_id=? ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut notifications = Vec::with_capacity(rows.len());
    for (id, body, is_read, created_at) in rows {
        notifications.push(NotificationView {
            id: Uuid::parse_str(&id)?,
            body,
            is_read,
            created_at: db::rfc3339(created_at)?,
        });
    }

    Ok(NotificationsSnapshot { notifications })
}

/// Inserts a notification and wakes the target's live inbox sessions.
pub async fn notify(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    user_id: Uuid,
    body: String,
    now: OffsetDateTime,
) -> AppResult<()> {
    sqlx::query("INSERT INTO notifications (id, user_id, body, created_at) VALUES (?,?,?,?)")
        .bind(Uuid::now_v7().to_string())
        .bind(user_id.to_string())
        .bind(&body)
        .bind(now.unix_timestamp())
        .execute(pool)
        .await?;

    registry.broadcast(Topic::Inbox(user_id));

    Ok(())
}

#[debug_handler]
pub(crate) async fn inbox(
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let viewer = resolve_identity(&session).await?;
    Ok(Json(inbox_snapshot(&db_pool, viewer).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn inbox_stream(
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let viewer = resolve_identity(&session).await?;

    Ok(spawn_sse_session(
        state,
        Topic::Inbox(viewer),
        move |pool| async move {
            let snapshot = inbox_snapshot(&pool, viewer).await?;
            Ok(serde_json::to_string(&snapshot)?)
        },
    ))
}

#[debug_handler(state = AppState)]
pub(crate) async fn mark_read(
    State(state): State<AppState>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let viewer = resolve_identity(&session).await?;

    sqlx::query("UPDATE notifications SET is_read=1 WHERE user_id=? AND is_read=0")
        .bind(viewer.to_string())
        .execute(&state.db_pool)
        .await?;

    state.registry.broadcast(Topic::Inbox(viewer));

    Ok(Json(json!({ "ok": true })))
}
