use axum::{
    Json, debug_handler,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppState;
use crate::appresult::{AppError, AppResult};
use crate::db::{self, Club, Role};
use crate::discipline;
use crate::registry::{SubscriberRegistry, Topic};
use crate::session::resolve_identity;

use super::require_club;

/// Joins a public club. Idempotent for existing members. Banned and
/// suspended users cannot rejoin (their membership was evicted when the
/// sanction landed).
pub async fn join_club(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
    now: OffsetDateTime,
) -> AppResult<()> {
    let standing = discipline::evaluate(pool, club.id, caller, now).await?;
    if let Some(block) = standing.read_block() {
        return Err(block.into());
    }

    if !club.is_public {
        return Err(AppError::forbidden("this club is private"));
    }

    sqlx::query(
        "INSERT OR IGNORE INTO memberships (club_id, user_id, role, created_at) VALUES (?,?,?,?)",
    )
    .bind(club.id.to_string())
    .bind(caller.to_string())
    .bind(Role::Member.as_str())
    .bind(now.unix_timestamp())
    .execute(pool)
    .await?;

    registry.broadcast(Topic::Club(club.id));

    Ok(())
}

pub async fn leave_club(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
) -> AppResult<()> {
    let Some(role) = db::find_membership(pool, club.id, caller).await? else {
        return Err(AppError::forbidden("not a member of this club"));
    };
    if role == Role::Owner {
        return Err(AppError::forbidden("the owner cannot leave their club"));
    }

    sqlx::query("DELETE FROM memberships WHERE club_id=? AND user_id=?")
        .bind(club.id.to_string())
        .bind(caller.to_string())
        .execute(pool)
        .await?;

    registry.broadcast(Topic::Club(club.id));

    Ok(())
}

#[debug_handler(state = AppState)]
pub(crate) async fn join_handler(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    join_club(
        &state.db_pool,
        &state.registry,
        &club,
        caller,
        OffsetDateTime::now_utc(),
    )
    .await?;

    Ok(Json(json!({ "ok": true })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave_handler(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    leave_club(&state.db_pool, &state.registry, &club, caller).await?;

    Ok(Json(json!({ "ok": true })))
}
