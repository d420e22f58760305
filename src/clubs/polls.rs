use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use time::{Duration, OffsetDateTime};
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppState;
use crate::appresult::{AppError, AppResult};
use crate::db::{self, Club};
use crate::discipline;
use crate::registry::{SubscriberRegistry, Topic};
use crate::session::resolve_identity;

use super::require_club;

pub const MAX_QUESTION_LEN: usize = 200;
pub const MAX_OPTIONS: usize = 10;
pub const MAX_OPTION_LEN: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreatePollInput {
    pub question: String,
    pub options: Vec<String>,
    pub expires_in_minutes: Option<i64>,
}

/// Creates a poll in the club. Membership required; mute does not block this
/// (mute covers chat posting only).
pub async fn create_poll(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
    input: CreatePollInput,
    now: OffsetDateTime,
) -> AppResult<Uuid> {
    if db::find_membership(pool, club.id, caller).await?.is_none() {
        return Err(AppError::forbidden("not a member of this club"));
    }

    let standing = discipline::evaluate(pool, club.id, caller, now).await?;
    if let Some(block) = standing.read_block() {
        return Err(block.into());
    }

    let question = input.question.trim();
    if question.is_empty() || question.chars().count() > MAX_QUESTION_LEN {
        return Err(AppError::invalid_input(format!(
            "question must be 1..={MAX_QUESTION_LEN} characters"
        )));
    }
    if input.options.len() < 2 || input.options.len() > MAX_OPTIONS {
        return Err(AppError::invalid_input(format!(
            "polls take 2..={MAX_OPTIONS} options"
        )));
    }
    if input
        .options
        .iter()
        .any(|o| o.trim().is_empty() || o.chars().count() > MAX_OPTION_LEN)
    {
        return Err(AppError::invalid_input(format!(
            "options must be 1..={MAX_OPTION_LEN} characters"
        )));
    }

    let expires_at = match input.expires_in_minutes {
        Some(minutes) if minutes <= 0 => {
            return Err(AppError::invalid_input("poll expiry must be positive"));
        }
        Some(minutes) => Some((now + Duration::minutes(minutes)).unix_timestamp()),
        None => None,
    };

    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO polls (id, club_id, question, options, expires_at, created_at) \
         VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(club.id.to_string())
    .bind(question)
    .bind(serde_json::to_string(&input.options)?)
    .bind(expires_at)
    .bind(now.unix_timestamp())
    .execute(pool)
    .await?;

    registry.broadcast(Topic::Club(club.id));

    Ok(id)
}

/// Records the caller's vote. Upsert semantics: re-voting overwrites the
/// prior choice, one row per (poll, user).
pub async fn cast_vote(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
    poll_id: Uuid,
    option_index: i64,
    now: OffsetDateTime,
) -> AppResult<()> {
    if db::find_membership(pool, club.id, caller).await?.is_none() {
        return Err(AppError::forbidden("not a member of this club"));
    }

    let standing = discipline::evaluate(pool, club.id, caller, now).await?;
    if let Some(block) = standing.read_block() {
        return Err(block.into());
    }

    let poll: Option<(String, Option<i64>)> =
        sqlx::query_as("SELECT options, expires_at FROM polls WHERE id=? AND club_id=?")
            .bind(poll_id.to_string())
            .bind(club.id.to_string())
            .fetch_optional(pool)
            .await?;
    let Some((options, expires_at)) = poll else {
        return Err(AppError::not_found("poll"));
    };

    if expires_at.is_some_and(|t| t <= now.unix_timestamp()) {
        return Err(AppError::invalid_input("poll is closed"));
    }

    let options: Vec<String> = serde_json::from_str(&options)?;
    if option_index < 0 || option_index as usize >= options.len() {
        return Err(AppError::not_found("poll option"));
    }

    sqlx::query(
        "INSERT INTO poll_votes (poll_id, user_id, option_index, created_at) VALUES (?,?,?,?) \
         ON CONFLICT(poll_id, user_id) \
         DO UPDATE SET option_index=excluded.option_index, created_at=excluded.created_at",
    )
    .bind(poll_id.to_string())
    .bind(caller.to_string())
    .bind(option_index)
    .bind(now.unix_timestamp())
    .execute(pool)
    .await?;

    registry.broadcast(Topic::Club(club.id));

    Ok(())
}

#[debug_handler(state = AppState)]
pub(crate) async fn create_poll_handler(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
    Json(input): Json<CreatePollInput>,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    let id = create_poll(
        &state.db_pool,
        &state.registry,
        &club,
        caller,
        input,
        OffsetDateTime::now_utc(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CastVoteInput {
    option_index: i64,
}

#[debug_handler(state = AppState)]
pub(crate) async fn cast_vote_handler(
    Path((slug, poll_id)): Path<(String, Uuid)>,
    State(state): State<AppState>,
    session: Session,
    Json(input): Json<CastVoteInput>,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    cast_vote(
        &state.db_pool,
        &state.registry,
        &club,
        caller,
        poll_id,
        input.option_index,
        OffsetDateTime::now_utc(),
    )
    .await?;

    Ok(Json(json!({ "ok": true })))
}
