use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::AppState;
use crate::appresult::{AppError, AppResult};
use crate::db::{self, Club};
use crate::discipline;
use crate::registry::{SubscriberRegistry, Topic};
use crate::session::resolve_identity;

use super::feed::Attachment;
use super::require_club;

pub const MAX_BODY_LEN: usize = 2000;
pub const MAX_ATTACHMENTS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct PostMessageInput {
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Posts a message to the club's chat. Requires membership; the full
/// discipline precedence applies, including mute (the one write mute
/// blocks). Broadcasts the club topic on success.
pub async fn post_message(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
    input: PostMessageInput,
    now: OffsetDateTime,
) -> AppResult<Uuid> {
    if db::find_membership(pool, club.id, caller).await?.is_none() {
        return Err(AppError::forbidden("not a member of this club"));
    }

    let standing = discipline::evaluate(pool, club.id, caller, now).await?;
    if let Some(block) = standing.post_block() {
        return Err(block.into());
    }

    let body = input.body.trim();
    if body.is_empty() {
        return Err(AppError::invalid_input("message body is empty"));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(AppError::invalid_input(format!(
            "message body exceeds {MAX_BODY_LEN} characters"
        )));
    }
    if input.attachments.len() > MAX_ATTACHMENTS {
        return Err(AppError::invalid_input(format!(
            "at most {MAX_ATTACHMENTS} attachments allowed"
        )));
    }
    if input.attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(AppError::invalid_input("attachment url is empty"));
    }

    let id = Uuid::now_v7();
    let attachments = if input.attachments.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&input.attachments)?)
    };

    sqlx::query(
        "INSERT INTO messages (id, club_id, author_id, body, attachments, created_at) \
         VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(club.id.to_string())
    .bind(caller.to_string())
    .bind(body)
    .bind(attachments)
    .bind(now.unix_timestamp())
    .execute(pool)
    .await?;

    registry.broadcast(Topic::Club(club.id));

    Ok(id)
}

#[debug_handler(state = AppState)]
pub(crate) async fn post_message_handler(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
    Json(input): Json<PostMessageInput>,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    let id = post_message(
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
