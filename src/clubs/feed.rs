//! Room State Projector: assembles the externally visible snapshot of a club
//! (message feed + poll tallies) on demand. Stateless between calls; every
//! live delivery and every plain read goes through here.

use axum::{Json, debug_handler, extract::{Path, State}, response::IntoResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::db::{self, Club};
use crate::discipline;
use crate::session::resolve_identity;

use super::require_club;

#[derive(Debug, Serialize)]
pub struct ChatSnapshot {
    pub messages: Vec<MessageView>,
    pub polls: Vec<PollView>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub body: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub author: AuthorView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Gif,
}

#[derive(Debug, Serialize)]
pub struct AuthorView {
    pub id: Uuid,
    pub username: String,
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PollView {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    pub counts: Vec<i64>,
    #[serde(rename = "myVote")]
    pub my_vote: Option<i64>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<String>,
}

/// Assembles the full snapshot for one viewer. No access checks here; the
/// gateway and the live renderer apply those before calling in.
pub async fn chat_snapshot(
    pool: &SqlitePool,
    club_id: Uuid,
    viewer: Uuid,
) -> AppResult<ChatSnapshot> {
    let rows: Vec<(String, String, Option<String>, i64, String, String, Option<String>)> =
        sqlx::query_as(
            "SELECT m.id, m.body, m.attachments, m.created_at, u.id, u.username, u.image \
             FROM messages m JOIN users u ON u.id = m.author_id \
             WHERE m.club_id=? ORDER BY m.created_at, m.id",
        )
        .bind(club_id.to_string())
        .fetch_all(pool)
        .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, body, attachments, created_at, author_id, username, image) in rows {
        messages.push(MessageView {
            id: Uuid::parse_str(&id)?,
            body,
            created_at: db::rfc3339(created_at)?,
            attachments: match attachments {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            },
            author: AuthorView {
                id: Uuid::parse_str(&author_id)?,
                username,
                image,
            },
        });
    }

    let poll_rows: Vec<(String, String, String, Option<i64>)> = sqlx::query_as(
        "SELECT id, question, options, expires_at FROM polls \
         WHERE club_id=? ORDER BY created_at, id",
    )
    .bind(club_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut polls = Vec::with_capacity(poll_rows.len());
    for (id, question, options, expires_at) in poll_rows {
        let options: Vec<String> = serde_json::from_str(&options)?;
        let mut counts = vec![0i64; options.len()];

        let tallies: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT option_index, COUNT(*) FROM poll_votes WHERE poll_id=? GROUP BY option_index",
        )
        .bind(&id)
        .fetch_all(pool)
        .await?;
        for (index, count) in tallies {
            if let Some(slot) = counts.get_mut(index as usize) {
                *slot = count;
            }
        }

        let my_vote: Option<(i64,)> =
            sqlx::query_as("SELECT option_index FROM poll_votes WHERE poll_id=? AND user_id=?")
                .bind(&id)
                .bind(viewer.to_string())
                .fetch_optional(pool)
                .await?;

        polls.push(PollView {
            id: Uuid::parse_str(&id)?,
            question,
            options,
            counts,
            my_vote: my_vote.map(|(i,)| i),
            expires_at: expires_at.map(db::rfc3339).transpose()?,
        });
    }

    Ok(ChatSnapshot { messages, polls })
}

/// The gated read path: membership for private clubs, then the read
/// precedence rule (ban and active suspend close the club; mute does not).
pub async fn read_feed(
    pool: &SqlitePool,
    club: &Club,
    viewer: Uuid,
    now: OffsetDateTime,
) -> AppResult<ChatSnapshot> {
    if !club.is_public && db::find_membership(pool, club.id, viewer).await?.is_none() {
        return Err(AppError::forbidden("not a member of this club"));
    }

    let state = discipline::evaluate(pool, club.id, viewer, now).await?;
    if let Some(block) = state.read_block() {
        return Err(block.into());
    }

    chat_snapshot(pool, club.id, viewer).await
}

/// Renderer for live sessions: re-applies the read gate on every delivery,
/// so a viewer sanctioned mid-stream loses the session on the next trigger.
pub async fn live_chat_frame(
    pool: &SqlitePool,
    club: &Club,
    viewer: Uuid,
) -> AppResult<String> {
    let snapshot = read_feed(pool, club, viewer, OffsetDateTime::now_utc()).await?;
    Ok(serde_json::to_string(&snapshot)?)
}

#[debug_handler]
pub(crate) async fn club_feed(
    Path(slug): Path<String>,
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let viewer = resolve_identity(&session).await?;
    let club = require_club(&db_pool, &slug).await?;

    let snapshot = read_feed(&db_pool, &club, viewer, OffsetDateTime::now_utc()).await?;
    Ok(Json(snapshot))
}
