pub mod chat;
pub mod feed;
pub(crate) mod live;
pub mod membership;
pub mod moderation;
pub mod new;
pub mod polls;

use axum::{Router, routing::{get, post}};
use sqlx::SqlitePool;

use crate::AppState;
use crate::appresult::{AppError, AppResult};
use crate::db::{self, Club};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/new", post(new::new_club))
        .route("/{slug}", get(feed::club_feed))
        .route("/{slug}/live", get(live::club_stream))
        .route("/{slug}/messages", post(chat::post_message_handler))
        .route("/{slug}/polls", post(polls::create_poll_handler))
        .route("/{slug}/polls/{poll_id}/vote", post(polls::cast_vote_handler))
        .route("/{slug}/join", post(membership::join_handler))
        .route("/{slug}/leave", post(membership::leave_handler))
        .route("/{slug}/discipline", post(moderation::discipline_handler))
}

pub(crate) async fn require_club(pool: &SqlitePool, slug: &str) -> AppResult<Club> {
    db::find_club_by_slug(pool, slug)
        .await?
        .ok_or_else(|| AppError::not_found("club"))
}
