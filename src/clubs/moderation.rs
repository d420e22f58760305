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
use crate::db::{self, Club, Role};
use crate::discipline::{self, DisciplineKind};
use crate::notifications;
use crate::registry::{SubscriberRegistry, Topic};
use crate::session::resolve_identity;

use super::require_club;

#[derive(Debug, Deserialize)]
pub struct DisciplineInput {
    pub target: Uuid,
    pub kind: DisciplineKind,
    pub reason: Option<String>,
    /// Required for mute and suspend; optional for ban (absent = permanent).
    pub minutes: Option<i64>,
}

/// Issues a sanction against a club member.
///
/// Caller must hold moderator or owner role in the club, or be a global
/// admin. Self-targeting is refused, and a plain moderator cannot touch the
/// owner or another moderator. Ban and suspend evict the target's membership
/// row; mute leaves it intact and only blocks chat posting until expiry.
pub async fn apply_discipline(
    pool: &SqlitePool,
    registry: &SubscriberRegistry,
    club: &Club,
    caller: Uuid,
    input: DisciplineInput,
    now: OffsetDateTime,
) -> AppResult<Uuid> {
    let Some(caller_user) = db::find_user(pool, caller).await? else {
        return Err(AppError::Unauthorized);
    };
    let caller_role = db::find_membership(pool, club.id, caller).await?;

    if !caller_user.is_admin && !caller_role.is_some_and(|r| r.can_moderate()) {
        return Err(AppError::forbidden("moderator role required"));
    }

    let standing = discipline::evaluate(pool, club.id, caller, now).await?;
    if let Some(block) = standing.read_block() {
        return Err(block.into());
    }

    if input.target == caller {
        return Err(AppError::forbidden("you cannot discipline yourself"));
    }

    if db::find_user(pool, input.target).await?.is_none() {
        return Err(AppError::not_found("target user"));
    }

    let target_role = db::find_membership(pool, club.id, input.target).await?;
    if !caller_user.is_admin
        && caller_role != Some(Role::Owner)
        && target_role.is_some_and(|r| r.can_moderate())
    {
        return Err(AppError::forbidden(
            "moderators cannot discipline the owner or other moderators",
        ));
    }

    let expires_at = match (input.kind, input.minutes) {
        (_, Some(minutes)) if minutes <= 0 => {
            return Err(AppError::invalid_input("duration must be positive"));
        }
        (_, Some(minutes)) => Some(now + Duration::minutes(minutes)),
        (DisciplineKind::Ban, None) => None,
        (DisciplineKind::Mute | DisciplineKind::Suspend, None) => {
            return Err(AppError::invalid_input(
                "mute and suspend require a duration in minutes",
            ));
        }
    };

    // The record and the eviction commit or roll back together; a sanction
    // must never land without its membership effect.
    let id = Uuid::now_v7();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO discipline_records \
         (id, club_id, user_id, issuer_id, kind, reason, expires_at, created_at) \
         VALUES (?,?,?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(club.id.to_string())
    .bind(input.target.to_string())
    .bind(caller.to_string())
    .bind(input.kind.as_str())
    .bind(input.reason.as_deref())
    .bind(expires_at.map(|t| t.unix_timestamp()))
    .bind(now.unix_timestamp())
    .execute(&mut *tx)
    .await?;

    // Eviction: bans and suspensions take the member out of the club
    // immediately; a mute only gates future posts.
    if matches!(input.kind, DisciplineKind::Ban | DisciplineKind::Suspend) {
        sqlx::query("DELETE FROM memberships WHERE club_id=? AND user_id=?")
            .bind(club.id.to_string())
            .bind(input.target.to_string())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    // Post-commit side effects are best effort: the sanction is already
    // live, so a failed inbox write must not turn it into an error, and the
    // club broadcast always fires.
    let verb = match input.kind {
        DisciplineKind::Ban => "banned from",
        DisciplineKind::Mute => "muted in",
        DisciplineKind::Suspend => "suspended from",
    };
    let until = match expires_at {
        Some(t) => format!(" until {}", db::rfc3339(t.unix_timestamp())?),
        None => String::new(),
    };
    if let Err(err) = notifications::notify(
        pool,
        registry,
        input.target,
        format!("You have been {verb} {}{until}", club.name),
        now,
    )
    .await
    {
        tracing::warn!(target = %input.target, "inbox notification failed: {err}");
    }

    registry.broadcast(Topic::Club(club.id));

    tracing::info!(
        club = %club.slug,
        target = %input.target,
        kind = input.kind.as_str(),
        "discipline applied"
    );

    Ok(id)
}

#[debug_handler(state = AppState)]
pub(crate) async fn discipline_handler(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
    Json(input): Json<DisciplineInput>,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    let id = apply_discipline(
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
