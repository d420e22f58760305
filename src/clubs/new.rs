use axum::{
    Json, debug_handler,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::db::Role;
use crate::session::resolve_identity;

#[derive(Debug, Deserialize)]
pub struct NewClubInput {
    pub slug: String,
    pub name: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
}

fn default_public() -> bool {
    true
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 32
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Creates a club with the caller as owner. Slug uniqueness rides on the
/// column constraint rather than a racy pre-check; a concurrent duplicate
/// still comes back as a conflict.
pub async fn create_club(
    pool: &SqlitePool,
    caller: Uuid,
    input: NewClubInput,
    now: OffsetDateTime,
) -> AppResult<Uuid> {
    if !valid_slug(&input.slug) {
        return Err(AppError::invalid_input(
            "slug must be 1..=32 characters of a-z, 0-9 or '-'",
        ));
    }
    let name = input.name.trim().to_owned();
    if name.is_empty() || name.chars().count() > 64 {
        return Err(AppError::invalid_input("name must be 1..=64 characters"));
    }

    let id = Uuid::now_v7();
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO clubs (id, slug, name, is_public, created_at) VALUES (?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(&input.slug)
    .bind(&name)
    .bind(input.is_public)
    .bind(now.unix_timestamp())
    .execute(&mut *tx)
    .await;
    if let Err(err) = inserted {
        if err
            .as_database_error()
            .is_some_and(|e| e.is_unique_violation())
        {
            return Err(AppError::conflict(format!("slug {:?} is taken", input.slug)));
        }
        return Err(err.into());
    }
    sqlx::query("INSERT INTO memberships (club_id, user_id, role, created_at) VALUES (?,?,?,?)")
        .bind(id.to_string())
        .bind(caller.to_string())
        .bind(Role::Owner.as_str())
        .bind(now.unix_timestamp())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(slug = %input.slug, "club created");

    Ok(id)
}

#[debug_handler]
pub(crate) async fn new_club(
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(input): Json<NewClubInput>,
) -> AppResult<impl IntoResponse> {
    let caller = resolve_identity(&session).await?;
    let slug = input.slug.clone();

    let id = create_club(&db_pool, caller, input, OffsetDateTime::now_utc()).await?;

    Ok((StatusCode::CREATED, Json(json!({ "id": id, "slug": slug }))))
}
