//! Identity glue. Real authentication lives outside this service; this
//! module only needs to land a verified user id in the session for
//! `session::resolve_identity` to hand out.

use axum::{Json, Router, debug_handler, extract::State, response::IntoResponse, routing::post};
use rand::seq::IndexedRandom;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::session::USER_ID;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
}

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    username: Option<String>,
}

fn generated_username() -> String {
    let adjectives = [
        "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
        "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy",
        "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
    ];
    let nouns = [
        "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
        "Falcon", "Hawk", "Shark", "Panda", "Phoenix", "Griffin", "Turtle", "Dolphin",
    ];

    let mut rng = rand::rng();
    format!(
        "{}{}{}",
        adjectives.choose(&mut rng).unwrap(),
        nouns.choose(&mut rng).unwrap(),
        rand::random::<u16>() % 1000,
    )
}

#[debug_handler]
pub(crate) async fn login(
    State(db_pool): State<SqlitePool>,
    session: Session,
    Json(LoginQuery { username }): Json<LoginQuery>,
) -> AppResult<impl IntoResponse> {
    let username = match username {
        Some(name) => {
            let name = name.trim().to_owned();
            if name.is_empty() || name.chars().count() > 32 {
                return Err(AppError::invalid_input("username must be 1..=32 characters"));
            }
            name
        }
        None => generated_username(),
    };

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE username=?")
        .bind(&username)
        .fetch_optional(&db_pool)
        .await?;

    let user_id = match existing {
        Some((id,)) => Uuid::parse_str(&id)?,
        None => {
            let id = Uuid::now_v7();
            sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?,?,?)")
                .bind(id.to_string())
                .bind(&username)
                .bind(OffsetDateTime::now_utc().unix_timestamp())
                .execute(&db_pool)
                .await?;
            tracing::info!("created user @{username}");
            id
        }
    };

    session.insert(USER_ID, user_id.to_string()).await?;

    Ok(Json(json!({ "id": user_id, "username": username })))
}

#[debug_handler]
pub(crate) async fn logout(session: Session) -> AppResult<impl IntoResponse> {
    session.clear().await;
    Ok(Json(json!({ "ok": true })))
}
