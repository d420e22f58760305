use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};

pub async fn connect(url: &str) -> sqlx::Result<SqlitePool> {
    SqlitePoolOptions::new().max_connections(16).connect(url).await
}

/// Single-connection pool for `sqlite::memory:`. Every connection to the
/// in-memory driver is its own database, so the pool must never open a
/// second one.
pub async fn connect_memory() -> sqlx::Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    image TEXT,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS clubs (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    is_public INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS memberships (
    club_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member',
    created_at INTEGER NOT NULL,
    PRIMARY KEY (club_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    club_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    body TEXT NOT NULL,
    attachments TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS polls (
    id TEXT PRIMARY KEY,
    club_id TEXT NOT NULL,
    question TEXT NOT NULL,
    options TEXT NOT NULL,
    expires_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS poll_votes (
    poll_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    option_index INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (poll_id, user_id)
);
CREATE TABLE IF NOT EXISTS discipline_records (
    id TEXT PRIMARY KEY,
    club_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    issuer_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    reason TEXT,
    expires_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_discipline_target ON discipline_records (club_id, user_id);
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    body TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
";

pub async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Club {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub image: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Moderator,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Moderator => "moderator",
            Self::Owner => "owner",
        }
    }

    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Moderator | Self::Owner)
    }

    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "member" => Ok(Self::Member),
            "moderator" => Ok(Self::Moderator),
            "owner" => Ok(Self::Owner),
            _ => Err(AppError::Internal(anyhow::anyhow!(
                "unknown role {s:?} in database"
            ))),
        }
    }
}

pub async fn find_club_by_slug(pool: &SqlitePool, slug: &str) -> AppResult<Option<Club>> {
    let row: Option<(String, String, String, bool)> =
        sqlx::query_as("SELECT id, slug, name, is_public FROM clubs WHERE slug=?")
            .bind(slug)
            .fetch_optional(pool)
            .await?;

    let Some((id, slug, name, is_public)) = row else {
        return Ok(None);
    };

    Ok(Some(Club {
        id: Uuid::parse_str(&id)?,
        slug,
        name,
        is_public,
    }))
}

pub async fn find_membership(
    pool: &SqlitePool,
    club_id: Uuid,
    user_id: Uuid,
) -> AppResult<Option<Role>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT role FROM memberships WHERE club_id=? AND user_id=?")
            .bind(club_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;

    row.map(|(role,)| Role::parse(&role)).transpose()
}

pub async fn find_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<Option<User>> {
    let row: Option<(String, String, Option<String>, bool)> =
        sqlx::query_as("SELECT id, username, image, is_admin FROM users WHERE id=?")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;

    let Some((id, username, image, is_admin)) = row else {
        return Ok(None);
    };

    Ok(Some(User {
        id: Uuid::parse_str(&id)?,
        username,
        image,
        is_admin,
    }))
}

/// Renders a stored unix-second timestamp as ISO-8601 for payloads.
pub fn rfc3339(ts: i64) -> AppResult<String> {
    Ok(OffsetDateTime::from_unix_timestamp(ts)?.format(&Rfc3339)?)
}
