use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisciplineKind {
    Ban,
    Mute,
    Suspend,
}

impl DisciplineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
            Self::Suspend => "suspend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ban" => Some(Self::Ban),
            "mute" => Some(Self::Mute),
            "suspend" => Some(Self::Suspend),
            _ => None,
        }
    }
}

/// One sanction row. Append-only: a newer record of the same kind for the
/// same (club, user) supersedes older ones, nothing is ever mutated.
#[derive(Debug, Clone)]
pub struct DisciplineRecord {
    pub kind: DisciplineKind,
    pub reason: Option<String>,
    /// Absent = permanent.
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Derived view of a user's standing in a club. Never persisted; recomputed
/// from the record history on every check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisciplineState {
    pub is_banned: bool,
    pub muted_until: Option<OffsetDateTime>,
    pub suspended_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessBlock {
    Banned,
    Suspended,
    Muted,
}

impl AccessBlock {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::Suspended => "suspended",
            Self::Muted => "muted",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::Banned => "you are banned from this club",
            Self::Suspended => "you are suspended from this club",
            Self::Muted => "you are muted in this club",
        }
    }
}

impl From<AccessBlock> for AppError {
    fn from(block: AccessBlock) -> Self {
        AppError::Forbidden {
            reason: block.reason(),
            message: block.message().to_owned(),
        }
    }
}

impl DisciplineState {
    /// Strictest-first precedence for reads: a ban closes the club entirely,
    /// an active suspend does the same but is time-bound. A mute leaves
    /// reading open.
    pub fn read_block(&self) -> Option<AccessBlock> {
        if self.is_banned {
            Some(AccessBlock::Banned)
        } else if self.suspended_until.is_some() {
            Some(AccessBlock::Suspended)
        } else {
            None
        }
    }

    /// Message posting additionally honors an active mute. Poll voting and
    /// other non-chat writes use `read_block` only.
    pub fn post_block(&self) -> Option<AccessBlock> {
        self.read_block()
            .or(self.muted_until.map(|_| AccessBlock::Muted))
    }
}

/// Pure state derivation: per kind, only the record with the latest creation
/// time counts, and it counts only while unexpired (no expiry = forever).
///
/// The mute and suspend fields surface the expiry instant itself, so a
/// record of those kinds without one derives as no block; the write gateway
/// upholds this by requiring a duration for mutes and suspends.
pub fn derive_state(records: &[DisciplineRecord], now: OffsetDateTime) -> DisciplineState {
    let active = |kind: DisciplineKind| {
        records
            .iter()
            .filter(|r| r.kind == kind)
            .max_by_key(|r| r.created_at)
            .filter(|r| r.expires_at.is_none_or(|t| t > now))
    };

    DisciplineState {
        is_banned: active(DisciplineKind::Ban).is_some(),
        muted_until: active(DisciplineKind::Mute).and_then(|r| r.expires_at),
        suspended_until: active(DisciplineKind::Suspend).and_then(|r| r.expires_at),
    }
}

/// Fetches the full record history for (club, user) and derives the current
/// state. A user or club with no records yields the all-clear state, never
/// an error.
pub async fn evaluate(
    pool: &SqlitePool,
    club_id: Uuid,
    user_id: Uuid,
    now: OffsetDateTime,
) -> AppResult<DisciplineState> {
    let rows: Vec<(String, Option<String>, Option<i64>, i64)> = sqlx::query_as(
        "SELECT kind, reason, expires_at, created_at FROM discipline_records \
         WHERE club_id=? AND user_id=?",
    )
    .bind(club_id.to_string())
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for (kind, reason, expires_at, created_at) in rows {
        let Some(kind) = DisciplineKind::parse(&kind) else {
            return Err(AppError::Internal(anyhow::anyhow!(
                "unknown discipline kind {kind:?} in database"
            )));
        };
        records.push(DisciplineRecord {
            kind,
            reason,
            expires_at: match expires_at {
                Some(ts) => Some(OffsetDateTime::from_unix_timestamp(ts)?),
                None => None,
            },
            created_at: OffsetDateTime::from_unix_timestamp(created_at)?,
        });
    }

    Ok(derive_state(&records, now))
}
