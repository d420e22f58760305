use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};

pub const USER_ID: &str = "user_id";

/// Resolves the caller's verified identity from the session, or fails with
/// `Unauthorized`. Every gateway entry point goes through this first.
pub async fn resolve_identity(session: &Session) -> AppResult<Uuid> {
    let Some(id) = session.get::<String>(USER_ID).await? else {
        return Err(AppError::Unauthorized);
    };
    Ok(Uuid::parse_str(&id)?)
}
