use std::convert::Infallible;
use std::future::Future;

use axum::{
    debug_handler,
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures_util::{Stream, StreamExt};
use time::OffsetDateTime;
use tower_sessions::Session;

use crate::AppState;
use crate::appresult::{AppError, AppResult};
use crate::db;
use crate::discipline;
use crate::registry::Topic;
use crate::session::resolve_identity;
use crate::stream::{event_channel, run_session};

use super::{feed, require_club};

/// Opens one Stream Session for the club's chat topic: gate the viewer the
/// same way a plain read is gated, then hand a renderer to the session loop
/// and drain its sink into the SSE body. When the client goes away the sink
/// closes and the session unregisters itself.
#[debug_handler(state = AppState)]
pub(crate) async fn club_stream(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let viewer = resolve_identity(&session).await?;
    let club = require_club(&state.db_pool, &slug).await?;

    if !club.is_public
        && db::find_membership(&state.db_pool, club.id, viewer)
            .await?
            .is_none()
    {
        return Err(AppError::forbidden("not a member of this club"));
    }

    let now = OffsetDateTime::now_utc();
    let standing = discipline::evaluate(&state.db_pool, club.id, viewer, now).await?;
    if let Some(block) = standing.read_block() {
        return Err(block.into());
    }

    Ok(spawn_sse_session(state, Topic::Club(club.id), move |pool| {
        let club = club.clone();
        async move { feed::live_chat_frame(&pool, &club, viewer).await }
    }))
}

/// Shared glue between the session loop and the SSE transport, used by the
/// club stream and the notifications stream alike.
pub(crate) fn spawn_sse_session<F, Fut>(
    state: AppState,
    topic: Topic,
    render: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    F: Fn(sqlx::SqlitePool) -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<String>> + Send + 'static,
{
    let (sink, mut rx) = event_channel();
    let pool = state.db_pool.clone();

    tokio::spawn(run_session(state.registry, topic, sink, move || {
        render(pool.clone())
    }));

    let frames = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|frame| Ok(Event::default().data(frame)));
    Sse::new(frames)
}
