//! End-to-end gateway scenarios against an in-memory database: discipline
//! precedence at the write/read gates, vote upsert semantics, eviction, and
//! broadcast fan-out to registered subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::SqlitePool;
use tokio_test::assert_ok;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use huddles::appresult::AppError;
use huddles::clubs::{chat, feed, membership, moderation, new, polls};
use huddles::db::{self, Club, Role};
use huddles::discipline::DisciplineKind;
use huddles::registry::{PushFn, SubscriberRegistry, Topic};
use huddles::stream;

async fn test_pool() -> SqlitePool {
    let pool = db::connect_memory().await.unwrap();
    db::init_schema(&pool).await.unwrap();
    pool
}

async fn seed_user(pool: &SqlitePool, username: &str) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?,?,?)")
        .bind(id.to_string())
        .bind(username)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn seed_club(pool: &SqlitePool, slug: &str, owner: Uuid) -> Club {
    let id = Uuid::now_v7();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    sqlx::query("INSERT INTO clubs (id, slug, name, is_public, created_at) VALUES (?,?,?,1,?)")
        .bind(id.to_string())
        .bind(slug)
        .bind(format!("The {slug} club"))
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    add_member(pool, id, owner, Role::Owner).await;

    Club {
        id,
        slug: slug.to_owned(),
        name: format!("The {slug} club"),
        is_public: true,
    }
}

async fn add_member(pool: &SqlitePool, club_id: Uuid, user_id: Uuid, role: Role) {
    sqlx::query("INSERT INTO memberships (club_id, user_id, role, created_at) VALUES (?,?,?,?)")
        .bind(club_id.to_string())
        .bind(user_id.to_string())
        .bind(role.as_str())
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(pool)
        .await
        .unwrap();
}

fn counter_push(counter: &Arc<AtomicUsize>) -> PushFn {
    let counter = Arc::clone(counter);
    Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn message(body: &str) -> chat::PostMessageInput {
    chat::PostMessageInput {
        body: body.to_owned(),
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn banned_non_member_cannot_read_the_feed() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let outsider = seed_user(&pool, "outsider").await;
    let club = seed_club(&pool, "knitting", owner).await;

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: outsider,
            kind: DisciplineKind::Ban,
            reason: Some("spam".to_owned()),
            minutes: None,
        },
        now,
    )
    .await
    .unwrap();

    let err = feed::read_feed(&pool, &club, outsider, now).await.unwrap_err();
    assert_eq!(err.reason(), "banned");
}

#[tokio::test]
async fn mute_blocks_posts_until_it_expires_then_one_broadcast_per_subscriber() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let member = seed_user(&pool, "member").await;
    let club = seed_club(&pool, "chess", owner).await;
    add_member(&pool, club.id, member, Role::Member).await;

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: member,
            kind: DisciplineKind::Mute,
            reason: None,
            minutes: Some(5),
        },
        now,
    )
    .await
    .unwrap();

    // While the mute is live, posting is refused with the specific reason.
    let err = chat::post_message(&pool, &registry, &club, member, message("hi"), now)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "muted");

    // Membership survived the mute.
    assert_eq!(
        db::find_membership(&pool, club.id, member).await.unwrap(),
        Some(Role::Member)
    );

    // Simulated clock: once the five minutes elapse the identical post goes
    // through and wakes every registered subscriber exactly once.
    let later = now + Duration::minutes(5) + Duration::seconds(1);
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));
    let _a = registry.register(Topic::Club(club.id), counter_push(&hits_a));
    let _b = registry.register(Topic::Club(club.id), counter_push(&hits_b));

    chat::post_message(&pool, &registry, &club, member, message("hi"), later)
        .await
        .unwrap();

    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn moderator_cannot_suspend_the_owner() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let moderator = seed_user(&pool, "mod").await;
    let club = seed_club(&pool, "films", owner).await;
    add_member(&pool, club.id, moderator, Role::Moderator).await;

    let err = moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        moderator,
        moderation::DisciplineInput {
            target: owner,
            kind: DisciplineKind::Suspend,
            reason: None,
            minutes: Some(60),
        },
        now,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AppError::Forbidden { .. }));
}

#[tokio::test]
async fn broadcast_reaches_live_subscribers_but_not_cancelled_ones() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let club = seed_club(&pool, "poetry", owner).await;

    let hits: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let _subs: Vec<_> = hits
        .iter()
        .map(|h| registry.register(Topic::Club(club.id), counter_push(h)))
        .collect();

    let late_hits = Arc::new(AtomicUsize::new(0));
    let late = registry.register(Topic::Club(club.id), counter_push(&late_hits));
    late.cancel();

    chat::post_message(&pool, &registry, &club, owner, message("a poem"), now)
        .await
        .unwrap();

    for h in &hits {
        assert_eq!(h.load(Ordering::SeqCst), 1);
    }
    assert_eq!(late_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn revoting_keeps_one_row_with_the_latest_choice() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let club = seed_club(&pool, "lunch", owner).await;

    let poll_id = polls::create_poll(
        &pool,
        &registry,
        &club,
        owner,
        polls::CreatePollInput {
            question: "where to?".to_owned(),
            options: vec!["soup".to_owned(), "salad".to_owned(), "pizza".to_owned()],
            expires_in_minutes: Some(60),
        },
        now,
    )
    .await
    .unwrap();

    polls::cast_vote(&pool, &registry, &club, owner, poll_id, 0, now)
        .await
        .unwrap();
    polls::cast_vote(&pool, &registry, &club, owner, poll_id, 2, now)
        .await
        .unwrap();

    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT option_index FROM poll_votes WHERE poll_id=? AND user_id=?")
            .bind(poll_id.to_string())
            .bind(owner.to_string())
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(rows, vec![(2,)]);

    let snapshot = feed::chat_snapshot(&pool, club.id, owner).await.unwrap();
    assert_eq!(snapshot.polls.len(), 1);
    assert_eq!(snapshot.polls[0].my_vote, Some(2));
    assert_eq!(snapshot.polls[0].counts, vec![0, 0, 1]);
}

#[tokio::test]
async fn voting_on_a_closed_poll_or_bad_option_is_refused() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let club = seed_club(&pool, "books", owner).await;

    let poll_id = polls::create_poll(
        &pool,
        &registry,
        &club,
        owner,
        polls::CreatePollInput {
            question: "next read?".to_owned(),
            options: vec!["a".to_owned(), "b".to_owned()],
            expires_in_minutes: Some(30),
        },
        now,
    )
    .await
    .unwrap();

    let err = polls::cast_vote(&pool, &registry, &club, owner, poll_id, 5, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let after_close = now + Duration::minutes(31);
    let err = polls::cast_vote(&pool, &registry, &club, owner, poll_id, 0, after_close)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn muted_members_may_still_vote() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let member = seed_user(&pool, "member").await;
    let club = seed_club(&pool, "games", owner).await;
    add_member(&pool, club.id, member, Role::Member).await;

    let poll_id = polls::create_poll(
        &pool,
        &registry,
        &club,
        owner,
        polls::CreatePollInput {
            question: "co-op or versus?".to_owned(),
            options: vec!["co-op".to_owned(), "versus".to_owned()],
            expires_in_minutes: None,
        },
        now,
    )
    .await
    .unwrap();

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: member,
            kind: DisciplineKind::Mute,
            reason: None,
            minutes: Some(10),
        },
        now,
    )
    .await
    .unwrap();

    // Mute gates chat only; the vote still lands and reads stay open.
    tokio_test::assert_ok!(polls::cast_vote(&pool, &registry, &club, member, poll_id, 1, now).await);
    tokio_test::assert_ok!(feed::read_feed(&pool, &club, member, now).await);
}

#[tokio::test]
async fn ban_evicts_membership_and_suspend_lapses() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let banned = seed_user(&pool, "troll").await;
    let suspended = seed_user(&pool, "hothead").await;
    let club = seed_club(&pool, "debate", owner).await;
    add_member(&pool, club.id, banned, Role::Member).await;
    add_member(&pool, club.id, suspended, Role::Member).await;

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: banned,
            kind: DisciplineKind::Ban,
            reason: None,
            minutes: None,
        },
        now,
    )
    .await
    .unwrap();
    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: suspended,
            kind: DisciplineKind::Suspend,
            reason: None,
            minutes: Some(120),
        },
        now,
    )
    .await
    .unwrap();

    // Both evictions landed.
    assert!(db::find_membership(&pool, club.id, banned).await.unwrap().is_none());
    assert!(db::find_membership(&pool, club.id, suspended).await.unwrap().is_none());

    // Suspension reads like a ban while live...
    let err = feed::read_feed(&pool, &club, suspended, now).await.unwrap_err();
    assert_eq!(err.reason(), "suspended");

    // ...but lapses, after which the user can rejoin; the ban does not.
    let later = now + Duration::minutes(121);
    membership::join_club(&pool, &registry, &club, suspended, later)
        .await
        .unwrap();
    assert_eq!(
        db::find_membership(&pool, club.id, suspended).await.unwrap(),
        Some(Role::Member)
    );

    let err = membership::join_club(&pool, &registry, &club, banned, later)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "banned");
}

#[tokio::test]
async fn self_discipline_and_non_moderators_are_refused() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let member = seed_user(&pool, "member").await;
    let club = seed_club(&pool, "garden", owner).await;
    add_member(&pool, club.id, member, Role::Member).await;

    let err = moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        member,
        moderation::DisciplineInput {
            target: owner,
            kind: DisciplineKind::Mute,
            reason: None,
            minutes: Some(5),
        },
        now,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));

    let err = moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: owner,
            kind: DisciplineKind::Ban,
            reason: None,
            minutes: None,
        },
        now,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
}

#[tokio::test]
async fn sanction_commits_whole_even_when_the_inbox_write_fails() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let member = seed_user(&pool, "member").await;
    let club = seed_club(&pool, "sailing", owner).await;
    add_member(&pool, club.id, member, Role::Member).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let _sub = registry.register(Topic::Club(club.id), counter_push(&hits));

    // Sabotage the inbox write; the sanction itself must still land.
    sqlx::raw_sql("DROP TABLE notifications")
        .execute(&pool)
        .await
        .unwrap();

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: member,
            kind: DisciplineKind::Ban,
            reason: None,
            minutes: None,
        },
        now,
    )
    .await
    .unwrap();

    // Record and eviction committed together, and the club broadcast fired
    // despite the failed notification.
    let err = feed::read_feed(&pool, &club, member, now).await.unwrap_err();
    assert_eq!(err.reason(), "banned");
    assert!(db::find_membership(&pool, club.id, member).await.unwrap().is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn banned_mid_stream_viewer_loses_the_live_session() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let viewer = seed_user(&pool, "viewer").await;
    let club = seed_club(&pool, "trivia", owner).await;
    add_member(&pool, club.id, viewer, Role::Member).await;

    let (sink, mut rx) = stream::event_channel();
    let session = tokio::spawn(stream::run_session(
        registry.clone(),
        Topic::Club(club.id),
        sink,
        {
            let pool = pool.clone();
            let club = club.clone();
            move || {
                let pool = pool.clone();
                let club = club.clone();
                async move { feed::live_chat_frame(&pool, &club, viewer).await }
            }
        },
    ));

    // Initial snapshot arrives while the viewer is in good standing.
    assert!(rx.recv().await.is_some());
    assert_eq!(registry.subscriber_count(Topic::Club(club.id)), 1);

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: viewer,
            kind: DisciplineKind::Ban,
            reason: None,
            minutes: None,
        },
        now,
    )
    .await
    .unwrap();

    // The sanction's own broadcast wakes the session; the re-gated render
    // refuses and the session tears down and unregisters.
    session.await.unwrap();
    assert_eq!(registry.subscriber_count(Topic::Club(club.id)), 0);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn duplicate_slug_is_a_conflict() {
    let pool = test_pool().await;
    let now = OffsetDateTime::now_utc();

    let founder = seed_user(&pool, "founder").await;
    let rival = seed_user(&pool, "rival").await;

    let input = |name: &str| new::NewClubInput {
        slug: "allotment".to_owned(),
        name: name.to_owned(),
        is_public: true,
    };

    new::create_club(&pool, founder, input("Allotment"), now)
        .await
        .unwrap();

    // No pre-check to race past: the column constraint itself maps to a
    // conflict, never an internal error.
    let err = new::create_club(&pool, rival, input("Allotment Too"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn sanction_notifies_the_target_inbox() {
    let pool = test_pool().await;
    let registry = SubscriberRegistry::new();
    let now = OffsetDateTime::now_utc();

    let owner = seed_user(&pool, "owner").await;
    let member = seed_user(&pool, "member").await;
    let club = seed_club(&pool, "cooking", owner).await;
    add_member(&pool, club.id, member, Role::Member).await;

    let inbox_hits = Arc::new(AtomicUsize::new(0));
    let _sub = registry.register(Topic::Inbox(member), counter_push(&inbox_hits));

    moderation::apply_discipline(
        &pool,
        &registry,
        &club,
        owner,
        moderation::DisciplineInput {
            target: member,
            kind: DisciplineKind::Mute,
            reason: Some("cool off".to_owned()),
            minutes: Some(15),
        },
        now,
    )
    .await
    .unwrap();

    assert_eq!(inbox_hits.load(Ordering::SeqCst), 1);

    let inbox = huddles::notifications::inbox_snapshot(&pool, member).await.unwrap();
    assert_eq!(inbox.notifications.len(), 1);
    assert!(inbox.notifications[0].body.contains("muted in"));
    assert!(!inbox.notifications[0].is_read);
}
