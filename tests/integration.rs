//! End-to-end tests against a live Postgres instance.
//!
//! Set `TEST_DATABASE_URL` to run these; without it every test logs a skip
//! and passes. Tests that additionally need working reverse DNS (the crawler
//! autowhitelist path) are gated behind `TEST_LIVE_DNS`.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use std::net::IpAddr;
use tokio::sync::Mutex;
use tower::ServiceExt;
use trafficwatch::api::{self, AppState};
use trafficwatch::classifier::CrawlerClassifier;
use trafficwatch::policy::AutobanProfile;
use trafficwatch::store::{BanStore, HitStore, HotlinkStore, WhitelistStore};
use trafficwatch::{Enforcer, Error};

// The stores share one database; the suite serializes on this so tests that
// sweep whole tables cannot race the others.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

struct TestDb {
    hits: HitStore,
    bans: BanStore,
    whitelist: WhitelistStore,
    hotlink: HotlinkStore,
}

async fn connect() -> Option<TestDb> {
    let Ok(dsn) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .expect("connect test database");

    sqlx::migrate::Migrator::new(std::path::Path::new("migrations"))
        .await
        .expect("load migrations")
        .run(&pool)
        .await
        .expect("apply migrations");

    Some(TestDb {
        hits: HitStore::new(pool.clone()),
        bans: BanStore::new(pool.clone()),
        whitelist: WhitelistStore::new(pool.clone()),
        hotlink: HotlinkStore::new(pool),
    })
}

fn enforcer(db: &TestDb) -> Enforcer {
    Enforcer::new(
        db.hits.clone(),
        db.bans.clone(),
        db.whitelist.clone(),
        CrawlerClassifier::new(),
    )
}

fn minute_profile(limit: i64, reason: &str) -> AutobanProfile {
    AutobanProfile {
        limit,
        reason: reason.to_string(),
        group: vec![
            "hour".to_string(),
            "tenminute".to_string(),
            "minute".to_string(),
        ],
        time: Duration::hours(1),
    }
}

// =============================================================================
// Hit store
// =============================================================================

#[tokio::test]
async fn test_counter_accuracy() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.10".parse().unwrap();

    for n in [1usize, 10, 100] {
        db.hits.clear_ip(ip).await.unwrap();

        let now = Utc::now();
        for _ in 0..n {
            db.hits.add(ip, now).await.unwrap();
        }

        let top = db.hits.list_of_top(1000).await.unwrap();
        let item = top.iter().find(|item| item.ip == ip).unwrap();
        assert_eq!(item.count as usize, n);
    }

    db.hits.clear_ip(ip).await.unwrap();
}

#[tokio::test]
async fn test_hit_gc_keeps_today() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.11".parse().unwrap();
    db.hits.clear_ip(ip).await.unwrap();

    db.hits.add(ip, Utc::now() - Duration::days(2)).await.unwrap();
    db.hits.add(ip, Utc::now()).await.unwrap();

    let deleted = db.hits.gc().await.unwrap();
    assert!(deleted >= 1);

    assert!(db.hits.exists_ip(ip).await.unwrap());
    assert_eq!(db.hits.gc().await.unwrap(), 0);

    db.hits.clear_ip(ip).await.unwrap();
}

#[tokio::test]
async fn test_ban_profile_group_is_allowlisted() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let profile = AutobanProfile {
        limit: 1,
        reason: "bad".to_string(),
        group: vec!["minute; DROP TABLE ip_ban".to_string()],
        time: Duration::hours(1),
    };

    let err = db.hits.list_by_ban_profile(&profile).await.unwrap_err();
    assert!(matches!(err, Error::Policy(_)));

    // The table is still there.
    db.bans.exists("192.0.2.12".parse().unwrap()).await.unwrap();
}

// =============================================================================
// Ban store
// =============================================================================

#[tokio::test]
async fn test_ban_round_trip_and_upsert() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.20".parse().unwrap();
    db.bans.remove(ip).await.unwrap();

    db.bans.add(ip, Duration::hours(1), 4, "  first  ").await.unwrap();
    let entry = db.bans.get(ip).await.unwrap().unwrap();
    assert_eq!(entry.ip, ip);
    assert_eq!(entry.by_user_id, 4);
    assert_eq!(entry.reason, "first", "reason is trimmed");

    db.bans.add(ip, Duration::hours(2), 9, "second").await.unwrap();
    let entry = db.bans.get(ip).await.unwrap().unwrap();
    assert_eq!(entry.by_user_id, 9);
    assert_eq!(entry.reason, "second");

    db.bans.remove(ip).await.unwrap();
    assert!(db.bans.get(ip).await.unwrap().is_none());
    db.bans.remove(ip).await.unwrap();
}

#[tokio::test]
async fn test_ban_expiry_without_gc() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.21".parse().unwrap();

    db.bans.add(ip, Duration::milliseconds(200), 9, "short").await.unwrap();
    assert!(db.bans.exists(ip).await.unwrap());

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(!db.bans.exists(ip).await.unwrap());
    assert!(db.bans.get(ip).await.unwrap().is_none());

    let deleted = db.bans.gc().await.unwrap();
    assert!(deleted >= 1);
}

// =============================================================================
// Policy passes
// =============================================================================

#[tokio::test]
async fn test_autoban_by_minute_profile() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip1: IpAddr = "192.0.2.30".parse().unwrap();
    let ip2: IpAddr = "192.0.2.31".parse().unwrap();

    for ip in [ip1, ip2] {
        db.hits.clear_ip(ip).await.unwrap();
        db.bans.remove(ip).await.unwrap();
    }

    let now = Utc::now();
    db.hits.add(ip1, now).await.unwrap();
    for _ in 0..4 {
        db.hits.add(ip2, now).await.unwrap();
    }

    enforcer(&db)
        .auto_ban_by_profile(&minute_profile(3, "Test"))
        .await
        .unwrap();

    assert!(!db.bans.exists(ip1).await.unwrap());
    assert!(db.bans.exists(ip2).await.unwrap());

    let entry = db.bans.get(ip2).await.unwrap().unwrap();
    assert_eq!(entry.by_user_id, 9);
    assert_eq!(entry.reason, "Test");

    for ip in [ip1, ip2] {
        db.hits.clear_ip(ip).await.unwrap();
        db.bans.remove(ip).await.unwrap();
    }
}

#[tokio::test]
async fn test_whitelisted_ip_is_never_banned() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.40".parse().unwrap();
    db.hits.clear_ip(ip).await.unwrap();
    db.bans.remove(ip).await.unwrap();

    db.whitelist.add(ip, "load balancer").await.unwrap();

    let now = Utc::now();
    for _ in 0..4 {
        db.hits.add(ip, now).await.unwrap();
    }

    enforcer(&db)
        .auto_ban_by_profile(&minute_profile(3, "Test"))
        .await
        .unwrap();

    assert!(!db.bans.exists(ip).await.unwrap());

    db.whitelist.remove(ip).await.unwrap();
    db.hits.clear_ip(ip).await.unwrap();
}

#[tokio::test]
async fn test_autowhitelist_of_googlebot() {
    let _guard = DB_LOCK.lock().await;
    if std::env::var("TEST_LIVE_DNS").is_err() {
        eprintln!("TEST_LIVE_DNS not set, skipping");
        return;
    }
    let Some(db) = connect().await else { return };

    // A published Googlebot crawler address with a crawl-*.googlebot.com PTR.
    let ip: IpAddr = "66.249.73.139".parse().unwrap();

    db.whitelist.remove(ip).await.unwrap();
    db.bans.add(ip, Duration::hours(1), 4, "test").await.unwrap();
    db.hits.add(ip, Utc::now()).await.unwrap();

    let enforcer = enforcer(&db);
    enforcer.auto_whitelist().await.unwrap();

    assert!(!db.bans.exists(ip).await.unwrap());
    assert!(!db.hits.exists_ip(ip).await.unwrap());
    assert!(db.whitelist.exists(ip).await.unwrap());

    let entry = db.whitelist.get(ip).await.unwrap().unwrap();
    assert_eq!(entry.description, "googlebot autodetect");

    // A second pass changes nothing.
    enforcer.auto_whitelist().await.unwrap();
    assert!(db.whitelist.exists(ip).await.unwrap());
    assert!(!db.bans.exists(ip).await.unwrap());

    db.whitelist.remove(ip).await.unwrap();
}

// =============================================================================
// HTTP control API
// =============================================================================

fn test_router(db: &TestDb) -> axum::Router {
    api::router(AppState {
        hits: db.hits.clone(),
        bans: db.bans.clone(),
        whitelist: db.whitelist.clone(),
        hotlink: db.hotlink.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_http_ban_round_trip() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    db.bans.remove(ip).await.unwrap();

    let app = test_router(&db);

    let body = serde_json::json!({
        "ip": "127.0.0.1",
        "duration": 60_000_000_000i64,
        "by_user_id": 4,
        "reason": "Test"
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ban")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/ban/127.0.0.1"
    );

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ban/127.0.0.1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ip"], "127.0.0.1");
    assert_eq!(json["reason"], "Test");
    assert_eq!(json["by_user_id"], 4);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/ban/127.0.0.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ban/127.0.0.1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_invalid_ip_is_rejected() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let app = test_router(&db);

    for uri in ["/ban/not-an-ip", "/whitelist/999.1.1.1"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Invalid IP");
    }
}

#[tokio::test]
async fn test_http_whitelist_post_lifts_ban() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let ip: IpAddr = "192.0.2.50".parse().unwrap();
    db.bans.add(ip, Duration::hours(1), 4, "pre-existing").await.unwrap();

    let app = test_router(&db);

    let body = serde_json::json!({"ip": "192.0.2.50", "description": "office"});
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/whitelist")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/whitelist/192.0.2.50"
    );

    assert!(!db.bans.exists(ip).await.unwrap());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/whitelist/192.0.2.50")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["description"], "office");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/whitelist/192.0.2.50")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!db.whitelist.exists(ip).await.unwrap());
}

// =============================================================================
// Hotlink monitoring
// =============================================================================

#[tokio::test]
async fn test_hotlink_add_and_top() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    db.hotlink.clear().await.unwrap();
    for host in ["example.com", "second.com"] {
        db.hotlink.delete_from_whitelist(host).await.unwrap();
        db.hotlink.delete_from_blacklist(host).await.unwrap();
    }

    let now = Utc::now();
    db.hotlink
        .add("http://example.com/path-to-file", "image/jpeg", now)
        .await
        .unwrap();
    for _ in 0..10 {
        db.hotlink
            .add("http://second.com/path-to-file", "image/jpeg", now)
            .await
            .unwrap();
    }

    let app = test_router(&db);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/hotlink/monitoring")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(
        json,
        serde_json::json!([
            {
                "host": "second.com",
                "count": 10,
                "whitelisted": false,
                "blacklisted": false,
                "links": [
                    {"url": "http://second.com/path-to-file", "accept": "image/jpeg", "count": 10}
                ]
            },
            {
                "host": "example.com",
                "count": 1,
                "whitelisted": false,
                "blacklisted": false,
                "links": [
                    {"url": "http://example.com/path-to-file", "accept": "image/jpeg", "count": 1}
                ]
            }
        ])
    );

    db.hotlink.clear().await.unwrap();
}

#[tokio::test]
async fn test_hotlink_whitelist_and_blacklist_are_exclusive() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let host = "hotlink-lists.example";
    db.hotlink.delete_from_whitelist(host).await.unwrap();
    db.hotlink.delete_from_blacklist(host).await.unwrap();

    let app = test_router(&db);

    let body = serde_json::json!({"host": host});
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hotlink/whitelist")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/hotlink/whitelist/hotlink-lists.example"
    );

    assert!(db.hotlink.is_host_whitelisted(host).await.unwrap());
    assert!(!db.hotlink.is_host_blacklisted(host).await.unwrap());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hotlink/blacklist")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    assert!(db.hotlink.is_host_blacklisted(host).await.unwrap());
    assert!(!db.hotlink.is_host_whitelisted(host).await.unwrap());

    db.hotlink.delete_from_blacklist(host).await.unwrap();
}

#[tokio::test]
async fn test_hotlink_whitelisted_host_is_not_recorded() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    let host = "trusted-cdn.example";
    db.hotlink.clear().await.unwrap();
    db.hotlink.add_to_whitelist(host).await.unwrap();

    db.hotlink
        .add("http://trusted-cdn.example/img.png", "image/png", Utc::now())
        .await
        .unwrap();

    assert!(db.hotlink.top_data().await.unwrap().is_empty());

    db.hotlink.delete_from_whitelist(host).await.unwrap();
}

#[tokio::test]
async fn test_hotlink_monitoring_delete() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    db.hotlink.clear().await.unwrap();

    let now = Utc::now();
    db.hotlink
        .add("http://example.com/path-to-file", "image/jpeg", now)
        .await
        .unwrap();
    db.hotlink
        .add("http://second.com/path-to-file", "image/jpeg", now)
        .await
        .unwrap();

    let app = test_router(&db);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/hotlink/monitoring?host=example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let top = db.hotlink.top_data().await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].host, "second.com");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/hotlink/monitoring")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(db.hotlink.top_data().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hotlink_gc_sweeps_stale_referers() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    db.hotlink.clear().await.unwrap();

    db.hotlink
        .add("http://stale.example/old", "", Utc::now() - Duration::days(2))
        .await
        .unwrap();
    db.hotlink
        .add("http://fresh.example/new", "", Utc::now())
        .await
        .unwrap();

    let deleted = db.hotlink.gc().await.unwrap();
    assert_eq!(deleted, 1);

    let top = db.hotlink.top_data().await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].host, "fresh.example");

    db.hotlink.clear().await.unwrap();
}

#[tokio::test]
async fn test_http_top_ordering() {
    let _guard = DB_LOCK.lock().await;
    let Some(db) = connect().await else { return };

    db.hits.clear().await.unwrap();
    db.bans.clear().await.unwrap();

    let v6: IpAddr = "::1".parse().unwrap();
    let v4: IpAddr = "192.168.0.1".parse().unwrap();
    db.whitelist.remove(v6).await.unwrap();
    db.whitelist.remove(v4).await.unwrap();

    let now = Utc::now();
    for _ in 0..10 {
        db.hits.add(v6, now).await.unwrap();
    }
    db.hits.add(v4, now).await.unwrap();

    let app = test_router(&db);
    let response = app
        .oneshot(Request::builder().uri("/top").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(
        json,
        serde_json::json!([
            {"ip": "::1", "count": 10, "ban": null, "in_whitelist": false},
            {"ip": "192.168.0.1", "count": 1, "ban": null, "in_whitelist": false}
        ])
    );

    db.hits.clear().await.unwrap();
}
