//! HTTP control API: top-offenders view and manual ban/whitelist overrides.

use crate::error::Error;
use crate::store::{
    BanEntry, BanStore, HitStore, HotlinkStore, RefererTop, WhitelistEntry, WhitelistStore,
};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tower_http::trace::TraceLayer;

/// Shared handler state. The stores are cheap pool handles.
#[derive(Clone)]
pub struct AppState {
    pub hits: HitStore,
    pub bans: BanStore,
    pub whitelist: WhitelistStore,
    pub hotlink: HotlinkStore,
}

/// One row of `GET /top`.
#[derive(Debug, Serialize)]
pub struct TopRow {
    pub ip: IpAddr,
    pub count: i64,
    pub ban: Option<BanEntry>,
    pub in_whitelist: bool,
}

/// `POST /ban` body. `duration` is a nanosecond count.
#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub ip: IpAddr,
    pub duration: i64,
    pub by_user_id: i32,
    pub reason: String,
}

/// `POST /whitelist` body.
#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    pub ip: IpAddr,
    pub description: String,
}

/// `POST /hotlink/whitelist` and `POST /hotlink/blacklist` body.
#[derive(Debug, Deserialize)]
pub struct HotlinkHostRequest {
    pub host: String,
}

#[derive(Debug, Deserialize)]
struct HotlinkMonitoringParams {
    host: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/top", get(top))
        .route("/ban", post(ban_post))
        .route("/ban/{ip}", get(ban_get).delete(ban_delete))
        .route("/whitelist", get(whitelist_list).post(whitelist_post))
        .route("/whitelist/{ip}", get(whitelist_get).delete(whitelist_delete))
        .route(
            "/hotlink/monitoring",
            get(hotlink_monitoring).delete(hotlink_monitoring_delete),
        )
        .route("/hotlink/whitelist", post(hotlink_whitelist_post))
        .route("/hotlink/blacklist", post(hotlink_blacklist_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_ip(raw: &str) -> Result<IpAddr, Error> {
    raw.parse()
        .map_err(|_| Error::Validation("Invalid IP".to_string()))
}

async fn top(State(state): State<AppState>) -> Result<Json<Vec<TopRow>>, Error> {
    let items = state.hits.list_of_top(50).await?;

    let mut result = Vec::with_capacity(items.len());
    for item in items {
        let ban = state.bans.get(item.ip).await?;
        let in_whitelist = state.whitelist.exists(item.ip).await?;

        result.push(TopRow {
            ip: item.ip,
            count: item.count,
            ban,
            in_whitelist,
        });
    }

    Ok(Json(result))
}

async fn ban_post(
    State(state): State<AppState>,
    Json(request): Json<BanRequest>,
) -> Result<Response, Error> {
    state
        .bans
        .add(
            request.ip,
            Duration::nanoseconds(request.duration),
            request.by_user_id,
            &request.reason,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/ban/{}", request.ip))],
    )
        .into_response())
}

async fn ban_get(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<BanEntry>, Error> {
    let ip = parse_ip(&ip)?;

    match state.bans.get(ip).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(Error::NotFound),
    }
}

async fn ban_delete(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<StatusCode, Error> {
    let ip = parse_ip(&ip)?;
    state.bans.remove(ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn whitelist_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<WhitelistEntry>>, Error> {
    Ok(Json(state.whitelist.list().await?))
}

// The two writes are not transactional: if the ban removal fails the
// whitelist entry stays, and a concurrent autoban pass may re-ban in the gap
// until its next pass sees the whitelist.
async fn whitelist_post(
    State(state): State<AppState>,
    Json(request): Json<WhitelistRequest>,
) -> Result<Response, Error> {
    state.whitelist.add(request.ip, &request.description).await?;
    state.bans.remove(request.ip).await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/whitelist/{}", request.ip))],
    )
        .into_response())
}

async fn whitelist_get(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<WhitelistEntry>, Error> {
    let ip = parse_ip(&ip)?;

    match state.whitelist.get(ip).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(Error::NotFound),
    }
}

async fn whitelist_delete(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<StatusCode, Error> {
    let ip = parse_ip(&ip)?;
    state.whitelist.remove(ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Accepts the same `host[:port]` shape the referer accounting stores.
fn parse_host(raw: &str) -> Result<String, Error> {
    let url = url::Url::parse(&format!("http://{raw}/"))
        .map_err(|_| Error::Validation("Invalid host".to_string()))?;

    let plain_authority = url.path() == "/"
        && url.username().is_empty()
        && url.password().is_none()
        && url.query().is_none()
        && url.fragment().is_none();

    let host = url
        .host_str()
        .filter(|_| plain_authority)
        .ok_or_else(|| Error::Validation("Invalid host".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

async fn hotlink_monitoring(
    State(state): State<AppState>,
) -> Result<Json<Vec<RefererTop>>, Error> {
    Ok(Json(state.hotlink.top_data().await?))
}

async fn hotlink_monitoring_delete(
    State(state): State<AppState>,
    Query(params): Query<HotlinkMonitoringParams>,
) -> Result<StatusCode, Error> {
    match params.host {
        Some(host) => state.hotlink.delete_by_host(&host).await?,
        None => state.hotlink.clear().await?,
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn hotlink_whitelist_post(
    State(state): State<AppState>,
    Json(request): Json<HotlinkHostRequest>,
) -> Result<Response, Error> {
    let host = parse_host(&request.host)?;
    state.hotlink.add_to_whitelist(&host).await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/hotlink/whitelist/{host}"))],
    )
        .into_response())
}

async fn hotlink_blacklist_post(
    State(state): State<AppState>,
    Json(request): Json<HotlinkHostRequest>,
) -> Result<Response, Error> {
    let host = parse_host(&request.host)?;
    state.hotlink.add_to_blacklist(&host).await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/hotlink/blacklist/{host}"))],
    )
        .into_response())
}
