//! Route handlers and the authorization requirement of each route.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::authz::{Policy, Requirement, RouteTable};
use crate::error::AppError;
use crate::graph::UserProfile;
use crate::health::HealthReport;
use crate::identity::CallerContext;

/// Default page size for user search.
const DEFAULT_SEARCH_LIMIT: u32 = 10;
/// Header carrying a hub connection id, issued by the stream and echoed on publish.
const CONNECTION_ID_HEADER: &str = "x-connection-id";

const READER: Requirement = Requirement::Policy(Policy::RequireReaderRole);
const WRITER: Requirement = Requirement::Policy(Policy::RequireWriterRole);

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/values", get(list_values).post(create_value))
        .route(
            "/api/values/{id}",
            get(get_value).put(update_value).delete(delete_value),
        )
        .route("/api/identity/roles", get(roles))
        .route("/api/graph/me", get(graph_me))
        .route("/api/graph/users", get(search_users))
        .route("/api/graph/users/by-ids", get(users_by_ids))
        .route("/hub/values", get(hub_get).post(hub_publish))
        .route("/hub/values/stream", get(hub_stream))
}

/// Requirements for the routes above. Anything unlisted needs an authenticated caller.
pub fn route_table() -> RouteTable {
    RouteTable::new()
        .rule(Some(Method::GET), "/healthz", Requirement::Anonymous)
        .rule(Some(Method::GET), "/api/values", READER)
        .rule(None, "/api/values", WRITER)
        .rule(Some(Method::GET), "/api/identity/roles", Requirement::Authenticated)
        .rule(None, "/api/graph", READER)
        // Covers /hub/values/stream
        .rule(Some(Method::GET), "/hub/values", READER)
        .rule(Some(Method::POST), "/hub/values", WRITER)
        .fallback(Requirement::Authenticated)
}

// -- Health -----------------------------------------------------------------

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// -- Values -----------------------------------------------------------------

async fn list_values() -> Json<Vec<&'static str>> {
    Json(vec!["value1", "value2"])
}

async fn get_value(Path(_id): Path<i32>) -> Json<&'static str> {
    Json("value")
}

async fn create_value(Json(_value): Json<String>) -> StatusCode {
    StatusCode::OK
}

async fn update_value(Path(_id): Path<i32>, Json(_value): Json<String>) -> StatusCode {
    StatusCode::OK
}

async fn delete_value(Path(_id): Path<i32>) -> StatusCode {
    StatusCode::OK
}

// -- Identity ---------------------------------------------------------------

async fn roles(caller: CallerContext) -> Json<Vec<String>> {
    Json(caller.identity.roles().to_vec())
}

// -- Graph ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: String,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct IdsQuery {
    #[serde(default)]
    ids: String,
}

async fn graph_me(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<UserProfile>, AppError> {
    let profile = state.graph_service(&caller).get_current_profile().await?;
    Ok(Json(profile))
}

async fn search_users(
    State(state): State<AppState>,
    caller: CallerContext,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    let users = state
        .graph_service(&caller)
        .search_users(&query.search, query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .await?;
    Ok(Json(users))
}

async fn users_by_ids(
    State(state): State<AppState>,
    caller: CallerContext,
    Query(query): Query<IdsQuery>,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();

    let users = state.graph_service(&caller).get_users(&ids).await?;
    Ok(Json(users))
}

// -- Hub --------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct HubValue {
    value: i64,
}

#[derive(Debug, Serialize)]
struct Published {
    value: i64,
    receivers: usize,
}

async fn hub_get(State(state): State<AppState>) -> Json<HubValue> {
    Json(HubValue {
        value: state.hub.get(),
    })
}

/// Server-sent events for one hub connection.
///
/// The first event (`connected`) carries the connection id, also returned in
/// the `x-connection-id` header. Each later `value` event is a publish from
/// some other connection.
async fn hub_stream(State(state): State<AppState>) -> impl IntoResponse {
    let subscription = state.hub.subscribe(Uuid::new_v4());
    let connection_id = subscription.connection_id();
    debug!(connection = %connection_id, "Hub stream opened");

    let connected = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("connected").data(connection_id.to_string()))
    });
    let updates = stream::unfold(subscription, |mut subscription| async move {
        let value = subscription.recv().await?;
        let event = Event::default().event("value").data(value.to_string());
        Some((Ok(event), subscription))
    });

    (
        [(CONNECTION_ID_HEADER, connection_id.to_string())],
        Sse::new(connected.chain(updates)).keep_alive(KeepAlive::default()),
    )
}

async fn hub_publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HubValue>,
) -> Json<Published> {
    let sender = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4);

    let receivers = state.hub.publish(sender, body.value);
    Json(Published {
        value: body.value,
        receivers,
    })
}
