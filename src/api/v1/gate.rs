use axum::{extract::Query, Json};
use serde::Deserialize;

use crate::access::{gate, Gate, Requester, Route};

use super::auth::Session;

#[derive(Deserialize, Debug)]
pub struct GateQuery {
    pub path: String,
}

/// A missing or stale access token counts as anonymous.
pub async fn route_gate(session: Option<Session>, Query(query): Query<GateQuery>) -> Json<Gate> {
    let route = Route::parse(&query.path);

    Json(gate(&route, Requester::of(session.as_ref())))
}
