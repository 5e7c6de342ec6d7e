//! API v2 route registration.

mod groups;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    groups::routes()
}
