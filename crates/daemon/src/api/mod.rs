use axum::Router;
use std::sync::Arc;

use crate::session::SessionManager;

pub mod sessions;

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new().nest("/sessions", sessions::router(manager))
}
