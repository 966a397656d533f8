//! HTTP API surface.

pub mod routes;

use crate::store::BountyStore;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BountyStore>,
}
