//! HTTP handlers.

pub mod connector;

use std::sync::Arc;

use crate::connector::Connector;

pub use connector::{connector_get, connector_post, thumbnail};

/// State shared by every handler.
pub struct AppState {
    pub connector: Arc<Connector>,
}

impl AppState {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }
}
