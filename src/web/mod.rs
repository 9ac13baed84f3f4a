//! HTTP front end.
//!
//! `GET|POST /connector` runs one command, `GET /connector/thumb/:hash`
//! serves thumbnails and `GET /health` answers probes.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;

pub use router::{create_app, create_router};
pub use server::WebServer;
