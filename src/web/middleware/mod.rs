//! Middleware for the HTTP front end.

pub mod cors;

pub use cors::create_cors_layer;
