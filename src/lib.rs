//! FileDock - a volume-based file manager connector backend.
//!
//! Clients address files by opaque hashes and send protocol commands
//! (`open`, `ls`, `upload`, `paste`, ...) to a [`Connector`], which resolves
//! them against configured volumes and runs them through a [`driver::Driver`].
//! Mutations pass through hook lists that enforce storage quotas, keep
//! thumbnails fresh and write an audit trail.

pub mod audit;
pub mod backend;
pub mod codec;
pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod logging;
pub mod storage;
pub mod volume;
pub mod web;

pub use backend::Backend;
pub use config::Config;
pub use connector::response::{ConnectorResponse, ConnectorResult, FileDescriptor};
pub use connector::{Connector, ConnectorCommand};
pub use error::{ConnectorError, Result};
pub use volume::{PathInfo, Volume};
