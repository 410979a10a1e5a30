pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod status;
pub mod sweeper;
pub mod tls;
pub mod wal;
pub mod wire;
