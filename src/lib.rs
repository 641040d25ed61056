pub mod auth;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod gate;
pub mod model;
pub mod observability;
pub mod server;
pub mod sql;
pub mod wal;
pub mod wire;
