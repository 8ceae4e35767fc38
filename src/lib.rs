pub mod admin;
pub mod auth;
pub mod compactor;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod geo;
pub mod http;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod seed;
pub mod wal;
