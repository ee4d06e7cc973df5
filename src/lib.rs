pub mod config;
pub mod controller;
pub mod duration;
pub mod engine;
pub mod http;
pub mod limiter;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod seed;
pub mod store;
pub mod wal;
