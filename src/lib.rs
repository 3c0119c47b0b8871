pub mod activity;
pub mod automation;
pub mod config;
pub mod db;
pub mod handlers;
pub mod model;
pub mod ndjson;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
