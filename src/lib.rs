pub mod api;
pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod service;
pub mod store;
