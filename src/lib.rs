pub mod aggregation;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod database;
pub mod error;
pub mod granularity;
pub mod ingest;
pub mod lock;
pub mod scheduler;
pub mod upstream;
pub mod utils;
