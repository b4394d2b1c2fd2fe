pub mod api;
pub mod batch;
pub mod config;
pub mod db;
pub mod enrich;
pub mod lock;
pub mod scheduler;
pub mod telemetry;
