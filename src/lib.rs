pub mod async_queue;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod errors;
pub mod function;
pub mod generator;
pub mod metrics;
pub mod percentiles;
pub mod record;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod utils;
