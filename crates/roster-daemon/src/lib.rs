pub mod server;
pub mod telemetry;

mod blobs;
mod employees;
mod middleware;
