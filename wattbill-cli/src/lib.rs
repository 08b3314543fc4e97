pub mod app;
pub mod seed;
pub mod telemetry;

pub use app::run as run_app;
