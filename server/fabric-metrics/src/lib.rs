pub mod config;
pub mod fabric;
pub mod http;
pub mod labels;

pub use config::MetricsConfig;
pub use fabric::FabricMetrics;
pub use http::MetricsServer;
pub use labels::{BoundedLabel, LabelPolicy};
