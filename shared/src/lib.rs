pub mod http;
pub mod metrics_defs;
pub mod sse;
