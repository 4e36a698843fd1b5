mod handler;

pub use handler::{HealthResponse, STORE_PING_BREAKER, health};
