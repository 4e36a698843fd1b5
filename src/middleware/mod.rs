mod error_handler;
mod rate_limit;

pub use error_handler::log_errors;
pub use rate_limit::{RequestGate, client_ip, rate_limit};
