mod handler;
mod model;

pub use handler::{logout, logout_all, refresh};
pub use model::{LogoutResponse, RefreshTokenRequest};
