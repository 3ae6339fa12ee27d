//! HTTP surface: upgrade endpoints and the game room API.

mod auth;
mod error;
mod games;
mod routes;
mod state;
mod ws;

pub use auth::{CurrentUser, USER_ID_HEADER};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
