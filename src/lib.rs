// Cookie-based session tracking for axum
// An expiring session registry plus the middleware that feeds it

pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod session;

pub use error::SessionError;
pub use middleware::{CurrentSession, SessionFilter, session_middleware};
pub use models::SessionConfig;
pub use session::{ExpiryRegistry, SessionId, SweepHandle, TimeoutHandler};
