pub mod session;

pub use session::{
    CurrentSession, DefaultSessionKey, SessionContext, SessionFilter, lookup_session_id,
    session_middleware,
};
