// Session tracking core
// Expiring registry, background sweep, and timeout notification

pub mod registry;
pub mod sweeper;
pub mod timeout;
pub mod types;

pub use registry::{ExpiryRegistry, RegistryGuard};
pub use sweeper::SweepHandle;
pub use timeout::{NoopTimeoutHandler, TimeoutHandler};
pub use types::{EvictionEvent, MAX_TTL, RegistryStats, SessionId, SessionLease};
