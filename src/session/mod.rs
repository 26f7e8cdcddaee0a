//! Session guard and persisted identity.
//!
//! Every outgoing request goes through [`SessionGuard`]. A 401 triggers a
//! single verification against the server; while it runs, further requests
//! are held back and replayed once the outcome is known.

mod guard;
mod persist;

pub use guard::{AuthState, SessionConfig, SessionGuard, SessionState};
pub use persist::{FileSessionStore, MemorySessionStore, SessionStore};
