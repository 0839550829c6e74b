//! Session and worker events, the broadcast bus that carries them, and the
//! per-session update records streamed to clients.

mod bus;
mod types;

pub use bus::{EventBus, SessionSubscription};
pub use types::*;
