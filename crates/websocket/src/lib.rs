//! WebSocket relay of the event bus with per-connection subscription
//! filters.

mod handler;
mod messages;

pub use handler::{serve_connection, Relay};
pub use messages::{ClientMessage, ServerMessage, SubscriptionFilter};
