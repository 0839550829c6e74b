mod health;
mod pool;
mod sessions;
pub mod sse;
mod stages;
mod ws;

pub use health::*;
pub use pool::*;
pub use sessions::*;
pub use stages::*;
pub use ws::*;
