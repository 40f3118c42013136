//! The asynchronous relay: background completion followed by push delivery.

mod delivery;
mod dispatcher;

pub use delivery::{Delivery, FALLBACK_APOLOGY};
pub use dispatcher::{Dispatcher, RelayState};
