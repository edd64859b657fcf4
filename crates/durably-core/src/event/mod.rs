mod emitter;
mod types;

pub use emitter::{EventEmitter, Subscription};
pub use types::{Event, EventKind};
