mod event;
mod message;

pub use event::{ChangeEvent, ChangeKind, EventSource, OldKeys};
pub use message::Message;
