mod backoff;
mod channel;
pub mod protocol;
mod state;
mod subscribers;

pub use backoff::Backoff;
pub use channel::PresenceChannel;
pub use state::{PresenceDescriptor, PresenceStatus, Roster};
pub use subscribers::{Subscribers, Subscription};
