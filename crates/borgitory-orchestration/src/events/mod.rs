//! Event bus: single producer side, many subscribers, bounded queues with
//! drop-on-overflow, recent-event replay, and idle keep-alives.

mod broadcaster;

pub use broadcaster::{EventSubscription, JobEventBroadcaster};
