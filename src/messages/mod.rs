mod hub;
mod replay;
mod store;

pub use hub::{HubLimits, OverflowPolicy, Subscription, SubscriptionHub};
pub use replay::{ReplayCoordinator, ReplaySession};
pub use store::{AppendRequest, Appended, MessageStore, StoreOptions};
