//! Observe (RFC 7641): resources publish changes, the manager keeps the subscriptions and
//! renders notifications for them.

pub use manager::{Notification, ObserveManager};
pub use observers::{ListenerId, Observers, ResourceEvent};
pub use resource::{ObservableResource, Representation};

pub mod manager;
pub mod observers;
pub mod resource;
