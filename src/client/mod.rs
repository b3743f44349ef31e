//! Subscriber side of the streaming protocol.

pub mod connector;
pub mod registry;

pub use connector::{Connector, EventStream, HttpConnector, LocalConnector, VIEWER_HEADER};
pub use registry::{StreamView, SubscribeOptions, Subscription, SubscriptionRegistry};
