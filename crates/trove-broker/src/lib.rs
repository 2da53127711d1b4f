pub mod broker;
pub mod target;

pub use broker::ConnectionBroker;
pub use target::{ConnectionTarget, TargetConnection};
