pub mod component;
pub mod error;
pub mod link;

pub use component::{Component, ComponentId, Ctx, Delivery, Event, Payload, PortId};
pub use error::ProtocolViolation;
pub use link::{LinkTable, PortRef};
