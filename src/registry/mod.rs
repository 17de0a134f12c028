// Agent and base registry (live arena entities)

mod entity;
mod store;

pub use entity::{Agent, Base};
pub use store::{AgentRegistry, DiscoveryReport, RegistryError};
