//! Convenient re-exports for embedding the agent.
pub use crate::{
    agent::{Agent, AgentError, AgentStats},
    config::{AgentConfig, EndpointConfig},
    discovery::TopologySource,
    producer::{CollectError, Producer},
    stream::{Item, StreamKind},
};
