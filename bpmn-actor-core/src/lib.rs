//! Per-node actor execution core for BPMN-style process definitions.
//!
//! Every deployed flow node runs as its own actor and drives tokens for all
//! instances of its process:
//! - `actor` - node actor protocol (trigger, activation, deactivation, due timers)
//! - `gateway` - N-of-M join synchronization
//! - `timer` - ISO 8601 duration, date and cycle calculation
//! - `expression` - guard and output expressions over named data objects
//! - `dispatcher` - routes between flow nodes and external message integrations
//! - `cleansing` - archive or deletion of finished instances
//! - `engine` - deployment, external triggers, cancellation and timer polling
//!
//! Storage and integrations are pluggable through the traits in `providers`
//! and `repository`; `store_memory` holds in-memory backends and
//! `store_postgres` (feature `postgres`) durable ones.

pub mod actor;
pub mod cleansing;
pub mod config;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod gateway;
pub mod messages;
pub mod providers;
pub mod repository;
pub mod router;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod timer;
pub mod types;

pub use config::{CompletionPolicy, EngineConfig};
pub use definition::{DeployedProcess, ProcessDefinition};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, FaultKind};
pub use events::RuntimeEvent;
pub use messages::{NodeMessage, TriggerMessage};
pub use providers::{inbound_channel, InboundMessage, ProviderRegistry, Providers};
pub use repository::InstanceRepository;
pub use types::{FlowNodeId, FlowNodeInstance, NodeState, ProcessState};
