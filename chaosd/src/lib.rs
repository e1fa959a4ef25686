//! Chaos engine: scheduled, safety-gated fault injection.
//!
//! [`scheduler::ChaosScheduler`] drives [`executor::IterationExecutor`]
//! iterations against a cluster reached through the traits in [`cluster`].
//! Progress is published on an [`events::EventStream`].

#![forbid(unsafe_code)]

pub mod cluster;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod retry;
pub mod safety;
pub mod scheduler;
pub mod selector;
pub mod sim;
pub mod snapshot;
pub mod state_store;
pub mod telemetry;

pub use cluster::{ClusterClients, ClusterQueryClient, FaultActionClient, HealthClient};
pub use error::ChaosError;
pub use events::{ChaosEventRecord, EventFilter, EventSegment, EventStream};
pub use executor::{IterationExecutor, IterationOutcome, IterationPhase};
pub use retry::{RetryError, RetryPolicy};
pub use safety::{EnforcementMode, FatalHandler, SafetyAssertion, SafetyAssertionConfig};
pub use scheduler::{ChaosScheduler, SchedulerDeps};
pub use selector::{FaultActionSelector, SelectionOptions};
pub use state_store::{FileStateStore, MemoryStateStore, StateStore};
pub use telemetry::TelemetrySink;
