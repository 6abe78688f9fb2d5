//! Ferry consumer core
//!
//! - Launcher: validates queues and workers, owns one Manager per group
//! - Manager: dispatch loop over a bounded processor pool, soft/hard shutdown
//! - WeightedRoundRobin: weighted queue selection with pause and rebalance
//! - Processor: body parsing, middleware chain and worker invocation per unit
//! - VisibilityExtender: heartbeat that keeps in-flight messages hidden
//! - Executors: enqueue work through the transport or run it inline

pub mod body;
pub mod error;
pub mod events;
pub mod executor;
pub mod fetcher;
pub mod launcher;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod polling;
pub mod processor;
pub mod visibility;
pub mod worker;

pub use body::{Body, BodyParser, ParseFailurePolicy, Payload};
pub use error::{ConsumerError, WorkerError};
pub use events::{ConsumerEvents, NoopEvents};
pub use executor::{InlineExecutor, PerformOptions, QueueExecutor, WorkerExecutor};
pub use fetcher::Fetcher;
pub use launcher::Launcher;
pub use manager::{InFlightUnit, Manager, ManagerContext, ShutdownState, StopMode};
pub use middleware::{AutoDelete, ExponentialBackoffRetry, Invocation, Middleware, MiddlewareChain, Next, Timing};
pub use polling::{PollingStrategy, Rotation, WeightedRoundRobin};
pub use processor::Processor;
pub use visibility::VisibilityExtender;
pub use worker::{Worker, WorkerDescriptor, WorkerRegistry, WORKER_ATTRIBUTE};

pub type Result<T> = std::result::Result<T, ConsumerError>;
