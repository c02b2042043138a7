//! Weir Core
//!
//! Leaf primitives shared across the ingestion pipeline: a mockable clock,
//! the keyed in-memory token-bucket rate limiter, the invocation cost model,
//! the function health watcher with its shared store, a retry helper, and a
//! tracked background task scheduler.

pub mod clock;
pub mod cost;
pub mod health;
pub mod limiter;
pub mod retry;
pub mod scheduler;
pub mod watcher;

pub use clock::{Clock, MockClock, SystemClock};
pub use cost::{CostModel, CostModelConfig, CostModelError, InvocationResult, Timing, TimingKind};
pub use health::{
    HealthRecord, HealthState, HealthStore, InMemoryHealthStore, ObserveUpdate, StoreError,
};
pub use limiter::MemoryRateLimiter;
pub use retry::{retry_if_retriable, Retriable};
pub use scheduler::BackgroundScheduler;
pub use watcher::{
    AuditSink, FunctionInfo, HealthWatcher, NoOpAuditSink, StateChange, WatcherConfig,
};
