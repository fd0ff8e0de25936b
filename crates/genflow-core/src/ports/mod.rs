//! Ports: traits at every external seam.
//!
//! Each trait hides one external system (shared counter store, stream log,
//! pub/sub, billing ledger, result persistence, model vendors, audit). The
//! in-memory implementations in `impls` back tests and single-process runs.

pub mod audit;
pub mod clock;
pub mod counter_store;
pub mod event_log;
pub mod id_generator;
pub mod ledger;
pub mod provider;
pub mod stage_store;

pub use self::audit::{AnalyticsEvent, AnalyticsSink, AuditRecord, AuditSink};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::counter_store::{BoundedIncr, CounterStore, LockOutcome, WindowCount};
pub use self::event_log::{EventBus, EventLog};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ledger::{RefundLedger, RefundOutcome};
pub use self::provider::{Completion, CompletionRequest, ModelProvider, ProviderError, TokenSink};
pub use self::stage_store::{StageRecord, StageStore};
