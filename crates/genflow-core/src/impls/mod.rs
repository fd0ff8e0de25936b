//! In-memory implementations of the ports.
//!
//! They back the test suite and single-process deployments. Production
//! deployments swap them for shared stores behind the same traits.

pub mod counter;
pub mod event_log;
pub mod provider;
pub mod records;

pub use self::counter::InMemoryCounterStore;
pub use self::event_log::{InMemoryEventBus, InMemoryEventLog};
pub use self::provider::ScriptedProvider;
pub use self::records::{InMemoryAuditLog, InMemoryRefundLedger, InMemoryStageStore};
