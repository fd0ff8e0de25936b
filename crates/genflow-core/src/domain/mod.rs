//! Domain model (ids, invocations, stages, events, routing, codes).

pub mod errors;
pub mod events;
pub mod guard;
pub mod ids;
pub mod routing;
pub mod stage;
pub mod stream;
pub mod task;

pub use errors::{AdmissionCode, WorkerErrorCode};
pub use events::{ErrorStage, Event, EventBody, Usage};
pub use guard::{GuardKey, GuardSubject, pending_key};
pub use ids::{DebitId, Id, IdMarker, MessageId, TaskId};
pub use routing::{RoutingDecision, RoutingError, RoutingTable};
pub use stage::{Modality, Phase, PipelineStatus, Stage, StageStatus, Tier, UnknownName};
pub use stream::{ChannelKey, InvalidStreamId, StreamEntry, StreamId};
pub use task::{ExecutionKind, TaskInvocation};
