//! # arbor-protocol: Arbor contract types
//!
//! Shared types every Arbor crate depends on. The crate carries no runtime
//! (no tokio) so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, AgentId, CapabilityId, ExecutionId, ...)
//! - [`clock`]: Injectable wall clock (`SystemClock`, `ManualClock`)
//! - [`capability`]: Capability, ResourceUri, ResourceKind, CapabilityConstraints
//! - [`envelope`]: MessageEnvelope, AgentAddress, CommandRequest
//! - [`agent`]: AgentRecord and its lifecycle state
//! - [`task`]: TaskSpec, ExecutionHandle, Progress, CommandMode
//! - [`session`]: SessionStatus, SessionOptions, SessionState, journal records
//! - [`event`]: EventRecord + EventKind (bus taxonomy)
//! - [`audit`]: AuditEvent and the AuditSink port
//! - [`error`]: ErrorKind taxonomy and ProtocolError

pub mod agent;
pub mod audit;
pub mod capability;
pub mod clock;
pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod session;
pub mod task;

pub use agent::{AgentRecord, AgentState, AgentType};
pub use audit::{AuditAction, AuditEvent, AuditSink, NullAuditSink};
pub use capability::{Capability, CapabilityConstraints, ResourceKind, ResourceUri};
pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{AgentAddress, CommandRequest, MessageEnvelope};
pub use error::{ErrorKind, ProtocolError};
pub use event::{EventKind, EventRecord};
pub use ids::{
    AgentId, CapabilityId, EventId, ExecutionId, MessageId, PrincipalId, SessionId, TraceId,
    validate_id,
};
pub use session::{
    ExecutionRecord, JournalEntry, JournalRecord, SessionOptions, SessionState, SessionStatus,
};
pub use task::{CommandMode, ExecutionHandle, ExecutionStatus, Progress, TaskSpec};
