//! polyfier-session: control, worker, and observer sessions.
//!
//! Every connected peer speaks JSON [`Envelope`]s over a message channel. The
//! [`JobOrchestrator`] validates each envelope against the sender's role,
//! drives the node state machines held in the [`SessionRegistry`], and
//! persists history through the storage contracts of `polyfier-state`.
//!
//! The [`StatusBroadcaster`] pushes registry snapshots to observers, and
//! [`JobRequester`] is the control-side half of the job protocol.

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod registry;

pub use broadcast::StatusBroadcaster;
pub use channel::{ChannelHandle, SessionId};
pub use client::JobRequester;
pub use error::{SessionError, SessionResult};
pub use message::{ClientCode, Command, Envelope, ReplyCode, ServerMessage};
pub use orchestrator::JobOrchestrator;
pub use registry::{ControlNode, RegistrySnapshot, SessionRegistry, WorkerNode};
