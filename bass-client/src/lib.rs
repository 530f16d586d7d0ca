//! Broadcast Audio Scan Service client.
//!
//! One [`BassClientStateMachine`] drives one remote scan delegator (a sink):
//! it connects, discovers the service, mirrors the sink's receive states and
//! serializes control-point operations so that at most one GATT transaction
//! is outstanding. [`BassClientHandle`] runs a machine as a tokio task.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod gatt;
pub mod handle;
pub mod logging;
pub mod loopback;
pub mod machine;
pub mod message;
pub mod pending;
pub mod periodic;
pub mod timer;

pub use callbacks::{BassCallbacks, CallbackEvent, RecordingCallbacks};
pub use config::{ClientConfig, ConfigFile};
pub use error::ClientError;
pub use gatt::{ConnectionState, GattEvent, GattSession, GattStatus, GattTransport};
pub use handle::BassClientHandle;
pub use loopback::LoopbackSink;
pub use machine::{BassClientStateMachine, Collaborators, MachineSnapshot, State};
pub use message::{Message, SetCodeRequest};
pub use pending::{OperationKind, PendingOperation, PendingOperationTracker};
pub use periodic::{InMemorySyncManager, PeriodicSync, PeriodicSyncManager};
