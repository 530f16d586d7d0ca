//! Wire formats of the Broadcast Audio Scan Service (BASS).
//!
//! This crate decodes and encodes the byte layouts a BASS client deals with:
//!
//! - [`BaseData`]: the Broadcast Audio Source Endpoint carried in periodic
//!   advertising service data
//! - [`BroadcastReceiveState`]: the sink's per-source receive state
//!   characteristic
//! - [`ControlPointOperation`]: writes to the Broadcast Audio Scan Control
//!   Point
//!
//! # Example
//!
//! ```rust
//! use bass_protocol::BaseData;
//!
//! let base = [
//!     0x01, 0x02, 0x03, 0x01,
//!     0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x41, 0x03, 0x06, 0x07, 0x08,
//!     0x04, 0x03, 0x02, 0x42, 0x43,
//! ];
//! let data = BaseData::parse(&base).unwrap();
//! assert_eq!(data.level_one.num_subgroups, 1);
//! assert_eq!(data.level_three[0].index, 4);
//!
//! // Truncated metadata invalidates the whole structure.
//! let mut truncated = base[..17].to_vec();
//! truncated[13] = 0x04;
//! assert!(BaseData::parse(&truncated).is_none());
//! ```

pub mod base;
mod codec;
pub mod control_point;
pub mod error;
pub mod receive_state;
pub mod types;

pub use base::{is_valid_ltv, BaseData, BigInfo, BisInfo, CodecConfig, SubgroupInfo};
pub use control_point::{ControlPointOperation, ControlPointSubgroup};
pub use error::{ProtocolError, ReasonCode};
pub use receive_state::{BroadcastReceiveState, ReceiveStateDecoder, ReceiveStateSubgroup};
pub use types::{
    AddressType, BigEncryptionState, BisSync, BroadcastChannel, BroadcastMetadata,
    BroadcastSubgroup, DeviceAddress, DeviceId, PaSync, PaSyncState, ATT_WRITE_CMD_HDR_LEN,
    BASS_MAX_BYTES, BASS_UUID, BROADCAST_CODE_SIZE, CLIENT_CHARACTERISTIC_CONFIG_UUID,
    CONTROL_POINT_UUID, RECEIVE_STATE_UUID,
};
