//! Messages processed by a device's state machine.

use bass_protocol::{BroadcastMetadata, BroadcastReceiveState, DeviceId, PaSync};

use crate::gatt::{GattEvent, GattStatus};

/// Message identifiers.
pub mod id {
    pub const CONNECT: u32 = 1;
    pub const DISCONNECT: u32 = 2;
    pub const CONNECTION_STATE_CHANGED: u32 = 3;
    pub const GATT_TXN_PROCESSED: u32 = 4;
    pub const READ_BASS_CHARACTERISTICS: u32 = 5;
    pub const START_SCAN_OFFLOAD: u32 = 6;
    pub const STOP_SCAN_OFFLOAD: u32 = 7;
    pub const ADD_BCAST_SOURCE: u32 = 8;
    pub const UPDATE_BCAST_SOURCE: u32 = 9;
    pub const SET_BCAST_CODE: u32 = 10;
    pub const REMOVE_BCAST_SOURCE: u32 = 11;
    pub const GATT_TXN_TIMEOUT: u32 = 12;
    pub const CONNECT_TIMEOUT: u32 = 13;
    pub const SWITCH_BCAST_SOURCE: u32 = 14;
    pub const CANCEL_PENDING_SOURCE_OPERATION: u32 = 15;
    pub const INITIATE_PA_SYNC_TRANSFER: u32 = 16;
}

/// Input of a Set Broadcast Code request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCodeRequest {
    /// Cache the code of this source for the next "code required" state.
    Metadata(BroadcastMetadata),
    /// Answer the sink's receive state for this source.
    ReceiveState(BroadcastReceiveState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect,
    Disconnect,
    ConnectionStateChanged {
        connected: bool,
    },
    GattTxnProcessed {
        status: GattStatus,
    },
    ReadBassCharacteristics {
        instance_id: u32,
    },
    StartScanOffload,
    StopScanOffload,
    AddSource {
        metadata: BroadcastMetadata,
    },
    /// Modify a source. `pa_sync` of `None` keeps the sink's PA state.
    UpdateSource {
        source_id: u8,
        metadata: Option<BroadcastMetadata>,
        pa_sync: Option<PaSync>,
    },
    SetBroadcastCode(SetCodeRequest),
    RemoveSource {
        source_id: u8,
    },
    /// `token` identifies the transaction the timer was armed for.
    GattTxnTimeout {
        token: u64,
    },
    ConnectTimeout {
        device: DeviceId,
    },
    SwitchSource {
        source_id: u8,
        metadata: BroadcastMetadata,
    },
    CancelPendingSourceOperation {
        broadcast_id: u32,
    },
    InitiatePaSyncTransfer {
        sync_handle: u16,
        source_id: u8,
    },
    /// Transport completion re-injected into the queue.
    Gatt(GattEvent),
    /// A message id this machine does not know.
    Unknown(u32),
}

impl Message {
    /// Message id, `None` for transport events.
    pub fn id(&self) -> Option<u32> {
        Some(match self {
            Message::Connect => id::CONNECT,
            Message::Disconnect => id::DISCONNECT,
            Message::ConnectionStateChanged { .. } => id::CONNECTION_STATE_CHANGED,
            Message::GattTxnProcessed { .. } => id::GATT_TXN_PROCESSED,
            Message::ReadBassCharacteristics { .. } => id::READ_BASS_CHARACTERISTICS,
            Message::StartScanOffload => id::START_SCAN_OFFLOAD,
            Message::StopScanOffload => id::STOP_SCAN_OFFLOAD,
            Message::AddSource { .. } => id::ADD_BCAST_SOURCE,
            Message::UpdateSource { .. } => id::UPDATE_BCAST_SOURCE,
            Message::SetBroadcastCode(_) => id::SET_BCAST_CODE,
            Message::RemoveSource { .. } => id::REMOVE_BCAST_SOURCE,
            Message::GattTxnTimeout { .. } => id::GATT_TXN_TIMEOUT,
            Message::ConnectTimeout { .. } => id::CONNECT_TIMEOUT,
            Message::SwitchSource { .. } => id::SWITCH_BCAST_SOURCE,
            Message::CancelPendingSourceOperation { .. } => id::CANCEL_PENDING_SOURCE_OPERATION,
            Message::InitiatePaSyncTransfer { .. } => id::INITIATE_PA_SYNC_TRANSFER,
            Message::Unknown(value) => *value,
            Message::Gatt(_) => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Connect => "CONNECT",
            Message::Disconnect => "DISCONNECT",
            Message::ConnectionStateChanged { .. } => "CONNECTION_STATE_CHANGED",
            Message::GattTxnProcessed { .. } => "GATT_TXN_PROCESSED",
            Message::ReadBassCharacteristics { .. } => "READ_BASS_CHARACTERISTICS",
            Message::StartScanOffload => "START_SCAN_OFFLOAD",
            Message::StopScanOffload => "STOP_SCAN_OFFLOAD",
            Message::AddSource { .. } => "ADD_BCAST_SOURCE",
            Message::UpdateSource { .. } => "UPDATE_BCAST_SOURCE",
            Message::SetBroadcastCode(_) => "SET_BCAST_CODE",
            Message::RemoveSource { .. } => "REMOVE_BCAST_SOURCE",
            Message::GattTxnTimeout { .. } => "GATT_TXN_TIMEOUT",
            Message::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            Message::SwitchSource { .. } => "SWITCH_BCAST_SOURCE",
            Message::CancelPendingSourceOperation { .. } => "CANCEL_PENDING_SOURCE_OPERATION",
            Message::InitiatePaSyncTransfer { .. } => "INITIATE_PA_SYNC_TRANSFER",
            Message::Gatt(_) => "GATT_EVENT",
            Message::Unknown(_) => "UNKNOWN",
        }
    }

    /// Commands that need the control point to themselves.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            Message::ReadBassCharacteristics { .. }
                | Message::StartScanOffload
                | Message::StopScanOffload
                | Message::AddSource { .. }
                | Message::UpdateSource { .. }
                | Message::SetBroadcastCode(_)
                | Message::RemoveSource { .. }
                | Message::SwitchSource { .. }
                | Message::InitiatePaSyncTransfer { .. }
        )
    }

    /// Broadcast id an add or update is for, used by cancellation.
    pub fn broadcast_id(&self) -> Option<u32> {
        match self {
            Message::AddSource { metadata } => Some(metadata.broadcast_id),
            Message::UpdateSource {
                metadata: Some(metadata),
                ..
            } => Some(metadata.broadcast_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids() {
        assert_eq!(Message::Connect.id(), Some(1));
        assert_eq!(Message::InitiatePaSyncTransfer { sync_handle: 1, source_id: 1 }.id(), Some(16));
        assert_eq!(Message::Unknown(99).id(), Some(99));
        assert_eq!(
            Message::Gatt(GattEvent::ServicesDiscovered { status: GattStatus::SUCCESS }).id(),
            None
        );
        assert_eq!(Message::RemoveSource { source_id: 1 }.name(), "REMOVE_BCAST_SOURCE");
    }

    #[test]
    fn test_exclusive_and_broadcast_id() {
        let add = Message::AddSource {
            metadata: BroadcastMetadata {
                broadcast_id: 0x42,
                ..Default::default()
            },
        };
        assert!(add.is_exclusive());
        assert_eq!(add.broadcast_id(), Some(0x42));
        assert!(!Message::Disconnect.is_exclusive());
        assert!(!Message::CancelPendingSourceOperation { broadcast_id: 0x42 }.is_exclusive());
        let update = Message::UpdateSource {
            source_id: 1,
            metadata: None,
            pa_sync: Some(PaSync::DoNotSync),
        };
        assert_eq!(update.broadcast_id(), None);
    }
}
