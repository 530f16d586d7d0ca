//! Notifications emitted by the state machine.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use bass_protocol::{BroadcastMetadata, BroadcastReceiveState, DeviceId, ReasonCode};

use crate::gatt::ConnectionState;

/// Service-level callback set. All methods are invoked on the device actor.
pub trait BassCallbacks: Send + Sync {
    fn on_connection_state_changed(
        &self,
        device: &DeviceId,
        previous: ConnectionState,
        new: ConnectionState,
    );

    fn on_source_added(&self, device: &DeviceId, source_id: u8, reason: ReasonCode);

    fn on_source_modified(&self, device: &DeviceId, source_id: u8, reason: ReasonCode);

    fn on_source_removed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode);

    fn on_source_add_failed(
        &self,
        device: &DeviceId,
        metadata: &BroadcastMetadata,
        reason: ReasonCode,
    );

    fn on_source_modify_failed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode);

    fn on_source_remove_failed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode);

    fn on_receive_state_changed(
        &self,
        device: &DeviceId,
        source_id: u8,
        state: &BroadcastReceiveState,
    );

    fn on_bass_state_ready(&self, device: &DeviceId);

    fn on_bass_state_setup_failed(&self, device: &DeviceId);

    /// The link dropped; `by_user` is true for a requested disconnect.
    fn on_device_disconnection(&self, _device: &DeviceId, _by_user: bool) {}
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    ConnectionStateChanged {
        previous: ConnectionState,
        new: ConnectionState,
    },
    SourceAdded {
        source_id: u8,
        reason: ReasonCode,
    },
    SourceModified {
        source_id: u8,
        reason: ReasonCode,
    },
    SourceRemoved {
        source_id: u8,
        reason: ReasonCode,
    },
    SourceAddFailed {
        broadcast_id: u32,
        reason: ReasonCode,
    },
    SourceModifyFailed {
        source_id: u8,
        reason: ReasonCode,
    },
    SourceRemoveFailed {
        source_id: u8,
        reason: ReasonCode,
    },
    ReceiveStateChanged {
        source_id: u8,
        state: BroadcastReceiveState,
    },
    BassStateReady,
    BassStateSetupFailed,
    DeviceDisconnection {
        by_user: bool,
    },
}

/// Callback set that logs every notification and keeps it for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingCallbacks {
    events: Arc<Mutex<Vec<CallbackEvent>>>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<CallbackEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, device: &DeviceId, event: CallbackEvent) {
        match &event {
            CallbackEvent::ReceiveStateChanged { source_id, state } => info!(
                "[Callbacks {}] receive state of source {}: broadcast_id=0x{:06X} pa={:?} enc={:?}",
                device,
                source_id,
                state.broadcast_id,
                state.pa_sync_state,
                state.big_encryption_state
            ),
            other => info!("[Callbacks {}] {:?}", device, other),
        }
        self.events.lock().push(event);
    }
}

impl BassCallbacks for RecordingCallbacks {
    fn on_connection_state_changed(
        &self,
        device: &DeviceId,
        previous: ConnectionState,
        new: ConnectionState,
    ) {
        self.push(device, CallbackEvent::ConnectionStateChanged { previous, new });
    }

    fn on_source_added(&self, device: &DeviceId, source_id: u8, reason: ReasonCode) {
        self.push(device, CallbackEvent::SourceAdded { source_id, reason });
    }

    fn on_source_modified(&self, device: &DeviceId, source_id: u8, reason: ReasonCode) {
        self.push(device, CallbackEvent::SourceModified { source_id, reason });
    }

    fn on_source_removed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode) {
        self.push(device, CallbackEvent::SourceRemoved { source_id, reason });
    }

    fn on_source_add_failed(
        &self,
        device: &DeviceId,
        metadata: &BroadcastMetadata,
        reason: ReasonCode,
    ) {
        self.push(
            device,
            CallbackEvent::SourceAddFailed {
                broadcast_id: metadata.broadcast_id,
                reason,
            },
        );
    }

    fn on_source_modify_failed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode) {
        self.push(device, CallbackEvent::SourceModifyFailed { source_id, reason });
    }

    fn on_source_remove_failed(&self, device: &DeviceId, source_id: u8, reason: ReasonCode) {
        self.push(device, CallbackEvent::SourceRemoveFailed { source_id, reason });
    }

    fn on_receive_state_changed(
        &self,
        device: &DeviceId,
        source_id: u8,
        state: &BroadcastReceiveState,
    ) {
        self.push(
            device,
            CallbackEvent::ReceiveStateChanged {
                source_id,
                state: state.clone(),
            },
        );
    }

    fn on_bass_state_ready(&self, device: &DeviceId) {
        self.push(device, CallbackEvent::BassStateReady);
    }

    fn on_bass_state_setup_failed(&self, device: &DeviceId) {
        self.push(device, CallbackEvent::BassStateSetupFailed);
    }

    fn on_device_disconnection(&self, device: &DeviceId, by_user: bool) {
        self.push(device, CallbackEvent::DeviceDisconnection { by_user });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_callbacks_take() {
        let callbacks = RecordingCallbacks::new();
        let shared = callbacks.clone();
        callbacks.on_source_added(&DeviceId::EMPTY, 1, ReasonCode::LocalAppRequest);
        callbacks.on_bass_state_ready(&DeviceId::EMPTY);

        assert_eq!(shared.events().len(), 2);
        assert_eq!(
            shared.take(),
            vec![
                CallbackEvent::SourceAdded {
                    source_id: 1,
                    reason: ReasonCode::LocalAppRequest
                },
                CallbackEvent::BassStateReady,
            ]
        );
        assert!(callbacks.events().is_empty());
    }
}
