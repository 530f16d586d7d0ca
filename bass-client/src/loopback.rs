//! In-memory BASS server used by the `simulate` command and actor tests.
//!
//! The sink answers every GATT primitive immediately through the event
//! channel, applies control-point writes to its receive-state slots and
//! notifies the resulting states the way a real sink would.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;

use bass_protocol::{
    BigEncryptionState, BisSync, BroadcastReceiveState, ControlPointOperation, ControlPointSubgroup,
    DeviceId, PaSync, PaSyncState, ReceiveStateSubgroup, BASS_UUID,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, CONTROL_POINT_UUID, RECEIVE_STATE_UUID,
};

use crate::gatt::{
    property, Characteristic, ConnectionState, GattEvent, GattEventSender, GattSession,
    GattStatus, GattTransport, WriteType, ENABLE_NOTIFICATION_VALUE,
};

/// Instance id of the control point. Receive states follow it.
pub const CONTROL_POINT_INSTANCE: u32 = 1;

const MAX_MTU: u16 = 517;

#[derive(Debug)]
struct SinkState {
    slots: Vec<Option<BroadcastReceiveState>>,
    next_source_id: u8,
    events: Option<GattEventSender>,
    connected: bool,
    silent: bool,
    fail_writes: bool,
    encrypted: HashSet<u32>,
    writes: Vec<Bytes>,
}

impl SinkState {
    fn emit(&self, event: GattEvent) {
        if self.silent {
            debug!("[Loopback] Suppressed {:?}", event);
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn slot_value(&self, index: usize) -> Bytes {
        match self.slots.get(index).and_then(|s| s.as_ref()) {
            Some(state) => state.to_bytes().unwrap_or_default(),
            None => Bytes::new(),
        }
    }

    fn notify(&self, index: usize) {
        self.emit(GattEvent::CharacteristicChanged {
            instance_id: slot_instance(index),
            value: self.slot_value(index),
        });
    }

    fn slot_of(&self, source_id: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.source_id == source_id))
    }

    /// Apply a control-point operation, returning the slot that changed.
    fn apply(&mut self, op: ControlPointOperation) -> Option<usize> {
        match op {
            ControlPointOperation::RemoteScanStarted
            | ControlPointOperation::RemoteScanStopped => None,
            ControlPointOperation::AddSource {
                address_type,
                address,
                adv_sid,
                broadcast_id,
                pa_sync,
                subgroups,
                ..
            } => {
                // Sinks pick their own slot; filling from the end keeps slot
                // index and source id apart.
                let Some(index) = self.slots.iter().rposition(|s| s.is_none()) else {
                    warn!("[Loopback] No free slot for 0x{:06X}", broadcast_id);
                    return None;
                };
                let source_id = self.next_source_id;
                self.next_source_id = self.next_source_id.wrapping_add(1);
                let synced = pa_sync != PaSync::DoNotSync;
                let big_encryption_state = if self.encrypted.contains(&broadcast_id) {
                    BigEncryptionState::CodeRequired
                } else {
                    BigEncryptionState::NotEncrypted
                };
                self.slots[index] = Some(BroadcastReceiveState {
                    source_id,
                    source_address_type: address_type,
                    source_address: address,
                    source_device: DeviceId::new(address, address_type),
                    source_adv_sid: adv_sid,
                    broadcast_id,
                    pa_sync_state: if synced {
                        PaSyncState::Synchronized
                    } else {
                        PaSyncState::Idle
                    },
                    big_encryption_state,
                    bad_code: None,
                    subgroups: reported_subgroups(&subgroups, synced, true),
                });
                Some(index)
            }
            ControlPointOperation::ModifySource {
                source_id,
                pa_sync,
                subgroups,
                ..
            } => {
                let index = self.slot_of(source_id)?;
                let state = self.slots[index].as_mut()?;
                let synced = pa_sync != PaSync::DoNotSync;
                state.pa_sync_state = if synced {
                    PaSyncState::Synchronized
                } else {
                    PaSyncState::Idle
                };
                let keep_metadata = state.subgroups.clone();
                state.subgroups = reported_subgroups(&subgroups, synced, false);
                for (new, old) in state.subgroups.iter_mut().zip(keep_metadata) {
                    new.metadata = old.metadata;
                }
                Some(index)
            }
            ControlPointOperation::SetBroadcastCode { source_id, .. } => {
                let index = self.slot_of(source_id)?;
                let state = self.slots[index].as_mut()?;
                state.big_encryption_state = BigEncryptionState::Decrypting;
                Some(index)
            }
            ControlPointOperation::RemoveSource { source_id } => {
                let index = self.slot_of(source_id)?;
                self.slots[index] = None;
                Some(index)
            }
        }
    }
}

/// BIS sync the sink reports for requested subgroups.
///
/// "No preference" is answered by syncing the first BIS.
fn reported_subgroups(
    requested: &[ControlPointSubgroup],
    synced: bool,
    with_metadata: bool,
) -> Vec<ReceiveStateSubgroup> {
    requested
        .iter()
        .map(|s| ReceiveStateSubgroup {
            bis_sync_state: match s.bis_sync {
                _ if !synced => BisSync::DO_NOT_SYNC,
                BisSync::NO_PREFERENCE => BisSync(0x1),
                bits => bits,
            },
            metadata: if with_metadata {
                s.metadata.clone()
            } else {
                Vec::new()
            },
        })
        .collect()
}

fn slot_instance(index: usize) -> u32 {
    CONTROL_POINT_INSTANCE + 1 + index as u32
}

/// Emulated BASS server, shared between the transport and tests.
#[derive(Debug, Clone)]
pub struct LoopbackSink {
    state: Arc<Mutex<SinkState>>,
}

impl LoopbackSink {
    pub fn new(num_slots: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                slots: vec![None; num_slots],
                next_source_id: 0,
                events: None,
                connected: false,
                silent: false,
                fail_writes: false,
                encrypted: HashSet::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// Report "code required" for sources added with this broadcast id.
    pub fn set_encrypted(&self, broadcast_id: u32) {
        self.state.lock().encrypted.insert(broadcast_id);
    }

    /// Stop answering GATT primitives (models a stalled link).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer control-point writes with a failure status.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Every control-point value written so far.
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    pub fn sources(&self) -> Vec<BroadcastReceiveState> {
        self.state.lock().slots.iter().flatten().cloned().collect()
    }

    /// Change the PA state of a source on the sink side and notify it.
    pub fn set_pa_sync_state(&self, source_id: u8, pa_sync_state: PaSyncState) {
        let mut sink = self.state.lock();
        let Some(index) = sink.slot_of(source_id) else {
            return;
        };
        if let Some(state) = sink.slots[index].as_mut() {
            state.pa_sync_state = pa_sync_state;
            if pa_sync_state != PaSyncState::Synchronized {
                for subgroup in &mut state.subgroups {
                    subgroup.bis_sync_state = BisSync::DO_NOT_SYNC;
                }
            }
        }
        sink.notify(index);
    }

    /// Drop the link from the sink side.
    pub fn drop_link(&self) {
        let mut sink = self.state.lock();
        sink.connected = false;
        sink.emit(GattEvent::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            state: ConnectionState::Disconnected,
        });
    }
}

impl GattTransport for LoopbackSink {
    fn connect(
        &mut self,
        device: DeviceId,
        _auto_connect: bool,
        events: GattEventSender,
    ) -> Option<Box<dyn GattSession>> {
        debug!("[Loopback] Connect from client to {}", device);
        let mut sink = self.state.lock();
        sink.events = Some(events);
        sink.connected = true;
        sink.emit(GattEvent::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            state: ConnectionState::Connected,
        });
        Some(Box::new(LoopbackSession { sink: self.clone() }))
    }
}

struct LoopbackSession {
    sink: LoopbackSink,
}

impl GattSession for LoopbackSession {
    fn discover_services(&mut self) -> bool {
        self.sink.state.lock().emit(GattEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
        });
        true
    }

    fn request_mtu(&mut self, mtu: u16) -> bool {
        self.sink.state.lock().emit(GattEvent::MtuChanged {
            mtu: mtu.min(MAX_MTU),
            status: GattStatus::SUCCESS,
        });
        true
    }

    fn service_characteristics(&self, uuid: u16) -> Option<Vec<Characteristic>> {
        if uuid != BASS_UUID {
            return None;
        }
        let sink = self.sink.state.lock();
        let mut chars = vec![Characteristic {
            instance_id: CONTROL_POINT_INSTANCE,
            uuid: CONTROL_POINT_UUID,
            properties: property::WRITE | property::WRITE_NO_RESPONSE,
            has_ccc: false,
        }];
        chars.extend((0..sink.slots.len()).map(|index| Characteristic {
            instance_id: slot_instance(index),
            uuid: RECEIVE_STATE_UUID,
            properties: property::READ | property::NOTIFY,
            has_ccc: true,
        }));
        Some(chars)
    }

    fn read_characteristic(&mut self, instance_id: u32) -> bool {
        let sink = self.sink.state.lock();
        let Some(index) = (instance_id as usize).checked_sub(slot_instance(0) as usize) else {
            return false;
        };
        if index >= sink.slots.len() {
            return false;
        }
        sink.emit(GattEvent::CharacteristicRead {
            instance_id,
            value: sink.slot_value(index),
            status: GattStatus::SUCCESS,
        });
        true
    }

    fn write_characteristic(
        &mut self,
        instance_id: u32,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        let mut sink = self.sink.state.lock();
        if instance_id != CONTROL_POINT_INSTANCE {
            return false;
        }
        debug!("[Loopback] Control point write {:?}: {}", write_type, hex::encode(value));
        sink.writes.push(Bytes::copy_from_slice(value));

        if sink.fail_writes {
            sink.emit(GattEvent::CharacteristicWrite {
                instance_id,
                status: GattStatus::FAILURE,
            });
            return true;
        }

        let op = match ControlPointOperation::decode(value) {
            Ok(op) => op,
            Err(e) => {
                warn!("[Loopback] Rejecting control point write: {}", e);
                sink.emit(GattEvent::CharacteristicWrite {
                    instance_id,
                    status: GattStatus::FAILURE,
                });
                return true;
            }
        };
        let changed = sink.apply(op);
        sink.emit(GattEvent::CharacteristicWrite {
            instance_id,
            status: GattStatus::SUCCESS,
        });
        if let Some(index) = changed {
            sink.notify(index);
        }
        true
    }

    fn write_descriptor(&mut self, instance_id: u32, uuid: u16, value: &[u8]) -> bool {
        if uuid != CLIENT_CHARACTERISTIC_CONFIG_UUID || value != ENABLE_NOTIFICATION_VALUE {
            warn!("[Loopback] Unsupported descriptor 0x{:04X} on {}", uuid, instance_id);
            return false;
        }
        self.sink.state.lock().emit(GattEvent::DescriptorWrite {
            instance_id,
            status: GattStatus::SUCCESS,
        });
        true
    }

    fn disconnect(&mut self) {
        let mut sink = self.sink.state.lock();
        if sink.connected {
            sink.connected = false;
            sink.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: ConnectionState::Disconnected,
            });
        }
    }

    fn close(&mut self) {
        self.sink.state.lock().events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bass_protocol::{AddressType, DeviceAddress};
    use tokio::sync::mpsc;

    fn add_source_value(broadcast_id: u32) -> Vec<u8> {
        ControlPointOperation::AddSource {
            address_type: AddressType::Public,
            address: DeviceAddress([1, 2, 3, 4, 5, 6]),
            adv_sid: 1,
            broadcast_id,
            pa_sync: PaSync::SyncPastAvailable,
            pa_interval: 0xFFFF,
            subgroups: vec![ControlPointSubgroup {
                bis_sync: BisSync::NO_PREFERENCE,
                metadata: vec![0x03, 0x02, 0x04, 0x00],
            }],
        }
        .encode()
        .unwrap()
        .to_vec()
    }

    #[test]
    fn test_add_source_notifies_slot() {
        let mut sink = LoopbackSink::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = sink.connect(DeviceId::EMPTY, false, tx).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            GattEvent::ConnectionStateChanged { state: ConnectionState::Connected, .. }
        ));

        assert!(session.write_characteristic(
            CONTROL_POINT_INSTANCE,
            &add_source_value(0x123456),
            WriteType::WithResponse
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            GattEvent::CharacteristicWrite {
                instance_id: CONTROL_POINT_INSTANCE,
                status: GattStatus::SUCCESS
            }
        );
        let GattEvent::CharacteristicChanged { instance_id, value } = rx.try_recv().unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(instance_id, slot_instance(1));
        let state =
            BroadcastReceiveState::decode(&value, |a, t| Some(DeviceId::new(a, t))).unwrap();
        assert_eq!(state.source_id, 0);
        assert_eq!(state.broadcast_id, 0x123456);
        assert_eq!(state.pa_sync_state, PaSyncState::Synchronized);
        assert_eq!(state.subgroups[0].bis_sync_state, BisSync(1));
        assert_eq!(sink.sources().len(), 1);
    }

    #[test]
    fn test_malformed_write_fails() {
        let mut sink = LoopbackSink::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = sink.connect(DeviceId::EMPTY, false, tx).unwrap();
        let _ = rx.try_recv();

        session.write_characteristic(CONTROL_POINT_INSTANCE, &[0x7F], WriteType::WithoutResponse);
        assert_eq!(
            rx.try_recv().unwrap(),
            GattEvent::CharacteristicWrite {
                instance_id: CONTROL_POINT_INSTANCE,
                status: GattStatus::FAILURE
            }
        );
        assert_eq!(sink.writes().len(), 1);
    }

    #[test]
    fn test_silent_sink_emits_nothing() {
        let mut sink = LoopbackSink::new(1);
        sink.set_silent(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = sink.connect(DeviceId::EMPTY, false, tx).unwrap();
        session.discover_services();
        assert!(rx.try_recv().is_err());
        assert!(sink.is_connected());
    }
}
