//! Transport events and receive-state reconciliation.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use bass_protocol::{
    BigEncryptionState, BroadcastReceiveState, PaSyncState, ReasonCode, ATT_WRITE_CMD_HDR_LEN,
    BASS_UUID, CLIENT_CHARACTERISTIC_CONFIG_UUID, CONTROL_POINT_UUID, RECEIVE_STATE_UUID,
};

use super::BassClientStateMachine;
use crate::gatt::{property, ConnectionState, GattEvent, GattStatus, ENABLE_NOTIFICATION_VALUE};
use crate::message::{Message, SetCodeRequest};
use crate::pending::OperationKind;
use crate::periodic::{past_service_data, ADV_ADDRESS_DONT_MATCHES_SOURCE_ADV_ADDRESS};
use crate::timer::TimerKey;

impl BassClientStateMachine {
    pub(super) fn handle_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_gatt_connection_state(status, state)
            }
            GattEvent::ServicesDiscovered { status } => self.on_services_discovered(status),
            GattEvent::MtuChanged { mtu, status } => self.on_mtu_changed(mtu, status),
            GattEvent::CharacteristicRead {
                instance_id,
                value,
                status,
            } => self.on_characteristic_read(instance_id, &value, status),
            GattEvent::CharacteristicWrite { status, .. } => {
                self.post(Message::GattTxnProcessed { status });
            }
            GattEvent::DescriptorWrite { status, .. } => {
                self.post(Message::GattTxnProcessed { status });
            }
            GattEvent::CharacteristicChanged { instance_id, value } => {
                if self.is_receive_state_char(instance_id) {
                    self.process_receive_state(instance_id, &value);
                } else {
                    debug!(
                        "[BassClient {}] Notification on unknown characteristic {}",
                        self.device, instance_id
                    );
                }
            }
        }
    }

    fn on_gatt_connection_state(&mut self, status: GattStatus, state: ConnectionState) {
        debug!(
            "[BassClient {}] GATT connection state {:?} (status {})",
            self.device, state, status
        );
        let current = self.connection_state();
        let connected = match state {
            ConnectionState::Connected if current != ConnectionState::Connected => {
                if self.policy.ok_to_connect(&self.device) {
                    self.discovery_initiated = self
                        .gatt
                        .as_mut()
                        .is_some_and(|gatt| gatt.discover_services());
                    info!(
                        "[BassClient {}] Connected, service discovery started: {}",
                        self.device, self.discovery_initiated
                    );
                    true
                } else {
                    warn!("[BassClient {}] Connection no longer allowed", self.device);
                    self.disconnect_gatt();
                    false
                }
            }
            ConnectionState::Disconnected if current != ConnectionState::Disconnected => {
                info!("[BassClient {}] Disconnected from GATT server", self.device);
                false
            }
            _ => return,
        };
        self.post(Message::ConnectionStateChanged { connected });
    }

    fn on_services_discovered(&mut self, status: GattStatus) {
        if !self.discovery_initiated {
            debug!("[BassClient {}] Unsolicited service discovery result", self.device);
            return;
        }
        self.discovery_initiated = false;

        if !status.is_success() {
            error!("[BassClient {}] Service discovery failed: {}", self.device, status);
            self.callbacks.on_bass_state_setup_failed(&self.device);
            return;
        }
        let mtu = self.config.requested_mtu;
        match self.gatt.as_mut() {
            Some(gatt) => {
                self.mtu_requested = gatt.request_mtu(mtu);
                debug!("[BassClient {}] Requested MTU {}", self.device, mtu);
            }
            None => error!("[BassClient {}] No GATT handle after discovery", self.device),
        }
    }

    fn on_mtu_changed(&mut self, mtu: u16, status: GattStatus) {
        if self.mtu_requested {
            self.mtu_requested = false;
            self.acquire_all_bass_chars();
        }
        if status.is_success() {
            self.max_single_write = usize::from(mtu.saturating_sub(ATT_WRITE_CMD_HDR_LEN));
            debug!(
                "[BassClient {}] MTU {}, max single write {}",
                self.device, mtu, self.max_single_write
            );
        } else {
            warn!("[BassClient {}] MTU exchange failed: {}", self.device, status);
            self.callbacks.on_bass_state_setup_failed(&self.device);
        }
    }

    fn acquire_all_bass_chars(&mut self) {
        self.control_point = None;
        self.receive_state_chars.clear();
        self.read_instances.clear();

        let Some(chars) = self
            .gatt
            .as_ref()
            .and_then(|gatt| gatt.service_characteristics(BASS_UUID))
        else {
            warn!("[BassClient {}] BASS service not found", self.device);
            return;
        };
        self.num_receive_states = chars.len().saturating_sub(1);

        for characteristic in chars {
            if characteristic.uuid == CONTROL_POINT_UUID {
                if characteristic.supports(property::WRITE | property::WRITE_NO_RESPONSE) {
                    self.control_point = Some(characteristic);
                } else {
                    warn!(
                        "[BassClient {}] Control point lacks write properties, ignored",
                        self.device
                    );
                }
            } else {
                if characteristic.uuid != RECEIVE_STATE_UUID {
                    warn!(
                        "[BassClient {}] Unexpected characteristic 0x{:04X}",
                        self.device, characteristic.uuid
                    );
                }
                let instance_id = characteristic.instance_id;
                self.receive_state_chars.push(characteristic);
                self.post(Message::ReadBassCharacteristics { instance_id });
            }
        }
        info!(
            "[BassClient {}] {} receive state characteristics, control point: {}",
            self.device,
            self.num_receive_states,
            self.control_point.is_some()
        );
    }

    fn is_receive_state_char(&self, instance_id: u32) -> bool {
        self.receive_state_chars
            .iter()
            .any(|c| c.instance_id == instance_id)
    }

    fn on_characteristic_read(&mut self, instance_id: u32, value: &[u8], status: GattStatus) {
        if status.is_success() && self.is_receive_state_char(instance_id) {
            self.process_receive_state(instance_id, value);
            self.read_instances.insert(instance_id);
            if !self.bass_state_ready && self.read_instances.len() == self.num_receive_states {
                info!("[BassClient {}] BASS state ready", self.device);
                self.bass_state_ready = true;
                self.callbacks.on_bass_state_ready(&self.device);
            }
        } else if !status.is_success() {
            warn!(
                "[BassClient {}] Read of characteristic {} failed: {}",
                self.device, instance_id, status
            );
        }

        let has_ccc = self
            .receive_state_chars
            .iter()
            .any(|c| c.instance_id == instance_id && c.has_ccc);
        let enabled = has_ccc
            && self
                .gatt
                .as_mut()
                .is_some_and(|gatt| {
                    gatt.write_descriptor(
                        instance_id,
                        CLIENT_CHARACTERISTIC_CONFIG_UUID,
                        &ENABLE_NOTIFICATION_VALUE,
                    )
                });
        if !enabled {
            warn!(
                "[BassClient {}] No CCC for characteristic {}, completing read",
                self.device, instance_id
            );
            self.post(Message::GattTxnProcessed { status });
        }
    }

    /// Reconcile a new value of a receive-state characteristic.
    pub(super) fn process_receive_state(&mut self, instance_id: u32, value: &[u8]) {
        let previous = self.receive_states.get(&instance_id).cloned();
        if previous.is_none() && self.receive_states.len() >= self.num_receive_states {
            error!(
                "[BassClient {}] More receive states than the {} advertised",
                self.device, self.num_receive_states
            );
            return;
        }

        trace!(
            "[BassClient {}] Receive state {}: {}",
            self.device,
            instance_id,
            hex::encode(value)
        );
        let resolver = Arc::clone(&self.resolver);
        let state = match self
            .decoder
            .try_decode(instance_id, value, |addr, typ| resolver.resolve(addr, typ))
        {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "[BassClient {}] Malformed receive state on {} (last source {:?}): {}",
                    self.device,
                    instance_id,
                    self.decoder.source_id(instance_id),
                    e
                );
                self.decoder.decode(instance_id, &[], |_, _| None)
            }
        };
        self.receive_states.insert(instance_id, state.clone());

        let was_present = previous.as_ref().is_some_and(|p| p.is_source_present());
        let source_id = state.source_id;
        match (was_present, state.is_source_present()) {
            (false, true) => self.on_source_reported(&state),
            (true, true) => self.on_source_changed(&state),
            (true, false) => self.on_source_gone(&state),
            (false, false) => debug!("[BassClient {}] Slot {} empty", self.device, source_id),
        }

        self.callbacks
            .on_receive_state_changed(&self.device, source_id, &state);
    }

    fn bind_pending_metadata(&mut self, state: &BroadcastReceiveState) {
        self.timers
            .cancel(TimerKey::CancelSourceOperation(state.broadcast_id));
        if let Some(metadata) = self.tracker.take_metadata_for(state) {
            self.current_metadata.insert(state.source_id, metadata);
        }
    }

    fn on_source_reported(&mut self, state: &BroadcastReceiveState) {
        self.bind_pending_metadata(state);
        let reason = if self.tracker.is_outcome(OperationKind::Add, state) {
            self.tracker.settle(OperationKind::Add, state);
            ReasonCode::LocalAppRequest
        } else {
            ReasonCode::RemoteRequest
        };
        info!(
            "[BassClient {}] Source {} added (broadcast 0x{:06X}, {:?})",
            self.device, state.source_id, state.broadcast_id, reason
        );
        self.callbacks
            .on_source_added(&self.device, state.source_id, reason);
        self.check_and_update_broadcast_code(state);
        self.process_pa_sync_state(state);
    }

    fn on_source_changed(&mut self, state: &BroadcastReceiveState) {
        let source_id = state.source_id;
        self.bind_pending_metadata(state);
        let reason = if self.tracker.is_outcome(OperationKind::Update, state) {
            self.tracker.settle(OperationKind::Update, state);
            ReasonCode::LocalAppRequest
        } else {
            ReasonCode::RemoteRequest
        };
        debug!("[BassClient {}] Source {} modified ({:?})", self.device, source_id, reason);
        self.callbacks
            .on_source_modified(&self.device, source_id, reason);
        self.check_and_update_broadcast_code(state);
        self.process_pa_sync_state(state);

        if self.pending_remove.contains(&source_id)
            && !super::is_synced(state)
            && !self.tracker.is_adding(state.broadcast_id)
        {
            info!(
                "[BassClient {}] Source {} desynchronized, removing",
                self.device, source_id
            );
            self.post(Message::RemoveSource { source_id });
        }
    }

    fn on_source_gone(&mut self, state: &BroadcastReceiveState) {
        let source_id = state.source_id;
        self.current_metadata.remove(&source_id);
        self.pending_remove.remove(&source_id);

        if let Some(switch) = self.pending_switch.clone() {
            info!(
                "[BassClient {}] Source {} removed for switch to 0x{:06X}",
                self.device, source_id, switch.broadcast_id
            );
            self.tracker.settle(OperationKind::Remove, state);
            self.callbacks
                .on_source_removed(&self.device, source_id, ReasonCode::LocalStackRequest);
            self.post(Message::AddSource { metadata: switch });
        } else if self.tracker.is_outcome(OperationKind::Remove, state) {
            self.tracker.settle(OperationKind::Remove, state);
            self.callbacks
                .on_source_removed(&self.device, source_id, ReasonCode::LocalAppRequest);
        } else {
            self.callbacks
                .on_source_removed(&self.device, source_id, ReasonCode::RemoteRequest);
        }
    }

    /// Answer "code required" when a code is waiting for this source.
    pub(super) fn check_and_update_broadcast_code(&mut self, state: &BroadcastReceiveState) {
        if state.big_encryption_state != BigEncryptionState::CodeRequired {
            return;
        }
        if !self.config.set_code_requires_audio_state && !self.set_code_pending {
            return;
        }

        let source_id = state.source_id;
        let cached_for_source = self
            .set_code_metadata
            .as_ref()
            .is_some_and(|m| m.broadcast_id == state.broadcast_id);
        if cached_for_source {
            if let Some(metadata) = self.set_code_metadata.take() {
                self.current_metadata.insert(source_id, metadata);
            }
        }
        debug!("[BassClient {}] Source {} needs a broadcast code", self.device, source_id);
        self.post(Message::SetBroadcastCode(SetCodeRequest::ReceiveState(
            state.clone(),
        )));
        self.set_code_pending = false;
    }

    /// Hand over PA sync info when the sink asks for it.
    fn process_pa_sync_state(&mut self, state: &BroadcastReceiveState) {
        if state.pa_sync_state != PaSyncState::SyncInfoRequest {
            return;
        }
        let source_id = state.source_id;
        let broadcast_id = state.broadcast_id;

        if self.periodic.is_local_broadcast(broadcast_id) {
            let service_data =
                (u16::from(source_id) << 8) | ADV_ADDRESS_DONT_MATCHES_SOURCE_ADV_ADDRESS;
            match self.periodic.local_advertising_handle(broadcast_id) {
                Some(adv_handle) => {
                    info!(
                        "[BassClient {}] Transferring set info of local broadcast 0x{:06X}",
                        self.device, broadcast_id
                    );
                    self.periodic
                        .transfer_set_info(&self.device, service_data, adv_handle);
                }
                None => warn!(
                    "[BassClient {}] No advertising handle for local broadcast 0x{:06X}",
                    self.device, broadcast_id
                ),
            }
            return;
        }

        match self.periodic.sync_for_broadcast(broadcast_id) {
            Some(sync) => {
                let source_address = self
                    .current_metadata
                    .get(&source_id)
                    .map(|m| m.source_device.address);
                let service_data = past_service_data(
                    source_id,
                    state.source_address,
                    Some(sync.advertiser),
                    source_address,
                );
                info!(
                    "[BassClient {}] PAST for source {} (sync handle {}, service data 0x{:04X})",
                    self.device, source_id, sync.sync_handle, service_data
                );
                self.periodic
                    .transfer_sync(&self.device, service_data, sync.sync_handle);
            }
            None => {
                debug!(
                    "[BassClient {}] No sync for 0x{:06X}, requesting one for PAST",
                    self.device, broadcast_id
                );
                self.periodic
                    .request_sync_for_past(&self.device, broadcast_id, source_id);
            }
        }
    }
}
