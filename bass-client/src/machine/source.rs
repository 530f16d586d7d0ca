//! Source management commands issued from the Connected state.

use log::{debug, error, info, trace, warn};
use tokio::time::Instant;

use bass_protocol::{
    BigEncryptionState, BroadcastMetadata, ControlPointOperation, PaSync, ReasonCode,
};

use super::BassClientStateMachine;
use crate::gatt::WriteType;
use crate::message::{Message, SetCodeRequest};
use crate::pending::{OperationKind, PendingOperation};
use crate::periodic::past_service_data;
use crate::timer::TimerKey;

impl BassClientStateMachine {
    /// Write an operation to the Scan Control Point.
    ///
    /// Values longer than one ATT write command go with response.
    fn write_control_point(&mut self, op: &ControlPointOperation) -> bool {
        let value = match op.encode() {
            Ok(value) => value,
            Err(e) => {
                error!("[BassClient {}] Failed to encode {:?}: {}", self.device, op, e);
                return false;
            }
        };
        let (Some(gatt), Some(control_point)) = (self.gatt.as_mut(), self.control_point.as_ref())
        else {
            error!("[BassClient {}] No GATT handle or control point", self.device);
            return false;
        };

        let write_type = if value.len() > self.max_single_write {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!(
            "[BassClient {}] Writing opcode 0x{:02X} ({} bytes, {:?})",
            self.device,
            op.opcode(),
            value.len(),
            write_type
        );
        trace!("[BassClient {}] Control point value: {}", self.device, hex::encode(&value));
        gatt.write_characteristic(control_point.instance_id, &value, write_type)
    }

    fn schedule_source_operation_timeout(&mut self, broadcast_id: u32) {
        self.timers.schedule(
            TimerKey::CancelSourceOperation(broadcast_id),
            Instant::now() + self.config.source_operation_timeout(),
            Message::CancelPendingSourceOperation { broadcast_id },
        );
    }

    pub(super) fn read_characteristic(&mut self, instance_id: u32) {
        let Some(gatt) = self.gatt.as_mut() else {
            error!(
                "[BassClient {}] READ_BASS_CHARACTERISTICS ignored, no GATT handle",
                self.device
            );
            return;
        };
        if !gatt.read_characteristic(instance_id) {
            warn!("[BassClient {}] Read of characteristic {} not queued", self.device, instance_id);
            return;
        }
        self.begin_transaction(PendingOperation::read_characteristics());
    }

    pub(super) fn scan_offload(&mut self, start: bool) {
        let op = if start {
            ControlPointOperation::RemoteScanStarted
        } else {
            ControlPointOperation::RemoteScanStopped
        };
        if self.write_control_point(&op) {
            self.begin_transaction(PendingOperation::scan_offload(start));
        }
    }

    pub(super) fn add_source(&mut self, metadata: BroadcastMetadata) {
        let broadcast_id = metadata.broadcast_id;
        info!("[BassClient {}] Adding broadcast source 0x{:06X}", self.device, broadcast_id);

        if !self.periodic.is_local_broadcast(broadcast_id)
            && self.periodic.sync_for_broadcast(broadcast_id).is_none()
        {
            warn!(
                "[BassClient {}] Not synced to broadcast 0x{:06X}, add rejected",
                self.device, broadcast_id
            );
            self.callbacks
                .on_source_add_failed(&self.device, &metadata, ReasonCode::BadParameters);
            return;
        }

        let op = ControlPointOperation::add_source(&metadata, self.config.past_unavailable);
        if self.write_control_point(&op) {
            if metadata.needs_broadcast_code() {
                self.set_code_pending = true;
            }
            self.begin_transaction(PendingOperation::add(metadata));
            self.schedule_source_operation_timeout(broadcast_id);
        } else {
            error!("[BassClient {}] ADD_BCAST_SOURCE: write failed", self.device);
            self.callbacks
                .on_source_add_failed(&self.device, &metadata, ReasonCode::Unknown);
        }

        if self
            .pending_switch
            .as_ref()
            .is_some_and(|s| s.broadcast_id == broadcast_id)
        {
            self.pending_switch = None;
        }
    }

    pub(super) fn update_source(
        &mut self,
        source_id: u8,
        metadata: Option<BroadcastMetadata>,
        pa_sync: Option<PaSync>,
    ) {
        info!(
            "[BassClient {}] Updating source {} (pa_sync {:?}, metadata: {})",
            self.device,
            source_id,
            pa_sync,
            metadata.is_some()
        );
        let Some(current) = self
            .receive_state_for_source_id(source_id)
            .cloned()
        else {
            error!("[BassClient {}] No source with id {}", self.device, source_id);
            self.callbacks
                .on_source_modify_failed(&self.device, source_id, ReasonCode::InvalidSourceId);
            return;
        };

        let op = ControlPointOperation::modify_source(&current, metadata.as_ref(), pa_sync);
        if !self.write_control_point(&op) {
            error!("[BassClient {}] UPDATE_BCAST_SOURCE: write failed", self.device);
            self.callbacks
                .on_source_modify_failed(&self.device, source_id, ReasonCode::Unknown);
            return;
        }

        if pa_sync == Some(PaSync::DoNotSync) {
            self.pending_remove.insert(source_id);
        }
        if metadata.as_ref().is_some_and(|m| m.needs_broadcast_code()) {
            self.set_code_pending = true;
        }
        let broadcast_id = metadata
            .as_ref()
            .map(|m| m.broadcast_id)
            .unwrap_or(current.broadcast_id);
        self.begin_transaction(PendingOperation::update(source_id, broadcast_id, metadata));
        self.schedule_source_operation_timeout(broadcast_id);
    }

    pub(super) fn set_broadcast_code(&mut self, request: SetCodeRequest) {
        self.set_code_pending = false;
        let state = match request {
            SetCodeRequest::Metadata(metadata) => {
                let broadcast_id = metadata.broadcast_id;
                self.set_code_metadata = Some(metadata);
                self.set_code_pending = true;
                debug!("[BassClient {}] Broadcast code kept until requested", self.device);
                let waiting = self
                    .receive_states
                    .values()
                    .find(|s| {
                        s.broadcast_id == broadcast_id
                            && s.is_source_present()
                            && s.big_encryption_state == BigEncryptionState::CodeRequired
                    })
                    .cloned();
                if let Some(state) = waiting {
                    self.check_and_update_broadcast_code(&state);
                }
                return;
            }
            SetCodeRequest::ReceiveState(state) => state,
        };

        let source_id = state.source_id;
        let code_required = self
            .receive_state_for_source_id(source_id)
            .is_some_and(|s| s.big_encryption_state == BigEncryptionState::CodeRequired);
        if !self.config.force_set_broadcast_code && !code_required {
            debug!(
                "[BassClient {}] Source {} does not need a code yet, keeping request",
                self.device, source_id
            );
            self.set_code_pending = true;
            return;
        }

        let Some(code) = self
            .current_metadata
            .get(&source_id)
            .and_then(|m| m.broadcast_code.clone())
        else {
            error!("[BassClient {}] No broadcast code for source {}", self.device, source_id);
            return;
        };
        let op = match ControlPointOperation::set_broadcast_code(source_id, &code) {
            Ok(op) => op,
            Err(e) => {
                error!("[BassClient {}] Invalid broadcast code: {}", self.device, e);
                return;
            }
        };
        if self.write_control_point(&op) {
            self.begin_transaction(PendingOperation::set_code(source_id));
        }
    }

    pub(super) fn remove_source(&mut self, source_id: u8) {
        if self.is_synced_to_source(source_id) {
            info!(
                "[BassClient {}] Source {} still synced, asking the sink to stop first",
                self.device, source_id
            );
            self.update_source(source_id, None, Some(PaSync::DoNotSync));
            return;
        }

        info!("[BassClient {}] Removing source {}", self.device, source_id);
        self.pending_remove.remove(&source_id);
        let op = ControlPointOperation::RemoveSource { source_id };
        if self.write_control_point(&op) {
            self.begin_transaction(PendingOperation::remove(source_id));
            return;
        }

        error!("[BassClient {}] REMOVE_BCAST_SOURCE: write failed", self.device);
        self.callbacks
            .on_source_remove_failed(&self.device, source_id, ReasonCode::Unknown);
        if let Some(switch) = self.pending_switch.take() {
            self.callbacks
                .on_source_add_failed(&self.device, &switch, ReasonCode::Unknown);
        }
    }

    pub(super) fn switch_source(&mut self, source_id: u8, metadata: BroadcastMetadata) {
        info!(
            "[BassClient {}] Switching source {} to broadcast 0x{:06X}",
            self.device, source_id, metadata.broadcast_id
        );
        self.pending_switch = Some(metadata);

        let current = self.current_metadata.get(&source_id).cloned();
        if current.is_some() && self.is_synced_to_source(source_id) {
            self.post(Message::UpdateSource {
                source_id,
                metadata: current,
                pa_sync: Some(PaSync::DoNotSync),
            });
        } else {
            self.post(Message::RemoveSource { source_id });
        }
    }

    pub(super) fn cancel_pending_source_operation(&mut self, broadcast_id: u32) {
        let cancelled = self.tracker.cancel_if(broadcast_id);

        let before = self.deferred.len() + self.queue.len();
        self.deferred.retain(|m| m.broadcast_id() != Some(broadcast_id));
        self.queue.retain(|m| m.broadcast_id() != Some(broadcast_id));
        let dropped = before - self.deferred.len() - self.queue.len();

        if self
            .pending_switch
            .as_ref()
            .is_some_and(|s| s.broadcast_id == broadcast_id)
        {
            self.pending_switch = None;
        }
        self.timers.cancel(TimerKey::CancelSourceOperation(broadcast_id));

        if cancelled || dropped > 0 {
            info!(
                "[BassClient {}] Cancelled pending operation for 0x{:06X} ({} queued dropped)",
                self.device, broadcast_id, dropped
            );
        } else {
            debug!(
                "[BassClient {}] Nothing pending for 0x{:06X}",
                self.device, broadcast_id
            );
        }
    }

    pub(super) fn initiate_pa_sync_transfer(&mut self, sync_handle: u16, source_id: u8) {
        let Some(state) = self.receive_state_for_source_id(source_id) else {
            warn!("[BassClient {}] No receive state for source {}", self.device, source_id);
            return;
        };
        let advertiser = self
            .periodic
            .sync_for_broadcast(state.broadcast_id)
            .filter(|sync| sync.sync_handle == sync_handle)
            .map(|sync| sync.advertiser);
        let source_address = self
            .current_metadata
            .get(&source_id)
            .map(|m| m.source_device.address);
        let service_data =
            past_service_data(source_id, state.source_address, advertiser, source_address);
        info!(
            "[BassClient {}] PAST sync handle {} service data 0x{:04X}",
            self.device, sync_handle, service_data
        );
        self.periodic
            .transfer_sync(&self.device, service_data, sync_handle);
    }

    /// Failure notifications for a finished transaction.
    pub(super) fn send_pending_callbacks(&mut self, op: Option<PendingOperation>, success: bool) {
        let Some(op) = op else {
            return;
        };
        if success {
            debug!("[BassClient {}] {:?} succeeded", self.device, op.kind);
            return;
        }

        let source_id = op.source_id.unwrap_or_default();
        match op.kind {
            OperationKind::Add => {
                if let Some(metadata) = &op.metadata {
                    self.callbacks
                        .on_source_add_failed(&self.device, metadata, ReasonCode::Unknown);
                }
                if let Some(id) = op.broadcast_id {
                    self.timers.cancel(TimerKey::CancelSourceOperation(id));
                }
            }
            OperationKind::Update => {
                self.callbacks
                    .on_source_modify_failed(&self.device, source_id, ReasonCode::Unknown);
                if let Some(id) = op.broadcast_id {
                    self.timers.cancel(TimerKey::CancelSourceOperation(id));
                }
            }
            OperationKind::Remove => {
                self.callbacks
                    .on_source_remove_failed(&self.device, source_id, ReasonCode::Unknown);
                if let Some(switch) = self.pending_switch.take() {
                    self.callbacks
                        .on_source_add_failed(&self.device, &switch, ReasonCode::Unknown);
                }
            }
            kind => warn!("[BassClient {}] {:?} failed", self.device, kind),
        }
    }
}
