//! Per-device BASS client state machine.
//!
//! Every command, transport completion and timer is a [`Message`] processed
//! strictly in order by [`BassClientStateMachine::run_until_idle`]. A handler
//! may request a transition; it is applied after the handler returns, running
//! the exit actions of the old state and the entry actions of the new one.
//! Messages deferred in the old state are then replayed ahead of the queue.

mod receive;
mod source;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use bass_protocol::{
    BroadcastMetadata, BroadcastReceiveState, DeviceId, ReceiveStateDecoder,
};

use crate::callbacks::BassCallbacks;
use crate::config::ClientConfig;
use crate::gatt::{
    AddressResolver, AllowAll, Characteristic, ConnectionPolicy, ConnectionState,
    GattEventSender, GattSession, GattTransport, IdentityResolver,
};
use crate::message::Message;
use crate::pending::{OperationKind, PendingOperation, PendingOperationTracker};
use crate::periodic::{InMemorySyncManager, PeriodicSyncManager};
use crate::timer::{TimerKey, TimerQueue};

/// States of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    /// No link. Initial state.
    Disconnected,
    /// GATT connect issued, waiting for the link.
    Connecting,
    /// Link up, no GATT transaction outstanding.
    Connected,
    /// Exactly one GATT transaction outstanding.
    ConnectedProcessing,
}

impl State {
    /// Externally visible connection state.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting => ConnectionState::Connecting,
            State::Connected | State::ConnectedProcessing => ConnectionState::Connected,
        }
    }
}

/// External collaborators of a machine.
pub struct Collaborators {
    pub transport: Box<dyn GattTransport>,
    pub callbacks: Arc<dyn BassCallbacks>,
    pub resolver: Arc<dyn AddressResolver>,
    pub policy: Arc<dyn ConnectionPolicy>,
    pub periodic: Arc<dyn PeriodicSyncManager>,
}

impl Collaborators {
    /// Collaborators that resolve addresses as-is, allow every connection
    /// and keep periodic syncs in memory.
    pub fn new(transport: Box<dyn GattTransport>, callbacks: Arc<dyn BassCallbacks>) -> Self {
        Self {
            transport,
            callbacks,
            resolver: Arc::new(IdentityResolver),
            policy: Arc::new(AllowAll),
            periodic: Arc::new(InMemorySyncManager::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ConnectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_periodic(mut self, periodic: Arc<dyn PeriodicSyncManager>) -> Self {
        self.periodic = periodic;
        self
    }
}

/// Read-only view of a machine, published by the actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot {
    pub state: State,
    pub connection_state: ConnectionState,
    pub bass_state_ready: bool,
    pub maximum_source_capacity: usize,
    pub sources: Vec<BroadcastReceiveState>,
    /// Kind of the GATT transaction in flight.
    pub pending_operation: Option<OperationKind>,
    /// Messages waiting for the machine to leave ConnectedProcessing.
    pub deferred: usize,
}

impl MachineSnapshot {
    pub fn initial() -> Self {
        Self {
            state: State::Disconnected,
            connection_state: ConnectionState::Disconnected,
            bass_state_ready: false,
            maximum_source_capacity: 0,
            sources: Vec::new(),
            pending_operation: None,
            deferred: 0,
        }
    }
}

enum Disposition {
    Handled,
    Deferred(Message),
    Unhandled,
}

pub struct BassClientStateMachine {
    device: DeviceId,
    config: ClientConfig,

    transport: Box<dyn GattTransport>,
    callbacks: Arc<dyn BassCallbacks>,
    resolver: Arc<dyn AddressResolver>,
    policy: Arc<dyn ConnectionPolicy>,
    periodic: Arc<dyn PeriodicSyncManager>,
    events: GattEventSender,

    state: State,
    next_state: Option<State>,
    /// `None` until the machine first leaves Disconnected.
    last_connection_state: Option<ConnectionState>,
    queue: VecDeque<Message>,
    deferred: VecDeque<Message>,
    timers: TimerQueue,

    gatt: Option<Box<dyn GattSession>>,
    control_point: Option<Characteristic>,
    receive_state_chars: Vec<Characteristic>,
    num_receive_states: usize,
    read_instances: HashSet<u32>,
    bass_state_ready: bool,
    discovery_initiated: bool,
    mtu_requested: bool,
    max_single_write: usize,
    allow_reconnect: bool,

    decoder: ReceiveStateDecoder,
    /// Latest state per receive-state characteristic instance.
    receive_states: BTreeMap<u32, BroadcastReceiveState>,
    current_metadata: HashMap<u8, BroadcastMetadata>,
    tracker: PendingOperationTracker,
    txn_token: u64,
    pending_remove: HashSet<u8>,
    pending_switch: Option<BroadcastMetadata>,
    set_code_pending: bool,
    set_code_metadata: Option<BroadcastMetadata>,
}

impl BassClientStateMachine {
    /// Create a machine for `device`. Transport events must be fed back
    /// through [`Message::Gatt`]; `events` is handed to the transport.
    pub fn new(
        device: DeviceId,
        config: ClientConfig,
        collaborators: Collaborators,
        events: GattEventSender,
    ) -> Self {
        Self {
            device,
            config,
            transport: collaborators.transport,
            callbacks: collaborators.callbacks,
            resolver: collaborators.resolver,
            policy: collaborators.policy,
            periodic: collaborators.periodic,
            events,
            state: State::Disconnected,
            next_state: None,
            last_connection_state: None,
            queue: VecDeque::new(),
            deferred: VecDeque::new(),
            timers: TimerQueue::new(),
            gatt: None,
            control_point: None,
            receive_state_chars: Vec::new(),
            num_receive_states: 0,
            read_instances: HashSet::new(),
            bass_state_ready: false,
            discovery_initiated: false,
            mtu_requested: false,
            max_single_write: 0,
            allow_reconnect: false,
            decoder: ReceiveStateDecoder::new(),
            receive_states: BTreeMap::new(),
            current_metadata: HashMap::new(),
            tracker: PendingOperationTracker::new(),
            txn_token: 0,
            pending_remove: HashSet::new(),
            pending_switch: None,
            set_code_pending: false,
            set_code_metadata: None,
        }
    }

    /// Append a message to the queue.
    pub fn post(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    /// Post a message and process everything queued.
    pub fn send(&mut self, message: Message) {
        self.post(message);
        self.run_until_idle();
    }

    pub fn run_until_idle(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            self.dispatch(message);
        }
    }

    /// Fire every timer due at `now`, then process the queue.
    pub fn process_due_timers(&mut self, now: Instant) {
        for message in self.timers.pop_due(now) {
            debug!("[BassClient {}] Timer fired: {}", self.device, message.name());
            self.queue.push_back(message);
        }
        self.run_until_idle();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn dispatch(&mut self, message: Message) {
        let message = match message {
            Message::Gatt(event) => {
                self.handle_gatt_event(event);
                return;
            }
            Message::CancelPendingSourceOperation { broadcast_id } => {
                self.cancel_pending_source_operation(broadcast_id);
                return;
            }
            other => other,
        };

        let name = message.name();
        let id = message.id().unwrap_or_default();
        debug!(
            "[BassClient {}] {:?} process message: {} ({})",
            self.device, self.state, name, id
        );

        let disposition = match self.state {
            State::Disconnected => self.process_disconnected(message),
            State::Connecting => self.process_connecting(message),
            State::Connected => self.process_connected(message),
            State::ConnectedProcessing => self.process_connected_processing(message),
        };

        match disposition {
            Disposition::Handled => {}
            Disposition::Deferred(message) => {
                debug!("[BassClient {}] {:?}: deferring {}", self.device, self.state, name);
                self.deferred.push_back(message);
            }
            Disposition::Unhandled => {
                debug!(
                    "[BassClient {}] {:?}: not handled message: {} ({})",
                    self.device, self.state, name, id
                );
            }
        }

        if let Some(next) = self.next_state.take() {
            self.transition(next);
        }
    }

    fn transition(&mut self, to: State) {
        info!("[BassClient {}] {:?} -> {:?}", self.device, self.state, to);
        match self.state {
            State::Disconnected => self.exit_disconnected(),
            State::Connecting => self.exit_connecting(),
            State::Connected | State::ConnectedProcessing => {
                self.last_connection_state = Some(ConnectionState::Connected)
            }
        }

        self.state = to;
        match to {
            State::Disconnected => self.enter_disconnected(),
            State::Connecting => self.enter_connecting(),
            State::Connected => self.enter_connected(),
            State::ConnectedProcessing => {}
        }

        while let Some(message) = self.deferred.pop_back() {
            self.queue.push_front(message);
        }
    }

    // Disconnected

    fn enter_disconnected(&mut self) {
        self.clear_chars_cache();
        self.decoder.reset();
        self.timers.clear();
        self.deferred.retain(|m| !matches!(m, Message::Disconnect));

        let Some(last) = self.last_connection_state else {
            debug!("[BassClient {}] No broadcast of initial state", self.device);
            return;
        };
        self.broadcast_connection_state(last, ConnectionState::Disconnected);

        if last != ConnectionState::Disconnected
            && self.allow_reconnect
            && self.policy.ok_to_connect(&self.device)
        {
            info!("[BassClient {}] Reconnecting in background", self.device);
            if !self.connect_gatt(true) {
                warn!("[BassClient {}] Background reconnect could not start", self.device);
            }
        }
    }

    fn exit_disconnected(&mut self) {
        self.last_connection_state = Some(ConnectionState::Disconnected);
    }

    fn process_disconnected(&mut self, message: Message) -> Disposition {
        match message {
            Message::Connect => {
                if !self.policy.ok_to_connect(&self.device) {
                    warn!("[BassClient {}] Connection not allowed", self.device);
                    return Disposition::Handled;
                }
                if self.gatt.is_some() {
                    debug!("[BassClient {}] Dropping pending background connection", self.device);
                    self.disconnect_gatt();
                }
                self.allow_reconnect = true;
                if self.connect_gatt(self.config.auto_connect) {
                    self.next_state = Some(State::Connecting);
                } else {
                    error!("[BassClient {}] Error connecting", self.device);
                }
            }
            Message::Disconnect => {
                self.allow_reconnect = false;
                if self.gatt.is_some() {
                    info!("[BassClient {}] Cancelling background connection", self.device);
                    self.disconnect_gatt();
                } else {
                    debug!("[BassClient {}] DISCONNECT ignored", self.device);
                }
            }
            Message::ConnectionStateChanged { connected } => {
                if connected {
                    info!("[BassClient {}] Remote or background connection", self.device);
                    self.next_state = Some(State::Connected);
                } else {
                    warn!("[BassClient {}] Connection failed", self.device);
                }
            }
            _ => return Disposition::Unhandled,
        }
        Disposition::Handled
    }

    // Connecting

    fn enter_connecting(&mut self) {
        let deadline = Instant::now() + self.config.connect_timeout();
        self.timers.schedule(
            TimerKey::Connect,
            deadline,
            Message::ConnectTimeout {
                device: self.device,
            },
        );
        let last = self
            .last_connection_state
            .unwrap_or(ConnectionState::Disconnected);
        self.broadcast_connection_state(last, ConnectionState::Connecting);
    }

    fn exit_connecting(&mut self) {
        self.last_connection_state = Some(ConnectionState::Connecting);
        self.timers.cancel(TimerKey::Connect);
    }

    fn process_connecting(&mut self, message: Message) -> Disposition {
        match message {
            Message::Connect => {
                warn!("[BassClient {}] Already connecting, CONNECT ignored", self.device);
            }
            Message::Disconnect | Message::ReadBassCharacteristics { .. } => {
                return Disposition::Deferred(message);
            }
            Message::ConnectionStateChanged { connected } => {
                if connected {
                    self.next_state = Some(State::Connected);
                } else {
                    warn!("[BassClient {}] Connection failed", self.device);
                    self.reset_gatt();
                    self.next_state = Some(State::Disconnected);
                }
            }
            Message::ConnectTimeout { device } => {
                if device != self.device {
                    warn!(
                        "[BassClient {}] CONNECT_TIMEOUT for unknown device {}",
                        self.device, device
                    );
                    return Disposition::Handled;
                }
                warn!("[BassClient {}] Connection timed out", self.device);
                self.reset_gatt();
                self.next_state = Some(State::Disconnected);
            }
            _ => return Disposition::Unhandled,
        }
        Disposition::Handled
    }

    // Connected

    fn enter_connected(&mut self) {
        self.deferred.retain(|m| !matches!(m, Message::Connect));
        let last = self
            .last_connection_state
            .unwrap_or(ConnectionState::Disconnected);
        if last != ConnectionState::Connected {
            self.broadcast_connection_state(last, ConnectionState::Connected);
        }
    }

    /// Link-level messages shared by both connected states.
    fn process_link_message(&mut self, message: Message) -> Disposition {
        match message {
            Message::Connect => {
                warn!("[BassClient {}] Already connected, CONNECT ignored", self.device);
            }
            Message::Disconnect => {
                self.allow_reconnect = false;
                if self.gatt.is_some() {
                    info!("[BassClient {}] Disconnecting", self.device);
                    self.callbacks.on_device_disconnection(&self.device, true);
                    self.disconnect_gatt();
                    self.next_state = Some(State::Disconnected);
                } else {
                    debug!("[BassClient {}] No GATT handle, DISCONNECT ignored", self.device);
                }
            }
            Message::ConnectionStateChanged { connected } => {
                if connected {
                    warn!("[BassClient {}] Already connected", self.device);
                } else {
                    warn!("[BassClient {}] Unexpected disconnection", self.device);
                    self.callbacks.on_device_disconnection(&self.device, false);
                    self.reset_gatt();
                    self.next_state = Some(State::Disconnected);
                }
            }
            _ => return Disposition::Unhandled,
        }
        Disposition::Handled
    }

    fn process_connected(&mut self, message: Message) -> Disposition {
        match message {
            Message::Connect | Message::Disconnect | Message::ConnectionStateChanged { .. } => {
                self.process_link_message(message)
            }
            Message::ReadBassCharacteristics { instance_id } => {
                self.read_characteristic(instance_id);
                Disposition::Handled
            }
            Message::StartScanOffload => {
                self.scan_offload(true);
                Disposition::Handled
            }
            Message::StopScanOffload => {
                self.scan_offload(false);
                Disposition::Handled
            }
            Message::AddSource { metadata } => {
                self.add_source(metadata);
                Disposition::Handled
            }
            Message::UpdateSource {
                source_id,
                metadata,
                pa_sync,
            } => {
                self.update_source(source_id, metadata, pa_sync);
                Disposition::Handled
            }
            Message::SetBroadcastCode(request) => {
                self.set_broadcast_code(request);
                Disposition::Handled
            }
            Message::RemoveSource { source_id } => {
                self.remove_source(source_id);
                Disposition::Handled
            }
            Message::SwitchSource {
                source_id,
                metadata,
            } => {
                self.switch_source(source_id, metadata);
                Disposition::Handled
            }
            Message::InitiatePaSyncTransfer {
                sync_handle,
                source_id,
            } => {
                self.initiate_pa_sync_transfer(sync_handle, source_id);
                Disposition::Handled
            }
            _ => Disposition::Unhandled,
        }
    }

    // ConnectedProcessing

    fn process_connected_processing(&mut self, message: Message) -> Disposition {
        match message {
            Message::Connect | Message::Disconnect | Message::ConnectionStateChanged { .. } => {
                self.process_link_message(message)
            }
            Message::GattTxnProcessed { status } => {
                self.timers.cancel(TimerKey::GattTxn);
                debug!("[BassClient {}] GATT transaction processed: {}", self.device, status);
                let op = self.tracker.complete(status.is_success());
                self.send_pending_callbacks(op, status.is_success());
                self.next_state = Some(State::Connected);
                Disposition::Handled
            }
            Message::GattTxnTimeout { token } => {
                if token != self.txn_token {
                    debug!("[BassClient {}] Stale GATT_TXN_TIMEOUT ignored", self.device);
                    return Disposition::Handled;
                }
                warn!("[BassClient {}] GATT transaction timed out", self.device);
                let op = self.tracker.active().cloned();
                self.send_pending_callbacks(op, false);
                self.tracker.clear();
                self.next_state = Some(State::Connected);
                Disposition::Handled
            }
            message if message.is_exclusive() => Disposition::Deferred(message),
            _ => Disposition::Unhandled,
        }
    }

    // Helpers

    fn connect_gatt(&mut self, auto_connect: bool) -> bool {
        if self.gatt.is_some() {
            warn!("[BassClient {}] GATT handle already present", self.device);
            return false;
        }
        match self
            .transport
            .connect(self.device, auto_connect, self.events.clone())
        {
            Some(session) => {
                self.gatt = Some(session);
                true
            }
            None => false,
        }
    }

    fn disconnect_gatt(&mut self) {
        if let Some(mut gatt) = self.gatt.take() {
            gatt.disconnect();
            gatt.close();
        }
    }

    fn reset_gatt(&mut self) {
        if let Some(mut gatt) = self.gatt.take() {
            gatt.close();
        }
    }

    fn clear_chars_cache(&mut self) {
        self.control_point = None;
        self.receive_state_chars.clear();
        self.num_receive_states = 0;
        self.read_instances.clear();
        self.receive_states.clear();
        self.bass_state_ready = false;
        self.discovery_initiated = false;
        self.mtu_requested = false;
        self.current_metadata.clear();
        self.pending_remove.clear();
        self.pending_switch = None;
        self.set_code_pending = false;
        self.set_code_metadata = None;
        self.tracker.clear();
    }

    fn broadcast_connection_state(&self, from: ConnectionState, to: ConnectionState) {
        if from == ConnectionState::Connected && to == ConnectionState::Connected {
            debug!("[BassClient {}] CONNECTED->CONNECTED: ignore", self.device);
            return;
        }
        info!("[BassClient {}] Connection state {:?} -> {:?}", self.device, from, to);
        self.callbacks
            .on_connection_state_changed(&self.device, from, to);
    }

    /// Arm the transaction timeout and move to ConnectedProcessing.
    fn begin_transaction(&mut self, op: PendingOperation) {
        self.tracker.set(op);
        self.txn_token += 1;
        self.timers.cancel(TimerKey::GattTxn);
        self.timers.schedule(
            TimerKey::GattTxn,
            Instant::now() + self.config.gatt_txn_timeout(),
            Message::GattTxnTimeout {
                token: self.txn_token,
            },
        );
        self.next_state = Some(State::ConnectedProcessing);
    }

    /// Disconnect and drop all per-connection state.
    pub fn cleanup(&mut self) {
        info!("[BassClient {}] Cleanup", self.device);
        self.allow_reconnect = false;
        self.disconnect_gatt();
        self.clear_chars_cache();
        self.decoder.reset();
        self.timers.clear();
        self.queue.clear();
        self.deferred.clear();
        self.next_state = None;
        self.state = State::Disconnected;
    }

    // Queries

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected | State::ConnectedProcessing)
    }

    pub fn is_bass_state_ready(&self) -> bool {
        self.bass_state_ready
    }

    pub fn maximum_source_capacity(&self) -> usize {
        self.num_receive_states
    }

    /// Every known receive state, empty slots included.
    pub fn all_sources(&self) -> Vec<BroadcastReceiveState> {
        self.receive_states.values().cloned().collect()
    }

    /// Receive state of the source the sink reports under `source_id`.
    ///
    /// Empty slots are never matched.
    pub fn receive_state_for_source_id(&self, source_id: u8) -> Option<&BroadcastReceiveState> {
        self.receive_states
            .values()
            .find(|s| s.is_source_present() && s.source_id == source_id)
    }

    pub fn receive_state_for_source_device(
        &self,
        source_device: &DeviceId,
    ) -> Option<&BroadcastReceiveState> {
        self.receive_states
            .values()
            .find(|s| s.is_source_present() && s.source_device == *source_device)
    }

    pub fn current_metadata(&self, source_id: u8) -> Option<&BroadcastMetadata> {
        self.current_metadata.get(&source_id)
    }

    /// Whether an add or update is still unresolved, optionally for one broadcast id.
    pub fn has_pending_source_operation(&self, broadcast_id: Option<u32>) -> bool {
        match broadcast_id {
            Some(id) => self.tracker.matches(id),
            None => self.tracker.has_pending_metadata(),
        }
    }

    pub fn pending_operation(&self) -> Option<&PendingOperation> {
        self.tracker.active()
    }

    pub fn has_pending_switch(&self) -> bool {
        self.pending_switch.is_some()
    }

    pub fn is_pending_remove(&self, source_id: u8) -> bool {
        self.pending_remove.contains(&source_id)
    }

    /// PA synchronized or any BIS synchronized.
    pub fn is_synced_to_source(&self, source_id: u8) -> bool {
        self.receive_state_for_source_id(source_id)
            .is_some_and(is_synced)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state,
            connection_state: self.connection_state(),
            bass_state_ready: self.bass_state_ready,
            maximum_source_capacity: self.num_receive_states,
            sources: self.all_sources(),
            pending_operation: self.pending_operation().map(|op| op.kind),
            deferred: self.deferred_len(),
        }
    }
}

fn is_synced(state: &BroadcastReceiveState) -> bool {
    state.is_pa_synced() || state.subgroups.iter().any(|s| s.bis_sync_state.0 != 0)
}
