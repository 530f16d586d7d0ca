//! Actor running one state machine on the tokio runtime.

use std::time::Duration;

use futures::future::OptionFuture;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use bass_protocol::{BroadcastMetadata, DeviceId, PaSync};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::machine::{BassClientStateMachine, Collaborators, MachineSnapshot};
use crate::message::{Message, SetCodeRequest};

enum ClientCommand {
    Message(Message),
    Shutdown,
}

/// Handle to a running device actor.
///
/// Commands are queued to the actor; transport events and timers are
/// processed on the same task, one message at a time.
pub struct BassClientHandle {
    device: DeviceId,
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    snapshot_rx: watch::Receiver<MachineSnapshot>,
    join_handle: Option<JoinHandle<()>>,
}

impl BassClientHandle {
    pub fn spawn(device: DeviceId, config: ClientConfig, collaborators: Collaborators) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (snapshot_tx, snapshot_rx) = watch::channel(MachineSnapshot::initial());
        let mut machine = BassClientStateMachine::new(device, config, collaborators, events_tx);

        let join_handle = tokio::spawn(async move {
            info!("[BassClient {}] Actor started", device);
            loop {
                let timer: OptionFuture<_> = machine
                    .next_deadline()
                    .map(tokio::time::sleep_until)
                    .into();

                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ClientCommand::Message(message)) => machine.post(message),
                        Some(ClientCommand::Shutdown) | None => break,
                    },
                    Some(event) = events_rx.recv() => machine.post(Message::Gatt(event)),
                    Some(()) = timer => machine.process_due_timers(Instant::now()),
                }

                machine.run_until_idle();
                snapshot_tx.send_if_modified(|current| {
                    let next = machine.snapshot();
                    if *current == next {
                        return false;
                    }
                    *current = next;
                    true
                });
            }

            machine.cleanup();
            snapshot_tx.send_replace(machine.snapshot());
            info!("[BassClient {}] Actor stopped", device);
        });

        Self {
            device,
            cmd_tx,
            snapshot_rx,
            join_handle: Some(join_handle),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Queue a raw message.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        debug!("[BassClient {}] Queueing {}", self.device, message.name());
        self.cmd_tx
            .send(ClientCommand::Message(message))
            .map_err(|_| ClientError::ActorClosed)
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Message::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Message::Disconnect)
    }

    pub fn start_scan_offload(&self) -> Result<(), ClientError> {
        self.send(Message::StartScanOffload)
    }

    pub fn stop_scan_offload(&self) -> Result<(), ClientError> {
        self.send(Message::StopScanOffload)
    }

    pub fn add_source(&self, metadata: BroadcastMetadata) -> Result<(), ClientError> {
        self.send(Message::AddSource { metadata })
    }

    pub fn update_source(
        &self,
        source_id: u8,
        metadata: Option<BroadcastMetadata>,
        pa_sync: Option<PaSync>,
    ) -> Result<(), ClientError> {
        self.send(Message::UpdateSource {
            source_id,
            metadata,
            pa_sync,
        })
    }

    pub fn remove_source(&self, source_id: u8) -> Result<(), ClientError> {
        self.send(Message::RemoveSource { source_id })
    }

    pub fn switch_source(
        &self,
        source_id: u8,
        metadata: BroadcastMetadata,
    ) -> Result<(), ClientError> {
        self.send(Message::SwitchSource {
            source_id,
            metadata,
        })
    }

    pub fn set_broadcast_code(&self, request: SetCodeRequest) -> Result<(), ClientError> {
        self.send(Message::SetBroadcastCode(request))
    }

    pub fn cancel_pending_source_operation(&self, broadcast_id: u32) -> Result<(), ClientError> {
        self.send(Message::CancelPendingSourceOperation { broadcast_id })
    }

    pub fn initiate_pa_sync_transfer(
        &self,
        sync_handle: u16,
        source_id: u8,
    ) -> Result<(), ClientError> {
        self.send(Message::InitiatePaSyncTransfer {
            sync_handle,
            source_id,
        })
    }

    /// Latest published view of the machine.
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Wait until the published view satisfies `condition`.
    pub async fn wait_for<F>(
        &self,
        timeout: Duration,
        condition: F,
    ) -> Result<MachineSnapshot, ClientError>
    where
        F: FnMut(&MachineSnapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(condition)).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(ClientError::ActorClosed),
            Err(_) => Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for BASS client state",
            ))),
        };
        result
    }

    /// Disconnect, drop all state and stop the actor.
    pub async fn shutdown(mut self) {
        if self.cmd_tx.send(ClientCommand::Shutdown).is_err() {
            debug!("[BassClient {}] Actor already stopped", self.device);
        }
        if let Some(handle) = self.join_handle.take() {
            if let Err(e) = handle.await {
                warn!("[BassClient {}] Actor task failed: {}", self.device, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bass_protocol::{
        AddressType, BigEncryptionState, BroadcastChannel, BroadcastSubgroup, DeviceAddress,
        PaSyncState, ReasonCode,
    };

    use super::*;
    use crate::callbacks::{CallbackEvent, RecordingCallbacks};
    use crate::gatt::ConnectionState;
    use crate::loopback::LoopbackSink;
    use crate::machine::State;
    use crate::periodic::{InMemorySyncManager, PeriodicSync};

    const BROADCAST_ID: u32 = 0x123456;
    const WAIT: Duration = Duration::from_secs(60);

    fn source() -> DeviceId {
        DeviceId::new(DeviceAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]), AddressType::Random)
    }

    fn metadata() -> BroadcastMetadata {
        BroadcastMetadata {
            source_device: source(),
            source_adv_sid: 1,
            broadcast_id: BROADCAST_ID,
            subgroups: vec![BroadcastSubgroup {
                channels: vec![BroadcastChannel {
                    channel_index: 2,
                    selected: true,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn spawn(sink: &LoopbackSink, callbacks: &RecordingCallbacks) -> BassClientHandle {
        spawn_with(sink, callbacks, InMemorySyncManager::new())
    }

    fn spawn_with(
        sink: &LoopbackSink,
        callbacks: &RecordingCallbacks,
        periodic: InMemorySyncManager,
    ) -> BassClientHandle {
        periodic.add_sync(
            BROADCAST_ID,
            PeriodicSync {
                sync_handle: 1,
                advertiser: source().address,
            },
        );
        let collaborators = Collaborators::new(Box::new(sink.clone()), Arc::new(callbacks.clone()))
            .with_periodic(Arc::new(periodic));
        BassClientHandle::spawn(
            DeviceId::new(DeviceAddress([0xAA, 0, 0, 0, 0, 0x01]), AddressType::Public),
            ClientConfig::default(),
            collaborators,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_add_pause_remove() {
        let sink = LoopbackSink::new(2);
        let callbacks = RecordingCallbacks::new();
        let handle = spawn(&sink, &callbacks);

        handle.connect().unwrap();
        let snapshot = handle.wait_for(WAIT, |s| s.bass_state_ready).await.unwrap();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.maximum_source_capacity, 2);

        handle.add_source(metadata()).unwrap();
        let snapshot = handle
            .wait_for(WAIT, |s| s.sources.iter().any(|s| s.is_source_present()))
            .await
            .unwrap();
        let added = snapshot.sources.iter().find(|s| s.is_source_present()).unwrap();
        assert_eq!(added.broadcast_id, BROADCAST_ID);
        assert_eq!(added.pa_sync_state, PaSyncState::Synchronized);
        assert_eq!(added.subgroups[0].bis_sync_state.0, 0b10);
        let source_id = added.source_id;
        // The sink put id 0 on its last slot; slot 0 is still empty.
        assert_eq!(source_id, 0);
        assert!(!snapshot.sources[0].is_source_present());

        handle
            .update_source(source_id, Some(metadata().paused()), None)
            .unwrap();
        handle
            .wait_for(WAIT, |s| {
                s.sources.iter().any(|s| {
                    s.is_source_present()
                        && s.source_id == source_id
                        && s.subgroups.first().is_some_and(|g| g.bis_sync_state.0 == 0)
                })
            })
            .await
            .unwrap();

        handle.remove_source(source_id).unwrap();
        handle
            .wait_for(WAIT, |s| {
                s.state == State::Connected && s.sources.iter().all(|s| !s.is_source_present())
            })
            .await
            .unwrap();
        assert!(sink.sources().is_empty());
        // Still PA synced after the pause: Modify to "do not sync" before Remove.
        let opcodes: Vec<u8> = sink.writes().iter().map(|w| w[0]).collect();
        assert_eq!(opcodes, vec![0x02, 0x03, 0x03, 0x05]);

        let events = callbacks.events();
        assert!(events.contains(&CallbackEvent::SourceAdded {
            source_id,
            reason: ReasonCode::LocalAppRequest
        }));
        assert!(events.contains(&CallbackEvent::SourceRemoved {
            source_id,
            reason: ReasonCode::LocalAppRequest
        }));

        handle.shutdown().await;
        assert!(!sink.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_encrypted_source_during_scan_offload() {
        let sink = LoopbackSink::new(2);
        sink.set_encrypted(BROADCAST_ID);
        let callbacks = RecordingCallbacks::new();
        let handle = spawn(&sink, &callbacks);

        handle.connect().unwrap();
        handle.wait_for(WAIT, |s| s.bass_state_ready).await.unwrap();
        handle.start_scan_offload().unwrap();

        let encrypted = BroadcastMetadata {
            encrypted: true,
            broadcast_code: Some(b"1234".to_vec()),
            ..metadata()
        };
        handle.add_source(encrypted).unwrap();
        handle
            .wait_for(WAIT, |s| {
                s.state == State::Connected
                    && s.sources.iter().any(|s| {
                        s.is_source_present()
                            && s.big_encryption_state == BigEncryptionState::Decrypting
                    })
            })
            .await
            .unwrap();
        handle.stop_scan_offload().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let writes = sink.writes();
        let opcodes: Vec<u8> = writes.iter().map(|w| w[0]).collect();
        assert_eq!(opcodes, vec![0x01, 0x02, 0x04, 0x00]);
        // Set Broadcast Code for the sink's source 0, zero padded.
        assert_eq!(&writes[2][..6], &[0x04, 0x00, b'1', b'2', b'3', b'4']);
        assert_eq!(writes[2].len(), 18);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_connect_timeout() {
        let sink = LoopbackSink::new(1);
        sink.set_silent(true);
        let callbacks = RecordingCallbacks::new();
        let handle = spawn(&sink, &callbacks);

        handle.connect().unwrap();
        handle
            .wait_for(WAIT, |s| s.state == State::Connecting)
            .await
            .unwrap();
        handle
            .wait_for(WAIT, |s| s.state == State::Disconnected)
            .await
            .unwrap();
        assert!(callbacks.events().contains(&CallbackEvent::ConnectionStateChanged {
            previous: ConnectionState::Connecting,
            new: ConnectionState::Disconnected,
        }));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_write_failure() {
        let sink = LoopbackSink::new(1);
        let callbacks = RecordingCallbacks::new();
        let handle = spawn(&sink, &callbacks);

        handle.connect().unwrap();
        handle.wait_for(WAIT, |s| s.bass_state_ready).await.unwrap();

        sink.set_fail_writes(true);
        handle.add_source(metadata()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(callbacks.events().contains(&CallbackEvent::SourceAddFailed {
            broadcast_id: BROADCAST_ID,
            reason: ReasonCode::Unknown
        }));
        assert_eq!(handle.snapshot().state, State::Connected);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_after_shutdown() {
        let sink = LoopbackSink::new(1);
        let callbacks = RecordingCallbacks::new();
        let handle = spawn(&sink, &callbacks);
        let cmd_tx = handle.cmd_tx.clone();
        handle.shutdown().await;
        assert!(cmd_tx.send(ClientCommand::Message(Message::Connect)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_link_loss_and_sync_request() {
        let sink = LoopbackSink::new(1);
        let callbacks = RecordingCallbacks::new();
        let periodic = InMemorySyncManager::new();
        let handle = spawn_with(&sink, &callbacks, periodic.clone());

        handle.connect().unwrap();
        handle.wait_for(WAIT, |s| s.bass_state_ready).await.unwrap();
        handle.add_source(metadata()).unwrap();
        let snapshot = handle
            .wait_for(WAIT, |s| s.sources.iter().any(|s| s.is_source_present()))
            .await
            .unwrap();
        let source_id = snapshot
            .sources
            .iter()
            .find(|s| s.is_source_present())
            .map(|s| s.source_id)
            .unwrap();

        sink.set_pa_sync_state(source_id, PaSyncState::SyncInfoRequest);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(periodic.requests().len(), 1);

        sink.drop_link();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(callbacks
            .events()
            .contains(&CallbackEvent::DeviceDisconnection { by_user: false }));
        // The background reconnect completes against the sink.
        let snapshot = handle.wait_for(WAIT, |s| s.bass_state_ready).await.unwrap();
        assert_eq!(snapshot.state, State::Connected);
        assert!(sink.is_connected());
        handle.shutdown().await;
    }
}
