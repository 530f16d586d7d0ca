//! Tracking of the operation the state machine is waiting on.
//!
//! An operation is *active* from the GATT request until the transaction
//! completes. Source operations (add, update, remove) then stay *awaiting*
//! until the sink reports the resulting receive state, so the notification
//! can be attributed to the local request and bound to its metadata.

use bass_protocol::{BroadcastMetadata, BroadcastReceiveState};

/// Kind of GATT operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OperationKind {
    Add,
    Update,
    Remove,
    SetCode,
    ReadCharacteristics,
    StartScanOffload,
    StopScanOffload,
}

impl OperationKind {
    /// Source operations outlive their GATT transaction.
    pub fn is_source_operation(self) -> bool {
        matches!(
            self,
            OperationKind::Add | OperationKind::Update | OperationKind::Remove
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub source_id: Option<u8>,
    pub metadata: Option<BroadcastMetadata>,
    pub broadcast_id: Option<u32>,
    /// Set once a receive state settled the operation.
    resolved: bool,
}

impl PendingOperation {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            source_id: None,
            metadata: None,
            broadcast_id: None,
            resolved: false,
        }
    }

    pub fn add(metadata: BroadcastMetadata) -> Self {
        Self {
            broadcast_id: Some(metadata.broadcast_id),
            metadata: Some(metadata),
            ..Self::new(OperationKind::Add)
        }
    }

    pub fn update(source_id: u8, broadcast_id: u32, metadata: Option<BroadcastMetadata>) -> Self {
        Self {
            source_id: Some(source_id),
            broadcast_id: Some(broadcast_id),
            metadata,
            ..Self::new(OperationKind::Update)
        }
    }

    pub fn remove(source_id: u8) -> Self {
        Self {
            source_id: Some(source_id),
            ..Self::new(OperationKind::Remove)
        }
    }

    pub fn set_code(source_id: u8) -> Self {
        Self {
            source_id: Some(source_id),
            ..Self::new(OperationKind::SetCode)
        }
    }

    pub fn read_characteristics() -> Self {
        Self::new(OperationKind::ReadCharacteristics)
    }

    pub fn scan_offload(start: bool) -> Self {
        Self::new(if start {
            OperationKind::StartScanOffload
        } else {
            OperationKind::StopScanOffload
        })
    }

    /// Whether a receive state is the outcome of this operation.
    fn concerns(&self, state: &BroadcastReceiveState) -> bool {
        match self.kind {
            OperationKind::Add => self.broadcast_id == Some(state.broadcast_id),
            OperationKind::Update | OperationKind::Remove => {
                self.source_id == Some(state.source_id)
            }
            _ => false,
        }
    }
}

/// Holds the single active operation of a device.
#[derive(Debug, Default)]
pub struct PendingOperationTracker {
    active: Option<PendingOperation>,
    awaiting: Option<PendingOperation>,
}

impl PendingOperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly issued operation.
    pub fn set(&mut self, op: PendingOperation) {
        if op.kind.is_source_operation() {
            self.awaiting = None;
        }
        self.active = Some(op);
    }

    pub fn active(&self) -> Option<&PendingOperation> {
        self.active.as_ref()
    }

    /// Finish the active transaction and return it.
    ///
    /// A successful source operation keeps waiting for its receive state.
    pub fn complete(&mut self, success: bool) -> Option<PendingOperation> {
        let op = self.active.take()?;
        if success && op.kind.is_source_operation() && !op.resolved {
            let mut awaiting = op.clone();
            if awaiting.kind == OperationKind::Remove {
                awaiting.metadata = None;
            }
            self.awaiting = Some(awaiting);
        }
        Some(op)
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.awaiting = None;
    }

    /// Take the metadata of the operation that produced `state`.
    pub fn take_metadata_for(
        &mut self,
        state: &BroadcastReceiveState,
    ) -> Option<BroadcastMetadata> {
        if let Some(op) = self.active.as_mut().filter(|op| op.concerns(state)) {
            if op.metadata.is_some() {
                return op.metadata.take();
            }
        }
        self.awaiting
            .as_mut()
            .filter(|op| op.concerns(state))
            .and_then(|op| op.metadata.take())
    }

    /// Whether `state` is the outcome of a tracked operation of `kind`.
    pub fn is_outcome(&self, kind: OperationKind, state: &BroadcastReceiveState) -> bool {
        [self.active.as_ref(), self.awaiting.as_ref()]
            .into_iter()
            .flatten()
            .any(|op| op.kind == kind && !op.resolved && op.concerns(state))
    }

    /// Mark the operation of `kind` that produced `state` as settled.
    pub fn settle(&mut self, kind: OperationKind, state: &BroadcastReceiveState) {
        if let Some(op) = self.active.as_mut() {
            if op.kind == kind && op.concerns(state) {
                op.resolved = true;
            }
        }
        if self
            .awaiting
            .as_ref()
            .is_some_and(|op| op.kind == kind && op.concerns(state))
        {
            self.awaiting = None;
        }
    }

    /// Whether an operation for `broadcast_id` is tracked.
    pub fn matches(&self, broadcast_id: u32) -> bool {
        [self.active.as_ref(), self.awaiting.as_ref()]
            .into_iter()
            .flatten()
            .any(|op| op.broadcast_id == Some(broadcast_id))
    }

    /// Whether an add or update still carries metadata to bind.
    pub fn has_pending_metadata(&self) -> bool {
        [self.active.as_ref(), self.awaiting.as_ref()]
            .into_iter()
            .flatten()
            .any(|op| op.metadata.is_some())
    }

    /// Whether an Add for `broadcast_id` has not been reported yet.
    pub fn is_adding(&self, broadcast_id: u32) -> bool {
        [self.active.as_ref(), self.awaiting.as_ref()]
            .into_iter()
            .flatten()
            .any(|op| {
                op.kind == OperationKind::Add
                    && !op.resolved
                    && op.broadcast_id == Some(broadcast_id)
            })
    }

    /// Drop the metadata of operations for `broadcast_id`.
    ///
    /// The GATT transaction itself keeps running; only its effects are dropped.
    pub fn cancel_if(&mut self, broadcast_id: u32) -> bool {
        let mut cancelled = false;
        for op in [self.active.as_mut(), self.awaiting.as_mut()]
            .into_iter()
            .flatten()
        {
            if op.broadcast_id == Some(broadcast_id) {
                op.metadata = None;
                op.broadcast_id = None;
                cancelled = true;
            }
        }
        if self
            .awaiting
            .as_ref()
            .is_some_and(|op| op.broadcast_id.is_none() && op.kind == OperationKind::Add)
        {
            self.awaiting = None;
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(broadcast_id: u32) -> BroadcastMetadata {
        BroadcastMetadata {
            broadcast_id,
            ..Default::default()
        }
    }

    fn state(source_id: u8, broadcast_id: u32) -> BroadcastReceiveState {
        BroadcastReceiveState {
            broadcast_id,
            ..BroadcastReceiveState::empty(source_id)
        }
    }

    #[test]
    fn test_add_awaits_receive_state() {
        let mut tracker = PendingOperationTracker::new();
        tracker.set(PendingOperation::add(metadata(0x10)));
        assert!(tracker.matches(0x10));
        assert!(tracker.is_adding(0x10));

        let done = tracker.complete(true).unwrap();
        assert_eq!(done.kind, OperationKind::Add);
        assert!(tracker.active().is_none());
        assert!(tracker.is_adding(0x10));

        let reported = state(1, 0x10);
        assert_eq!(tracker.take_metadata_for(&reported), Some(metadata(0x10)));
        assert!(tracker.is_outcome(OperationKind::Add, &reported));
        tracker.settle(OperationKind::Add, &reported);
        assert!(!tracker.is_adding(0x10));
        assert!(!tracker.is_outcome(OperationKind::Add, &reported));
    }

    #[test]
    fn test_receive_state_before_write_response() {
        let mut tracker = PendingOperationTracker::new();
        tracker.set(PendingOperation::add(metadata(0x10)));
        let reported = state(1, 0x10);
        assert!(tracker.take_metadata_for(&reported).is_some());
        tracker.settle(OperationKind::Add, &reported);

        tracker.complete(true);
        assert!(!tracker.is_outcome(OperationKind::Add, &reported));
        assert!(!tracker.is_adding(0x10));
    }

    #[test]
    fn test_failed_operation_does_not_await() {
        let mut tracker = PendingOperationTracker::new();
        tracker.set(PendingOperation::update(2, 0x20, Some(metadata(0x20))));
        tracker.complete(false);
        assert!(tracker.active().is_none());
        assert!(!tracker.is_outcome(OperationKind::Update, &state(2, 0x20)));
        assert!(!tracker.matches(0x20));
    }

    #[test]
    fn test_metadata_only_binds_matching_state() {
        let mut tracker = PendingOperationTracker::new();
        tracker.set(PendingOperation::update(2, 0x20, Some(metadata(0x20))));
        assert_eq!(tracker.take_metadata_for(&state(3, 0x20)), None);
        assert_eq!(tracker.take_metadata_for(&state(2, 0x20)), Some(metadata(0x20)));
        assert_eq!(tracker.take_metadata_for(&state(2, 0x20)), None);
    }

    #[test]
    fn test_cancel_if() {
        let mut tracker = PendingOperationTracker::new();
        assert!(!tracker.cancel_if(0x30));

        tracker.set(PendingOperation::add(metadata(0x30)));
        assert!(!tracker.cancel_if(0x31));
        assert!(tracker.cancel_if(0x30));
        assert!(!tracker.matches(0x30));
        assert!(!tracker.has_pending_metadata());
        assert!(!tracker.is_adding(0x30));
        // The transaction itself is still outstanding.
        assert_eq!(tracker.active().map(|op| op.kind), Some(OperationKind::Add));
    }

    #[test]
    fn test_remove_drops_metadata_after_completion() {
        let mut tracker = PendingOperationTracker::new();
        tracker.set(PendingOperation::remove(4));
        tracker.complete(true);
        assert!(tracker.is_outcome(OperationKind::Remove, &state(4, 0)));
        assert!(!tracker.has_pending_metadata());

        tracker.set(PendingOperation::read_characteristics());
        assert_eq!(
            tracker.active().map(|op| op.kind),
            Some(OperationKind::ReadCharacteristics)
        );
        tracker.clear();
        assert!(tracker.active().is_none());
        assert!(!tracker.is_outcome(OperationKind::Remove, &state(4, 0)));
    }
}
