//! Periodic-advertising sync collaborator and PAST service data.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use bass_protocol::{DeviceAddress, DeviceId};

/// Service-data flag: the advertiser address differs from the extended advertising address.
pub const ADV_ADDRESS_DONT_MATCHES_EXT_ADV_ADDRESS: u16 = 0x01;

/// Service-data flag: the advertiser address differs from the source address.
pub const ADV_ADDRESS_DONT_MATCHES_SOURCE_ADV_ADDRESS: u16 = 0x02;

/// An established periodic-advertising sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSync {
    pub sync_handle: u16,
    /// Advertiser the sync was established with.
    pub advertiser: DeviceAddress,
}

/// Local periodic-advertising sync cache and PAST primitives.
pub trait PeriodicSyncManager: Send + Sync {
    /// Whether the broadcast is advertised by this device.
    fn is_local_broadcast(&self, broadcast_id: u32) -> bool;

    /// Cached sync for a broadcast id.
    fn sync_for_broadcast(&self, broadcast_id: u32) -> Option<PeriodicSync>;

    /// Advertising handle of a local broadcast.
    fn local_advertising_handle(&self, broadcast_id: u32) -> Option<u8>;

    fn transfer_sync(&self, device: &DeviceId, service_data: u16, sync_handle: u16);

    fn transfer_set_info(&self, device: &DeviceId, service_data: u16, adv_handle: u8);

    /// Ask for a sync to be established so it can be transferred later.
    fn request_sync_for_past(&self, device: &DeviceId, broadcast_id: u32, source_id: u8);
}

/// Service data of a PAST towards a sink: source id in the high byte, flags in the low byte.
pub fn past_service_data(
    source_id: u8,
    reported: DeviceAddress,
    sync_advertiser: Option<DeviceAddress>,
    source_address: Option<DeviceAddress>,
) -> u16 {
    let mut flags = 0;
    if sync_advertiser.is_some_and(|adv| adv != reported) {
        flags |= ADV_ADDRESS_DONT_MATCHES_EXT_ADV_ADDRESS;
    }
    if source_address.is_some_and(|src| src != reported) {
        flags |= ADV_ADDRESS_DONT_MATCHES_SOURCE_ADV_ADDRESS;
    }
    (u16::from(source_id) << 8) | flags
}

/// A PAST primitive issued through [`InMemorySyncManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PastRequest {
    TransferSync {
        device: DeviceId,
        service_data: u16,
        sync_handle: u16,
    },
    TransferSetInfo {
        device: DeviceId,
        service_data: u16,
        adv_handle: u8,
    },
    SyncForPast {
        device: DeviceId,
        broadcast_id: u32,
        source_id: u8,
    },
}

#[derive(Debug, Default)]
struct SyncTable {
    syncs: HashMap<u32, PeriodicSync>,
    local: HashMap<u32, u8>,
    requests: Vec<PastRequest>,
}

/// Sync cache kept in memory, recording every PAST primitive.
#[derive(Debug, Clone, Default)]
pub struct InMemorySyncManager {
    table: Arc<Mutex<SyncTable>>,
}

impl InMemorySyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sync(&self, broadcast_id: u32, sync: PeriodicSync) {
        self.table.lock().syncs.insert(broadcast_id, sync);
    }

    pub fn remove_sync(&self, broadcast_id: u32) {
        self.table.lock().syncs.remove(&broadcast_id);
    }

    pub fn add_local_broadcast(&self, broadcast_id: u32, adv_handle: u8) {
        self.table.lock().local.insert(broadcast_id, adv_handle);
    }

    pub fn requests(&self) -> Vec<PastRequest> {
        self.table.lock().requests.clone()
    }

    fn record(&self, request: PastRequest) {
        debug!("[PeriodicSync] {:?}", request);
        self.table.lock().requests.push(request);
    }
}

impl PeriodicSyncManager for InMemorySyncManager {
    fn is_local_broadcast(&self, broadcast_id: u32) -> bool {
        self.table.lock().local.contains_key(&broadcast_id)
    }

    fn sync_for_broadcast(&self, broadcast_id: u32) -> Option<PeriodicSync> {
        self.table.lock().syncs.get(&broadcast_id).copied()
    }

    fn local_advertising_handle(&self, broadcast_id: u32) -> Option<u8> {
        self.table.lock().local.get(&broadcast_id).copied()
    }

    fn transfer_sync(&self, device: &DeviceId, service_data: u16, sync_handle: u16) {
        self.record(PastRequest::TransferSync {
            device: *device,
            service_data,
            sync_handle,
        });
    }

    fn transfer_set_info(&self, device: &DeviceId, service_data: u16, adv_handle: u8) {
        self.record(PastRequest::TransferSetInfo {
            device: *device,
            service_data,
            adv_handle,
        });
    }

    fn request_sync_for_past(&self, device: &DeviceId, broadcast_id: u32, source_id: u8) {
        self.record(PastRequest::SyncForPast {
            device: *device,
            broadcast_id,
            source_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_data_flags() {
        let reported = DeviceAddress([1, 2, 3, 4, 5, 6]);
        let other = DeviceAddress([6, 5, 4, 3, 2, 1]);

        assert_eq!(past_service_data(3, reported, Some(reported), Some(reported)), 0x0300);
        assert_eq!(past_service_data(3, reported, Some(other), Some(reported)), 0x0301);
        assert_eq!(past_service_data(3, reported, Some(reported), Some(other)), 0x0302);
        assert_eq!(past_service_data(1, reported, Some(other), Some(other)), 0x0103);
        assert_eq!(past_service_data(1, reported, None, None), 0x0100);
    }

    #[test]
    fn test_in_memory_sync_manager() {
        let manager = InMemorySyncManager::new();
        let sync = PeriodicSync {
            sync_handle: 7,
            advertiser: DeviceAddress([1; 6]),
        };
        manager.add_sync(0x123456, sync);
        manager.add_local_broadcast(0x000001, 2);

        assert_eq!(manager.sync_for_broadcast(0x123456), Some(sync));
        assert!(manager.is_local_broadcast(0x000001));
        assert_eq!(manager.local_advertising_handle(0x000001), Some(2));

        manager.remove_sync(0x123456);
        assert_eq!(manager.sync_for_broadcast(0x123456), None);

        manager.transfer_sync(&DeviceId::EMPTY, 0x0100, 7);
        assert_eq!(manager.requests().len(), 1);
    }
}
