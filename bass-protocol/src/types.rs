//! Value types shared by the BASS wire formats.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broadcast Audio Scan Service UUID.
pub const BASS_UUID: u16 = 0x184F;

/// Broadcast Audio Scan Control Point characteristic UUID.
pub const CONTROL_POINT_UUID: u16 = 0x2BC7;

/// Broadcast Receive State characteristic UUID.
pub const RECEIVE_STATE_UUID: u16 = 0x2BC8;

/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: u16 = 0x2902;

/// Size of a broadcast code in octets.
pub const BROADCAST_CODE_SIZE: usize = 16;

/// Size of a device address in octets.
pub const ADDRESS_SIZE: usize = 6;

/// ATT write command header length (opcode + handle).
pub const ATT_WRITE_CMD_HDR_LEN: u16 = 3;

/// MTU requested from the sink after service discovery.
pub const BASS_MAX_BYTES: u16 = 100;

/// PA interval value meaning "unknown".
pub const PA_INTERVAL_UNKNOWN: u16 = 0xFFFF;

/// Largest value a 24-bit broadcast id can hold.
pub const MAX_BROADCAST_ID: u32 = 0x00FF_FFFF;

/// Address type of a broadcast source advertiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => AddressType::Random,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => 0x00,
            AddressType::Random => 0x01,
        }
    }
}

/// A 6-octet device address, most significant octet first.
///
/// On the wire BASS carries addresses least significant octet first;
/// [`DeviceAddress::from_le_bytes`] and [`DeviceAddress::to_le_bytes`] do the swap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceAddress(pub [u8; ADDRESS_SIZE]);

impl DeviceAddress {
    /// The all-zero address used as the "no source" placeholder.
    pub const EMPTY: DeviceAddress = DeviceAddress([0; ADDRESS_SIZE]);

    pub fn from_le_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        let mut addr = bytes;
        addr.reverse();
        DeviceAddress(addr)
    }

    pub fn to_le_bytes(self) -> [u8; ADDRESS_SIZE] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Parse a `AA:BB:CC:DD:EE:FF` string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; ADDRESS_SIZE];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(DeviceAddress(out))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Stable identity of a remote device (address plus address type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceId {
    pub address: DeviceAddress,
    pub address_type: AddressType,
}

impl DeviceId {
    /// Placeholder identity for an empty receive-state slot.
    pub const EMPTY: DeviceId = DeviceId {
        address: DeviceAddress::EMPTY,
        address_type: AddressType::Public,
    };

    pub fn new(address: DeviceAddress, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// PA synchronization requested in add/modify source operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaSync {
    /// Do not synchronize to PA.
    DoNotSync,
    /// Synchronize to PA, PAST available.
    SyncPastAvailable,
    /// Synchronize to PA, PAST not available.
    SyncPastUnavailable,
}

impl PaSync {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PaSync::DoNotSync),
            0x01 => Some(PaSync::SyncPastAvailable),
            0x02 => Some(PaSync::SyncPastUnavailable),
            _ => None,
        }
    }
}

impl From<PaSync> for u8 {
    fn from(value: PaSync) -> Self {
        match value {
            PaSync::DoNotSync => 0x00,
            PaSync::SyncPastAvailable => 0x01,
            PaSync::SyncPastUnavailable => 0x02,
        }
    }
}

/// PA synchronization state reported by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaSyncState {
    /// Not synchronized to PA.
    Idle,
    /// SyncInfo request, the sink wants a PAST.
    SyncInfoRequest,
    /// Synchronized to PA.
    Synchronized,
    /// Failed to synchronize to PA.
    FailedToSynchronize,
    /// No PAST available on the sink.
    NoPast,
    /// Value reserved for future use.
    Reserved(u8),
}

impl From<u8> for PaSyncState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => PaSyncState::Idle,
            0x01 => PaSyncState::SyncInfoRequest,
            0x02 => PaSyncState::Synchronized,
            0x03 => PaSyncState::FailedToSynchronize,
            0x04 => PaSyncState::NoPast,
            other => PaSyncState::Reserved(other),
        }
    }
}

impl From<PaSyncState> for u8 {
    fn from(value: PaSyncState) -> Self {
        match value {
            PaSyncState::Idle => 0x00,
            PaSyncState::SyncInfoRequest => 0x01,
            PaSyncState::Synchronized => 0x02,
            PaSyncState::FailedToSynchronize => 0x03,
            PaSyncState::NoPast => 0x04,
            PaSyncState::Reserved(v) => v,
        }
    }
}

/// BIG encryption state reported by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BigEncryptionState {
    NotEncrypted,
    /// The sink needs a broadcast code to decrypt the BIG.
    CodeRequired,
    Decrypting,
    /// The code written earlier was wrong; the receive state carries it back.
    BadCode,
    Reserved(u8),
}

impl From<u8> for BigEncryptionState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => BigEncryptionState::NotEncrypted,
            0x01 => BigEncryptionState::CodeRequired,
            0x02 => BigEncryptionState::Decrypting,
            0x03 => BigEncryptionState::BadCode,
            other => BigEncryptionState::Reserved(other),
        }
    }
}

impl From<BigEncryptionState> for u8 {
    fn from(value: BigEncryptionState) -> Self {
        match value {
            BigEncryptionState::NotEncrypted => 0x00,
            BigEncryptionState::CodeRequired => 0x01,
            BigEncryptionState::Decrypting => 0x02,
            BigEncryptionState::BadCode => 0x03,
            BigEncryptionState::Reserved(v) => v,
        }
    }
}

/// 4-octet BIS_Sync bitmap.
///
/// Bit `n - 1` selects BIS index `n` (1..=31). In a receive state
/// `0xFFFFFFFF` means the sink failed to sync to the BIG; in a request
/// it means "no preference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BisSync(pub u32);

impl BisSync {
    pub const NO_PREFERENCE: BisSync = BisSync(0xFFFF_FFFF);
    pub const DO_NOT_SYNC: BisSync = BisSync(0);
    pub const FAILED_SYNC_TO_BIG: BisSync = BisSync(0xFFFF_FFFF);

    /// Build the bitmap from the selected channels of a subgroup.
    ///
    /// Channel index 0 is invalid and skipped.
    pub fn from_channels(channels: &[BroadcastChannel]) -> Self {
        let bits = channels
            .iter()
            .filter(|c| c.selected && (1..=32).contains(&c.channel_index))
            .fold(0u32, |acc, c| acc | 1u32 << (c.channel_index - 1));
        BisSync(bits)
    }

    pub fn is_synced(self) -> bool {
        self.0 != 0
    }
}

/// One BIS of a broadcast subgroup as seen by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastChannel {
    /// 1-based BIS index.
    pub channel_index: u8,
    /// Whether the sink should synchronize to this BIS.
    pub selected: bool,
    #[serde(default)]
    pub codec_config: Vec<u8>,
}

/// A subgroup of a broadcast source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastSubgroup {
    #[serde(default)]
    pub codec_id: [u8; 5],
    #[serde(default)]
    pub codec_config: Vec<u8>,
    /// Raw LTV content metadata.
    #[serde(default)]
    pub content_metadata: Vec<u8>,
    #[serde(default)]
    pub channels: Vec<BroadcastChannel>,
}

/// Everything the assistant knows about a broadcast source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastMetadata {
    pub source_device: DeviceId,
    #[serde(default)]
    pub source_adv_sid: u8,
    pub broadcast_id: u32,
    #[serde(default = "default_pa_interval")]
    pub pa_sync_interval: u16,
    #[serde(default)]
    pub presentation_delay_micros: u32,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub broadcast_code: Option<Vec<u8>>,
    #[serde(default)]
    pub subgroups: Vec<BroadcastSubgroup>,
}

fn default_pa_interval() -> u16 {
    PA_INTERVAL_UNKNOWN
}

impl BroadcastMetadata {
    /// Copy of this metadata with every channel deselected, used to pause
    /// audio on the sink while keeping the source.
    pub fn paused(&self) -> Self {
        let mut paused = self.clone();
        for subgroup in &mut paused.subgroups {
            for channel in &mut subgroup.channels {
                channel.selected = false;
            }
        }
        paused
    }

    /// Whether a set-broadcast-code write will be needed for this source.
    pub fn needs_broadcast_code(&self) -> bool {
        self.encrypted && self.broadcast_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_byte_order() {
        let addr = DeviceAddress::parse("11:22:33:44:55:66").unwrap();
        assert_eq!(addr.to_le_bytes(), [0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(DeviceAddress::from_le_bytes(addr.to_le_bytes()), addr);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
        assert!(DeviceAddress::parse("11:22:33").is_none());
        assert!(DeviceAddress::parse("11:22:33:44:55:66:77").is_none());
    }

    #[test]
    fn test_bis_sync_from_channels() {
        let channels = vec![
            BroadcastChannel { channel_index: 1, selected: true, ..Default::default() },
            BroadcastChannel { channel_index: 2, selected: false, ..Default::default() },
            BroadcastChannel { channel_index: 3, selected: true, ..Default::default() },
            BroadcastChannel { channel_index: 0, selected: true, ..Default::default() },
        ];
        assert_eq!(BisSync::from_channels(&channels), BisSync(0b101));
        assert_eq!(BisSync::from_channels(&[]), BisSync::DO_NOT_SYNC);
    }

    #[test]
    fn test_paused_metadata_deselects_everything() {
        let meta = BroadcastMetadata {
            subgroups: vec![BroadcastSubgroup {
                channels: vec![
                    BroadcastChannel { channel_index: 1, selected: true, ..Default::default() },
                    BroadcastChannel { channel_index: 2, selected: true, ..Default::default() },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let paused = meta.paused();
        assert!(paused.subgroups[0].channels.iter().all(|c| !c.selected));
        assert_eq!(BisSync::from_channels(&meta.subgroups[0].channels), BisSync(0b11));
    }

    #[test]
    fn test_state_values() {
        assert_eq!(PaSyncState::from(0x02), PaSyncState::Synchronized);
        assert_eq!(u8::from(PaSyncState::Reserved(0x09)), 0x09);
        assert_eq!(BigEncryptionState::from(0x03), BigEncryptionState::BadCode);
        assert_eq!(PaSync::from_u8(0x05), None);
    }
}
