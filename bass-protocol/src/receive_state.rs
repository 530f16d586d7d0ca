//! Broadcast Receive State characteristic decoding.
//!
//! ```text
//! source_id(1) addr_type(1) addr(6, LSO first) adv_sid(1) broadcast_id(3)
//! pa_sync_state(1) big_encryption(1) [bad_code(16)] num_subgroups(1)
//! { bis_sync(4) md_len(1) md(md_len) } * num_subgroups
//! ```
//!
//! An empty value means the slot holds no source.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::codec::{
    get_array, get_length_prefixed, get_u24_le, get_u8, put_length_prefixed, put_u24_le,
};
use crate::error::ProtocolError;
use crate::types::{
    AddressType, BigEncryptionState, BisSync, DeviceAddress, DeviceId, PaSyncState,
    BROADCAST_CODE_SIZE,
};

/// Shortest non-empty receive state (no bad code, zero subgroups).
pub const MIN_RECEIVE_STATE_LEN: usize = 15;

/// One subgroup entry of a receive state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReceiveStateSubgroup {
    pub bis_sync_state: BisSync,
    /// Opaque content metadata, kept verbatim.
    pub metadata: Vec<u8>,
}

/// Snapshot of one receive-state slot on the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReceiveState {
    pub source_id: u8,
    pub source_address_type: AddressType,
    /// Address as reported by the sink.
    pub source_address: DeviceAddress,
    /// Resolved identity, [`DeviceId::EMPTY`] when unresolved.
    pub source_device: DeviceId,
    pub source_adv_sid: u8,
    pub broadcast_id: u32,
    pub pa_sync_state: PaSyncState,
    pub big_encryption_state: BigEncryptionState,
    pub bad_code: Option<[u8; BROADCAST_CODE_SIZE]>,
    pub subgroups: Vec<ReceiveStateSubgroup>,
}

impl BroadcastReceiveState {
    /// Placeholder for a slot without a source.
    pub fn empty(source_id: u8) -> Self {
        Self {
            source_id,
            source_address_type: AddressType::Public,
            source_address: DeviceAddress::EMPTY,
            source_device: DeviceId::EMPTY,
            source_adv_sid: 0,
            broadcast_id: 0,
            pa_sync_state: PaSyncState::Idle,
            big_encryption_state: BigEncryptionState::NotEncrypted,
            bad_code: None,
            subgroups: Vec::new(),
        }
    }

    /// A slot is empty when its device is unresolved or all-zero.
    pub fn is_source_present(&self) -> bool {
        !self.source_device.is_empty()
    }

    pub fn num_subgroups(&self) -> usize {
        self.subgroups.len()
    }

    pub fn is_pa_synced(&self) -> bool {
        self.pa_sync_state == PaSyncState::Synchronized
    }

    /// Whether any subgroup reports a synchronized BIS.
    pub fn is_any_bis_synced(&self) -> bool {
        self.subgroups.iter().any(|s| {
            s.bis_sync_state.is_synced() && s.bis_sync_state != BisSync::FAILED_SYNC_TO_BIG
        })
    }

    /// Decode a non-empty characteristic value.
    ///
    /// `resolve` maps the reported address to a device identity.
    pub fn decode<F>(value: &[u8], resolve: F) -> Result<Self, ProtocolError>
    where
        F: Fn(DeviceAddress, AddressType) -> Option<DeviceId>,
    {
        let mut buf = Bytes::copy_from_slice(value);

        let source_id = get_u8(&mut buf, "source_id")?;
        let source_address_type = AddressType::from(get_u8(&mut buf, "source_address_type")?);
        let source_address =
            DeviceAddress::from_le_bytes(get_array::<6>(&mut buf, "source_address")?);
        let source_adv_sid = get_u8(&mut buf, "source_adv_sid")?;
        let broadcast_id = get_u24_le(&mut buf, "broadcast_id")?;
        let pa_sync_state = PaSyncState::from(get_u8(&mut buf, "pa_sync_state")?);
        let big_encryption_state = BigEncryptionState::from(get_u8(&mut buf, "big_encryption")?);

        let bad_code = if big_encryption_state == BigEncryptionState::BadCode {
            Some(get_array::<BROADCAST_CODE_SIZE>(&mut buf, "bad_code")?)
        } else {
            None
        };

        let num_subgroups = get_u8(&mut buf, "num_subgroups")?;
        let mut subgroups = Vec::with_capacity(num_subgroups as usize);
        for _ in 0..num_subgroups {
            let bis_sync = u32::from_le_bytes(get_array::<4>(&mut buf, "bis_sync")?);
            let metadata = get_length_prefixed(&mut buf, "metadata_length", "metadata")?;
            subgroups.push(ReceiveStateSubgroup {
                bis_sync_state: BisSync(bis_sync),
                metadata: metadata.to_vec(),
            });
        }

        let source_device = if source_address.is_empty() {
            DeviceId::EMPTY
        } else {
            resolve(source_address, source_address_type).unwrap_or(DeviceId::EMPTY)
        };

        Ok(Self {
            source_id,
            source_address_type,
            source_address,
            source_device,
            source_adv_sid,
            broadcast_id,
            pa_sync_state,
            big_encryption_state,
            bad_code,
            subgroups,
        })
    }

    /// Encode as the sink would report it.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(MIN_RECEIVE_STATE_LEN);
        buf.put_u8(self.source_id);
        buf.put_u8(self.source_address_type.into());
        buf.put_slice(&self.source_address.to_le_bytes());
        buf.put_u8(self.source_adv_sid);
        put_u24_le(&mut buf, self.broadcast_id);
        buf.put_u8(self.pa_sync_state.into());
        buf.put_u8(self.big_encryption_state.into());
        if self.big_encryption_state == BigEncryptionState::BadCode {
            buf.put_slice(&self.bad_code.unwrap_or_default());
        }
        buf.put_u8(self.subgroups.len() as u8);
        for subgroup in &self.subgroups {
            buf.put_u32_le(subgroup.bis_sync_state.0);
            put_length_prefixed(&mut buf, "metadata", &subgroup.metadata)?;
        }
        Ok(buf.freeze())
    }
}

/// Source id behind a characteristic instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotId {
    /// Slot index for an instance that never reported a source.
    Placeholder(u8),
    /// Id assigned by the sink.
    Reported(u8),
}

impl SlotId {
    fn value(self) -> u8 {
        match self {
            SlotId::Placeholder(id) | SlotId::Reported(id) => id,
        }
    }
}

/// Decoder that remembers which source id lives behind each characteristic instance.
#[derive(Debug, Default)]
pub struct ReceiveStateDecoder {
    slots: HashMap<u32, SlotId>,
}

impl ReceiveStateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a value read or notified on characteristic `instance_id`.
    ///
    /// Values that are too short or malformed yield the empty state for the
    /// slot. An empty slot keeps the id the sink last reported on it; a slot
    /// that never held a source carries its slot index, which is only a
    /// placeholder and never returned by [`ReceiveStateDecoder::source_id`].
    pub fn decode<F>(&mut self, instance_id: u32, value: &[u8], resolve: F) -> BroadcastReceiveState
    where
        F: Fn(DeviceAddress, AddressType) -> Option<DeviceId>,
    {
        self.try_decode(instance_id, value, resolve)
            .unwrap_or_else(|_| self.empty_slot(instance_id))
    }

    /// Like [`ReceiveStateDecoder::decode`] but reports malformed values.
    pub fn try_decode<F>(
        &mut self,
        instance_id: u32,
        value: &[u8],
        resolve: F,
    ) -> Result<BroadcastReceiveState, ProtocolError>
    where
        F: Fn(DeviceAddress, AddressType) -> Option<DeviceId>,
    {
        if value.len() < MIN_RECEIVE_STATE_LEN {
            return Ok(self.empty_slot(instance_id));
        }

        let state = BroadcastReceiveState::decode(value, resolve)?;
        self.slots
            .insert(instance_id, SlotId::Reported(state.source_id));
        Ok(state)
    }

    fn empty_slot(&mut self, instance_id: u32) -> BroadcastReceiveState {
        let next = SlotId::Placeholder(self.slots.len() as u8);
        let slot = *self.slots.entry(instance_id).or_insert(next);
        BroadcastReceiveState::empty(slot.value())
    }

    /// Source id the sink last reported on a characteristic instance.
    pub fn source_id(&self, instance_id: u32) -> Option<u8> {
        match self.slots.get(&instance_id) {
            Some(SlotId::Reported(id)) => Some(*id),
            _ => None,
        }
    }

    /// Forget all slot mappings (new connection).
    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(addr: DeviceAddress, typ: AddressType) -> Option<DeviceId> {
        Some(DeviceId::new(addr, typ))
    }

    fn sample(encryption: u8, metadata: &[u8]) -> Vec<u8> {
        let mut v = vec![
            0x01, // source id
            0x01, // random
            0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // address
            0x02, // adv sid
            0x0C, 0x0B, 0x0A, // broadcast id
            0x02, // synchronized
            encryption,
        ];
        if encryption == 0x03 {
            v.extend(1..=16u8);
        }
        v.push(0x01);
        v.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
        v.push(metadata.len() as u8);
        v.extend_from_slice(metadata);
        v
    }

    #[test]
    fn test_decode_receive_state() {
        let mut decoder = ReceiveStateDecoder::new();
        let state = decoder.decode(7, &sample(0x00, &[0x02, 0x01, 0x00]), resolve);
        assert_eq!(state.source_id, 1);
        assert_eq!(state.source_address_type, AddressType::Random);
        assert_eq!(state.source_address.to_string(), "11:22:33:44:55:66");
        assert!(state.is_source_present());
        assert_eq!(state.source_adv_sid, 2);
        assert_eq!(state.broadcast_id, 0x0A0B0C);
        assert_eq!(state.pa_sync_state, PaSyncState::Synchronized);
        assert_eq!(state.bad_code, None);
        assert_eq!(state.subgroups.len(), 1);
        assert_eq!(state.subgroups[0].bis_sync_state, BisSync(0x03));
        assert_eq!(state.subgroups[0].metadata, vec![0x02, 0x01, 0x00]);
        assert!(state.is_any_bis_synced());
        assert_eq!(decoder.source_id(7), Some(1));
    }

    #[test]
    fn test_decode_bad_code() {
        let state = BroadcastReceiveState::decode(&sample(0x03, &[]), resolve).unwrap();
        assert_eq!(state.big_encryption_state, BigEncryptionState::BadCode);
        let expected: Vec<u8> = (1..=16).collect();
        assert_eq!(state.bad_code.unwrap().to_vec(), expected);
        assert_eq!(state.subgroups[0].bis_sync_state, BisSync(0x03));
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = ReceiveStateDecoder::new();
        let first = decoder.decode(10, &[], resolve);
        assert!(!first.is_source_present());
        assert_eq!(first.source_id, 0);

        let second = decoder.decode(11, &[0x00], resolve);
        assert!(!second.is_source_present());
        assert_eq!(second.source_id, 1);
        assert_eq!(decoder.source_id(10), None);
        assert_eq!(decoder.source_id(11), None);
    }

    #[test]
    fn test_reported_id_differs_from_slot_index() {
        let mut decoder = ReceiveStateDecoder::new();
        decoder.decode(10, &[], resolve);
        decoder.decode(11, &[], resolve);

        let mut value = sample(0x00, &[]);
        value[0] = 0x00;
        let present = decoder.decode(11, &value, resolve);
        assert!(present.is_source_present());
        assert_eq!(present.source_id, 0);
        assert_eq!(decoder.source_id(11), Some(0));
        assert_eq!(decoder.source_id(10), None);

        let removed = decoder.decode(11, &[], resolve);
        assert_eq!(removed.source_id, 0);
        assert!(!removed.is_source_present());
    }

    #[test]
    fn test_empty_after_source_keeps_source_id() {
        let mut decoder = ReceiveStateDecoder::new();
        decoder.decode(10, &[], resolve);
        let present = decoder.decode(11, &sample(0x00, &[]), resolve);
        assert_eq!(present.source_id, 1);

        let removed = decoder.decode(11, &[], resolve);
        assert_eq!(removed.source_id, 1);
        assert!(!removed.is_source_present());

        decoder.reset();
        assert_eq!(decoder.source_id(11), None);
    }

    #[test]
    fn test_unresolved_address_is_absent() {
        let state = BroadcastReceiveState::decode(&sample(0x00, &[]), |_, _| None).unwrap();
        assert!(!state.is_source_present());
        assert_eq!(state.broadcast_id, 0x0A0B0C);
    }

    #[test]
    fn test_long_metadata() {
        let mut metadata = vec![141, 0xFF];
        metadata.extend((0..140u32).map(|i| (i * 13) as u8));
        let state = BroadcastReceiveState::decode(&sample(0x00, &metadata), resolve).unwrap();
        assert_eq!(state.subgroups[0].metadata.len(), 142);
        assert_eq!(state.subgroups[0].metadata, metadata);
    }

    #[test]
    fn test_truncated_metadata() {
        let mut value = sample(0x00, &[0x02, 0x01, 0x00]);
        value.pop();
        assert!(matches!(
            BroadcastReceiveState::decode(&value, resolve),
            Err(ProtocolError::LengthOverrun { field: "metadata", .. })
        ));

        let mut decoder = ReceiveStateDecoder::new();
        assert!(decoder.try_decode(3, &value, resolve).is_err());
        let state = decoder.decode(3, &value, resolve);
        assert!(!state.is_source_present());
    }

    #[test]
    fn test_encode_matches_wire() {
        let value = sample(0x03, &[0x04, 0x04, b'e', b'n', b'g']);
        let state = BroadcastReceiveState::decode(&value, resolve).unwrap();
        assert_eq!(&state.to_bytes().unwrap()[..], &value[..]);
    }
}
