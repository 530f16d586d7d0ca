//! Broadcast Audio Scan Control Point operations.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::codec::{
    get_array, get_length_prefixed, get_u24_le, get_u8, put_length_prefixed, put_u24_le,
};
use crate::error::ProtocolError;
use crate::receive_state::BroadcastReceiveState;
use crate::types::{
    AddressType, BisSync, BroadcastMetadata, DeviceAddress, PaSync, PaSyncState,
    BROADCAST_CODE_SIZE, MAX_BROADCAST_ID, PA_INTERVAL_UNKNOWN,
};

/// Control point opcodes.
pub mod opcode {
    pub const REMOTE_SCAN_STOPPED: u8 = 0x00;
    pub const REMOTE_SCAN_STARTED: u8 = 0x01;
    pub const ADD_SOURCE: u8 = 0x02;
    pub const MODIFY_SOURCE: u8 = 0x03;
    pub const SET_BROADCAST_CODE: u8 = 0x04;
    pub const REMOVE_SOURCE: u8 = 0x05;
}

/// Add Source length without subgroups.
pub const ADD_SOURCE_FIXED_LENGTH: usize = 16;

/// Modify Source length without subgroups.
pub const MODIFY_SOURCE_FIXED_LENGTH: usize = 6;

/// Bytes per subgroup before its metadata (BIS_Sync + metadata length).
pub const SUBGROUP_FIXED_LENGTH: usize = 5;

/// Set Broadcast Code operation length.
pub const SET_BROADCAST_CODE_LENGTH: usize = 2 + BROADCAST_CODE_SIZE;

/// Per-subgroup parameters of Add/Modify Source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlPointSubgroup {
    pub bis_sync: BisSync,
    pub metadata: Vec<u8>,
}

/// One write to the Scan Control Point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ControlPointOperation {
    RemoteScanStopped,
    RemoteScanStarted,
    AddSource {
        address_type: AddressType,
        address: DeviceAddress,
        adv_sid: u8,
        broadcast_id: u32,
        pa_sync: PaSync,
        pa_interval: u16,
        subgroups: Vec<ControlPointSubgroup>,
    },
    ModifySource {
        source_id: u8,
        pa_sync: PaSync,
        pa_interval: u16,
        subgroups: Vec<ControlPointSubgroup>,
    },
    SetBroadcastCode {
        source_id: u8,
        code: [u8; BROADCAST_CODE_SIZE],
    },
    RemoveSource {
        source_id: u8,
    },
}

impl ControlPointOperation {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlPointOperation::RemoteScanStopped => opcode::REMOTE_SCAN_STOPPED,
            ControlPointOperation::RemoteScanStarted => opcode::REMOTE_SCAN_STARTED,
            ControlPointOperation::AddSource { .. } => opcode::ADD_SOURCE,
            ControlPointOperation::ModifySource { .. } => opcode::MODIFY_SOURCE,
            ControlPointOperation::SetBroadcastCode { .. } => opcode::SET_BROADCAST_CODE,
            ControlPointOperation::RemoveSource { .. } => opcode::REMOVE_SOURCE,
        }
    }

    /// Build Add Source from broadcast metadata.
    ///
    /// Subgroups without a channel preference ask for "no preference".
    pub fn add_source(metadata: &BroadcastMetadata, past_unavailable: bool) -> Self {
        let subgroups = metadata
            .subgroups
            .iter()
            .map(|subgroup| {
                let mut bis_sync = BisSync::from_channels(&subgroup.channels);
                if bis_sync == BisSync::DO_NOT_SYNC {
                    bis_sync = BisSync::NO_PREFERENCE;
                }
                ControlPointSubgroup {
                    bis_sync,
                    metadata: subgroup.content_metadata.clone(),
                }
            })
            .collect();

        ControlPointOperation::AddSource {
            address_type: metadata.source_device.address_type,
            address: metadata.source_device.address,
            adv_sid: metadata.source_adv_sid,
            broadcast_id: metadata.broadcast_id,
            pa_sync: if past_unavailable {
                PaSync::SyncPastUnavailable
            } else {
                PaSync::SyncPastAvailable
            },
            pa_interval: metadata.pa_sync_interval,
            subgroups,
        }
    }

    /// Build Modify Source against the sink's current receive state.
    ///
    /// `pa_sync` of `None` keeps the current PA state. Without metadata the
    /// current BIS selection is kept; with metadata it is recomputed from the
    /// selected channels. Metadata itself is never rewritten.
    pub fn modify_source(
        current: &BroadcastReceiveState,
        metadata: Option<&BroadcastMetadata>,
        pa_sync: Option<PaSync>,
    ) -> Self {
        let num_subgroups = match metadata {
            Some(m) => m.subgroups.len(),
            None => current.num_subgroups(),
        };

        let pa_sync_value = match pa_sync {
            Some(value) => value,
            None if current.pa_sync_state == PaSyncState::Synchronized => {
                PaSync::SyncPastAvailable
            }
            None => PaSync::DoNotSync,
        };

        let subgroups = (0..num_subgroups)
            .map(|i| {
                let current_bis = current
                    .subgroups
                    .get(i)
                    .map(|s| s.bis_sync_state)
                    .unwrap_or(BisSync::NO_PREFERENCE);

                let bis_sync = match (pa_sync, metadata) {
                    (Some(PaSync::DoNotSync), _) => BisSync::DO_NOT_SYNC,
                    (requested, Some(m)) => {
                        let from_channels = m
                            .subgroups
                            .get(i)
                            .map(|s| BisSync::from_channels(&s.channels))
                            .unwrap_or(BisSync::DO_NOT_SYNC);
                        if requested.is_some() && from_channels == BisSync::DO_NOT_SYNC {
                            BisSync::NO_PREFERENCE
                        } else {
                            from_channels
                        }
                    }
                    (_, None) => current_bis,
                };

                ControlPointSubgroup {
                    bis_sync,
                    metadata: Vec::new(),
                }
            })
            .collect();

        ControlPointOperation::ModifySource {
            source_id: current.source_id,
            pa_sync: pa_sync_value,
            pa_interval: PA_INTERVAL_UNKNOWN,
            subgroups,
        }
    }

    /// Build Set Broadcast Code, zero-padding short codes.
    pub fn set_broadcast_code(source_id: u8, code: &[u8]) -> Result<Self, ProtocolError> {
        if code.len() > BROADCAST_CODE_SIZE {
            return Err(ProtocolError::BroadcastCodeTooLong(code.len()));
        }
        let mut padded = [0u8; BROADCAST_CODE_SIZE];
        padded[..code.len()].copy_from_slice(code);
        Ok(ControlPointOperation::SetBroadcastCode {
            source_id,
            code: padded,
        })
    }

    /// Length of the encoded operation.
    pub fn encoded_len(&self) -> usize {
        let subgroups_len = |subgroups: &[ControlPointSubgroup]| -> usize {
            subgroups
                .iter()
                .map(|s| SUBGROUP_FIXED_LENGTH + s.metadata.len())
                .sum()
        };
        match self {
            ControlPointOperation::RemoteScanStopped
            | ControlPointOperation::RemoteScanStarted => 1,
            ControlPointOperation::AddSource { subgroups, .. } => {
                ADD_SOURCE_FIXED_LENGTH + subgroups_len(subgroups)
            }
            ControlPointOperation::ModifySource { subgroups, .. } => {
                MODIFY_SOURCE_FIXED_LENGTH + subgroups_len(subgroups)
            }
            ControlPointOperation::SetBroadcastCode { .. } => SET_BROADCAST_CODE_LENGTH,
            ControlPointOperation::RemoveSource { .. } => 2,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.opcode());

        match self {
            ControlPointOperation::RemoteScanStopped | ControlPointOperation::RemoteScanStarted => {
                // Opcode only
            }
            ControlPointOperation::AddSource {
                address_type,
                address,
                adv_sid,
                broadcast_id,
                pa_sync,
                pa_interval,
                subgroups,
            } => {
                if *broadcast_id > MAX_BROADCAST_ID {
                    return Err(ProtocolError::InvalidValue {
                        field: "broadcast_id",
                        value: *broadcast_id,
                    });
                }
                buf.put_u8((*address_type).into());
                buf.put_slice(&address.to_le_bytes());
                buf.put_u8(*adv_sid);
                put_u24_le(&mut buf, *broadcast_id);
                buf.put_u8((*pa_sync).into());
                buf.put_u16_le(*pa_interval);
                encode_subgroups(&mut buf, subgroups)?;
            }
            ControlPointOperation::ModifySource {
                source_id,
                pa_sync,
                pa_interval,
                subgroups,
            } => {
                buf.put_u8(*source_id);
                buf.put_u8((*pa_sync).into());
                buf.put_u16_le(*pa_interval);
                encode_subgroups(&mut buf, subgroups)?;
            }
            ControlPointOperation::SetBroadcastCode { source_id, code } => {
                buf.put_u8(*source_id);
                buf.put_slice(code);
            }
            ControlPointOperation::RemoveSource { source_id } => {
                buf.put_u8(*source_id);
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(value: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = Bytes::copy_from_slice(value);
        let op = get_u8(&mut buf, "opcode")?;

        let operation = match op {
            opcode::REMOTE_SCAN_STOPPED => ControlPointOperation::RemoteScanStopped,
            opcode::REMOTE_SCAN_STARTED => ControlPointOperation::RemoteScanStarted,
            opcode::ADD_SOURCE => {
                let address_type = AddressType::from(get_u8(&mut buf, "address_type")?);
                let address = DeviceAddress::from_le_bytes(get_array::<6>(&mut buf, "address")?);
                let adv_sid = get_u8(&mut buf, "adv_sid")?;
                let broadcast_id = get_u24_le(&mut buf, "broadcast_id")?;
                let pa_sync = decode_pa_sync(&mut buf)?;
                let pa_interval = u16::from_le_bytes(get_array::<2>(&mut buf, "pa_interval")?);
                let subgroups = decode_subgroups(&mut buf)?;
                ControlPointOperation::AddSource {
                    address_type,
                    address,
                    adv_sid,
                    broadcast_id,
                    pa_sync,
                    pa_interval,
                    subgroups,
                }
            }
            opcode::MODIFY_SOURCE => {
                let source_id = get_u8(&mut buf, "source_id")?;
                let pa_sync = decode_pa_sync(&mut buf)?;
                let pa_interval = u16::from_le_bytes(get_array::<2>(&mut buf, "pa_interval")?);
                let subgroups = decode_subgroups(&mut buf)?;
                ControlPointOperation::ModifySource {
                    source_id,
                    pa_sync,
                    pa_interval,
                    subgroups,
                }
            }
            opcode::SET_BROADCAST_CODE => {
                let source_id = get_u8(&mut buf, "source_id")?;
                let code = get_array::<BROADCAST_CODE_SIZE>(&mut buf, "broadcast_code")?;
                ControlPointOperation::SetBroadcastCode { source_id, code }
            }
            opcode::REMOVE_SOURCE => ControlPointOperation::RemoveSource {
                source_id: get_u8(&mut buf, "source_id")?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::InvalidValue {
                field: "trailing_bytes",
                value: buf.remaining() as u32,
            });
        }
        Ok(operation)
    }
}

fn encode_subgroups(
    buf: &mut BytesMut,
    subgroups: &[ControlPointSubgroup],
) -> Result<(), ProtocolError> {
    let count = u8::try_from(subgroups.len()).map_err(|_| ProtocolError::InvalidValue {
        field: "num_subgroups",
        value: subgroups.len() as u32,
    })?;
    buf.put_u8(count);
    for subgroup in subgroups {
        buf.put_u32_le(subgroup.bis_sync.0);
        put_length_prefixed(buf, "metadata", &subgroup.metadata)?;
    }
    Ok(())
}

fn decode_subgroups(buf: &mut Bytes) -> Result<Vec<ControlPointSubgroup>, ProtocolError> {
    let count = get_u8(buf, "num_subgroups")?;
    (0..count)
        .map(|_| {
            let bis_sync = BisSync(u32::from_le_bytes(get_array::<4>(buf, "bis_sync")?));
            let metadata = get_length_prefixed(buf, "metadata_length", "metadata")?;
            Ok(ControlPointSubgroup {
                bis_sync,
                metadata: metadata.to_vec(),
            })
        })
        .collect()
}

fn decode_pa_sync(buf: &mut Bytes) -> Result<PaSync, ProtocolError> {
    let value = get_u8(buf, "pa_sync")?;
    PaSync::from_u8(value).ok_or(ProtocolError::InvalidValue {
        field: "pa_sync",
        value: value as u32,
    })
}
