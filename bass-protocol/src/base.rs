//! Broadcast Audio Source Endpoint (BASE) parsing.
//!
//! The BASE is carried in periodic-advertising service data and describes a
//! BIG in three levels:
//!
//! ```text
//! Level 1  presentation_delay(3) num_subgroups(1)
//! Level 2  num_bis(1) codec_id(5) cc_len(1) cc(cc_len) md_len(1) md(md_len)
//! Level 3  bis_index(1) cc_len(1) cc(cc_len)            (num_bis times)
//! ```
//!
//! Each subgroup's level-3 entries follow that subgroup's level-2 entry. Any
//! truncation or length overrun invalidates the whole structure.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::codec::{ensure, get_array, get_length_prefixed, get_u8, put_length_prefixed};
use crate::error::ProtocolError;

/// First codec id octet marking a vendor-specific codec.
pub const VENDOR_CODEC_FORMAT: u8 = 0xFF;

/// Codec-specific configuration LTV types.
pub mod ltv_type {
    pub const SAMPLING_FREQUENCY: u8 = 0x01;
    pub const FRAME_DURATION: u8 = 0x02;
    pub const AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
    pub const OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;

    /// Metadata type for the stream language.
    pub const METADATA_LANGUAGE: u8 = 0x04;
}

/// Level 1: the BIG as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BigInfo {
    pub presentation_delay: [u8; 3],
    pub num_subgroups: u8,
}

impl BigInfo {
    /// Presentation delay in microseconds.
    pub fn presentation_delay_micros(&self) -> u32 {
        let d = self.presentation_delay;
        d[0] as u32 | (d[1] as u32) << 8 | (d[2] as u32) << 16
    }
}

/// Level 2: one subgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubgroupInfo {
    pub subgroup_id: usize,
    pub num_bis: u8,
    pub codec_id: [u8; 5],
    pub codec_config_info: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl SubgroupInfo {
    pub fn codec_config_length(&self) -> usize {
        self.codec_config_info.len()
    }

    pub fn metadata_length(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_vendor_codec(&self) -> bool {
        self.codec_id[0] == VENDOR_CODEC_FORMAT
    }

    /// Decoded codec configuration, `None` for vendor codecs.
    pub fn codec_config(&self) -> Option<CodecConfig> {
        if self.is_vendor_codec() {
            return None;
        }
        Some(CodecConfig::from_ltv(&self.codec_config_info))
    }
}

/// Level 3: one BIS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BisInfo {
    pub index: u8,
    /// Subgroup this BIS belongs to.
    pub subgroup_id: usize,
    pub codec_config_info: Vec<u8>,
}

impl BisInfo {
    pub fn codec_config_length(&self) -> usize {
        self.codec_config_info.len()
    }
}

/// A fully decoded BASE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseData {
    pub level_one: BigInfo,
    pub level_two: Vec<SubgroupInfo>,
    pub level_three: Vec<BisInfo>,
}

impl BaseData {
    /// Parse raw service data, returning `None` on any truncation or overrun.
    pub fn parse(service_data: &[u8]) -> Option<BaseData> {
        Self::try_parse(service_data).ok()
    }

    /// Like [`BaseData::parse`] but reports why the buffer was rejected.
    pub fn try_parse(service_data: &[u8]) -> Result<BaseData, ProtocolError> {
        let mut buf = Bytes::copy_from_slice(service_data);

        let presentation_delay = get_array::<3>(&mut buf, "presentation_delay")?;
        let num_subgroups = get_u8(&mut buf, "num_subgroups")?;

        let mut level_two = Vec::with_capacity(num_subgroups as usize);
        let mut level_three = Vec::new();

        for subgroup_id in 0..num_subgroups as usize {
            // num_bis + codec_id + codec config length + metadata length
            ensure(&buf, "subgroup", 8)?;
            let num_bis = get_u8(&mut buf, "num_bis")?;
            let codec_id = get_array::<5>(&mut buf, "codec_id")?;
            let codec_config_info =
                get_length_prefixed(&mut buf, "codec_config_length", "codec_config")?;
            let metadata = get_length_prefixed(&mut buf, "metadata_length", "metadata")?;

            level_two.push(SubgroupInfo {
                subgroup_id,
                num_bis,
                codec_id,
                codec_config_info: codec_config_info.to_vec(),
                metadata: metadata.to_vec(),
            });

            for _ in 0..num_bis {
                ensure(&buf, "bis", 2)?;
                let index = get_u8(&mut buf, "bis_index")?;
                let codec_config_info =
                    get_length_prefixed(&mut buf, "bis_codec_config_length", "bis_codec_config")?;
                level_three.push(BisInfo {
                    index,
                    subgroup_id,
                    codec_config_info: codec_config_info.to_vec(),
                });
            }
        }

        Ok(BaseData {
            level_one: BigInfo {
                presentation_delay,
                num_subgroups,
            },
            level_two,
            level_three,
        })
    }

    pub fn number_of_subgroups(&self) -> u8 {
        self.level_one.num_subgroups
    }

    /// Aggregate BIS count across all subgroups.
    pub fn number_of_bis_indices(&self) -> usize {
        self.level_two.iter().map(|s| s.num_bis as usize).sum()
    }

    pub fn bis_index_infos(&self) -> &[BisInfo] {
        &self.level_three
    }

    /// BIS entries of one subgroup.
    pub fn bis_of_subgroup(&self, subgroup: usize) -> impl Iterator<Item = &BisInfo> + '_ {
        self.level_three
            .iter()
            .filter(move |b| b.subgroup_id == subgroup)
    }

    pub fn metadata(&self, subgroup: usize) -> Option<&[u8]> {
        self.level_two.get(subgroup).map(|s| s.metadata.as_slice())
    }

    /// Re-encode the structure.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.level_one.presentation_delay);
        buf.put_u8(self.level_one.num_subgroups);
        for subgroup in &self.level_two {
            buf.put_u8(subgroup.num_bis);
            buf.put_slice(&subgroup.codec_id);
            put_length_prefixed(&mut buf, "codec_config", &subgroup.codec_config_info)?;
            put_length_prefixed(&mut buf, "metadata", &subgroup.metadata)?;
            for bis in self.bis_of_subgroup(subgroup.subgroup_id) {
                buf.put_u8(bis.index);
                put_length_prefixed(&mut buf, "bis_codec_config", &bis.codec_config_info)?;
            }
        }
        Ok(buf.freeze())
    }
}

/// One length-type-value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ltv<'a> {
    pub typ: u8,
    pub value: &'a [u8],
}

/// Iterate LTV entries, stopping at the first malformed one.
pub fn ltv_entries(data: &[u8]) -> impl Iterator<Item = Ltv<'_>> {
    let mut rest = data;
    std::iter::from_fn(move || {
        let (&len, tail) = rest.split_first()?;
        let len = len as usize;
        if len == 0 || len > tail.len() {
            rest = &[];
            return None;
        }
        let (entry, next) = tail.split_at(len);
        rest = next;
        Some(Ltv {
            typ: entry[0],
            value: &entry[1..],
        })
    })
}

/// Whether `data` is a well-formed LTV sequence.
///
/// Advisory only: parsing never rejects malformed codec configuration.
pub fn is_valid_ltv(data: &[u8]) -> bool {
    let mut offset = 0;
    while offset < data.len() {
        let len = data[offset] as usize;
        if len == 0 || offset + 1 + len > data.len() {
            return false;
        }
        offset += 1 + len;
    }
    true
}

/// Known fields of an LC3 codec-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodecConfig {
    pub sampling_frequency_hz: Option<u32>,
    pub frame_duration_us: Option<u32>,
    pub audio_channel_allocation: Option<u32>,
    pub octets_per_frame: Option<u16>,
    pub frame_blocks_per_sdu: Option<u8>,
}

impl CodecConfig {
    pub fn from_ltv(data: &[u8]) -> Self {
        let mut config = CodecConfig::default();
        for ltv in ltv_entries(data) {
            match (ltv.typ, ltv.value) {
                (ltv_type::SAMPLING_FREQUENCY, [v, ..]) => {
                    config.sampling_frequency_hz = sampling_frequency_hz(*v);
                }
                (ltv_type::FRAME_DURATION, [v, ..]) => {
                    config.frame_duration_us = match v {
                        0x00 => Some(7_500),
                        0x01 => Some(10_000),
                        _ => None,
                    };
                }
                (ltv_type::AUDIO_CHANNEL_ALLOCATION, [a, b, c, d, ..]) => {
                    config.audio_channel_allocation = Some(u32::from_le_bytes([*a, *b, *c, *d]));
                }
                (ltv_type::OCTETS_PER_CODEC_FRAME, [a, b, ..]) => {
                    config.octets_per_frame = Some(u16::from_le_bytes([*a, *b]));
                }
                (ltv_type::CODEC_FRAME_BLOCKS_PER_SDU, [v, ..]) => {
                    config.frame_blocks_per_sdu = Some(*v);
                }
                _ => {}
            }
        }
        config
    }
}

fn sampling_frequency_hz(code: u8) -> Option<u32> {
    match code {
        0x01 => Some(8_000),
        0x02 => Some(11_025),
        0x03 => Some(16_000),
        0x04 => Some(22_050),
        0x05 => Some(24_000),
        0x06 => Some(32_000),
        0x07 => Some(44_100),
        0x08 => Some(48_000),
        0x09 => Some(88_200),
        0x0A => Some(96_000),
        0x0B => Some(176_400),
        0x0C => Some(192_000),
        0x0D => Some(384_000),
        _ => None,
    }
}

/// Three-letter language code from content metadata, if present.
pub fn metadata_language(metadata: &[u8]) -> Option<String> {
    ltv_entries(metadata)
        .find(|ltv| ltv.typ == ltv_type::METADATA_LANGUAGE && ltv.value.len() == 3)
        .and_then(|ltv| std::str::from_utf8(ltv.value).ok().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: [u8; 22] = [
        0x01, 0x02, 0x03, 0x01, // level 1
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, b'A', 0x03, 0x06, 0x07, 0x08, // level 2
        0x04, 0x03, 0x02, b'B', b'C', // level 3
    ];

    #[test]
    fn test_parse_base_data() {
        let data = BaseData::parse(&SAMPLE).unwrap();
        assert_eq!(data.level_one.presentation_delay, [1, 2, 3]);
        assert_eq!(data.level_one.num_subgroups, 1);

        assert_eq!(data.level_two.len(), 1);
        let sg = &data.level_two[0];
        assert_eq!(sg.num_bis, 1);
        assert_eq!(sg.codec_id, [0, 0, 0, 0, 0]);
        assert_eq!(sg.codec_config_length(), 2);
        assert_eq!(sg.metadata_length(), 3);

        assert_eq!(data.level_three.len(), 1);
        assert_eq!(data.level_three[0].index, 4);
        assert_eq!(data.level_three[0].codec_config_length(), 3);
        assert_eq!(data.number_of_bis_indices(), 1);
        assert_eq!(data.number_of_subgroups(), 1);
        assert_eq!(data.bis_index_infos(), &data.level_three[..]);
    }

    #[test]
    fn test_truncated_level2_metadata() {
        let mut buf = SAMPLE[..17].to_vec();
        buf[13] = 0x04;
        assert!(BaseData::parse(&buf).is_none());
    }

    #[test]
    fn test_truncated_level2_config() {
        let buf = [
            0x01, 0x02, 0x03, 0x01, 0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, b'A',
        ];
        assert!(BaseData::parse(&buf).is_none());
    }

    #[test]
    fn test_truncated_level3_config() {
        let mut buf = SAMPLE.to_vec();
        buf[18] = 0x04;
        assert!(matches!(
            BaseData::try_parse(&buf),
            Err(ProtocolError::LengthOverrun { field: "bis_codec_config", .. })
        ));
    }

    #[test]
    fn test_truncated_level1() {
        assert!(BaseData::parse(&[]).is_none());
        assert!(BaseData::parse(&[0x01, 0x02, 0x03]).is_none());
        // Subgroup declared but absent.
        assert!(BaseData::parse(&[0x01, 0x02, 0x03, 0x01]).is_none());
    }

    #[test]
    fn test_invalid_ltv_is_tolerated() {
        let buf = [
            0x01, 0x02, 0x03, 0x01, //
            0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, b'A', 0x03, 0x06, 0x07, 0x08, //
            0x04, 0x03, 0x03, b'B', b'C',
        ];
        let data = BaseData::parse(&buf).unwrap();
        let sg = &data.level_two[0];
        assert_eq!(sg.codec_id, [0x06, 0, 0, 0, 0]);
        assert_eq!(sg.codec_config_info, vec![0x04, b'A']);
        assert!(!is_valid_ltv(&sg.codec_config_info));
        assert_eq!(data.level_three[0].codec_config_length(), 3);
    }

    #[test]
    fn test_vendor_codec() {
        let buf = [
            0x01, 0x02, 0x03, 0x01, //
            0x01, 0xFF, 0x0A, 0xAB, 0xBC, 0xCD, 0x04, 0x01, 0x02, 0x03, 0x04, 0x03, 0x06, 0x07,
            0x08, //
            0x04, 0x03, 0x03, 0x02, 0x01,
        ];
        let data = BaseData::parse(&buf).unwrap();
        let sg = &data.level_two[0];
        assert!(sg.is_vendor_codec());
        assert_eq!(sg.codec_id, [0xFF, 0x0A, 0xAB, 0xBC, 0xCD]);
        assert_eq!(sg.codec_config_info, vec![0x01, 0x02, 0x03, 0x04]);
        assert!(sg.codec_config().is_none());
        assert_eq!(data.level_three[0].index, 4);
    }

    #[test]
    fn test_vendor_codec_minimal() {
        let buf = [
            0x01, 0x02, 0x03, 0x01, 0x01, 0xFF, 0x0A, 0xAB, 0xBC, 0xCD, 0x00, 0x00, 0x04, 0x00,
        ];
        let data = BaseData::parse(&buf).unwrap();
        assert_eq!(data.level_two[0].codec_config_length(), 0);
        assert_eq!(data.level_two[0].metadata_length(), 0);
        assert_eq!(data.level_three[0].codec_config_length(), 0);
    }

    #[test]
    fn test_short_subgroup_is_invalid() {
        let buf = [0x01, 0x02, 0x03, 0x01, 0x00, 0xFE, 0x00, 0x00];
        assert!(BaseData::parse(&buf).is_none());
    }

    #[test]
    fn test_long_metadata() {
        let mut buf = vec![0x01, 0x02, 0x03, 0x01];
        buf.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, b'A']);
        buf.push(142);
        buf.push(141);
        buf.push(0xFF);
        buf.extend((0..140u32).map(|i| (i * 7 + 3) as u8));
        buf.extend_from_slice(&[0x04, 0x03, 0x02, b'B', b'C']);

        let data = BaseData::parse(&buf).unwrap();
        assert_eq!(data.level_two[0].metadata_length(), 142);
        assert_eq!(data.metadata(0).unwrap()[1], 0xFF);
        assert_eq!(data.level_three[0].index, 4);
    }

    #[test]
    fn test_multiple_subgroups() {
        let buf = [
            0x10, 0x27, 0x00, 0x02, //
            0x02, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x01, 0x00, 0x02, 0x00, //
            0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x03, 0x00,
        ];
        let data = BaseData::parse(&buf).unwrap();
        assert_eq!(data.level_one.presentation_delay_micros(), 10_000);
        assert_eq!(data.number_of_bis_indices(), 3);
        let second: Vec<u8> = data.bis_of_subgroup(1).map(|b| b.index).collect();
        assert_eq!(second, vec![3]);
        assert_eq!(data.level_three[1].subgroup_id, 0);
    }

    #[test]
    fn test_reencode_is_idempotent() {
        let data = BaseData::parse(&SAMPLE).unwrap();
        let bytes = data.to_bytes().unwrap();
        assert_eq!(&bytes[..], &SAMPLE[..]);
        assert_eq!(BaseData::parse(&bytes).unwrap(), data);
    }

    #[test]
    fn test_codec_config_decoding() {
        let cc = [
            0x02, 0x01, 0x08, // 48 kHz
            0x02, 0x02, 0x01, // 10 ms
            0x05, 0x03, 0x03, 0x00, 0x00, 0x00, // FL | FR
            0x03, 0x04, 0x64, 0x00, // 100 octets
        ];
        assert!(is_valid_ltv(&cc));
        let config = CodecConfig::from_ltv(&cc);
        assert_eq!(config.sampling_frequency_hz, Some(48_000));
        assert_eq!(config.frame_duration_us, Some(10_000));
        assert_eq!(config.audio_channel_allocation, Some(0x03));
        assert_eq!(config.octets_per_frame, Some(100));
        assert_eq!(config.frame_blocks_per_sdu, None);
    }

    #[test]
    fn test_metadata_language() {
        let md = [0x04, 0x04, b'e', b'n', b'g', 0x02, 0x01, 0x00];
        assert_eq!(metadata_language(&md).as_deref(), Some("eng"));
        assert_eq!(metadata_language(&[0x02, 0x01, 0x00]), None);
    }
}
