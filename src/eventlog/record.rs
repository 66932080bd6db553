//! Wire format of event-log deltas.
//!
//! A delta is a length-prefixed header (version, header size, flags)
//! followed by one tagged record. The layout is explicit little-endian and
//! must stay stable across versions: decoders keep unknown header bytes and
//! unknown record-flag bits so that a round-trip through an older reader
//! does not strip information written by a newer writer.
//!
//! ```text
//! +---------+-----------+---------+----------------+-----+------
//! | version | header_sz | flags   | header extra   | tag | body
//! |   u16   |    u16    |  u32    | header_sz - 8  | u8  |
//! +---------+-----------+---------+----------------+-----+------
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StrandError};
use crate::types::{NodeIndex, ShardId};

/// Current delta-header version.
pub const DELTA_VERSION: u16 = 2;

/// Size of the known header fields.
pub const DELTA_HEADER_SIZE: u16 = 8;

/// Record flag bits for `SHARD_NEEDS_REBUILD`.
pub mod record_flags {
    /// The shard is being drained rather than recovered.
    pub const DRAIN: u32 = 1 << 0;
    /// A conditional-version field follows the fixed body.
    pub const CONDITIONAL_ON_VERSION: u32 = 1 << 1;
    /// A time-ranges field follows; this is a mini rebuilding.
    pub const TIME_RANGED: u32 = 1 << 2;

    /// Reason code travels in bits 8..12.
    pub const REASON_SHIFT: u32 = 8;
    pub const REASON_MASK: u32 = 0xF << REASON_SHIFT;

    /// Bits with defined meaning today; everything else is preserved.
    pub const KNOWN: u32 = DRAIN | CONDITIONAL_ON_VERSION | TIME_RANGED | REASON_MASK;
}

/// Why a rebuild was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    Unknown,
    DeadNode,
    Corrupted,
    IoError,
    MissingCompletionMetadata,
    TimeRanged,
}

impl RebuildReason {
    fn code(&self) -> u32 {
        match self {
            RebuildReason::Unknown => 0,
            RebuildReason::DeadNode => 1,
            RebuildReason::Corrupted => 2,
            RebuildReason::IoError => 3,
            RebuildReason::MissingCompletionMetadata => 4,
            RebuildReason::TimeRanged => 5,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            1 => RebuildReason::DeadNode,
            2 => RebuildReason::Corrupted,
            3 => RebuildReason::IoError,
            4 => RebuildReason::MissingCompletionMetadata,
            5 => RebuildReason::TimeRanged,
            _ => RebuildReason::Unknown,
        }
    }
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebuildReason::Unknown => "unknown",
            RebuildReason::DeadNode => "dead_node",
            RebuildReason::Corrupted => "corrupted",
            RebuildReason::IoError => "io_error",
            RebuildReason::MissingCompletionMetadata => "missing_completion_metadata",
            RebuildReason::TimeRanged => "time_ranged",
        };
        f.write_str(s)
    }
}

/// A half-open time interval in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub lo_ms: i64,
    pub hi_ms: i64,
}

/// The dirty time ranges of a mini rebuilding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRanges(pub Vec<TimeRange>);

impl TimeRanges {
    pub fn single(lo_ms: i64, hi_ms: i64) -> Self {
        Self(vec![TimeRange { lo_ms, hi_ms }])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Delta header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaHeader {
    pub version: u16,
    pub flags: u32,
    /// Header bytes beyond the known fields, preserved verbatim.
    pub extra: Vec<u8>,
}

impl Default for DeltaHeader {
    fn default() -> Self {
        Self {
            version: DELTA_VERSION,
            flags: 0,
            extra: Vec::new(),
        }
    }
}

/// One tagged event-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    ShardNeedsRebuild {
        shard: ShardId,
        /// Full record flags, including preserved unknown bits.
        flags: u32,
        /// Node whose supervisor requested the rebuild.
        source_node: NodeIndex,
        /// Event-log version the append was conditioned on.
        conditional_version: Option<u64>,
        /// Present (and non-empty) for mini rebuildings.
        ranges: Option<TimeRanges>,
    },
    ShardAbortRebuild { shard: ShardId },
    ShardIsRebuilt { shard: ShardId },
    ShardUndrain { shard: ShardId },
    ShardAckRebuilt { shard: ShardId },
}

const TAG_SHARD_NEEDS_REBUILD: u8 = 1;
const TAG_SHARD_ABORT_REBUILD: u8 = 2;
const TAG_SHARD_IS_REBUILT: u8 = 3;
const TAG_SHARD_UNDRAIN: u8 = 4;
const TAG_SHARD_ACK_REBUILT: u8 = 5;

impl EventRecord {
    /// Convenience constructor for a supervisor-initiated rebuild request.
    pub fn shard_needs_rebuild(
        shard: ShardId,
        source_node: NodeIndex,
        reason: RebuildReason,
        conditional_version: Option<u64>,
        ranges: Option<TimeRanges>,
    ) -> Self {
        let mut flags = reason.code() << record_flags::REASON_SHIFT;
        if conditional_version.is_some() {
            flags |= record_flags::CONDITIONAL_ON_VERSION;
        }
        if ranges.as_ref().map_or(false, |r| !r.is_empty()) {
            flags |= record_flags::TIME_RANGED;
        }
        EventRecord::ShardNeedsRebuild {
            shard,
            flags,
            source_node,
            conditional_version,
            ranges: ranges.filter(|r| !r.is_empty()),
        }
    }

    pub fn shard(&self) -> ShardId {
        match self {
            EventRecord::ShardNeedsRebuild { shard, .. }
            | EventRecord::ShardAbortRebuild { shard }
            | EventRecord::ShardIsRebuilt { shard }
            | EventRecord::ShardUndrain { shard }
            | EventRecord::ShardAckRebuilt { shard } => *shard,
        }
    }

    /// Reason of a `ShardNeedsRebuild`, `Unknown` for other records.
    pub fn reason(&self) -> RebuildReason {
        match self {
            EventRecord::ShardNeedsRebuild { flags, .. } => RebuildReason::from_code(
                (flags & record_flags::REASON_MASK) >> record_flags::REASON_SHIFT,
            ),
            _ => RebuildReason::Unknown,
        }
    }

    /// True for mini (time-ranged) rebuild requests.
    pub fn is_time_ranged(&self) -> bool {
        matches!(
            self,
            EventRecord::ShardNeedsRebuild { flags, .. }
                if flags & record_flags::TIME_RANGED != 0
        )
    }

    fn tag(&self) -> u8 {
        match self {
            EventRecord::ShardNeedsRebuild { .. } => TAG_SHARD_NEEDS_REBUILD,
            EventRecord::ShardAbortRebuild { .. } => TAG_SHARD_ABORT_REBUILD,
            EventRecord::ShardIsRebuilt { .. } => TAG_SHARD_IS_REBUILT,
            EventRecord::ShardUndrain { .. } => TAG_SHARD_UNDRAIN,
            EventRecord::ShardAckRebuilt { .. } => TAG_SHARD_ACK_REBUILT,
        }
    }

    /// Encode with the given header.
    pub fn encode_with_header(&self, header: &DeltaHeader) -> Vec<u8> {
        let header_sz = DELTA_HEADER_SIZE as usize + header.extra.len();
        let mut out = Vec::with_capacity(header_sz + 32);
        out.extend_from_slice(&header.version.to_le_bytes());
        out.extend_from_slice(&(header_sz as u16).to_le_bytes());
        out.extend_from_slice(&header.flags.to_le_bytes());
        out.extend_from_slice(&header.extra);
        out.push(self.tag());
        match self {
            EventRecord::ShardNeedsRebuild {
                shard,
                flags,
                source_node,
                conditional_version,
                ranges,
            } => {
                out.extend_from_slice(&shard.node.to_le_bytes());
                out.extend_from_slice(&shard.shard.to_le_bytes());
                out.extend_from_slice(&flags.to_le_bytes());
                out.extend_from_slice(&source_node.to_le_bytes());
                if flags & record_flags::CONDITIONAL_ON_VERSION != 0 {
                    out.extend_from_slice(
                        &conditional_version.unwrap_or_default().to_le_bytes(),
                    );
                }
                if flags & record_flags::TIME_RANGED != 0 {
                    let ranges = ranges.clone().unwrap_or_default();
                    out.extend_from_slice(&(ranges.0.len() as u16).to_le_bytes());
                    for range in &ranges.0 {
                        out.extend_from_slice(&range.lo_ms.to_le_bytes());
                        out.extend_from_slice(&range.hi_ms.to_le_bytes());
                    }
                }
            }
            EventRecord::ShardAbortRebuild { shard }
            | EventRecord::ShardIsRebuilt { shard }
            | EventRecord::ShardUndrain { shard }
            | EventRecord::ShardAckRebuilt { shard } => {
                out.extend_from_slice(&shard.node.to_le_bytes());
                out.extend_from_slice(&shard.shard.to_le_bytes());
            }
        }
        out
    }

    /// Encode with a default header.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_header(&DeltaHeader::default())
    }

    /// Decode a delta payload into its header and record.
    pub fn decode(payload: &[u8]) -> Result<(DeltaHeader, EventRecord)> {
        let mut reader = ByteReader::new(payload);
        let version = reader.u16()?;
        if version == 0 || version > DELTA_VERSION {
            return Err(StrandError::UnsupportedDeltaVersion(version));
        }
        let header_sz = reader.u16()?;
        if (header_sz as usize) < DELTA_HEADER_SIZE as usize
            || header_sz as usize > payload.len()
        {
            return Err(StrandError::MalformedRecord(format!(
                "header size {header_sz} out of bounds"
            )));
        }
        let flags = reader.u32()?;
        let extra = reader
            .bytes(header_sz as usize - DELTA_HEADER_SIZE as usize)?
            .to_vec();
        let header = DeltaHeader {
            version,
            flags,
            extra,
        };

        let tag = reader.u8()?;
        let record = match tag {
            TAG_SHARD_NEEDS_REBUILD => {
                let node = reader.u16()?;
                let shard = reader.u16()?;
                let flags = reader.u32()?;
                let source_node = reader.u16()?;
                let conditional_version = if flags & record_flags::CONDITIONAL_ON_VERSION != 0 {
                    Some(reader.u64()?)
                } else {
                    None
                };
                let ranges = if flags & record_flags::TIME_RANGED != 0 {
                    let count = reader.u16()? as usize;
                    let mut ranges = Vec::with_capacity(count);
                    for _ in 0..count {
                        ranges.push(TimeRange {
                            lo_ms: reader.i64()?,
                            hi_ms: reader.i64()?,
                        });
                    }
                    Some(TimeRanges(ranges))
                } else {
                    None
                };
                EventRecord::ShardNeedsRebuild {
                    shard: ShardId::new(node, shard),
                    flags,
                    source_node,
                    conditional_version,
                    ranges,
                }
            }
            TAG_SHARD_ABORT_REBUILD => EventRecord::ShardAbortRebuild {
                shard: reader.shard()?,
            },
            TAG_SHARD_IS_REBUILT => EventRecord::ShardIsRebuilt {
                shard: reader.shard()?,
            },
            TAG_SHARD_UNDRAIN => EventRecord::ShardUndrain {
                shard: reader.shard()?,
            },
            TAG_SHARD_ACK_REBUILT => EventRecord::ShardAckRebuilt {
                shard: reader.shard()?,
            },
            other => {
                return Err(StrandError::MalformedRecord(format!(
                    "unknown record tag {other}"
                )))
            }
        };
        Ok((header, record))
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StrandError::MalformedRecord("truncated delta".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn shard(&mut self) -> Result<ShardId> {
        let node = self.u16()?;
        let shard = self.u16()?;
        Ok(ShardId::new(node, shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_rebuild_roundtrip() {
        let record = EventRecord::shard_needs_rebuild(
            ShardId::new(4, 1),
            2,
            RebuildReason::DeadNode,
            Some(17),
            None,
        );
        let bytes = record.encode();
        let (header, back) = EventRecord::decode(&bytes).unwrap();
        assert_eq!(header.version, DELTA_VERSION);
        assert_eq!(back, record);
        assert_eq!(back.reason(), RebuildReason::DeadNode);
        assert!(!back.is_time_ranged());
    }

    #[test]
    fn test_time_ranged_roundtrip() {
        let record = EventRecord::shard_needs_rebuild(
            ShardId::new(1, 0),
            0,
            RebuildReason::TimeRanged,
            None,
            Some(TimeRanges::single(1_000, 2_000)),
        );
        let (_, back) = EventRecord::decode(&record.encode()).unwrap();
        assert!(back.is_time_ranged());
        match back {
            EventRecord::ShardNeedsRebuild { ranges, .. } => {
                assert_eq!(ranges.unwrap(), TimeRanges::single(1_000, 2_000));
            }
            _ => panic!("wrong record kind"),
        }
    }

    #[test]
    fn test_unknown_flags_preserved() {
        let unknown_bit = 1u32 << 30;
        let record = EventRecord::ShardNeedsRebuild {
            shard: ShardId::new(3, 0),
            flags: unknown_bit | (RebuildReason::IoError.code() << record_flags::REASON_SHIFT),
            source_node: 3,
            conditional_version: None,
            ranges: None,
        };
        let (_, back) = EventRecord::decode(&record.encode()).unwrap();
        match back {
            EventRecord::ShardNeedsRebuild { flags, .. } => {
                assert_eq!(flags & unknown_bit, unknown_bit);
            }
            _ => panic!("wrong record kind"),
        }
        assert_eq!(back.reason(), RebuildReason::IoError);
    }

    #[test]
    fn test_header_extra_preserved() {
        let header = DeltaHeader {
            version: DELTA_VERSION,
            flags: 7,
            extra: vec![0xaa, 0xbb, 0xcc],
        };
        let record = EventRecord::ShardIsRebuilt {
            shard: ShardId::new(2, 1),
        };
        let bytes = record.encode_with_header(&header);
        let (back_header, back) = EventRecord::decode(&bytes).unwrap();
        assert_eq!(back_header, header);
        assert_eq!(back, record);
    }

    #[test]
    fn test_simple_records_roundtrip() {
        for record in [
            EventRecord::ShardAbortRebuild { shard: ShardId::new(1, 1) },
            EventRecord::ShardIsRebuilt { shard: ShardId::new(0, 0) },
            EventRecord::ShardUndrain { shard: ShardId::new(9, 3) },
            EventRecord::ShardAckRebuilt { shard: ShardId::new(2, 0) },
        ] {
            let (_, back) = EventRecord::decode(&record.encode()).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_truncated_and_bad_input() {
        let bytes = EventRecord::ShardIsRebuilt {
            shard: ShardId::new(2, 1),
        }
        .encode();
        assert!(EventRecord::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(EventRecord::decode(&[]).is_err());
        assert!(EventRecord::decode(&[0xff; 16]).is_err());
    }
}
