//! Binary persistence format for compiled programs and tuning results.
//!
//! The wire image has two top-level collections, programs and tunings,
//! encoded with bincode. Every record field is optional so that a
//! structurally valid blob with incomplete records degrades record by
//! record instead of failing the whole load; decoding is best-effort and
//! never a hard failure.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::tuning::TuningTable;

/// One persisted compiled program: cache key, the option string it was
/// built with, and the first device's binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProgramRecord {
    pub key: Option<String>,
    pub build_options: Option<String>,
    pub binary: Option<Vec<u8>>,
}

impl ProgramRecord {
    /// Splits the record into (key, build options, binary), or `None` when
    /// the key or binary is missing. Absent build options are treated as
    /// an empty string.
    pub(crate) fn into_parts(self) -> Option<(String, String, Vec<u8>)> {
        let key = self.key?;
        let binary = self.binary?;
        Some((key, self.build_options.unwrap_or_default(), binary))
    }
}

/// One persisted tuning entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TuningRecord {
    pub key: Option<String>,
    pub global: Option<Vec<u32>>,
    pub local: Option<Vec<u32>>,
}

/// The serialized snapshot: all programs, then all tuning entries.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CacheImage {
    pub programs: Vec<ProgramRecord>,
    pub tunings: Vec<TuningRecord>,
}

pub(crate) fn encode_image(image: &CacheImage) -> Vec<u8> {
    match bincode::serialize(image) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode cache image: {e}");
            Vec::new()
        }
    }
}

pub(crate) fn decode_image(bytes: &[u8]) -> Option<CacheImage> {
    match bincode::deserialize(bytes) {
        Ok(image) => Some(image),
        Err(e) => {
            warn!("failed to decode cache blob, ignoring it: {e}");
            None
        }
    }
}

/// Loads persisted tuning records into the table, skipping malformed
/// records individually. Returns how many records were applied.
pub(crate) fn apply_tuning_records(records: Vec<TuningRecord>, table: &mut TuningTable) -> usize {
    let mut applied = 0;
    for record in records {
        let (Some(key), Some(global), Some(local)) = (record.key, record.global, record.local)
        else {
            warn!("persisted tuning record is incomplete, skipped");
            continue;
        };
        table.record(key, global, local);
        applied += 1;
    }
    applied
}

/// Ownership state of the serialized cache blob.
///
/// `External` is caller-owned and read-only: serialization echoes the
/// exact bytes back and the runtime never regenerates or mutates them.
/// `Owned` is the runtime's own buffer, rebuilt on demand. Installing an
/// external blob replaces (and thereby drops) any owned buffer, so the
/// two can never diverge.
#[derive(Debug)]
pub(crate) enum CacheState {
    Empty,
    Owned(Vec<u8>),
    External(Arc<[u8]>),
}

impl CacheState {
    pub(crate) fn is_external(&self) -> bool {
        matches!(self, CacheState::External(_))
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            CacheState::Empty => &[],
            CacheState::Owned(bytes) => bytes,
            CacheState::External(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_program(key: &str, binary: &[u8]) -> ProgramRecord {
        ProgramRecord {
            key: Some(key.to_string()),
            build_options: Some("-DFLOAT=float".to_string()),
            binary: Some(binary.to_vec()),
        }
    }

    fn full_tuning(key: &str, global: Vec<u32>, local: Vec<u32>) -> TuningRecord {
        TuningRecord {
            key: Some(key.to_string()),
            global: Some(global),
            local: Some(local),
        }
    }

    #[test]
    fn test_image_round_trip() {
        let image = CacheImage {
            programs: vec![full_program("matmul", &[1, 2, 3, 4])],
            tunings: vec![
                full_tuning("conv3x3", vec![64, 64], vec![8, 8]),
                full_tuning("gemm", vec![256], vec![32]),
            ],
        };

        let bytes = encode_image(&image);
        assert!(!bytes.is_empty());
        let decoded = decode_image(&bytes).unwrap();

        assert_eq!(decoded.programs.len(), 1);
        assert_eq!(decoded.programs[0].key.as_deref(), Some("matmul"));
        assert_eq!(decoded.programs[0].binary.as_deref(), Some(&[1u8, 2, 3, 4][..]));

        let mut table = TuningTable::new();
        assert_eq!(apply_tuning_records(decoded.tunings, &mut table), 2);
        assert_eq!(table.lookup("conv3x3", &[64, 64]), Some(&[8u32, 8][..]));
        assert_eq!(table.lookup("gemm", &[256]), Some(&[32u32][..]));
    }

    #[test]
    fn test_garbage_blob_decodes_to_none() {
        assert!(decode_image(&[]).is_none());
        assert!(decode_image(&[0xde, 0xad, 0xbe, 0xef]).is_none());
    }

    #[test]
    fn test_incomplete_program_records_are_detected() {
        let missing_binary = ProgramRecord {
            key: Some("matmul".to_string()),
            build_options: None,
            binary: None,
        };
        let missing_key = ProgramRecord {
            key: None,
            build_options: None,
            binary: Some(vec![1, 2, 3]),
        };
        assert!(missing_binary.into_parts().is_none());
        assert!(missing_key.into_parts().is_none());

        let (key, options, binary) = full_program("softmax", &[9, 9]).into_parts().unwrap();
        assert_eq!(key, "softmax");
        assert_eq!(options, "-DFLOAT=float");
        assert_eq!(binary, vec![9, 9]);
    }

    #[test]
    fn test_one_corrupt_record_leaves_others_usable() {
        let image = CacheImage {
            programs: vec![
                full_program("matmul", &[1]),
                ProgramRecord {
                    key: Some("conv2d".to_string()),
                    build_options: Some(String::new()),
                    binary: None,
                },
                full_program("softmax", &[2]),
            ],
            tunings: vec![
                full_tuning("conv3x3", vec![64, 64], vec![8, 8]),
                TuningRecord {
                    key: Some("gemm".to_string()),
                    global: None,
                    local: Some(vec![4]),
                },
            ],
        };

        let decoded = decode_image(&encode_image(&image)).unwrap();
        let usable = decoded
            .programs
            .into_iter()
            .filter_map(ProgramRecord::into_parts)
            .count();
        assert_eq!(usable, 2);

        let mut table = TuningTable::new();
        assert_eq!(apply_tuning_records(decoded.tunings, &mut table), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cache_state_transitions() {
        let mut state = CacheState::Owned(vec![1, 2, 3]);
        assert!(!state.is_external());
        assert_eq!(state.bytes(), &[1, 2, 3]);

        let external: Arc<[u8]> = vec![7, 7, 7].into();
        state = CacheState::External(external.clone());
        assert!(state.is_external());
        assert_eq!(state.bytes(), &external[..]);

        state = CacheState::Empty;
        assert!(state.bytes().is_empty());
    }
}
