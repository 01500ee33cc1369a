//! Tuned local-work-size table.
//!
//! Maps (kernel identifier, global launch shape) to a previously discovered
//! local shape. The search that produces good local shapes lives outside
//! this crate; the table only stores and retrieves exact matches.

use rustc_hash::FxHashMap;

type TuningKey = (String, Vec<u32>);

/// Exact-match lookup table for tuned local work sizes.
#[derive(Debug, Default)]
pub struct TuningTable {
    entries: FxHashMap<TuningKey, Vec<u32>>,
}

impl TuningTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tuned local shape for the exact global shape, if any.
    /// Shapes of different lengths are distinct keys.
    pub fn lookup(&self, kernel: &str, global: &[u32]) -> Option<&[u32]> {
        self.entries
            .get(&(kernel.to_string(), global.to_vec()))
            .map(Vec::as_slice)
    }

    /// Records a tuned local shape. A later recording for the same key
    /// replaces the earlier one.
    pub fn record(&mut self, kernel: impl Into<String>, global: Vec<u32>, local: Vec<u32>) {
        self.entries.insert((kernel.into(), global), local);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&TuningKey, &Vec<u32>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut table = TuningTable::new();
        table.record("conv3x3", vec![64, 64], vec![8, 8]);

        assert_eq!(table.lookup("conv3x3", &[64, 64]), Some(&[8u32, 8][..]));
        assert_eq!(table.lookup("conv3x3", &[32, 32]), None);
        assert_eq!(table.lookup("conv5x5", &[64, 64]), None);
    }

    #[test]
    fn test_shape_length_distinguishes_keys() {
        let mut table = TuningTable::new();
        table.record("gemm", vec![64], vec![16]);
        table.record("gemm", vec![64, 1], vec![16, 1]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("gemm", &[64]), Some(&[16u32][..]));
        assert_eq!(table.lookup("gemm", &[64, 1]), Some(&[16u32, 1][..]));
    }

    #[test]
    fn test_rerecord_replaces() {
        let mut table = TuningTable::new();
        table.record("gemm", vec![128, 128], vec![8, 8]);
        table.record("gemm", vec![128, 128], vec![16, 4]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("gemm", &[128, 128]), Some(&[16u32, 4][..]));
    }
}
