//! Per-layer score index
//!
//! For every layer, the tracked fragments it holds ordered by score. Each
//! entry keeps the logical view (file name and logical range) next to the
//! physical one (blob name and offsets on the layer).

use hfetch_common::{Error, FileName, LayerId, PosixFile, Result, Segment};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Score ordered by `f64::total_cmp`
#[derive(Clone, Copy, Debug)]
struct Heat(f64);

impl PartialEq for Heat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Heat {}

impl PartialOrd for Heat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Heat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

type IndexKey = (Heat, FileName, Segment);

/// One tracked fragment as seen from its layer
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedFragment {
    pub score: f64,
    /// Application file and logical range, on the fragment's layer
    pub logical: PosixFile,
    /// Blob and offsets actually holding the bytes
    pub physical: PosixFile,
}

/// Fragments of every layer ordered coldest first
pub struct LayerScoreIndex {
    layers: Vec<RwLock<BTreeMap<IndexKey, PosixFile>>>,
}

impl LayerScoreIndex {
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| RwLock::new(BTreeMap::new())).collect(),
        }
    }

    fn layer(&self, id: LayerId) -> Result<&RwLock<BTreeMap<IndexKey, PosixFile>>> {
        self.layers
            .get(usize::from(id.0))
            .ok_or(Error::LayerNotFound(id.0))
    }

    /// Record the fragment `logical` of `filename`, stored at `physical`
    pub fn insert(
        &self,
        score: f64,
        filename: &FileName,
        logical: Segment,
        physical: &PosixFile,
    ) -> Result<()> {
        let mut layer = self.layer(physical.layer)?.write();
        layer.insert(
            (Heat(score), filename.clone(), logical),
            physical.clone(),
        );
        Ok(())
    }

    /// Forget a fragment; returns its physical location if it was indexed
    pub fn remove(
        &self,
        layer: LayerId,
        score: f64,
        filename: &FileName,
        logical: Segment,
    ) -> Result<Option<PosixFile>> {
        let mut layer = self.layer(layer)?.write();
        Ok(layer.remove(&(Heat(score), filename.clone(), logical)))
    }

    /// Coldest and hottest score on `layer`
    pub fn bounds(&self, layer: LayerId) -> Result<(Option<f64>, Option<f64>)> {
        let layer = self.layer(layer)?.read();
        let min = layer.keys().next().map(|(heat, _, _)| heat.0);
        let max = layer.keys().next_back().map(|(heat, _, _)| heat.0);
        Ok((min, max))
    }

    /// Every fragment on `layer`, coldest first
    pub fn coldest_first(&self, layer: LayerId) -> Result<Vec<IndexedFragment>> {
        let id = layer;
        let layer = self.layer(layer)?.read();
        Ok(layer
            .iter()
            .map(|((heat, filename, logical), physical)| IndexedFragment {
                score: heat.0,
                logical: PosixFile::new(filename.clone(), *logical, id),
                physical: physical.clone(),
            })
            .collect())
    }

    pub fn len(&self, layer: LayerId) -> Result<usize> {
        Ok(self.layer(layer)?.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FileName {
        FileName::new(s).unwrap()
    }

    fn physical(s: &str, start: i64, end: i64, layer: u8) -> PosixFile {
        PosixFile::new(name(s), Segment::new(start, end), LayerId(layer))
    }

    #[test]
    fn test_coldest_first_and_bounds() {
        let index = LayerScoreIndex::new(2);
        index.insert(5.0, &name("a"), Segment::new(0, 9), &physical("1.hfetch", 0, 9, 0)).unwrap();
        index.insert(1.0, &name("b"), Segment::new(0, 9), &physical("2.hfetch", 0, 9, 0)).unwrap();
        // Equal scores are kept apart by file and range.
        index.insert(1.0, &name("b"), Segment::new(10, 19), &physical("3.hfetch", 0, 9, 0)).unwrap();

        assert_eq!(index.bounds(LayerId(0)).unwrap(), (Some(1.0), Some(5.0)));
        assert_eq!(index.bounds(LayerId(1)).unwrap(), (None, None));

        let order: Vec<f64> = index
            .coldest_first(LayerId(0))
            .unwrap()
            .into_iter()
            .map(|f| f.score)
            .collect();
        assert_eq!(order, vec![1.0, 1.0, 5.0]);
    }

    #[test]
    fn test_remove() {
        let index = LayerScoreIndex::new(1);
        let loc = physical("a", 0, 9, 0);
        index.insert(2.0, &name("a"), Segment::new(0, 9), &loc).unwrap();
        assert_eq!(
            index.remove(LayerId(0), 2.0, &name("a"), Segment::new(0, 9)).unwrap(),
            Some(loc)
        );
        assert_eq!(index.len(LayerId(0)).unwrap(), 0);
        assert!(index.remove(LayerId(3), 2.0, &name("a"), Segment::new(0, 9)).is_err());
    }
}
