use std::collections::HashSet;

use foldhash::fast::RandomState;
use roaring::RoaringBitmap;

use crate::{MvMap, MvMapError, MvMapHashLoader, Result};

/// A reusable restriction of a map's values, built by [`MvMap::make_view`].
///
/// A view holds value ids and is only meaningful for the map that produced
/// it. Passing it to another map's [`query`](MvMap::query) fails with
/// [`MvMapError::ViewMismatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct MvMapView {
    ids: RoaringBitmap,
    instance: u64,
}

impl MvMapView {
    /// Number of values in the view.
    pub fn len(&self) -> usize {
        self.ids.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> &RoaringBitmap {
        &self.ids
    }

    pub(crate) fn check<B: AsRef<[u8]>, H: MvMapHashLoader>(
        &self,
        map: &MvMap<B, H>,
    ) -> Result<&RoaringBitmap> {
        if self.instance != map.instance() {
            return Err(MvMapError::ViewMismatch);
        }
        Ok(&self.ids)
    }
}

impl<B: AsRef<[u8]>, H: MvMapHashLoader> MvMap<B, H> {
    /// Builds a view over the given values.
    ///
    /// The distinct values are scanned once; values that are not stored in
    /// the map are ignored.
    pub fn make_view<I>(&self, values: I) -> MvMapView
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let wanted: Vec<I::Item> = values.into_iter().collect();
        let set: HashSet<&[u8], RandomState> = wanted.iter().map(|v| v.as_ref()).collect();
        let mut ids = RoaringBitmap::new();
        if !set.is_empty() {
            for (id, value) in self.values().enumerate() {
                if set.contains(value) {
                    ids.insert(id as u32);
                }
            }
        }
        tracing::trace!(requested = set.len(), matched = ids.len(), "built mvmap view");
        MvMapView {
            ids,
            instance: self.instance(),
        }
    }

    /// Builds a view from value ids. Ids outside the map are dropped.
    pub fn make_view_from_ids(&self, ids: impl IntoIterator<Item = u32>) -> MvMapView {
        let limit = self.num_values() as u64;
        MvMapView {
            ids: ids.into_iter().filter(|&id| (id as u64) < limit).collect(),
            instance: self.instance(),
        }
    }
}
