//! Immutable, persistent key to multi-value maps.
//!
//! The `mvmap` crate builds maps where every key is associated with a list of
//! values. Keys and values are arbitrary byte strings, each distinct value is
//! stored once and referenced by id. A builder accumulates pairs and
//! finalizes them into a compact blob indexed by a minimal perfect hash;
//! readers validate a blob once and then answer lookups in constant time,
//! either from memory or from a memory-mapped file.
//!
//! On top of plain lookups, maps evaluate boolean queries over keys
//! (`a & (b | !c)`) and restrict results to reusable views.
//!
//! ```
//! use mvmap::{MvMap, MvMapBuilder};
//!
//! # fn main() -> mvmap::Result<()> {
//! let mut builder = MvMapBuilder::new();
//! builder.add("fruit", "apple")?;
//! builder.add("fruit", "banana")?;
//! builder.add("red", "apple")?;
//! builder.add("red", "cherry")?;
//!
//! let blob = builder.finalize(true)?;
//! let map = MvMap::from_bytes(blob.into_bytes())?;
//! assert_eq!(map.get("fruit").collect::<Vec<_>>(), vec![&b"apple"[..], &b"banana"[..]]);
//!
//! let result = map.query_str("red & !fruit", None)?;
//! assert_eq!(result.iter().collect::<Vec<_>>(), vec![&b"cherry"[..]]);
//! # Ok(())
//! # }
//! ```
const MAGIC_NUMBER: [u8; 4] = *b"MVM1";

mod error;
pub use error::{MvMapError, Result};

mod encoding;
pub use encoding::ValueIdList;

mod interner;
use interner::Interner;

mod hasher;
pub use hasher::{
    ChdFunction, MvMapDefaultHashLoader, MvMapHashConfig, MvMapHashLoader, PerfectHash,
};

mod meta;
pub use meta::{FORMAT_VERSION, MvMapHeader, MvMapInfo, MvMapSection};

mod reader;
pub use reader::MvMapReader;

mod writer;
pub use writer::{MvMapWriter, MvMapWriterWrapper};

mod mvmap;
pub use mvmap::{MvMap, MvMapItems, MvMapIter, MvMapValues};

mod builder;
pub use builder::{MvMapBlob, MvMapBuilder, MvMapMerger};

mod view;
pub use view::MvMapView;

mod query;
pub use query::{MvMapQueryResult, Query};
