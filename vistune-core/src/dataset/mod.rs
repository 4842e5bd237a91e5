//! Dataset preparation: curation, splitting, tag repair and image housekeeping.

pub mod compress;
pub mod entry;
pub mod expand;
pub mod images;
pub mod split;
pub mod subset;
pub mod tags;

pub use entry::{
    DatasetEntry, ImageRef, Turn, load_document, load_entries, save_document, save_entries,
};
pub use split::SplitRatios;
