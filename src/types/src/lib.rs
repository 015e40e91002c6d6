//! Shared row and request types for the NEOWISE light-curve pipeline.
//!
//! Every other crate in the workspace depends on this one; it carries no
//! behaviour beyond small constructors and band-indexing helpers so that it
//! stays cheap to depend on from both the ingest and query sides.

mod band;
mod catalog_row;
mod epoch;
mod filter;
mod raw;
mod source;

pub use band::Band;
pub use catalog_row::{BandRow, RawCatalogRow};
pub use epoch::EpochSummary;
pub use filter::FilterToggles;
pub use raw::RawObservation;
pub use source::Source;

/// Tag written into `EpochSummary.filter_applied` for ingest-time summaries.
pub const DEFAULT_FILTER_TAG: &str = "default";

/// Angular radius, in degrees, within which a coordinate-based query matches
/// a persisted [`Source`]. 3 arcseconds.
pub const NEAREST_SOURCE_RADIUS_DEG: f64 = 0.00083;
