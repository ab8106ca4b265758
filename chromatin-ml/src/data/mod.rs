//! Data pipeline descriptors, label tables and class weighting.

pub mod module;
pub mod source;
pub mod weights;

pub use module::{DataModuleSpec, PreparedData, Split};
pub use source::LabelTable;
pub use weights::PosWeightStrategy;
