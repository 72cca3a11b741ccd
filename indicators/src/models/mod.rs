pub mod manifest;
pub mod source;

pub use manifest::RunManifest;
pub use source::{SourceTable, ORDINAL, SNAPSHOT_PERIOD};
