//! Built-in step operators.

pub mod cleanup;
pub mod dataframe;
pub mod load_file;
pub mod merge;
pub mod transform;

pub use cleanup::Cleanup;
pub use dataframe::{DataframeTransform, FrameRoutine};
pub use load_file::{IfExists, LoadFile};
pub use merge::{ConflictPolicy, Merge, MergeMode, MergeStats};
pub use transform::SqlTransform;
