pub mod commit;
pub mod loaders;
pub mod request;
pub mod score;

pub use commit::{CommitDiff, CommitMeta, FileDiff};
pub use loaders::{load_all_diff_files, load_diff_file, parse_patch, DiffSource, DirectoryDiffSource};
pub use request::{ChunkPlan, ScoreRequest};
pub use score::{Dimension, Provenance, ScoreResult, NEUTRAL_SCORE};
