pub mod diff_loader;

pub use diff_loader::{load_all_diff_files, load_diff_file, parse_patch, DiffSource, DirectoryDiffSource};
