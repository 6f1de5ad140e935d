//! Jailed filesystem capability (component B, §4.B): named roots, a
//! normalized relative-path type, and the operation surface every other
//! crate in the workspace uses instead of touching `std::fs` directly.

pub mod error;
pub mod jail;
pub mod path;

pub use error::{FsError, Result};
pub use jail::{FileEntry, FileStat, Jail, Root, RootPaths};
pub use path::RelativePath;
