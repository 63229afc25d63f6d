mod archive;
mod wrapper;

pub use archive::{build_archive, StagedFile};
pub use wrapper::{code_to_execute, wrap_last_line_interactive};
