//! File-merging configuration.

/// Configuration for the file-merging checkpoint storage.
#[derive(Debug, Clone)]
pub struct FileMergingConfig {
    /// Rotate to a new physical file once the current one reaches this size.
    pub max_file_size: u64,
    /// Retire a closed file from reuse once its allocated size exceeds its
    /// live data size by more than this factor.
    pub max_space_amplification: f64,
}

impl Default for FileMergingConfig {
    fn default() -> Self {
        Self {
            max_file_size: 32 * 1024 * 1024,
            max_space_amplification: 2.0,
        }
    }
}
