// Error types for vmap file loading

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Outcome of a map or tile load request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoadResult {
    Success,
    FileNotFound,
    VersionMismatch,
    ReadFromFileFailed,
    DisabledInConfig,
}

impl LoadResult {
    pub fn is_success(self) -> bool {
        self == LoadResult::Success
    }
}

impl std::fmt::Display for LoadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadResult::Success => "success",
            LoadResult::FileNotFound => "file not found",
            LoadResult::VersionMismatch => "version mismatch",
            LoadResult::ReadFromFileFailed => "read from file failed",
            LoadResult::DisabledInConfig => "disabled in config",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum VmapError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("bad magic {found:?} (expected {expected:?})")]
    BadMagic { expected: String, found: String },

    #[error("version mismatch: file has {found:?}, engine expects {expected:?}")]
    VersionMismatch { expected: String, found: String },

    #[error("chunk mismatch: expected {expected:?}, got {found:?}")]
    ChunkMismatch { expected: String, found: String },

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmapError {
    /// Classify the error for callers that only care about the load outcome
    pub fn load_result(&self) -> LoadResult {
        match self {
            VmapError::NotFound(_) => LoadResult::FileNotFound,
            VmapError::VersionMismatch { .. } => LoadResult::VersionMismatch,
            VmapError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                LoadResult::FileNotFound
            }
            _ => LoadResult::ReadFromFileFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, VmapError>;
