use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("object not found: '{0}'")]
    NotFound(String),

    #[error("data corruption detected: {0}")]
    Corrupt(String),

    #[error("decryption failed: wrong key or tampered data")]
    CryptoAuth,

    #[error("file changed while being backed up: '{0}'")]
    FileRace(String),

    #[error("backup set is locked by another process (lock: {0})")]
    Locked(String),

    #[error("operation cancelled")]
    CancelRequested,

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("patch decode error: {0}")]
    PatchDecode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Errors that abort a single file, not the whole backup run.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            StrataError::Io(_)
                | StrataError::Transport(_)
                | StrataError::NotFound(_)
                | StrataError::Corrupt(_)
                | StrataError::CryptoAuth
                | StrataError::FileRace(_)
                | StrataError::Decompression(_)
                | StrataError::PatchDecode(_)
        )
    }
}
