pub mod backup;
pub mod list;
pub mod restore;
pub mod verify;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StrataError};

/// Bail out between files when a shutdown signal arrived.
pub(crate) fn check_interrupted(shutdown: Option<&AtomicBool>) -> Result<()> {
    if shutdown.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
        return Err(StrataError::CancelRequested);
    }
    Ok(())
}
