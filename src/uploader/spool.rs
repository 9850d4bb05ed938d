//! On-disk spool of items that were not uploaded before shutdown

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::OutboundItem;
use crate::error::{Result, UploadError};
use crate::persist;

#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the spooled items; an absent spool is empty
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Spool` if the file exists but is unreadable
    pub fn load(&self) -> Result<Vec<OutboundItem>> {
        let items: Option<Vec<OutboundItem>> = persist::read_json(&self.path)
            .map_err(|e| UploadError::Spool(format!("cannot read {}: {}", self.path.display(), e)))?;
        Ok(items.unwrap_or_default())
    }

    /// Atomically replace the spool with `items`; an empty list removes it
    pub fn save(&self, items: &[OutboundItem]) -> Result<()> {
        if items.is_empty() {
            return self.remove();
        }

        persist::write_json_atomic(&self.path, items)
            .map_err(|e| UploadError::Spool(format!("cannot write {}: {}", self.path.display(), e)))?;
        info!("Spooled {} pending item(s) to {}", items.len(), self.path.display());
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        persist::remove_if_exists(&self.path)?;
        debug!("Removed spool {}", self.path.display());
        Ok(())
    }
}
