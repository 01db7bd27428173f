use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Removes a local artifact. A file that is already gone counts as removed.
pub async fn remove_local(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed local artifact {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Scoped handle on a local artifact owned by one processing attempt.
///
/// The file is deleted when the guard drops, on every exit path, unless the
/// attempt explicitly keeps it with [`LocalArtifact::retain`].
#[derive(Debug)]
pub struct LocalArtifact {
    path: PathBuf,
    armed: bool,
}

impl LocalArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the file on disk past the end of this attempt.
    pub fn retain(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for LocalArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await; a single unlink is cheap enough to run inline.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released local artifact {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove local artifact {}: {e}",
                self.path.display()
            ),
        }
    }
}
