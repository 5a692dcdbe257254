/// Source Packager - Learner Text to Compilation Unit
///
/// **Responsibility:**
/// Validate raw editor text and write it into a fresh, execution-scoped
/// work area under the toolchain's fixed source file name.
///
/// **Ownership:**
/// The returned [`WorkArea`] belongs to exactly one execution. Dropping it
/// removes the directory, so every exit path of the caller cleans up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::InfrastructureError;

const WORK_AREA_PREFIX: &str = "tutor-run-";

/// Scoped temporary directory holding the packaged source and build artifacts.
#[derive(Debug)]
pub struct WorkArea {
    dir: TempDir,
    source_file: String,
}

impl WorkArea {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.path().join(&self.source_file)
    }

    /// Remove the directory now and report failures; `Drop` does the same silently.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        let result = self.dir.close();
        match &result {
            Ok(()) => debug!(path = %path.display(), "Work area removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove work area"),
        }
        result
    }
}

/// What the packager made of the learner's text.
#[derive(Debug)]
pub enum Package {
    Ready(WorkArea),
    /// Nothing but whitespace was submitted.
    Empty,
    /// The source exceeds the configured size cap.
    TooLarge { bytes: usize, limit: usize },
}

#[derive(Debug, Clone)]
pub struct SourcePackager {
    source_file: String,
    work_root: Option<PathBuf>,
    max_source_bytes: usize,
}

impl SourcePackager {
    pub fn new(source_file: impl Into<String>, work_root: Option<PathBuf>, max_source_bytes: usize) -> Self {
        Self {
            source_file: source_file.into(),
            work_root,
            max_source_bytes,
        }
    }

    /// Package `source` into a new work area.
    ///
    /// Allocation is retried once before surfacing as an infrastructure error.
    pub fn package(&self, source: &str) -> Result<Package, InfrastructureError> {
        self.package_with(source, |packager, source| packager.allocate(source))
    }

    fn package_with<F>(&self, source: &str, mut allocate: F) -> Result<Package, InfrastructureError>
    where
        F: FnMut(&Self, &str) -> io::Result<WorkArea>,
    {
        if source.trim().is_empty() {
            return Ok(Package::Empty);
        }
        if source.len() > self.max_source_bytes {
            return Ok(Package::TooLarge {
                bytes: source.len(),
                limit: self.max_source_bytes,
            });
        }

        let area = match allocate(self, source) {
            Ok(area) => area,
            Err(first) => {
                warn!(error = %first, "Work area allocation failed, retrying once");
                allocate(self, source).map_err(InfrastructureError::WorkArea)?
            }
        };

        debug!(
            path = %area.path().display(),
            source_file = %area.source_file(),
            source_size = source.len(),
            "Source packaged"
        );
        Ok(Package::Ready(area))
    }

    fn allocate(&self, source: &str) -> io::Result<WorkArea> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORK_AREA_PREFIX);
        let dir = match &self.work_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let area = WorkArea {
            dir,
            source_file: self.source_file.clone(),
        };
        // On failure `area` drops here and the half-built directory goes with it.
        fs::write(area.source_path(), source)?;
        Ok(area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packager(root: &Path) -> SourcePackager {
        SourcePackager::new("Main.kt", Some(root.to_path_buf()), 1024)
    }

    #[test]
    fn test_empty_source_short_circuits() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());

        assert!(matches!(packager.package("").unwrap(), Package::Empty));
        assert!(matches!(packager.package("  \n\t ").unwrap(), Package::Empty));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_oversized_source_rejected() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());
        let source = "x".repeat(2048);

        match packager.package(&source).unwrap() {
            Package::TooLarge { bytes, limit } => {
                assert_eq!(bytes, 2048);
                assert_eq!(limit, 1024);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_source_written_under_fixed_name() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());

        let Package::Ready(area) = packager.package("fun main() = println(1)").unwrap() else {
            panic!("expected a work area");
        };
        assert!(area.path().starts_with(root.path()));
        assert_eq!(area.source_file(), "Main.kt");
        assert_eq!(
            fs::read_to_string(area.source_path()).unwrap(),
            "fun main() = println(1)"
        );
    }

    #[test]
    fn test_work_area_removed_on_drop_and_close() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());

        let Package::Ready(dropped) = packager.package("a").unwrap() else {
            panic!("expected a work area");
        };
        let dropped_path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_path.exists());

        let Package::Ready(closed) = packager.package("b").unwrap() else {
            panic!("expected a work area");
        };
        let closed_path = closed.path().to_path_buf();
        closed.close().unwrap();
        assert!(!closed_path.exists());
    }

    #[test]
    fn test_transient_allocation_failure_is_retried() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());
        let mut attempts = 0;

        let package = packager
            .package_with("fun main() {}", |packager, source| {
                attempts += 1;
                if attempts == 1 {
                    Err(io::Error::new(io::ErrorKind::Other, "temp dir busy"))
                } else {
                    packager.allocate(source)
                }
            })
            .unwrap();

        assert_eq!(attempts, 2);
        let Package::Ready(area) = package else {
            panic!("expected a work area");
        };
        assert_eq!(fs::read_to_string(area.source_path()).unwrap(), "fun main() {}");
    }

    #[test]
    fn test_allocation_gives_up_after_one_retry() {
        let root = tempfile::tempdir().unwrap();
        let packager = packager(root.path());
        let mut attempts = 0;

        let err = packager
            .package_with("fun main() {}", |_, _| {
                attempts += 1;
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            })
            .unwrap_err();

        assert_eq!(attempts, 2);
        assert!(matches!(err, InfrastructureError::WorkArea(_)));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unusable_work_root_is_infrastructure_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();

        let packager = SourcePackager::new("Main.kt", Some(blocker), 1024);
        let err = packager.package("fun main() {}").unwrap_err();
        assert!(matches!(err, InfrastructureError::WorkArea(_)));
    }
}
