//! Disk space guard run before large write operations.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Reports free bytes on the filesystem holding a path.
pub type SpaceProbe = Arc<dyn Fn(&Path) -> io::Result<u64> + Send + Sync>;

/// Checks free space against a required byte count plus a safety margin.
#[derive(Clone)]
pub struct DiskSpaceGuard {
    margin_percent: u32,
    probe: Option<SpaceProbe>,
}

impl fmt::Debug for DiskSpaceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSpaceGuard")
            .field("margin_percent", &self.margin_percent)
            .field("custom_probe", &self.probe.is_some())
            .finish()
    }
}

impl Default for DiskSpaceGuard {
    fn default() -> Self {
        Self::new(110)
    }
}

impl DiskSpaceGuard {
    /// Create a guard with a margin in percent (110 = 1.1x).
    pub fn new(margin_percent: u32) -> Self {
        Self {
            margin_percent: margin_percent.max(100),
            probe: None,
        }
    }

    /// Query free space through `probe` instead of the filesystem.
    pub fn with_probe(mut self, probe: SpaceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Margin in percent.
    pub fn margin_percent(&self) -> u32 {
        self.margin_percent
    }

    /// Required bytes after applying the margin, rounded up.
    pub fn with_margin(&self, required: u64) -> u64 {
        let scaled = (required as u128 * self.margin_percent as u128).div_ceil(100);
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    /// Accept or reject a known amount of free space.
    pub fn check(&self, required: u64, free: u64) -> SyncResult<u64> {
        let needed = self.with_margin(required);
        if free < needed {
            return Err(SyncError::InsufficientSpace {
                required: needed,
                free,
            });
        }
        Ok(free)
    }

    /// Ensure the filesystem holding `at_path` has room for `required` bytes.
    ///
    /// Returns the free byte count, or `None` when free space could not be
    /// queried; in that case the check passes with a warning.
    pub fn ensure_space(&self, required: u64, at_path: &Path) -> SyncResult<Option<u64>> {
        match &self.probe {
            Some(probe) => self.ensure_space_with(required, at_path, |p| (**probe)(p)),
            None => self.ensure_space_with(required, at_path, |p| fs2::available_space(p)),
        }
    }

    /// [`ensure_space`](Self::ensure_space) with an injectable free-space probe.
    pub fn ensure_space_with<F>(
        &self,
        required: u64,
        at_path: &Path,
        probe: F,
    ) -> SyncResult<Option<u64>>
    where
        F: FnOnce(&Path) -> io::Result<u64>,
    {
        let Some(existing) = nearest_existing_ancestor(at_path) else {
            warn!(path = %at_path.display(), "No existing ancestor, skipping disk space check");
            return Ok(None);
        };

        match probe(existing) {
            Ok(free) => {
                debug!(
                    path = %existing.display(),
                    required,
                    with_margin = self.with_margin(required),
                    free,
                    "Disk space checked"
                );
                self.check(required, free).map(Some)
            }
            Err(e) => {
                warn!(
                    path = %existing.display(),
                    error = %e,
                    "Could not query free disk space, assuming sufficient"
                );
                Ok(None)
            }
        }
    }
}

/// Walk upward from `path` to the closest ancestor that exists.
pub fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_margin_rounds_up() {
        let guard = DiskSpaceGuard::new(110);
        assert_eq!(guard.with_margin(1000), 1100);
        assert_eq!(guard.with_margin(1), 2);
        assert_eq!(guard.with_margin(0), 0);
    }

    #[test]
    fn test_margin_never_below_one() {
        let guard = DiskSpaceGuard::new(50);
        assert_eq!(guard.margin_percent(), 100);
        assert_eq!(guard.with_margin(1234), 1234);
    }

    #[test]
    fn test_boundary_exactly_at_margin_accepts() {
        let guard = DiskSpaceGuard::new(110);
        assert_eq!(guard.check(1000, 1100).unwrap(), 1100);
    }

    #[test]
    fn test_boundary_one_below_margin_rejects() {
        let guard = DiskSpaceGuard::new(110);
        match guard.check(1000, 1099) {
            Err(SyncError::InsufficientSpace { required, free }) => {
                assert_eq!(required, 1100);
                assert_eq!(free, 1099);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_requirement_saturates() {
        let guard = DiskSpaceGuard::new(110);
        assert_eq!(guard.with_margin(u64::MAX), u64::MAX);
        assert!(guard.check(u64::MAX, u64::MAX - 1).is_err());
    }

    #[test]
    fn test_probe_gets_nearest_existing_ancestor() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("not/yet/created");
        let seen = RefCell::new(PathBuf::new());

        let guard = DiskSpaceGuard::default();
        let free = guard
            .ensure_space_with(10, &target, |p| {
                *seen.borrow_mut() = p.to_path_buf();
                Ok(1_000)
            })
            .unwrap();

        assert_eq!(free, Some(1_000));
        assert_eq!(*seen.borrow(), temp.path());
    }

    #[test]
    fn test_probe_failure_assumes_sufficient() {
        let temp = TempDir::new().unwrap();
        let guard = DiskSpaceGuard::default();
        let result = guard.ensure_space_with(u64::MAX / 2, temp.path(), |_| {
            Err(io::Error::new(io::ErrorKind::Other, "statvfs failed"))
        });

        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_probe_rejects_when_short() {
        let temp = TempDir::new().unwrap();
        let guard = DiskSpaceGuard::default();
        let result = guard.ensure_space_with(1_000, temp.path(), |_| Ok(500));
        assert!(matches!(result, Err(SyncError::InsufficientSpace { .. })));
    }

    #[test]
    fn test_configured_probe_is_used() {
        let temp = TempDir::new().unwrap();
        let guard = DiskSpaceGuard::default().with_probe(Arc::new(|_: &Path| -> io::Result<u64> { Ok(500) }));

        assert!(matches!(
            guard.ensure_space(1_000, temp.path()),
            Err(SyncError::InsufficientSpace { required: 1_100, free: 500 })
        ));
        assert_eq!(guard.ensure_space(100, temp.path()).unwrap(), Some(500));
    }

    #[test]
    fn test_real_filesystem_query() {
        let temp = TempDir::new().unwrap();
        let guard = DiskSpaceGuard::default();
        // One byte should fit on any test machine
        let result = guard.ensure_space(1, temp.path()).unwrap();
        if let Some(free) = result {
            assert!(free >= 2);
        }
    }

    #[test]
    fn test_nearest_existing_ancestor() {
        let temp = TempDir::new().unwrap();
        let deep = temp.path().join("a/b/c");
        assert_eq!(nearest_existing_ancestor(&deep), Some(temp.path()));
        assert_eq!(nearest_existing_ancestor(temp.path()), Some(temp.path()));
    }

    proptest! {
        #[test]
        fn prop_accepts_iff_free_covers_margin(required in 0u64..1_000_000_000, free in 0u64..2_000_000_000) {
            let guard = DiskSpaceGuard::new(110);
            let needed = (required as u128 * 110).div_ceil(100) as u64;
            prop_assert_eq!(guard.check(required, free).is_ok(), free >= needed);
        }
    }
}
