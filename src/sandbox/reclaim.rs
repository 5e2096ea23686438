//! Best-effort recursive removal of sandbox directories

use crate::config::ReclaimPolicy;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Removes a directory tree
pub trait DirRemover: Send + Sync {
    /// Recursively delete `path`
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Filesystem-backed remover
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRemover;

impl DirRemover for FsRemover {
    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }
}

/// What happened to a directory handed to [`reclaim_dir_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Deleted on the given attempt
    Removed {
        /// 1-based attempt that succeeded
        attempts: u32,
    },
    /// Nothing to delete
    Absent,
    /// Transient failures exhausted the retry bound
    Abandoned {
        /// Attempts made
        attempts: u32,
        /// Kind of the last failure
        kind: io::ErrorKind,
    },
    /// Permission denied; not retried
    Denied,
}

impl ReclaimOutcome {
    /// Whether the directory is known to be gone
    pub fn is_gone(&self) -> bool {
        matches!(self, ReclaimOutcome::Removed { .. } | ReclaimOutcome::Absent)
    }
}

/// Remove `path` with the default policy and the real filesystem
pub fn reclaim_dir(path: &Path) -> ReclaimOutcome {
    reclaim_dir_with(path, &ReclaimPolicy::default(), &FsRemover)
}

/// Remove `path`, retrying transient failures up to `policy.attempts` times.
///
/// Never fails: a missing path is [`ReclaimOutcome::Absent`], permission
/// errors give up at once, anything else is retried after `policy.pause`.
pub fn reclaim_dir_with(
    path: &Path,
    policy: &ReclaimPolicy,
    remover: &dyn DirRemover,
) -> ReclaimOutcome {
    let attempts = policy.attempts.max(1);
    let mut last_kind = io::ErrorKind::Other;

    for attempt in 1..=attempts {
        match remover.remove_dir_all(path) {
            Ok(()) => {
                debug!("Removed {} on attempt {}", path.display(), attempt);
                return ReclaimOutcome::Removed { attempts: attempt };
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return ReclaimOutcome::Absent;
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("Permission denied removing {}: {}", path.display(), e);
                return ReclaimOutcome::Denied;
            }
            Err(e) => {
                debug!(
                    "Attempt {}/{} to remove {} failed: {}",
                    attempt,
                    attempts,
                    path.display(),
                    e
                );
                last_kind = e.kind();
                if attempt < attempts {
                    std::thread::sleep(policy.pause());
                }
            }
        }
    }

    warn!(
        "Giving up on removing {} after {} attempts",
        path.display(),
        attempts
    );
    ReclaimOutcome::Abandoned {
        attempts,
        kind: last_kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `kind` for the first `failures` calls, then deletes for real
    struct FlakyRemover {
        failures: u32,
        kind: io::ErrorKind,
        calls: AtomicU32,
    }

    impl FlakyRemover {
        fn new(failures: u32, kind: io::ErrorKind) -> Self {
            Self {
                failures,
                kind,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DirRemover for FlakyRemover {
        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(io::Error::new(self.kind, "simulated"));
            }
            std::fs::remove_dir_all(path)
        }
    }

    fn populated_dir() -> (tempfile::TempDir, std::path::PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("box");
        std::fs::create_dir_all(dir.join("nested/deeper")).unwrap();
        std::fs::write(dir.join("nested/file.txt"), "data").unwrap();
        (root, dir)
    }

    #[test]
    fn test_removes_tree() {
        let (_root, dir) = populated_dir();

        assert_eq!(reclaim_dir(&dir), ReclaimOutcome::Removed { attempts: 1 });
        assert!(!dir.exists());
    }

    #[test]
    fn test_missing_path_is_absent() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("never-created");

        assert_eq!(reclaim_dir(&dir), ReclaimOutcome::Absent);
        assert_eq!(reclaim_dir(&dir), ReclaimOutcome::Absent);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (_root, dir) = populated_dir();
        let remover = FlakyRemover::new(2, io::ErrorKind::Other);

        let outcome = reclaim_dir_with(&dir, &ReclaimPolicy::default(), &remover);

        assert_eq!(outcome, ReclaimOutcome::Removed { attempts: 3 });
        assert_eq!(remover.calls(), 3);
        assert!(!dir.exists());
    }

    #[test]
    fn test_gives_up_after_bound() {
        let (_root, dir) = populated_dir();
        let remover = FlakyRemover::new(10, io::ErrorKind::WouldBlock);

        let outcome = reclaim_dir_with(&dir, &ReclaimPolicy::default(), &remover);

        assert_eq!(
            outcome,
            ReclaimOutcome::Abandoned {
                attempts: 3,
                kind: io::ErrorKind::WouldBlock
            }
        );
        assert_eq!(remover.calls(), 3);
        assert!(dir.exists());
    }

    #[test]
    fn test_permission_denied_is_not_retried() {
        let (_root, dir) = populated_dir();
        let remover = FlakyRemover::new(10, io::ErrorKind::PermissionDenied);

        let outcome = reclaim_dir_with(&dir, &ReclaimPolicy::default(), &remover);

        assert_eq!(outcome, ReclaimOutcome::Denied);
        assert_eq!(remover.calls(), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let (_root, dir) = populated_dir();
        let policy = ReclaimPolicy {
            attempts: 0,
            pause_ms: 0,
        };

        assert!(reclaim_dir_with(&dir, &policy, &FsRemover).is_gone());
    }
}
