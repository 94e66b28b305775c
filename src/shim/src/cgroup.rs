//! OOM detection through the container's cgroup v2 `memory.events`.

use std::path::{Path, PathBuf};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// The unified-hierarchy path from a `/proc/<pid>/cgroup` body.
pub fn unified_path(proc_cgroup: &str) -> Option<&str> {
    proc_cgroup
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

/// Cgroup directory of a live process, when it sits in a v2 hierarchy.
pub fn cgroup_of(pid: i32) -> Option<PathBuf> {
    let body = std::fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
    let path = unified_path(&body)?;
    Some(Path::new(CGROUP_ROOT).join(path.trim_start_matches('/')))
}

/// The `oom_kill` counter of a `memory.events` body.
pub fn oom_kills(events: &str) -> u64 {
    events
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(0)
}

/// Whether the kernel OOM killer fired inside `cgroup`.
pub fn was_oom_killed(cgroup: &Path) -> bool {
    std::fs::read_to_string(cgroup.join("memory.events"))
        .map(|events| oom_kills(&events) > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_path() {
        let body = "12:pids:/legacy\n0::/kiln/sb/c1\n";
        assert_eq!(unified_path(body), Some("/kiln/sb/c1"));
        assert_eq!(unified_path("3:memory:/x\n"), None);
        assert_eq!(unified_path("0::\n"), None);
    }

    #[test]
    fn test_oom_kills() {
        let events = "low 0\nhigh 0\nmax 4\noom 2\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(oom_kills(events), 1);
        assert_eq!(oom_kills("low 0\n"), 0);
    }

    #[test]
    fn test_was_oom_killed_reads_events_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(!was_oom_killed(tmp.path()));
        std::fs::write(tmp.path().join("memory.events"), "oom 1\noom_kill 3\n").unwrap();
        assert!(was_oom_killed(tmp.path()));
    }
}
