//! Descendant enumeration and forced termination of OS processes.
//!
//! Process identity is only valid for killing at the moment of the
//! snapshot, so the parent/child table is rebuilt from a fresh OS snapshot
//! on every call and never cached.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;

/// Platform-specific process enumeration and termination, selected once at
/// startup. Call sites stay free of platform conditionals.
pub trait ProcessTreeResolver: Send + Sync {
    /// All pids whose ancestry chain traces back to `pid`, excluding `pid`
    /// itself.
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// Forcibly terminate one process. Returns false when the process is
    /// already gone.
    fn kill_one(&self, pid: u32) -> bool;
}

/// The resolver for the current platform.
#[cfg(unix)]
pub fn platform_resolver() -> Arc<dyn ProcessTreeResolver> {
    Arc::new(PosixResolver)
}

/// The resolver for the current platform.
#[cfg(windows)]
pub fn platform_resolver() -> Arc<dyn ProcessTreeResolver> {
    Arc::new(WindowsResolver)
}

fn snapshot_descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let root = Pid::from_u32(root);
    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if !seen.contains(kid) {
                    stack.push(*kid);
                }
            }
        }
    }

    seen.remove(&root);
    seen.into_iter().map(|pid| pid.as_u32()).collect()
}

#[cfg(unix)]
struct PosixResolver;

#[cfg(unix)]
impl ProcessTreeResolver for PosixResolver {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        snapshot_descendants(pid)
    }

    fn kill_one(&self, pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 }
    }
}

#[cfg(windows)]
struct WindowsResolver;

#[cfg(windows)]
impl ProcessTreeResolver for WindowsResolver {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        snapshot_descendants(pid)
    }

    fn kill_one(&self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system.process(target).is_some_and(sysinfo::Process::kill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_not_its_own_descendant() {
        let pid = std::process::id();
        let descendants = snapshot_descendants(pid);
        assert!(!descendants.contains(&pid));
    }

    #[cfg(unix)]
    #[test]
    fn killing_a_dead_pid_reports_failure() {
        let mut child = match std::process::Command::new("true").spawn() {
            Ok(child) => child,
            Err(err) => panic!("failed to spawn `true`: {err}"),
        };
        let pid = child.id();
        let _ = child.wait();
        // The pid is reaped, so a later kill must not report success.
        assert!(!PosixResolver.kill_one(pid));
    }
}
