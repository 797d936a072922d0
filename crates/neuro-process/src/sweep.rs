//! Command-line based process discovery.
//!
//! Used only when no process record exists for a job: substring matching on
//! command lines is racy (truncated arguments, id collisions), so callers try
//! the registry first.

use crate::group::{is_alive, signal_pid, Signal};
use crate::ProcessError;
use neuro_types::JobId;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use sysinfo::{Pid, Process, System};

const MAX_PARENT_DEPTH: usize = 4;

fn sid_pattern() -> &'static Regex {
    static SID: OnceLock<Regex> = OnceLock::new();
    SID.get_or_init(|| {
        Regex::new(r"--sid[= ]+([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
            .expect("static --sid pattern")
    })
}

/// Why a process was matched to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// Full job id on its own command line.
    CommandLine,
    /// Short id plus the tool name, for truncated command lines.
    ShortIdAndTool,
    /// An ancestor's command line carries the job id.
    Parent,
}

#[derive(Debug, Clone)]
pub struct MatchedProcess {
    pub pid: u32,
    pub cmdline: String,
    pub reason: MatchReason,
}

/// A live segmentation tool process and the job it was started for.
#[derive(Debug, Clone)]
pub struct ToolProcess {
    pub pid: u32,
    pub pgid: Option<i32>,
    pub job_id: Option<JobId>,
    pub cmdline: String,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub matched: usize,
    /// Exited within the grace window.
    pub terminated: Vec<u32>,
    /// Needed a forced kill.
    pub killed: Vec<u32>,
    /// Could not be signalled for lack of permission.
    pub permission_denied: Vec<u32>,
}

/// Finds and terminates processes belonging to a job by inspecting command lines.
#[derive(Debug, Clone)]
pub struct ProcessSweeper {
    tool_name: String,
}

impl ProcessSweeper {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into().to_lowercase(),
        }
    }

    fn snapshot() -> System {
        let mut system = System::new();
        system.refresh_processes();
        system
    }

    fn cmdline(process: &Process) -> String {
        process.cmd().join(" ")
    }

    /// This process and its ancestors; an admin command carrying the job id
    /// on its own command line must not kill itself.
    fn own_lineage(system: &System) -> HashSet<Pid> {
        let mut out = HashSet::new();
        let mut current = Some(Pid::from_u32(std::process::id()));
        while let Some(pid) = current {
            if !out.insert(pid) {
                break;
            }
            current = system.process(pid).and_then(|p| p.parent());
        }
        out
    }

    fn parent_references(system: &System, process: &Process, needle: &str) -> bool {
        let mut current = process.parent();
        for _ in 0..MAX_PARENT_DEPTH {
            let Some(pid) = current else { return false };
            let Some(parent) = system.process(pid) else {
                return false;
            };
            if Self::cmdline(parent).contains(needle) {
                return true;
            }
            current = parent.parent();
        }
        false
    }

    fn match_in(&self, system: &System, job_id: &JobId) -> Vec<MatchedProcess> {
        let full = job_id.to_string();
        let short = job_id.short();
        let skip = Self::own_lineage(system);
        let mut out = Vec::new();
        for (pid, process) in system.processes() {
            if skip.contains(pid) {
                continue;
            }
            let cmdline = Self::cmdline(process);
            if cmdline.is_empty() {
                continue;
            }
            let reason = if cmdline.contains(&full) {
                MatchReason::CommandLine
            } else if cmdline.contains(&short) && cmdline.to_lowercase().contains(&self.tool_name)
            {
                MatchReason::ShortIdAndTool
            } else if Self::parent_references(system, process, &full) {
                MatchReason::Parent
            } else {
                continue;
            };
            out.push(MatchedProcess {
                pid: pid.as_u32(),
                cmdline,
                reason,
            });
        }
        out.sort_by_key(|m| m.pid);
        out
    }

    /// Live processes that look like they belong to `job_id`.
    pub fn find_matching(&self, job_id: &JobId) -> Vec<MatchedProcess> {
        self.match_in(&Self::snapshot(), job_id)
    }

    /// SIGTERM every match, wait `grace`, SIGKILL survivors. Best-effort: an
    /// empty match set or a permission error is logged, never returned.
    pub async fn sweep(&self, job_id: &JobId, grace: Duration) -> SweepReport {
        let matches = self.find_matching(job_id);
        let mut report = SweepReport {
            matched: matches.len(),
            ..Default::default()
        };
        if matches.is_empty() {
            tracing::debug!(job_id = %job_id, "no live processes matched");
            return report;
        }

        let mut signalled = Vec::new();
        for m in &matches {
            tracing::info!(job_id = %job_id, pid = m.pid, reason = ?m.reason, cmdline = %m.cmdline, "terminating matched process");
            match signal_pid(m.pid, Signal::Term) {
                Ok(()) => signalled.push(m.pid),
                Err(ProcessError::NotFound(_)) => {}
                Err(ProcessError::PermissionDenied(pid)) => {
                    tracing::warn!(job_id = %job_id, pid, "permission denied terminating process");
                    report.permission_denied.push(pid);
                }
                Err(e) => tracing::warn!(job_id = %job_id, pid = m.pid, error = %e, "failed to signal process"),
            }
        }
        if signalled.is_empty() {
            return report;
        }

        tokio::time::sleep(grace).await;
        for pid in signalled {
            if !is_alive(pid) {
                report.terminated.push(pid);
                continue;
            }
            match signal_pid(pid, Signal::Kill) {
                Ok(()) => report.killed.push(pid),
                Err(ProcessError::NotFound(_)) => report.terminated.push(pid),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, pid, error = %e, "failed to kill process");
                    report.permission_denied.push(pid);
                }
            }
        }
        report
    }

    /// Every live tool process, with the job id parsed from `--sid <uuid>` when present.
    pub fn find_tool_processes(&self) -> Vec<ToolProcess> {
        let system = Self::snapshot();
        let skip = Self::own_lineage(&system);
        let mut out: Vec<ToolProcess> = system
            .processes()
            .iter()
            .filter(|(pid, _)| !skip.contains(*pid))
            .filter_map(|(pid, process)| {
                let cmdline = Self::cmdline(process);
                let job_id = parse_sid(&cmdline);
                if job_id.is_none() && !cmdline.to_lowercase().contains(&self.tool_name) {
                    return None;
                }
                Some(ToolProcess {
                    pid: pid.as_u32(),
                    pgid: process_group_of(pid.as_u32()),
                    job_id,
                    cmdline,
                })
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        out
    }
}

/// Job id passed to the tool as `--sid`.
pub(crate) fn parse_sid(cmdline: &str) -> Option<JobId> {
    sid_pattern()
        .captures(cmdline)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(unix)]
fn process_group_of(pid: u32) -> Option<i32> {
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    (pgid > 0).then_some(pgid)
}

#[cfg(not(unix))]
fn process_group_of(_pid: u32) -> Option<i32> {
    None
}
