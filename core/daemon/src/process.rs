//! Process scanner signal source.
//!
//! Polls the process table and reports launches and exits of watched
//! executables. The first scan only records a baseline, so processes already
//! running when the daemon starts do not count as fresh activity.

use chrono::{DateTime, Utc};
use monitor_core::SignalEvent;
use std::collections::HashMap;
use sysinfo::System;

pub struct ProcessScanner {
    names: Vec<String>,
    known: HashMap<u32, String>,
    primed: bool,
    system: System,
}

impl ProcessScanner {
    pub fn new(names: &[String]) -> Self {
        Self {
            names: names.iter().map(|name| name.to_ascii_lowercase()).collect(),
            known: HashMap::new(),
            primed: false,
            system: System::new(),
        }
    }

    pub fn scan(&mut self, now: DateTime<Utc>) -> Vec<SignalEvent> {
        self.system.refresh_processes();
        let current: HashMap<u32, String> = self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| matches_name(process.name(), &self.names))
            .map(|(pid, process)| (pid.as_u32(), process.name().to_string()))
            .collect();

        if !self.primed {
            self.primed = true;
            tracing::debug!(watched = current.len(), "Process scanner baseline recorded");
            self.known = current;
            return Vec::new();
        }

        diff_processes(&mut self.known, current, now)
    }
}

fn diff_processes(
    known: &mut HashMap<u32, String>,
    current: HashMap<u32, String>,
    now: DateTime<Utc>,
) -> Vec<SignalEvent> {
    let mut events = Vec::new();

    let mut exited: Vec<(u32, String)> = known
        .iter()
        .filter(|(pid, _)| !current.contains_key(pid))
        .map(|(pid, name)| (*pid, name.clone()))
        .collect();
    exited.sort_by_key(|(pid, _)| *pid);
    for (pid, name) in exited {
        tracing::debug!(pid, name = %name, "Watched process exited");
        events.push(SignalEvent::process_exit(now, pid, &name));
    }

    let mut launched: Vec<(&u32, &String)> = current
        .iter()
        .filter(|(pid, _)| !known.contains_key(pid))
        .collect();
    launched.sort_by_key(|(pid, _)| **pid);
    for (pid, name) in launched {
        tracing::debug!(pid = *pid, name = %name, "Watched process launched");
        events.push(SignalEvent::process_exec(now, *pid, name));
    }

    *known = current;
    events
}

fn matches_name(name: &str, watched: &[String]) -> bool {
    let lowered = name.to_ascii_lowercase();
    let stem = lowered.strip_suffix(".exe").unwrap_or(&lowered);
    watched.iter().any(|candidate| candidate == stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::SignalKind;

    fn procs(entries: &[(u32, &str)]) -> HashMap<u32, String> {
        entries
            .iter()
            .map(|(pid, name)| (*pid, name.to_string()))
            .collect()
    }

    #[test]
    fn reports_launches_and_exits() {
        let now = Utc::now();
        let mut known = procs(&[(10, "claude"), (11, "claude")]);
        let events = diff_processes(&mut known, procs(&[(11, "claude"), (12, "claude")]), now);

        let summary: Vec<(SignalKind, Option<u32>)> = events
            .iter()
            .map(|event| (event.kind, event.process_id))
            .collect();
        assert_eq!(
            summary,
            vec![
                (SignalKind::ProcessExit, Some(10)),
                (SignalKind::ProcessExec, Some(12)),
            ]
        );
        assert_eq!(known, procs(&[(11, "claude"), (12, "claude")]));
    }

    #[test]
    fn steady_state_is_silent() {
        let mut known = procs(&[(10, "claude")]);
        assert!(diff_processes(&mut known, procs(&[(10, "claude")]), Utc::now()).is_empty());
    }

    #[test]
    fn name_match_is_exact_and_case_insensitive() {
        let watched = vec!["claude".to_string()];
        assert!(matches_name("claude", &watched));
        assert!(matches_name("Claude.exe", &watched));
        assert!(!matches_name("claude-helper", &watched));
        assert!(!matches_name("node", &watched));
    }
}
