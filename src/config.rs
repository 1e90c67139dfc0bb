// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::HashSet;
use std::fs;
use std::io::Read;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::policy::SchedPolicy;
use crate::resource::LockProtocol;
use crate::time::Clock;
use crate::workload::Workload;

pub const TASK1_PERIOD_US: u64 = 100_000;
pub const TASK2_PERIOD_US: u64 = 200_000;
pub const TASK3_PERIOD_US: u64 = 300_000;

pub const TASK1_PRIORITY: i32 = 3;
pub const TASK2_PRIORITY: i32 = 2;
pub const TASK3_PRIORITY: i32 = 1;

/// How long the lowest-priority task sits on the shared resource.
pub const HOLD_US: u64 = 120_000;

/// Release phase of the other tasks in the inversion set, so the holder
/// owns the resource before the fastest task first asks for it.
pub const INVERSION_OFFSET_US: u64 = 20_000;

pub const DEFAULT_FIRST_CPU: usize = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Independent tasks, no shared resource.
    #[default]
    RateMonotonic,
    /// Resource users lock the shared resource every period.
    PriorityInversion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum CoreMode {
    /// Every task on the same CPU; priorities decide who runs.
    Single,
    /// One CPU per task.
    Multi,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub period_us: u64,
    /// Higher is more urgent.
    pub priority: i32,
    /// Allowed CPUs. Empty means unpinned.
    #[serde(default)]
    pub cpus: Vec<usize>,
    #[serde(default)]
    pub uses_resource: bool,
    /// Time spent sleeping with the resource held.
    #[serde(default)]
    pub hold_us: u64,
    /// Delay of the first release after start.
    #[serde(default)]
    pub offset_us: u64,
    #[serde(default)]
    pub workload: Workload,
    /// Stop after this many periods. Runs forever when unset.
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

impl TaskSpec {
    pub fn new(name: &str, period_us: u64, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            period_us,
            priority,
            cpus: Vec::new(),
            uses_resource: false,
            hold_us: 0,
            offset_us: 0,
            workload: Workload::default(),
            max_cycles: None,
        }
    }

    /// Whether this task touches the shared resource under `regime`.
    pub fn contends(&self, regime: Regime) -> bool {
        regime == Regime::PriorityInversion && self.uses_resource
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSetConfig {
    #[serde(default)]
    pub regime: Regime,
    #[serde(default)]
    pub policy: SchedPolicy,
    #[serde(default)]
    pub clock: Clock,
    #[serde(default)]
    pub lock_protocol: LockProtocol,
    pub tasks: Vec<TaskSpec>,
}

impl TaskSetConfig {
    /// The classic three-task set: 100/200/300ms periods with
    /// rate-monotonic priorities. Task 1 and task 3 share the resource and
    /// task 3 holds it for [`HOLD_US`]. Under the inversion regime task 1
    /// and task 2 are released [`INVERSION_OFFSET_US`] after task 3.
    pub fn three_task(
        regime: Regime,
        cores: CoreMode,
        first_cpu: usize,
        workload: Workload,
    ) -> Self {
        let periods = [
            (TASK1_PERIOD_US, TASK1_PRIORITY),
            (TASK2_PERIOD_US, TASK2_PRIORITY),
            (TASK3_PERIOD_US, TASK3_PRIORITY),
        ];

        let tasks = periods
            .iter()
            .enumerate()
            .map(|(i, &(period_us, priority))| {
                let mut spec = TaskSpec::new(&format!("Task {}", i + 1), period_us, priority);
                spec.cpus = match cores {
                    CoreMode::Single => vec![first_cpu],
                    CoreMode::Multi => vec![first_cpu + i],
                };
                spec.workload = workload;
                spec
            })
            .collect::<Vec<_>>();

        let mut cfg = Self {
            regime,
            policy: SchedPolicy::Fifo,
            clock: Clock::Realtime,
            lock_protocol: LockProtocol::None,
            tasks,
        };
        cfg.tasks[0].uses_resource = true;
        cfg.tasks[2].uses_resource = true;
        cfg.tasks[2].hold_us = HOLD_US;
        if regime == Regime::PriorityInversion {
            cfg.tasks[0].offset_us = INVERSION_OFFSET_US;
            cfg.tasks[1].offset_us = INVERSION_OFFSET_US;
        }
        cfg
    }

    /// `input` is either a path to a JSON file or the JSON itself. Input
    /// that cannot be opened is taken as JSON only if it looks like an
    /// object.
    pub fn parse(input: &str) -> Result<Self> {
        let content = match fs::OpenOptions::new().read(true).open(input) {
            Ok(mut opened) => {
                let mut content = String::new();
                opened
                    .read_to_string(&mut content)
                    .with_context(|| format!("Failed to read {}", input))?;
                content
            }
            Err(e) if !input.trim_start().starts_with('{') => {
                return Err(anyhow!(e).context(format!("Failed to open task set config {}", input)));
            }
            Err(_) => input.to_string(),
        };
        let cfg: Self = serde_json::from_str(&content).context("Failed to parse task set config")?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("Task set is empty");
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                bail!("Duplicate task name {:?}", task.name);
            }
            if task.period_us == 0 {
                bail!("{}: period must be positive", task.name);
            }
            if task.hold_us > 0 && !task.uses_resource {
                bail!("{}: hold_us set but the task does not use the resource", task.name);
            }
            if let Some(&cpu) = task.cpus.iter().find(|&&c| c >= libc::CPU_SETSIZE as usize) {
                bail!("{}: CPU {} exceeds CPU_SETSIZE", task.name, cpu);
            }
            if task.max_cycles == Some(0) {
                bail!("{}: max_cycles must be positive when set", task.name);
            }
        }
        Ok(())
    }

    /// Pairs `(a, b)` where `a` has the shorter period but not the higher
    /// priority.
    pub fn rate_monotonic_violations(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for a in &self.tasks {
            for b in &self.tasks {
                if a.period_us < b.period_us && a.priority <= b.priority {
                    out.push((a.name.clone(), b.name.clone()));
                }
            }
        }
        out
    }

    /// Whether any task will touch the shared resource.
    pub fn needs_resource(&self) -> bool {
        self.tasks.iter().any(|t| t.contends(self.regime))
    }
}

/// Liu & Layland bound: `n` periodic tasks are schedulable under
/// rate-monotonic priorities if total utilization stays at or below it.
pub fn utilization_bound(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    n * (2f64.powf(1.0 / n) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadPreset;
    use std::io::Write;

    fn default_set(regime: Regime, cores: CoreMode) -> TaskSetConfig {
        TaskSetConfig::three_task(
            regime,
            cores,
            DEFAULT_FIRST_CPU,
            Workload::preset(WorkloadPreset::Fixed),
        )
    }

    #[test]
    fn test_three_task_is_rate_monotonic() {
        let cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        assert_eq!(cfg.tasks.len(), 3);
        let periods: Vec<u64> = cfg.tasks.iter().map(|t| t.period_us).collect();
        let prios: Vec<i32> = cfg.tasks.iter().map(|t| t.priority).collect();
        assert_eq!(periods, vec![100_000, 200_000, 300_000]);
        assert_eq!(prios, vec![3, 2, 1]);
        assert!(cfg.rate_monotonic_violations().is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_single_core_shares_one_cpu() {
        let cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        for t in &cfg.tasks {
            assert_eq!(t.cpus, vec![1]);
        }
    }

    #[test]
    fn test_multi_core_spreads_tasks() {
        let cfg = TaskSetConfig::three_task(
            Regime::RateMonotonic,
            CoreMode::Multi,
            0,
            Workload::default(),
        );
        let cpus: Vec<Vec<usize>> = cfg.tasks.iter().map(|t| t.cpus.clone()).collect();
        assert_eq!(cpus, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_resource_only_under_inversion() {
        let rms = default_set(Regime::RateMonotonic, CoreMode::Single);
        assert!(!rms.needs_resource());
        assert!(rms.tasks.iter().all(|t| !t.contends(rms.regime)));

        let inv = default_set(Regime::PriorityInversion, CoreMode::Single);
        assert!(inv.needs_resource());
        let contending: Vec<&str> = inv
            .tasks
            .iter()
            .filter(|t| t.contends(inv.regime))
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(contending, vec!["Task 1", "Task 3"]);
        assert_eq!(inv.tasks[2].hold_us, 120_000);
        assert_eq!(inv.tasks[0].hold_us, 0);

        let offsets: Vec<u64> = inv.tasks.iter().map(|t| t.offset_us).collect();
        assert_eq!(offsets, vec![20_000, 20_000, 0]);
        assert!(rms.tasks.iter().all(|t| t.offset_us == 0));
    }

    #[test]
    fn test_parse_inline_json_defaults() {
        let json = r#"
        {
            "regime": "priority_inversion",
            "policy": "other",
            "tasks": [
                { "name": "fast", "period_us": 50000, "priority": 10, "uses_resource": true },
                { "name": "slow", "period_us": 150000, "priority": 5,
                  "uses_resource": true, "hold_us": 80000, "cpus": [0],
                  "workload": { "outer": 10, "inner": 10 } }
            ]
        }
        "#;
        let cfg = TaskSetConfig::parse(json).unwrap();
        assert_eq!(cfg.regime, Regime::PriorityInversion);
        assert_eq!(cfg.policy, SchedPolicy::Other);
        assert_eq!(cfg.clock, Clock::Realtime);
        assert_eq!(cfg.lock_protocol, LockProtocol::None);
        assert_eq!(cfg.tasks[0].cpus, Vec::<usize>::new());
        assert_eq!(cfg.tasks[0].workload, Workload::default());
        assert_eq!(cfg.tasks[0].max_cycles, None);
        assert_eq!(cfg.tasks[1].hold_us, 80_000);
        assert_eq!(cfg.tasks[1].workload, Workload { outer: 10, inner: 10 });
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_from_file_roundtrip() {
        let cfg = default_set(Regime::PriorityInversion, CoreMode::Multi);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cfg.to_json().unwrap().as_bytes()).unwrap();

        let parsed = TaskSetConfig::parse(file.path().to_str().unwrap()).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(TaskSetConfig::parse("{ not json at all").is_err());
    }

    #[test]
    fn test_parse_missing_file_reports_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasksett.json");
        let err = TaskSetConfig::parse(path.to_str().unwrap()).err().unwrap();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Failed to open task set config"), "{}", msg);
        assert!(msg.contains("No such file"), "{}", msg);
    }

    #[test]
    fn test_validate_rejects_bad_sets() {
        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[1].period_us = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[1].hold_us = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[1].name = "Task 1".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[0].cpus = vec![libc::CPU_SETSIZE as usize];
        assert!(cfg.validate().is_err());

        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[0].max_cycles = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rate_monotonic_violation_detected() {
        let mut cfg = default_set(Regime::RateMonotonic, CoreMode::Single);
        cfg.tasks[0].priority = 1;
        cfg.tasks[2].priority = 3;
        let v = cfg.rate_monotonic_violations();
        assert!(v.contains(&("Task 1".to_string(), "Task 3".to_string())));
        assert!(v.contains(&("Task 1".to_string(), "Task 2".to_string())));
        assert!(v.contains(&("Task 2".to_string(), "Task 3".to_string())));
    }

    #[test]
    fn test_utilization_bound() {
        assert_eq!(utilization_bound(0), 0.0);
        assert!((utilization_bound(1) - 1.0).abs() < 1e-12);
        assert!((utilization_bound(3) - 0.7798).abs() < 1e-4);
        assert!(utilization_bound(100) > std::f64::consts::LN_2);
    }
}
