pub mod notifier;
pub mod scheduler;
pub mod workers;

pub use scheduler::{DependencyHealth, HealthRegistry, Scheduler, WorkerHealth};
pub use workers::{spawn_workers, Pipeline};

use std::fmt;

/// A polling worker. `WORKER_STAGES` picks which of these a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Routing,
    Execution,
    Settlement,
    Impact,
    Sweep,
    PositionMonitor,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Routing,
        Stage::Execution,
        Stage::Settlement,
        Stage::Impact,
        Stage::Sweep,
        Stage::PositionMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Routing => "routing",
            Stage::Execution => "execution",
            Stage::Settlement => "settlement",
            Stage::Impact => "impact",
            Stage::Sweep => "sweep",
            Stage::PositionMonitor => "position_monitor",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "routing" => Some(Stage::Routing),
            "execution" => Some(Stage::Execution),
            "settlement" => Some(Stage::Settlement),
            "impact" => Some(Stage::Impact),
            "sweep" => Some(Stage::Sweep),
            "position_monitor" | "monitor" => Some(Stage::PositionMonitor),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
