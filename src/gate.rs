//! Gate kernel: minimum-trust checks between pipeline stages
//!
//! Stages compute checks; only this module turns checks into a verdict and
//! decides what a verdict permits downstream. Gates are deterministic and do
//! no I/O, which keeps the stage graph acyclic and replayable.

use serde::{Deserialize, Serialize};

/// Pipeline stages guarded by gates, in causal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Retrieval,
    Generation,
    Evaluation,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::Evaluation => "evaluation",
        }
    }
}

/// Verdict of a gate or a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Partial,
    Fail,
    Skipped,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Partial => "partial",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "partial" => Some(Self::Partial),
            "fail" => Some(Self::Fail),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Status of one check inside a stage report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }
}

/// One named check computed by a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl GateCheck {
    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    pub fn warn(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }

    pub fn skipped(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Skipped,
            detail: detail.into(),
        }
    }
}

/// Aggregated gate verdict for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    /// Stage name the report belongs to
    pub name: String,
    pub status: GateStatus,
    /// Reasons collected from warn/fail checks (check name when detail empty)
    pub reasons: Vec<String>,
    pub checks: Vec<GateCheck>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        matches!(self.status, GateStatus::Pass | GateStatus::Partial)
    }

    pub fn failed(&self) -> bool {
        self.status == GateStatus::Fail
    }
}

/// Aggregate stage checks into a gate verdict.
///
/// Lattice: any fail -> fail; any warn without fail -> partial;
/// all skipped -> skipped; otherwise pass. Reasons collect the detail (or
/// name) of each warn/fail check in input order.
pub fn aggregate(stage: Stage, checks: Vec<GateCheck>) -> GateReport {
    let mut has_fail = false;
    let mut has_warn = false;
    let mut all_skipped = !checks.is_empty();
    let mut reasons = Vec::new();

    for check in &checks {
        match check.status {
            CheckStatus::Fail => {
                has_fail = true;
                all_skipped = false;
            }
            CheckStatus::Warn => {
                has_warn = true;
                all_skipped = false;
            }
            CheckStatus::Pass => all_skipped = false,
            CheckStatus::Skipped => {}
        }
        if matches!(check.status, CheckStatus::Fail | CheckStatus::Warn) {
            let reason = if check.detail.is_empty() {
                check.name.clone()
            } else {
                check.detail.clone()
            };
            reasons.push(reason);
        }
    }

    let status = if has_fail {
        GateStatus::Fail
    } else if has_warn {
        GateStatus::Partial
    } else if all_skipped {
        GateStatus::Skipped
    } else {
        GateStatus::Pass
    };

    GateReport {
        name: stage.as_str().to_string(),
        status,
        reasons,
        checks,
    }
}

/// Causal chain: does a verdict at `stage` block the next stage?
///
/// Ingest fail blocks retrieval over that file. Retrieval fail blocks
/// generation. Generation fail does NOT block evaluation (the evaluator must
/// still record the failure). Evaluation fail blocks the user-visible answer.
pub fn blocks_downstream(stage: Stage, status: GateStatus) -> bool {
    if status != GateStatus::Fail {
        return false;
    }
    match stage {
        Stage::Ingest => true,
        Stage::Retrieval => true,
        Stage::Generation => false,
        Stage::Evaluation => true,
    }
}
