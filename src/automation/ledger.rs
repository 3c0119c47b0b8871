//! Step ledger of one automation run.
use serde::Serialize;
use std::fmt;

pub const STEP_NAMES: [&str; 7] = [
    "Parse script",
    "Extract characters",
    "Generate character images",
    "Generate scene images",
    "Generate scene videos",
    "Analyze mood",
    "Stitch final video",
];

pub const PARSE_SCRIPT: usize = 0;
pub const EXTRACT_CHARACTERS: usize = 1;
pub const CHARACTER_IMAGES: usize = 2;
pub const SCENE_IMAGES: usize = 3;
pub const SCENE_VIDEOS: usize = 4;
pub const ANALYZE_MOOD: usize = 5;
pub const STITCH: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl StepStatus {
    fn credit(&self) -> f64 {
        match self {
            StepStatus::Pending => 0.0,
            StepStatus::Running | StepStatus::Error => 0.5,
            StepStatus::Done => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Step {
    pub name: &'static str,
    pub status: StepStatus,
    pub error: Option<String>,
}

/// Live state of one engine invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AutomationRun {
    pub steps: Vec<Step>,
    pub current: usize,
    pub current_action: String,
    pub cancelled: bool,
}

impl Default for AutomationRun {
    fn default() -> Self {
        Self {
            steps: STEP_NAMES
                .iter()
                .map(|name| Step {
                    name,
                    status: StepStatus::Pending,
                    error: None,
                })
                .collect(),
            current: 0,
            current_action: String::new(),
            cancelled: false,
        }
    }
}

impl AutomationRun {
    /// `round(100 * (current + credit) / total)` where a running step earns
    /// half credit and a finished one full credit.
    pub fn progress(&self) -> u8 {
        let total = self.steps.len();
        if total == 0 {
            return 0;
        }
        let credit = self
            .steps
            .get(self.current)
            .map(|s| s.status.credit())
            .unwrap_or(0.0);
        let pct = (100.0 * (self.current as f64 + credit) / total as f64).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Steps move forward only; `index` must not be behind the current step.
    pub fn start(&mut self, index: usize) {
        debug_assert!(index >= self.current, "steps run strictly in order");
        self.current = index;
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Running;
            step.error = None;
        }
    }

    pub fn finish(&mut self, index: usize) {
        self.current = index;
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Done;
        }
    }

    pub fn fail(&mut self, index: usize, message: impl Into<String>) {
        self.current = index;
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Error;
            step.error = Some(message.into());
        }
    }

    pub fn status(&self, index: usize) -> Option<StepStatus> {
        self.steps.get(index).map(|s| s.status)
    }

    pub fn failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Error)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Done)
    }
}

impl fmt::Display for AutomationRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "progress {}%: {}", self.progress(), self.current_action)?;
        for (i, step) in self.steps.iter().enumerate() {
            let mark = match step.status {
                StepStatus::Pending => " ",
                StepStatus::Running => ">",
                StepStatus::Done => "x",
                StepStatus::Error => "!",
            };
            write!(f, "  [{mark}] {}. {}", i + 1, step.name)?;
            if let Some(err) = &step.error {
                write!(f, " ({err})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
