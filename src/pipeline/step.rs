// src/pipeline/step.rs

//! The ordered chain of steps a request goes through

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::PackageManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum Step {
    FetchSource,
    Resolve { manager: PackageManager },
    Assemble,
    Complete,
}

impl Step {
    /// Every step for a request, in execution order
    pub fn chain(managers: &[PackageManager]) -> Vec<Step> {
        let mut chain = vec![Step::FetchSource];
        chain.extend(managers.iter().map(|&manager| Step::Resolve { manager }));
        chain.push(Step::Assemble);
        chain.push(Step::Complete);
        chain
    }

    /// The step after this one, `None` at the end of the chain
    pub fn next(&self, managers: &[PackageManager]) -> Option<Step> {
        let chain = Self::chain(managers);
        let position = chain.iter().position(|s| s == self)?;
        chain.get(position + 1).copied()
    }

    /// Reason recorded on the request while this step runs
    pub fn progress_message(&self) -> String {
        match self {
            Step::FetchSource => "Fetching the application source".to_string(),
            Step::Resolve { manager } => format!("Fetching the {manager} dependencies"),
            Step::Assemble => "Assembling the request bundle".to_string(),
            Step::Complete => "Completed successfully".to_string(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::FetchSource => write!(f, "fetch-source"),
            Step::Resolve { manager } => write!(f, "resolve({manager})"),
            Step::Assemble => write!(f, "assemble"),
            Step::Complete => write!(f, "complete"),
        }
    }
}
