use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::hash32;
use crate::error::Result;

pub const PHONY_RULE: &str = "phony";

/// JSON description of a build: its edges and default targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Targets built when none are requested. Empty means every output no
    /// other edge consumes.
    #[serde(default)]
    pub defaults: Vec<String>,
    pub edges: Vec<EdgeSpec>,
}

/// One build action as written in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub rule: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rspfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rspfile_content: Option<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl EdgeSpec {
    pub fn new(rule: &str, command: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            rule: rule.to_string(),
            command: command.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            rspfile: None,
            rspfile_content: None,
        }
    }

    pub fn phony(inputs: &[&str], output: &str) -> Self {
        Self::new(PHONY_RULE, "", inputs, &[output])
    }

    pub fn is_phony(&self) -> bool {
        self.rule == PHONY_RULE
    }

    /// Stable identifier shared by master and slaves: a hash of the rule
    /// name and the outputs, case-folded.
    pub fn hash(&self) -> u32 {
        let key = format!("{} {}", self.rule, self.outputs.join(" "));
        hash32(&key.to_lowercase())
    }

    pub fn rspfile(&self) -> Option<(&str, &str)> {
        self.rspfile
            .as_deref()
            .map(|name| (name, self.rspfile_content.as_deref().unwrap_or("")))
    }
}
