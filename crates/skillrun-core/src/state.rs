// Mutable execution state, owned by the ReAct driver
//
// The iteration counter only moves forward; observations and partial
// results are append-only.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skillrun_contracts::ErrorKind;

/// One observed tool outcome, in action order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub tool: String,
    pub correlation_id: String,
    pub success: bool,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable state of one execution. Mutated only by the driver.
#[derive(Debug)]
pub struct ExecutionState {
    iteration: u32,
    observations: Vec<Observation>,
    /// `tool:error_kind` -> attempt count
    failed_approaches: HashMap<String, u32>,
    loaded_files: HashSet<String>,
    partial_results: Vec<String>,
    error_count: u32,
    start_time: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            observations: Vec::new(),
            failed_approaches: HashMap::new(),
            loaded_files: HashSet::new(),
            partial_results: Vec::new(),
            error_count: 0,
            start_time: Utc::now(),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Advance to the next iteration; the counter never decreases.
    pub fn advance_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    pub fn record_observation(
        &mut self,
        tool: impl Into<String>,
        correlation_id: impl Into<String>,
        success: bool,
        summary: impl Into<String>,
    ) {
        self.observations.push(Observation {
            tool: tool.into(),
            correlation_id: correlation_id.into(),
            success,
            summary: summary.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Count a failed approach under its `tool:error_kind` key.
    pub fn record_failed_approach(&mut self, tool: &str, kind: ErrorKind) {
        *self
            .failed_approaches
            .entry(format!("{tool}:{kind}"))
            .or_insert(0) += 1;
    }

    pub fn failed_approaches(&self) -> &HashMap<String, u32> {
        &self.failed_approaches
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn mark_file_loaded(&mut self, path: impl Into<String>) {
        self.loaded_files.insert(path.into());
    }

    pub fn loaded_files(&self) -> &HashSet<String> {
        &self.loaded_files
    }

    pub fn add_partial_result(&mut self, partial: impl Into<String>) {
        self.partial_results.push(partial.into());
    }

    pub fn partial_results(&self) -> &[String] {
        &self.partial_results
    }

    pub fn take_partial_results(&mut self) -> Vec<String> {
        std::mem::take(&mut self.partial_results)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}
