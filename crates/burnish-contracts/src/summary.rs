use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::attempts::Attempt;
use crate::events::now_utc_iso;

/// Final record of one refinement run, persisted as `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub gen_model: String,
    pub refine_model: String,
    pub original_prompt: String,
    pub final_prompt: String,
    pub iterations_completed: u32,
    pub attempts: Vec<Attempt>,
    pub images: Vec<String>,
    pub ts: String,
}

impl RunSummary {
    pub fn stamped(mut self) -> Self {
        self.ts = now_utc_iso();
        self
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}
