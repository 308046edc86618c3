use super::ExecutionMode;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u64,
    pub tasks: Vec<TaskMetrics>,
}

/// Timings of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u64,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u64> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }
}
