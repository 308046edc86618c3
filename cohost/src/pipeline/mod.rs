//! Staged task execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//! ```
//!
//! A stage runs its tasks either concurrently or one after another; stages
//! run in order and the first failing task stops the pipeline. Concurrent
//! tasks are always driven to completion, even when a sibling fails, so a
//! failed stage never leaves work running in the background. Tasks share a
//! cloned context, so anything they produce goes through interior
//! mutability in the context.

mod metrics;
mod stage;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use stage::{BoxedTask, ExecutionMode, PipelineTask, Stage};

use cohost_shared::errors::{CohostError, CohostResult};
use futures::future::join_all;
use std::time::Instant;

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx: Clone> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    /// Run every stage against `ctx`. Returns per-task timings on success.
    pub async fn run(self, ctx: Ctx) -> CohostResult<PipelineMetrics> {
        let total_start = Instant::now();
        let mut stages = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let stage_start = Instant::now();

            let tasks = match execution {
                ExecutionMode::Parallel => {
                    join_all(stage.tasks.into_iter().map(|task| run_task(task, ctx.clone())))
                        .await
                        .into_iter()
                        .collect::<CohostResult<Vec<_>>>()?
                }
                ExecutionMode::Sequential => {
                    let mut tasks = Vec::new();
                    for task in stage.tasks {
                        tasks.push(run_task(task, ctx.clone()).await?);
                    }
                    tasks
                }
            };

            let metrics = StageMetrics {
                index,
                execution,
                duration_ms: stage_start.elapsed().as_millis() as u64,
                tasks,
            };
            tracing::debug!(stage = index, ?execution, duration_ms = metrics.duration_ms, "stage done");
            stages.push(metrics);
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            stages,
        })
    }
}

async fn run_task<Ctx>(task: BoxedTask<Ctx>, ctx: Ctx) -> CohostResult<TaskMetrics> {
    let name = task.name().to_string();
    let start = Instant::now();
    task.run(ctx).await.inspect_err(|e: &CohostError| {
        tracing::warn!(task = %name, error = %e, "task failed");
    })?;
    Ok(TaskMetrics {
        name,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> CohostResult<()> {
            ctx.lock().push(self.0);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> CohostResult<()> {
            Err(CohostError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::new(vec![
            Stage::parallel(vec![
                Box::new(Record("a")) as BoxedTask<Log>,
                Box::new(Record("b")),
            ]),
            Stage::sequential(vec![Box::new(Record("c")) as BoxedTask<Log>]),
        ]);
        let metrics = pipeline.run(log.clone()).await.unwrap();

        let seen = log.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], "c");
        assert_eq!(metrics.stages.len(), 2);
        assert_eq!(metrics.stages[0].execution, ExecutionMode::Parallel);
        assert!(metrics.task_duration_ms("b").is_some());
        assert!(metrics.task_duration_ms("missing").is_none());
    }

    #[tokio::test]
    async fn test_parallel_siblings_finish_despite_failure() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::new(vec![Stage::parallel(vec![
            Box::new(Fail) as BoxedTask<Log>,
            Box::new(Record("sibling")),
        ])]);
        assert!(pipeline.run(log.clone()).await.is_err());
        assert_eq!(log.lock().clone(), vec!["sibling"]);
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::new(vec![
            Stage::sequential(vec![Box::new(Fail) as BoxedTask<Log>]),
            Stage::sequential(vec![Box::new(Record("never")) as BoxedTask<Log>]),
        ]);
        assert!(pipeline.run(log.clone()).await.is_err());
        assert!(log.lock().is_empty());
    }
}
