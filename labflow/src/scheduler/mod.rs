//! Graph traversal and dispatch.
//!
//! Stages run as soon as their dependencies are satisfied, bounded by the
//! resource budget. A failing stage cascades to its transitive dependents
//! while unrelated branches continue. Stages whose fingerprint matches a
//! published artifact are skipped as cache hits.

mod budget;
mod report;

pub use budget::{BudgetGuard, ResourceBudget, ResourceRequest};
pub use report::{RunReport, StageOutcome};

use crate::acquire::{url_file_name, Acquirer};
use crate::cancellation::CancellationToken;
use crate::config::RunnerConfig;
use crate::container::ContainerRuntime;
use crate::errors::{FailureSummary, LabflowError};
use crate::events::{EventSink, NoOpEventSink, RunEvent};
use crate::executor::{build_executor, Executor, PreparedStage};
use crate::fingerprint::{
    file_fingerprint, files_fingerprint, stage_fingerprint, url_fingerprint, Fingerprint,
};
use crate::graph::DependencyGraph;
use crate::manifest::{expand_pattern, is_glob_pattern, InputSource, PipelineManifest};
use crate::params::ResolvedParams;
use crate::store::ArtifactStore;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Work directory: pre-supplied inputs are resolved against it and the
    /// artifact store lives beneath it unless configured otherwise.
    pub workdir: PathBuf,
    /// Re-execute stages even when a published artifact matches.
    pub force: bool,
}

/// The resolved execution plan: graph plus per-stage fingerprints.
#[derive(Debug)]
pub struct RunPlan {
    /// The validated dependency graph.
    pub graph: DependencyGraph,
    /// Fingerprint per stage, chained through upstream fingerprints.
    pub fingerprints: BTreeMap<String, Fingerprint>,
}

impl RunPlan {
    /// Which stages would be satisfied from the store, in execution order.
    pub fn cache_status(
        &self,
        store: &ArtifactStore,
    ) -> Result<Vec<(String, bool)>, LabflowError> {
        let mut status = Vec::with_capacity(self.graph.stage_count());
        for name in self.graph.execution_order() {
            let cached = store.lookup(name, &self.fingerprints[name])?.is_some();
            status.push((name.clone(), cached));
        }
        Ok(status)
    }
}

/// Schedules and executes one pipeline.
pub struct Scheduler {
    manifest: PipelineManifest,
    params: ResolvedParams,
    config: RunnerConfig,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl Scheduler {
    /// Creates a scheduler with no event sink.
    #[must_use]
    pub fn new(manifest: PipelineManifest, params: ResolvedParams, config: RunnerConfig) -> Self {
        Self {
            manifest,
            params,
            config,
            events: Arc::new(NoOpEventSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches an event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The token that cancels this scheduler's run.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Builds the dependency graph and fingerprints every stage.
    ///
    /// All configuration errors (unknown parameters were already rejected
    /// at resolution, missing producers, cycles, oversized requests)
    /// surface here, before anything executes.
    pub fn plan(&self, workdir: &std::path::Path) -> Result<RunPlan, LabflowError> {
        self.config.validate()?;
        self.config.check_admissible(&self.manifest)?;

        let graph = DependencyGraph::build(&self.manifest, |path| {
            if is_glob_pattern(path) {
                expand_pattern(workdir, path).is_ok_and(|matches| !matches.is_empty())
            } else {
                workdir.join(path).exists()
            }
        })?;

        let producers = self.manifest.producers();
        let mut fingerprints: BTreeMap<String, Fingerprint> = BTreeMap::new();
        for name in graph.execution_order() {
            let stage = self
                .manifest
                .stage(name)
                .ok_or_else(|| LabflowError::Internal(format!("unknown stage '{name}'")))?;
            let mut input_fingerprints = BTreeMap::new();
            for (alias, source) in stage.input_sources() {
                let fingerprint = match &source {
                    InputSource::Url(url) => url_fingerprint(url),
                    InputSource::Path(path) => match producers.get(path) {
                        Some(producer) => fingerprints[producer].clone(),
                        None if is_glob_pattern(path) => {
                            let matches = expand_pattern(workdir, path)
                                .map_err(LabflowError::Validation)?;
                            files_fingerprint(workdir, &matches)?
                        }
                        None => file_fingerprint(&workdir.join(path))?,
                    },
                };
                input_fingerprints.insert(alias, fingerprint);
            }
            fingerprints.insert(
                name.clone(),
                stage_fingerprint(stage, &self.params, &input_fingerprints),
            );
        }

        Ok(RunPlan { graph, fingerprints })
    }

    /// Runs the pipeline to completion, failure, or cancellation.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport, LabflowError> {
        let started_at = Utc::now();
        let run_id = Uuid::now_v7();
        let plan = self.plan(&options.workdir)?;
        let store = ArtifactStore::open(&self.config.store_root_for(&options.workdir))?;

        if self.manifest.stages.iter().any(|s| s.container.is_some()) {
            ContainerRuntime::new(
                self.config.container_runtime.clone(),
                self.config.retry.clone(),
            )
            .check_available()
            .await?;
        }

        let executor = build_executor(&self.config);
        let budget = ResourceBudget::from_config(&self.config)?;
        let acquirer = Arc::new(Acquirer::new(
            self.config.retry.clone(),
            store.downloads_dir().to_path_buf(),
        ));

        info!(
            pipeline = %self.manifest.name,
            run_id = %run_id,
            stages = plan.graph.stage_count(),
            "Run started"
        );

        let mut outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
        let mut failures = FailureSummary::new();
        let mut in_degree = plan.graph.in_degrees();
        let mut ready: VecDeque<String> = plan
            .graph
            .execution_order()
            .iter()
            .filter(|name| in_degree[*name] == 0)
            .cloned()
            .collect();
        let mut active: FuturesUnordered<
            tokio::task::JoinHandle<(String, Result<u64, LabflowError>)>,
        > = FuturesUnordered::new();

        loop {
            while let Some(name) = ready.pop_front() {
                if outcomes.contains_key(&name) {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    outcomes.insert(name, StageOutcome::Cancelled);
                    continue;
                }

                let fingerprint = plan.fingerprints[&name].clone();
                if !options.force && store.lookup(&name, &fingerprint)?.is_some() {
                    self.events.emit(&RunEvent::StageCacheHit {
                        stage: name.clone(),
                        fingerprint,
                    });
                    outcomes.insert(name.clone(), StageOutcome::Cached);
                    Self::mark_satisfied(&name, &plan.graph, &mut in_degree, &mut ready);
                    continue;
                }

                let job = self.prepare_job(
                    &name,
                    &plan,
                    &options.workdir,
                    run_id,
                    options.force,
                    &store,
                    &executor,
                    &budget,
                    &acquirer,
                )?;
                self.events.emit(&RunEvent::StageStarted {
                    stage: name.clone(),
                    fingerprint: plan.fingerprints[&name].clone(),
                });
                active.push(tokio::spawn(async move {
                    let name = job.stage_name.clone();
                    let result = run_stage_job(job).await;
                    (name, result)
                }));
            }

            if active.is_empty() {
                break;
            }

            let Some(joined) = active.next().await else {
                break;
            };
            let (name, result) = joined
                .map_err(|err| LabflowError::Internal(format!("stage task panicked: {err}")))?;
            match result {
                Ok(duration_ms) => {
                    self.events.emit(&RunEvent::StageCompleted {
                        stage: name.clone(),
                        duration_ms,
                    });
                    outcomes.insert(name.clone(), StageOutcome::Completed { duration_ms });
                    Self::mark_satisfied(&name, &plan.graph, &mut in_degree, &mut ready);
                }
                Err(LabflowError::Cancelled(_)) => {
                    outcomes.insert(name, StageOutcome::Cancelled);
                }
                Err(err) => {
                    self.events.emit(&RunEvent::StageFailed {
                        stage: name.clone(),
                        error: err.to_string(),
                    });
                    failures.record(name.clone(), err.to_string());
                    outcomes.insert(name.clone(), StageOutcome::Failed {
                        error: err.to_string(),
                    });
                    if matches!(err, LabflowError::Environment(_)) {
                        self.cancel.cancel(format!("environment error in '{name}'"));
                    }
                    for dependent in plan.graph.downstream_closure(&name) {
                        if !outcomes.contains_key(&dependent) {
                            self.events.emit(&RunEvent::StageSkipped {
                                stage: dependent.clone(),
                                cause: name.clone(),
                            });
                            outcomes.insert(
                                dependent,
                                StageOutcome::Skipped { cause: name.clone() },
                            );
                        }
                    }
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            self.events.emit(&RunEvent::RunCancelled {
                reason: self
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string()),
            });
        }
        for name in plan.graph.execution_order() {
            if !outcomes.contains_key(name) {
                if cancelled {
                    outcomes.insert(name.clone(), StageOutcome::Cancelled);
                } else {
                    return Err(LabflowError::Internal(format!(
                        "stage '{name}' was never scheduled"
                    )));
                }
            }
        }

        let report = RunReport {
            run_id,
            pipeline: self.manifest.name.clone(),
            started_at,
            finished_at: Utc::now(),
            stages: outcomes,
            fingerprints: plan.fingerprints,
            failures,
            cancelled,
        };
        info!(
            pipeline = %self.manifest.name,
            run_id = %run_id,
            success = report.is_success(),
            executed = report.executed_stages().len(),
            cached = report.cached_stages().len(),
            "Run finished"
        );
        Ok(report)
    }

    fn mark_satisfied(
        name: &str,
        graph: &DependencyGraph,
        in_degree: &mut BTreeMap<String, usize>,
        ready: &mut VecDeque<String>,
    ) {
        for dependent in graph.dependents_of(name) {
            if let Some(count) = in_degree.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(dependent.clone());
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_job(
        &self,
        name: &str,
        plan: &RunPlan,
        workdir: &std::path::Path,
        run_id: Uuid,
        replace: bool,
        store: &Arc<ArtifactStore>,
        executor: &Arc<dyn Executor>,
        budget: &Arc<ResourceBudget>,
        acquirer: &Arc<Acquirer>,
    ) -> Result<StageJob, LabflowError> {
        let stage = self
            .manifest
            .stage(name)
            .ok_or_else(|| LabflowError::Internal(format!("unknown stage '{name}'")))?;
        let producers = self.manifest.producers();

        let mut inputs = Vec::new();
        let mut staged_names = BTreeMap::new();
        for (alias, source) in stage.input_sources() {
            match source {
                InputSource::Url(url) => {
                    let staged_rel = format!("inputs/{alias}/{}", url_file_name(&url));
                    staged_names.insert(alias.clone(), staged_rel.clone());
                    inputs.push(InputMaterialization {
                        source: MaterializationSource::Download(url),
                        staged_rel,
                    });
                }
                InputSource::Path(path) => match producers.get(&path) {
                    Some(producer) => {
                        let source_path = store
                            .published_dir(producer, &plan.fingerprints[producer])
                            .join(&path);
                        staged_names.insert(alias.clone(), path.clone());
                        inputs.push(InputMaterialization {
                            source: MaterializationSource::File(source_path),
                            staged_rel: path,
                        });
                    }
                    None if is_glob_pattern(&path) => {
                        // Matched files land at their relative paths; the
                        // pattern itself re-expands inside the stage
                        // directory.
                        staged_names.insert(alias.clone(), path.clone());
                        for matched in
                            expand_pattern(workdir, &path).map_err(LabflowError::Validation)?
                        {
                            inputs.push(InputMaterialization {
                                source: MaterializationSource::File(workdir.join(&matched)),
                                staged_rel: matched,
                            });
                        }
                    }
                    None => {
                        staged_names.insert(alias.clone(), path.clone());
                        inputs.push(InputMaterialization {
                            source: MaterializationSource::File(workdir.join(&path)),
                            staged_rel: path,
                        });
                    }
                },
            }
        }

        let command = stage
            .render_command(&self.params, &staged_names)
            .map_err(LabflowError::Validation)?;
        // Per-stage retry budgets get their own acquirer over the same
        // download cache.
        let acquirer = match stage.retries {
            Some(attempts) => Arc::new(Acquirer::new(
                self.config.retry.clone().with_max_attempts(attempts),
                store.downloads_dir().to_path_buf(),
            )),
            None => Arc::clone(acquirer),
        };
        let request = ResourceRequest {
            cpus: stage.resources.cpus,
            memory_mb: stage
                .resources
                .memory_mb()
                .map_err(LabflowError::Validation)?,
            gpus: stage.resources.gpus,
        };
        let wall_time = stage
            .resources
            .wall_time()
            .map_err(LabflowError::Validation)?;

        Ok(StageJob {
            stage_name: name.to_string(),
            fingerprint: plan.fingerprints[name].clone(),
            command,
            container: stage.container.clone(),
            outputs: stage.outputs.clone(),
            inputs,
            request,
            wall_time,
            run_id,
            replace,
            store: Arc::clone(store),
            executor: Arc::clone(executor),
            budget: Arc::clone(budget),
            acquirer,
            cancel: Arc::clone(&self.cancel),
        })
    }
}

#[derive(Debug)]
enum MaterializationSource {
    File(PathBuf),
    Download(String),
}

#[derive(Debug)]
struct InputMaterialization {
    source: MaterializationSource,
    staged_rel: String,
}

struct StageJob {
    stage_name: String,
    fingerprint: Fingerprint,
    command: String,
    container: Option<String>,
    outputs: BTreeMap<String, String>,
    inputs: Vec<InputMaterialization>,
    request: ResourceRequest,
    wall_time: Option<Duration>,
    run_id: Uuid,
    replace: bool,
    store: Arc<ArtifactStore>,
    executor: Arc<dyn Executor>,
    budget: Arc<ResourceBudget>,
    acquirer: Arc<Acquirer>,
    cancel: Arc<CancellationToken>,
}

/// Runs one stage end to end: stage inputs, admit, execute, publish.
///
/// Any error drops the staging directory, so nothing partial is ever
/// visible to dependents.
async fn run_stage_job(job: StageJob) -> Result<u64, LabflowError> {
    let staging = job.store.begin_stage(&job.stage_name, &job.fingerprint)?;

    for input in &job.inputs {
        let source_path = match &input.source {
            MaterializationSource::File(path) => path.clone(),
            MaterializationSource::Download(url) => job.acquirer.fetch_url(url).await?,
        };
        staging.stage_input(&source_path, &input.staged_rel)?;
    }

    let prepared = PreparedStage {
        name: job.stage_name.clone(),
        command: job.command.clone(),
        workdir: staging.path().to_path_buf(),
        container: job.container.clone(),
        cpus: job.request.cpus,
        memory_mb: job.request.memory_mb,
        gpus: job.request.gpus,
        wall_time: job.wall_time,
    };

    let _admission = job.budget.acquire(job.request).await;
    if job.cancel.is_cancelled() {
        return Err(LabflowError::Cancelled(
            job.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
        ));
    }

    debug!(stage = %job.stage_name, fingerprint = %job.fingerprint, "Executing stage");
    let started = Instant::now();
    job.executor.execute(&prepared, &job.cancel).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    staging.publish(job.run_id, &job.outputs, job.replace)?;
    Ok(duration_ms)
}
