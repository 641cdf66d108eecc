//! Build execution.
//!
//! This module provides the entry point for running the builders needed by a
//! request. It handles:
//! - Staleness-driven scheduling over the builder job graph
//! - Bounded parallel execution of independent builders
//! - Failure propagation, blocking and cancellation
//! - Committing signatures and dynamic discoveries after every success

mod plan;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::builder::{BuildContext, BuildOutcome, Builder, BuilderError, Discoveries};
use crate::config::SignatureMode;
use crate::environment::Environment;
use crate::graph::BuilderId;
use crate::node::{Identity, NodeId, NodeInfo, NodeKind, NodeSpec, spec_signature};
use crate::state::{
  DependencyRecord, LockMode, SignatureRecord, StaleReason, StateLock, StoreLockError, direct_staleness,
};
use crate::util::hash::Signature;

pub use plan::{Job, PreparedBuild, prepare};
pub use types::{BlockCause, BuildReport, ExecuteConfig, ExecuteError, TargetStatus};

use plan::{dependency_states, prepare_with};

/// Bring `roots` up to date.
///
/// Holds the state lock for the whole request: exclusively for a real
/// build, shared for a dry run. A state directory that cannot be used at all
/// turns the request into a full rebuild without recorded signatures.
pub async fn build(env: &mut Environment, roots: &[NodeId], config: &ExecuteConfig) -> Result<BuildReport, ExecuteError> {
  let mode = if config.dry_run { LockMode::Shared } else { LockMode::Exclusive };
  let lock = match StateLock::acquire(env.store.state_dir(), mode, "build") {
    Ok(lock) => Some(lock),
    Err(e @ (StoreLockError::Contention { .. } | StoreLockError::ContentionUnknown { .. })) => return Err(e.into()),
    Err(e) => {
      warn!(
        state_dir = %env.store.state_dir().display(),
        error = %e,
        "state directory is unusable; rebuilding everything without recorded signatures"
      );
      None
    }
  };

  let prepared = prepare_with(env, roots, lock.is_some())?;
  info!(
    jobs = prepared.jobs.len(),
    stale = prepared.jobs.iter().filter(|j| j.stale.is_some()).count(),
    dry_run = config.dry_run,
    "starting build"
  );

  let mut scheduler = Scheduler::new(env, &prepared, config);
  scheduler.run().await;
  let report = scheduler.into_report();

  info!(
    invocations = report.invocations,
    built = report.built(),
    failed = report.failed(),
    blocked = report.blocked(),
    cancelled = report.cancelled(),
    "build complete"
  );
  Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
  Pending,
  Running,
  Succeeded,
  Failed,
  Blocked,
  Cancelled,
}

impl JobState {
  fn is_terminal(self) -> bool {
    !matches!(self, JobState::Pending | JobState::Running)
  }
}

/// What a worker hands back after running a builder.
struct WorkerOutput {
  outcome: BuildOutcome,
  discoveries: Discoveries,
  signatures: Vec<(Identity, Option<Signature>)>,
}

struct Completion {
  job: usize,
  result: Result<WorkerOutput, BuilderError>,
}

struct Scheduler<'a> {
  env: &'a mut Environment,
  prepared: &'a PreparedBuild,
  config: &'a ExecuteConfig,
  states: Vec<JobState>,
  remaining: Vec<usize>,
  dependents: Vec<Vec<usize>>,
  ready: BTreeSet<usize>,
  statuses: BTreeMap<NodeId, TargetStatus>,
  assume_unchanged: HashSet<Identity>,
  /// Jobs whose builder ran and reported `Built`.
  rebuilt: Vec<bool>,
  running: HashMap<task::Id, usize>,
  stopped: bool,
  invocations: usize,
  vars: Arc<BTreeMap<String, serde_json::Value>>,
  semaphore: Arc<Semaphore>,
  tasks: JoinSet<Completion>,
}

impl<'a> Scheduler<'a> {
  fn new(env: &'a mut Environment, prepared: &'a PreparedBuild, config: &'a ExecuteConfig) -> Self {
    let count = prepared.jobs.len();
    let mut dependents = vec![Vec::new(); count];
    let mut remaining = vec![0; count];
    for (index, job) in prepared.jobs.iter().enumerate() {
      remaining[index] = job.deps.len();
      for &dep in &job.deps {
        dependents[dep].push(index);
      }
    }
    let ready = (0..count).filter(|&i| remaining[i] == 0).collect();
    let vars = Arc::new(env.vars.clone());

    Self {
      env,
      prepared,
      config,
      states: vec![JobState::Pending; count],
      remaining,
      dependents,
      ready,
      statuses: BTreeMap::new(),
      assume_unchanged: HashSet::new(),
      rebuilt: vec![false; count],
      running: HashMap::new(),
      stopped: false,
      invocations: 0,
      vars,
      semaphore: Arc::new(Semaphore::new(config.parallelism.max(1))),
      tasks: JoinSet::new(),
    }
  }

  async fn run(&mut self) {
    loop {
      self.dispatch();
      if self.tasks.is_empty() {
        break;
      }

      match self.tasks.join_next_with_id().await {
        Some(Ok((id, completion))) => {
          self.running.remove(&id);
          self.complete(completion.job, completion.result);
        }
        Some(Err(e)) => {
          error!(error = %e, "builder task failed to join");
          if let Some(index) = self.running.remove(&e.id()) {
            self.fail(index, format!("builder task was lost: {e}"));
          }
        }
        None => break,
      }
    }

    for index in 0..self.states.len() {
      match self.states[index] {
        JobState::Pending => self.set_state(index, JobState::Cancelled, TargetStatus::Cancelled),
        JobState::Running => {
          let status = TargetStatus::Failed {
            error: "builder task was lost".to_string(),
          };
          self.set_state(index, JobState::Failed, status);
        }
        _ => {}
      }
    }
  }

  /// Start everything that is ready, until the pool is full.
  fn dispatch(&mut self) {
    let prepared = self.prepared;
    while !self.stopped {
      let Some(&index) = self.ready.first() else {
        break;
      };
      let job = &prepared.jobs[index];

      if let Some(&missing) = job.missing.first() {
        self.ready.remove(&index);
        let node = self.env.node_name(missing);
        warn!(builder = %job.name, source = %node, "required source is missing");
        self.block(index, BlockCause::MissingSource { node });
        continue;
      }

      if job.stale.is_none() {
        self.ready.remove(&index);
        self.skip(index);
        continue;
      }

      if self.config.dry_run {
        self.ready.remove(&index);
        self.set_state(index, JobState::Succeeded, TargetStatus::WouldBuild);
        self.release(index);
        continue;
      }

      let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
        break;
      };
      self.ready.remove(&index);

      if !self.may_cascade_stop(index) {
        if let Some(reason) = &job.stale {
          debug!(builder = %job.name, reason = %reason, "builder is stale");
        }
        self.spawn(index, permit);
        continue;
      }
      match self.recheck(index) {
        Some(reason) => {
          debug!(builder = %job.name, reason = %reason, "builder is stale");
          self.spawn(index, permit);
        }
        None => {
          debug!(builder = %job.name, "dependencies settled; nothing to rebuild");
          self.refresh_records(index);
          self.skip(index);
        }
      }
    }
  }

  /// A job stale only through its dependencies, none of which rebuilt
  /// anything, may turn out to have nothing left to do.
  fn may_cascade_stop(&self, index: usize) -> bool {
    let job = &self.prepared.jobs[index];
    job.stale.as_ref().is_some_and(StaleReason::is_propagated) && !job.deps.iter().any(|&dep| self.rebuilt[dep])
  }

  /// Direct staleness of a job's targets against current signatures.
  fn recheck(&self, index: usize) -> Option<StaleReason> {
    let builder = self.prepared.jobs[index].builder;
    let config = &self.env.builders[builder.index()].config;
    self.env.graph.targets(builder).into_iter().find_map(|target| {
      let kind = self.env.registry.kind(target)?;
      let current = self.env.registry.signature_of(target);
      let deps = dependency_states(self.env, target);
      direct_staleness(
        self.prepared.records.get(&target),
        kind,
        current.as_ref(),
        config,
        &deps,
        &self.assume_unchanged,
      )
    })
  }

  /// Rewrite the records of a skipped job whose dependencies were rebuilt
  /// but reported unchanged, so the next run compares against what is on
  /// disk now.
  fn refresh_records(&self, index: usize) {
    let builder = self.prepared.jobs[index].builder;
    for target in self.env.graph.targets(builder) {
      let Some(record) = self.prepared.records.get(&target) else {
        continue;
      };
      let deps = dependency_states(self.env, target);
      let outdated = deps.iter().any(|d| {
        self.assume_unchanged.contains(&d.identity)
          && record.dependency(&d.identity).and_then(|r| r.signature.as_ref()) != d.signature.as_ref()
      });
      if !outdated {
        continue;
      }

      let mut refreshed = record.clone();
      refreshed.dependencies = deps.into_iter().map(dependency_record).collect();
      if let Err(e) = self.env.store.commit(&refreshed) {
        warn!(node = %refreshed.identity, error = %e, "failed to refresh signature record");
      }
    }
  }

  fn spawn(&mut self, index: usize, permit: OwnedSemaphorePermit) {
    let job = &self.prepared.jobs[index];
    let builder_id = job.builder;
    let entry = &self.env.builders[builder_id.index()];
    let builder = Arc::clone(&entry.builder);

    let static_targets: Vec<NodeSpec> = self
      .env
      .graph
      .static_targets(builder_id)
      .iter()
      .filter_map(|&t| self.env.registry.spec(t))
      .collect();
    let previous: Vec<NodeSpec> = self
      .env
      .graph
      .targets(builder_id)
      .into_iter()
      .filter_map(|t| self.env.registry.spec(t))
      .collect();
    let infos = |nodes: &[NodeId]| -> Vec<NodeInfo> {
      nodes.iter().filter_map(|&n| self.env.registry.info(n).ok()).collect()
    };
    let targets = infos(self.env.graph.static_targets(builder_id));
    let recorded = infos(self.env.graph.dynamic_targets(builder_id));
    let sources = infos(self.env.graph.static_sources(builder_id));

    let ctx = BuildContext::new(
      entry.name.clone(),
      self.env.config.root.clone(),
      self.env.config.build_root.clone(),
      targets,
      sources,
      Arc::clone(&self.vars),
    )
    .with_recorded_targets(recorded);
    let mode = self.env.registry.mode();

    info!(builder = %entry.name, "running builder");
    self.invocations += 1;
    self.states[index] = JobState::Running;

    let handle = self.tasks.spawn_blocking(move || {
      let _permit = permit;
      let result = run_builder(builder.as_ref(), ctx, &previous, &static_targets, mode);
      Completion { job: index, result }
    });
    self.running.insert(handle.id(), index);
  }

  fn complete(&mut self, index: usize, result: Result<WorkerOutput, BuilderError>) {
    let builder = self.prepared.jobs[index].builder;
    let name = self.prepared.jobs[index].name.clone();

    let result = result.and_then(|output| self.commit(builder, output));
    self.env.graph.mark_complete(builder);

    match result {
      Ok(outcome) => {
        info!(builder = %name, outcome = ?outcome, "builder succeeded");
        let status = match outcome {
          BuildOutcome::Built => {
            self.rebuilt[index] = true;
            TargetStatus::Built
          }
          BuildOutcome::Unchanged => TargetStatus::Unchanged,
        };
        self.set_state(index, JobState::Succeeded, status);
        self.release(index);
      }
      Err(e) => {
        error!(builder = %name, error = %e, "builder failed");
        self.fail(index, e.to_string());
      }
    }
  }

  /// Record a failed job, block everything downstream of it and, unless
  /// keep-going is set, stop dispatching.
  fn fail(&mut self, index: usize, error: String) {
    self.env.graph.mark_complete(self.prepared.jobs[index].builder);
    self.set_state(index, JobState::Failed, TargetStatus::Failed { error });
    let node = self.first_target_name(index);
    self.block_dependents(index, &BlockCause::FailedDependency { node });
    if !self.config.keep_going {
      self.stopped = true;
    }
  }

  /// Apply discoveries and persist records for a successful builder.
  fn commit(&mut self, builder: BuilderId, output: WorkerOutput) -> Result<BuildOutcome, BuilderError> {
    let cache = self.env.registry.cache().clone();
    for target in self.env.graph.targets(builder) {
      if let Some(identity) = self.env.registry.identity(target) {
        cache.invalidate(identity);
      }
    }
    for (identity, signature) in output.signatures {
      cache.insert(identity, signature);
    }

    let dynamic_targets = self.apply_discoveries(builder, &output.discoveries)?;

    let config = self.env.builders[builder.index()].config.clone();
    let targets = self.env.graph.targets(builder);
    for &target in &targets {
      let Some(spec) = self.env.registry.spec(target) else {
        continue;
      };
      let mut record = SignatureRecord::new(spec.identity, spec.kind, self.env.registry.signature_of(target), config.clone());
      record.dependencies = dependency_states(self.env, target).into_iter().map(dependency_record).collect();
      record.dynamic_targets = dynamic_targets.clone();
      if let Err(e) = self.env.store.commit(&record) {
        warn!(node = %record.identity, error = %e, "failed to persist signature record; it will be rebuilt next time");
      }
    }

    if output.outcome == BuildOutcome::Unchanged {
      for &target in &targets {
        if let Some(identity) = self.env.registry.identity(target) {
          self.assume_unchanged.insert(identity.clone());
        }
      }
    }
    Ok(output.outcome)
  }

  /// Replace the builder's dynamic graph with what it reported this time.
  fn apply_discoveries(&mut self, builder: BuilderId, found: &Discoveries) -> Result<Vec<NodeSpec>, BuilderError> {
    let name = self.env.builders[builder.index()].name.clone();
    let dynamic = |e: String| BuilderError::Dynamic(e);

    self.env.graph.clear_dynamic(builder);

    for spec in &found.targets {
      let id = self.env.intern_spec(spec).map_err(|e| dynamic(e.to_string()))?;
      self
        .env
        .graph
        .add_dynamic_target(builder, id)
        .map_err(|e| dynamic(self.env.graph_error(e, &name).to_string()))?;
    }

    let targets = self.env.graph.targets(builder);
    for spec in &found.sources {
      let source = self.discovered_source(spec)?;
      for &target in &targets {
        self
          .env
          .graph
          .add_dynamic_edge(target, source)
          .map_err(|e| dynamic(self.env.graph_error(e, &name).to_string()))?;
      }
    }

    for (target, source) in &found.edges {
      let target = self
        .env
        .registry
        .lookup(&target.identity)
        .filter(|t| targets.contains(t))
        .ok_or_else(|| dynamic(format!("{} is not a target of {}", target.identity, name)))?;
      let source = self.discovered_source(source)?;
      self
        .env
        .graph
        .add_dynamic_edge(target, source)
        .map_err(|e| dynamic(self.env.graph_error(e, &name).to_string()))?;
    }

    Ok(found.targets.clone())
  }

  fn discovered_source(&mut self, spec: &NodeSpec) -> Result<NodeId, BuilderError> {
    let id = self
      .env
      .intern_spec(spec)
      .map_err(|e| BuilderError::Dynamic(e.to_string()))?;
    if let Some(producer) = self.env.graph.producer(id)
      && !self.env.graph.is_complete(producer)
    {
      warn!(
        source = %spec.identity,
        producer = self.env.builder_name(producer).unwrap_or("?"),
        "discovered source is built by a builder that has not run; it will be ordered first next time"
      );
    }
    Ok(id)
  }

  fn skip(&mut self, index: usize) {
    self.env.graph.mark_complete(self.prepared.jobs[index].builder);
    self.set_state(index, JobState::Succeeded, TargetStatus::UpToDate);
    self.release(index);
  }

  fn block(&mut self, index: usize, cause: BlockCause) {
    self.env.graph.mark_complete(self.prepared.jobs[index].builder);
    self.set_state(index, JobState::Blocked, TargetStatus::Blocked { cause: cause.clone() });
    self.block_dependents(index, &cause);
  }

  /// Mark every pending transitive dependent of `index` as blocked.
  fn block_dependents(&mut self, index: usize, cause: &BlockCause) {
    let mut stack: Vec<usize> = self.dependents[index].clone();
    while let Some(dependent) = stack.pop() {
      if self.states[dependent] != JobState::Pending {
        continue;
      }
      self.ready.remove(&dependent);
      debug!(builder = %self.prepared.jobs[dependent].name, cause = %cause, "blocked");
      self.set_state(dependent, JobState::Blocked, TargetStatus::Blocked { cause: cause.clone() });
      stack.extend(self.dependents[dependent].iter().copied());
    }
  }

  /// A job finished successfully: count it off for its dependents.
  fn release(&mut self, index: usize) {
    for &dependent in &self.dependents[index] {
      self.remaining[dependent] -= 1;
      if self.remaining[dependent] == 0 && self.states[dependent] == JobState::Pending {
        self.ready.insert(dependent);
      }
    }
  }

  fn set_state(&mut self, index: usize, state: JobState, status: TargetStatus) {
    debug_assert!(!self.states[index].is_terminal());
    self.states[index] = state;
    let builder = self.prepared.jobs[index].builder;
    let mut targets = self.prepared.jobs[index].targets.clone();
    for target in self.env.graph.targets(builder) {
      if !targets.contains(&target) {
        targets.push(target);
      }
    }
    for target in targets {
      self.statuses.insert(target, status.clone());
    }
  }

  fn first_target_name(&self, index: usize) -> String {
    match self.prepared.jobs[index].targets.first() {
      Some(&target) => self.env.node_name(target),
      None => self.prepared.jobs[index].name.clone(),
    }
  }

  fn into_report(self) -> BuildReport {
    let env = &*self.env;
    let mut report = BuildReport {
      dry_run: self.config.dry_run,
      invocations: self.invocations,
      missing: self.prepared.missing.iter().map(|&n| env.node_name(n)).collect(),
      ..BuildReport::default()
    };

    for (&node, status) in &self.statuses {
      report.targets.insert(env.node_name(node), status.clone());
    }

    for &root in &self.prepared.roots {
      let members = env.graph.alias_members(root);
      let statuses: Vec<TargetStatus> = members
        .iter()
        .map(|member| match self.statuses.get(member) {
          Some(status) => status.clone(),
          None if self.prepared.missing.contains(member) => TargetStatus::Blocked {
            cause: BlockCause::MissingSource {
              node: env.node_name(*member),
            },
          },
          None => TargetStatus::UpToDate,
        })
        .collect();
      report.requested.insert(env.node_name(root), TargetStatus::aggregate(&statuses));
    }

    report
  }
}

fn dependency_record(state: crate::state::DependencyState) -> DependencyRecord {
  DependencyRecord {
    identity: state.identity,
    kind: state.kind,
    signature: state.signature,
    dynamic: state.dynamic,
  }
}

/// Run one builder on a blocking worker thread.
///
/// Removes the outputs of the previous run and creates the parent
/// directories of path targets beforehand, then checks afterwards that every
/// declared output exists.
fn run_builder(
  builder: &dyn Builder,
  mut ctx: BuildContext,
  previous: &[NodeSpec],
  static_targets: &[NodeSpec],
  mode: SignatureMode,
) -> Result<WorkerOutput, BuilderError> {
  for spec in previous {
    remove_output(spec)?;
  }
  for spec in static_targets {
    if let Some(parent) = spec.identity.as_path().and_then(|p| p.parent()) {
      std::fs::create_dir_all(parent)?;
    }
  }

  let outcome = match catch_unwind(AssertUnwindSafe(|| builder.build(&mut ctx))) {
    Ok(result) => result?,
    Err(payload) => return Err(BuilderError::Panicked(panic_message(payload.as_ref()))),
  };

  let discoveries = ctx.into_discoveries();
  let mut signatures = Vec::with_capacity(static_targets.len() + discoveries.targets.len());
  for spec in static_targets.iter().chain(&discoveries.targets) {
    let signature = spec_signature(spec, mode);
    if signature.is_none() {
      return Err(BuilderError::MissingOutput(spec.identity.to_string()));
    }
    signatures.push((spec.identity.clone(), signature));
  }

  Ok(WorkerOutput {
    outcome,
    discoveries,
    signatures,
  })
}

fn remove_output(spec: &NodeSpec) -> std::io::Result<()> {
  let Some(path) = spec.identity.as_path() else {
    return Ok(());
  };
  let removed = match spec.kind {
    NodeKind::File if path.is_file() => std::fs::remove_file(path),
    NodeKind::Dir if path.is_dir() => std::fs::remove_dir_all(path),
    _ => return Ok(()),
  };
  match removed {
    Ok(()) => {
      debug!(path = %path.display(), "removed previous output");
      Ok(())
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
