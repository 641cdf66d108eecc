//! Turning a set of requested nodes into an ordered list of builder jobs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::environment::Environment;
use crate::graph::{BuilderId, EdgeKind, kahn};
use crate::node::{NodeId, NodeKind, NodeSpec};
use crate::state::{DependencyState, SignatureRecord, StaleReason, direct_staleness};

use super::types::ExecuteError;

/// One builder invocation candidate.
#[derive(Debug, Clone)]
pub struct Job {
  pub builder: BuilderId,
  pub name: String,
  /// Static targets, then dynamic targets known before the build.
  pub targets: Vec<NodeId>,
  /// Jobs (indices into [`PreparedBuild::jobs`]) that must finish first.
  pub deps: Vec<usize>,
  /// Declared sources that do not exist and that nothing builds.
  pub missing: Vec<NodeId>,
  pub stale: Option<StaleReason>,
}

/// Result of the construction-only pass.
#[derive(Debug, Clone)]
pub struct PreparedBuild {
  pub(crate) roots: Vec<NodeId>,
  pub(crate) closure: BTreeSet<NodeId>,
  pub(crate) order: Vec<NodeId>,
  pub(crate) jobs: Vec<Job>,
  pub(crate) job_of: HashMap<BuilderId, usize>,
  pub(crate) stale: BTreeMap<NodeId, StaleReason>,
  pub(crate) missing: Vec<NodeId>,
  pub(crate) records: HashMap<NodeId, SignatureRecord>,
}

impl PreparedBuild {
  pub fn roots(&self) -> &[NodeId] {
    &self.roots
  }

  /// Every node involved, including recorded dynamic targets and edges.
  pub fn closure(&self) -> &BTreeSet<NodeId> {
    &self.closure
  }

  /// The closure ordered dependencies first.
  pub fn order(&self) -> &[NodeId] {
    &self.order
  }

  /// Jobs ordered so that every job follows the jobs it depends on.
  pub fn jobs(&self) -> &[Job] {
    &self.jobs
  }

  pub fn job_for(&self, builder: BuilderId) -> Option<&Job> {
    self.job_of.get(&builder).map(|&i| &self.jobs[i])
  }

  pub fn stale_reason(&self, node: NodeId) -> Option<&StaleReason> {
    self.stale.get(&node)
  }

  pub fn is_stale(&self, node: NodeId) -> bool {
    self.stale.contains_key(&node)
  }

  pub fn stale_nodes(&self) -> impl Iterator<Item = (NodeId, &StaleReason)> {
    self.stale.iter().map(|(&n, r)| (n, r))
  }

  pub fn missing(&self) -> &[NodeId] {
    &self.missing
  }

  pub fn record(&self, node: NodeId) -> Option<&SignatureRecord> {
    self.records.get(&node)
  }
}

/// Current state of the dependencies of `node`, aliases expanded.
pub(crate) fn dependency_states(env: &Environment, node: NodeId) -> Vec<DependencyState> {
  env
    .graph
    .expanded_dependencies(node)
    .into_iter()
    .filter_map(|(dep, edge)| {
      let spec = env.registry.spec(dep)?;
      Some(DependencyState {
        identity: spec.identity,
        kind: spec.kind,
        signature: env.registry.signature_of(dep),
        dynamic: edge == EdgeKind::Dynamic,
      })
    })
    .collect()
}

/// Re-add dynamic targets and edges recorded by earlier runs for every
/// builder reachable from `roots`, until nothing new turns up.
fn hydrate(env: &mut Environment, roots: &[NodeId], cache: &mut RecordCache) {
  let mut hydrated: HashSet<BuilderId> = HashSet::new();

  loop {
    let closure = env.graph.closure(roots);
    let pending: BTreeSet<BuilderId> = closure
      .iter()
      .filter_map(|&n| env.graph.producer(n))
      .filter(|b| !hydrated.contains(b))
      .collect();
    let unloaded: Vec<NodeId> = closure
      .iter()
      .copied()
      .filter(|n| env.graph.producer(*n).is_some() && !cache.loaded.contains(n))
      .collect();
    if pending.is_empty() && unloaded.is_empty() {
      return;
    }

    for builder in pending {
      hydrated.insert(builder);
      let anchors: Vec<NodeId> = env.graph.static_targets(builder).to_vec();
      for anchor in anchors {
        let Some(record) = cache.load(env, anchor) else {
          continue;
        };
        for spec in &record.dynamic_targets {
          let added = env
            .intern_spec(spec)
            .map_err(|e| e.to_string())
            .and_then(|id| env.graph.add_dynamic_target(builder, id).map_err(|e| e.to_string()));
          if let Err(e) = added {
            warn!(node = %spec.identity, error = %e, "dropping recorded dynamic target");
          }
        }
      }
    }

    for node in unloaded {
      let Some(record) = cache.load(env, node) else {
        continue;
      };
      for dep in record.dynamic_dependencies() {
        let spec = NodeSpec {
          identity: dep.identity.clone(),
          kind: dep.kind,
        };
        let added = env
          .intern_spec(&spec)
          .map_err(|e| e.to_string())
          .and_then(|id| env.graph.add_dynamic_edge(node, id).map_err(|e| e.to_string()));
        if let Err(e) = added {
          warn!(node = %dep.identity, error = %e, "dropping recorded dynamic dependency");
        }
      }
    }
  }
}

/// Records read so far in one pass.
struct RecordCache {
  readable: bool,
  loaded: HashSet<NodeId>,
  records: HashMap<NodeId, SignatureRecord>,
}

impl RecordCache {
  fn load(&mut self, env: &Environment, node: NodeId) -> Option<SignatureRecord> {
    if self.loaded.insert(node) && self.readable {
      let identity = env.registry.identity(node)?;
      if let Some(record) = env.store.lookup(identity) {
        self.records.insert(node, record);
      }
    }
    self.records.get(&node).cloned()
  }
}

/// Run the construction-only pass for `roots`.
pub fn prepare(env: &mut Environment, roots: &[NodeId]) -> Result<PreparedBuild, ExecuteError> {
  prepare_with(env, roots, true)
}

/// Like [`prepare`]; with `records_readable` false every record is treated
/// as absent and everything in the closure is stale.
pub(crate) fn prepare_with(
  env: &mut Environment,
  roots: &[NodeId],
  records_readable: bool,
) -> Result<PreparedBuild, ExecuteError> {
  env.graph.begin_run();
  env.registry.cache().clear();

  let mut cache = RecordCache {
    readable: records_readable,
    loaded: HashSet::new(),
    records: HashMap::new(),
  };
  hydrate(env, roots, &mut cache);
  let records = cache.records;

  let closure = env.graph.closure(roots);
  let order = env.topo_order(&closure)?;

  // One job per builder with a target in the closure, in registration order
  // for now; reordered below.
  let builders: BTreeSet<BuilderId> = closure.iter().filter_map(|&n| env.graph.producer(n)).collect();
  let builders: Vec<BuilderId> = builders.into_iter().collect();

  let mut builder_deps: HashMap<BuilderId, BTreeSet<BuilderId>> = HashMap::new();
  let mut builder_missing: HashMap<BuilderId, BTreeSet<NodeId>> = HashMap::new();
  for &builder in &builders {
    let deps = builder_deps.entry(builder).or_default();
    let missing = builder_missing.entry(builder).or_default();
    for target in env.graph.targets(builder) {
      for (dep, edge) in env.graph.expanded_dependencies(target) {
        match env.graph.producer(dep) {
          Some(producer) if producer != builder => {
            deps.insert(producer);
          }
          Some(_) => {}
          None => {
            if edge == EdgeKind::Static
              && env.registry.kind(dep).is_some_and(|k| k.is_path())
              && env.registry.signature_of(dep).is_none()
            {
              missing.insert(dep);
            }
          }
        }
      }
    }
  }

  let job_order = kahn(&builders, |b| builder_deps.get(&b).into_iter().flatten().copied()).map_err(|cycle| {
    ExecuteError::CycleDetected {
      path: cycle
        .iter()
        .map(|b| env.builder_name(*b).unwrap_or("?").to_string())
        .collect(),
    }
  })?;

  let job_of: HashMap<BuilderId, usize> = job_order.iter().enumerate().map(|(i, &b)| (b, i)).collect();

  // Direct staleness per target.
  let mut stale: BTreeMap<NodeId, StaleReason> = BTreeMap::new();
  for &builder in &job_order {
    let config = env.builders[builder.index()].config.clone();
    for target in env.graph.targets(builder) {
      let record = records.get(&target);
      let kind = env.registry.kind(target).unwrap_or(NodeKind::File);
      let current = env.registry.signature_of(target);
      let deps = dependency_states(env, target);
      if let Some(reason) = direct_staleness(record, kind, current.as_ref(), &config, &deps, &HashSet::new()) {
        stale.insert(target, reason);
      }
    }
  }

  // Propagate along jobs: a job is stale if one of its targets is, or if a
  // job it depends on is.
  let mut jobs: Vec<Job> = Vec::with_capacity(job_order.len());
  for &builder in &job_order {
    let targets = env.graph.targets(builder);
    let mut reason = targets.iter().find_map(|t| stale.get(t).cloned());

    if reason.is_none() {
      'deps: for &target in &targets {
        for (dep, _) in env.graph.expanded_dependencies(target) {
          if let Some(producer) = env.graph.producer(dep)
            && producer != builder
            && jobs[job_of[&producer]].stale.is_some()
          {
            reason = Some(StaleReason::DependencyStale(env.node_name(dep)));
            break 'deps;
          }
        }
      }
    }

    if let Some(reason) = &reason {
      for &target in &targets {
        stale.entry(target).or_insert_with(|| reason.clone());
      }
      debug!(builder = %env.builders[builder.index()].name, reason = %reason, "stale");
    }

    let deps: Vec<usize> = builder_deps
      .get(&builder)
      .into_iter()
      .flatten()
      .map(|b| job_of[b])
      .collect();

    jobs.push(Job {
      builder,
      name: env.builders[builder.index()].name.clone(),
      targets,
      deps,
      missing: builder_missing.remove(&builder).unwrap_or_default().into_iter().collect(),
      stale: reason,
    });
  }

  let missing: Vec<NodeId> = jobs
    .iter()
    .flat_map(|j| j.missing.iter().copied())
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect();

  // Requested source files that nothing builds must exist too.
  let mut missing = missing;
  for &root in roots {
    for member in env.graph.alias_members(root) {
      if env.graph.producer(member).is_none()
        && env.registry.kind(member).is_some_and(|k| k.is_path())
        && env.registry.signature_of(member).is_none()
        && !missing.contains(&member)
      {
        missing.push(member);
      }
    }
  }
  missing.sort();

  debug!(
    nodes = closure.len(),
    jobs = jobs.len(),
    stale = stale.len(),
    missing = missing.len(),
    "prepared build"
  );

  Ok(PreparedBuild {
    roots: roots.to_vec(),
    closure,
    order,
    jobs,
    job_of,
    stale,
    missing,
    records,
  })
}
