//! Dependency graph between nodes and the builders producing them.
//!
//! Edges point from a dependent node to the node it depends on (target to
//! source, alias to member) and are tagged with whether they were declared
//! up front or discovered while building. Each node has at most one
//! producing builder.

mod order;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

use crate::node::NodeId;

pub(crate) use order::kahn;

/// Handle to a registered builder, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuilderId(pub(crate) usize);

impl BuilderId {
  pub fn index(self) -> usize {
    self.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
  Static,
  Dynamic,
}

/// Structural errors, reported by id and translated into
/// [`ConfigError`](crate::error::ConfigError) by the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("node {node:?} is already produced by builder {existing:?}")]
  DuplicateProducer { node: NodeId, existing: BuilderId },

  #[error("builder declares no targets")]
  NoTargets,

  #[error("producer of {0:?} has already completed")]
  BuilderComplete(NodeId),

  #[error("unknown builder {0:?}")]
  UnknownBuilder(BuilderId),
}

/// A cycle among nodes, as a path whose first and last node coincide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
  pub path: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
struct BuilderSlot {
  static_targets: Vec<NodeId>,
  dynamic_targets: Vec<NodeId>,
  sources: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
  graph: DiGraph<NodeId, EdgeKind>,
  producers: HashMap<NodeId, BuilderId>,
  builders: Vec<BuilderSlot>,
  aliases: HashSet<NodeId>,
  complete: HashSet<BuilderId>,
}

fn ix(node: NodeId) -> NodeIndex {
  NodeIndex::new(node.0)
}

impl DependencyGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make sure `node` has a graph slot. Graph indices mirror node ids.
  pub fn add_node(&mut self, node: NodeId) {
    while self.graph.node_count() <= node.0 {
      let next = NodeId(self.graph.node_count());
      self.graph.add_node(next);
    }
  }

  fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
    self.add_node(from);
    self.add_node(to);
    if self.graph.find_edge(ix(from), ix(to)).is_some() {
      return false;
    }
    self.graph.add_edge(ix(from), ix(to), kind);
    true
  }

  /// Record a builder producing `targets` from `sources`.
  pub fn register(&mut self, targets: &[NodeId], sources: &[NodeId]) -> Result<BuilderId, GraphError> {
    if targets.is_empty() {
      return Err(GraphError::NoTargets);
    }
    for target in targets {
      if let Some(&existing) = self.producers.get(target) {
        return Err(GraphError::DuplicateProducer { node: *target, existing });
      }
    }

    let id = BuilderId(self.builders.len());
    let mut slot = BuilderSlot::default();
    for &target in targets {
      if !slot.static_targets.contains(&target) {
        slot.static_targets.push(target);
      }
      self.producers.insert(target, id);
      self.add_node(target);
      for &source in sources {
        self.add_edge(target, source, EdgeKind::Static);
      }
    }
    for &source in sources {
      self.add_node(source);
      if !slot.sources.contains(&source) {
        slot.sources.push(source);
      }
    }
    self.builders.push(slot);
    Ok(id)
  }

  /// Replace the members of an alias node.
  pub fn set_alias_members(&mut self, alias: NodeId, members: &[NodeId]) {
    self.add_node(alias);
    self.aliases.insert(alias);
    self.graph.retain_edges(|g, e| g.edge_endpoints(e).is_none_or(|(from, _)| from != ix(alias)));
    for &member in members {
      self.add_edge(alias, member, EdgeKind::Static);
    }
  }

  pub fn is_alias(&self, node: NodeId) -> bool {
    self.aliases.contains(&node)
  }

  /// Record a dependency discovered while building `target`.
  ///
  /// Returns whether the edge is new.
  pub fn add_dynamic_edge(&mut self, target: NodeId, source: NodeId) -> Result<bool, GraphError> {
    if let Some(builder) = self.producers.get(&target)
      && self.complete.contains(builder)
    {
      return Err(GraphError::BuilderComplete(target));
    }
    Ok(self.add_edge(target, source, EdgeKind::Dynamic))
  }

  /// Record an output of `builder` discovered while it ran.
  ///
  /// The new target depends on the builder's static sources.
  pub fn add_dynamic_target(&mut self, builder: BuilderId, node: NodeId) -> Result<(), GraphError> {
    if builder.0 >= self.builders.len() {
      return Err(GraphError::UnknownBuilder(builder));
    }
    if self.complete.contains(&builder) {
      return Err(GraphError::BuilderComplete(node));
    }
    match self.producers.get(&node) {
      Some(&existing) if existing == builder => return Ok(()),
      Some(&existing) => return Err(GraphError::DuplicateProducer { node, existing }),
      None => {}
    }

    self.producers.insert(node, builder);
    self.add_node(node);
    let slot = &mut self.builders[builder.0];
    slot.dynamic_targets.push(node);
    let sources = slot.sources.clone();
    for source in sources {
      self.add_edge(node, source, EdgeKind::Dynamic);
    }
    Ok(())
  }

  /// Forget every dynamic target of `builder` and every dynamic edge leaving
  /// one of its targets, ready for a fresh set of discoveries.
  pub fn clear_dynamic(&mut self, builder: BuilderId) {
    let Some(slot) = self.builders.get_mut(builder.0) else {
      return;
    };
    let dynamic_targets = std::mem::take(&mut slot.dynamic_targets);
    for node in &dynamic_targets {
      self.producers.remove(node);
    }

    let mut owned: HashSet<NodeIndex> = slot.static_targets.iter().map(|&t| ix(t)).collect();
    owned.extend(dynamic_targets.iter().map(|&t| ix(t)));

    self.graph.retain_edges(|g, e| {
      let dynamic = g[e] == EdgeKind::Dynamic;
      let from_owned = g.edge_endpoints(e).is_some_and(|(from, _)| owned.contains(&from));
      !(dynamic && from_owned)
    });
  }

  pub fn mark_complete(&mut self, builder: BuilderId) {
    self.complete.insert(builder);
  }

  pub fn is_complete(&self, builder: BuilderId) -> bool {
    self.complete.contains(&builder)
  }

  /// Reopen every builder for dynamic declarations.
  pub fn begin_run(&mut self) {
    self.complete.clear();
  }

  pub fn producer(&self, node: NodeId) -> Option<BuilderId> {
    self.producers.get(&node).copied()
  }

  pub fn builder_count(&self) -> usize {
    self.builders.len()
  }

  pub fn builder_ids(&self) -> impl Iterator<Item = BuilderId> + '_ {
    (0..self.builders.len()).map(BuilderId)
  }

  pub fn static_targets(&self, builder: BuilderId) -> &[NodeId] {
    self.builders.get(builder.0).map(|s| s.static_targets.as_slice()).unwrap_or_default()
  }

  pub fn dynamic_targets(&self, builder: BuilderId) -> &[NodeId] {
    self.builders.get(builder.0).map(|s| s.dynamic_targets.as_slice()).unwrap_or_default()
  }

  /// Static targets followed by dynamic ones.
  pub fn targets(&self, builder: BuilderId) -> Vec<NodeId> {
    let mut targets = self.static_targets(builder).to_vec();
    targets.extend_from_slice(self.dynamic_targets(builder));
    targets
  }

  pub fn static_sources(&self, builder: BuilderId) -> &[NodeId] {
    self.builders.get(builder.0).map(|s| s.sources.as_slice()).unwrap_or_default()
  }

  /// Direct dependencies of `node`, sorted by id.
  pub fn dependencies(&self, node: NodeId) -> Vec<(NodeId, EdgeKind)> {
    if node.0 >= self.graph.node_count() {
      return Vec::new();
    }
    let mut deps: Vec<(NodeId, EdgeKind)> = self
      .graph
      .edges_directed(ix(node), Direction::Outgoing)
      .map(|e| (self.graph[e.target()], *e.weight()))
      .collect();
    deps.sort_by_key(|(id, _)| *id);
    deps
  }

  /// Direct dependents of `node`, sorted by id.
  pub fn dependents(&self, node: NodeId) -> Vec<NodeId> {
    if node.0 >= self.graph.node_count() {
      return Vec::new();
    }
    let mut users: Vec<NodeId> = self
      .graph
      .neighbors_directed(ix(node), Direction::Incoming)
      .map(|n| self.graph[n])
      .collect();
    users.sort();
    users
  }

  /// Dependencies of `node` with aliases replaced by their members,
  /// transitively. The edge kind of the alias edge is kept.
  pub fn expanded_dependencies(&self, node: NodeId) -> Vec<(NodeId, EdgeKind)> {
    let mut out: Vec<(NodeId, EdgeKind)> = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<(NodeId, EdgeKind)> = self.dependencies(node).into();
    while let Some((dep, kind)) = queue.pop_front() {
      if !seen.insert(dep) {
        continue;
      }
      if self.is_alias(dep) {
        queue.extend(self.dependencies(dep).into_iter().map(|(m, _)| (m, kind)));
      } else {
        out.push((dep, kind));
      }
    }
    out.sort_by_key(|(id, _)| *id);
    out
  }

  /// Members of an alias, expanded transitively to non-alias nodes.
  pub fn alias_members(&self, alias: NodeId) -> Vec<NodeId> {
    if !self.is_alias(alias) {
      return vec![alias];
    }
    self.expanded_dependencies(alias).into_iter().map(|(n, _)| n).collect()
  }

  /// Everything needed to bring `roots` up to date.
  ///
  /// Follows static and dynamic edges, and pulls in every target of a
  /// builder as soon as one of its targets is in the set.
  pub fn closure(&self, roots: &[NodeId]) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
      if !seen.insert(node) {
        continue;
      }
      queue.extend(self.dependencies(node).into_iter().map(|(d, _)| d));
      if let Some(builder) = self.producer(node) {
        queue.extend(self.targets(builder));
      }
    }
    seen
  }

  /// Order `nodes` dependencies first, smallest id first among equals.
  pub fn topo_order(&self, nodes: &BTreeSet<NodeId>) -> Result<Vec<NodeId>, CycleError> {
    let nodes: Vec<NodeId> = nodes.iter().copied().collect();
    kahn(&nodes, |n| self.dependencies(n).into_iter().map(|(d, _)| d)).map_err(|path| CycleError { path })
  }
}
