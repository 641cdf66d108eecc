//! Deterministic topological ordering shared by the node and job graphs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;

/// Order `nodes` so that every node comes after all of its dependencies.
///
/// Dependencies outside `nodes` are ignored. Among nodes that are ready at the
/// same time the smallest comes first, so equal inputs always give equal
/// output. On a cycle, returns one offending path whose first and last
/// elements are the same node.
pub(crate) fn kahn<K, F, I>(nodes: &[K], deps: F) -> Result<Vec<K>, Vec<K>>
where
  K: Ord + Hash + Copy,
  F: Fn(K) -> I,
  I: IntoIterator<Item = K>,
{
  let members: HashSet<K> = nodes.iter().copied().collect();
  let mut remaining: HashMap<K, usize> = HashMap::with_capacity(nodes.len());
  let mut dependents: HashMap<K, Vec<K>> = HashMap::new();

  for &node in &members {
    let mut seen = HashSet::new();
    let mut count = 0;
    for dep in deps(node) {
      if members.contains(&dep) && seen.insert(dep) {
        count += 1;
        dependents.entry(dep).or_default().push(node);
      }
    }
    remaining.insert(node, count);
  }

  let mut ready: BinaryHeap<Reverse<K>> = remaining
    .iter()
    .filter(|&(_, &count)| count == 0)
    .map(|(&node, _)| Reverse(node))
    .collect();

  let mut order = Vec::with_capacity(members.len());
  while let Some(Reverse(node)) = ready.pop() {
    order.push(node);
    remaining.remove(&node);
    if let Some(users) = dependents.get(&node) {
      for user in users {
        if let Some(count) = remaining.get_mut(user) {
          *count -= 1;
          if *count == 0 {
            ready.push(Reverse(*user));
          }
        }
      }
    }
  }

  if remaining.is_empty() {
    return Ok(order);
  }

  Err(find_cycle(&remaining, &deps))
}

/// Walk dependencies among the nodes Kahn could not order until one repeats.
///
/// Every such node has at least one unordered dependency, so the walk never
/// gets stuck.
fn find_cycle<K, F, I>(remaining: &HashMap<K, usize>, deps: &F) -> Vec<K>
where
  K: Ord + Hash + Copy,
  F: Fn(K) -> I,
  I: IntoIterator<Item = K>,
{
  let Some(&start) = remaining.keys().min() else {
    return Vec::new();
  };

  let mut path = vec![start];
  let mut position: HashMap<K, usize> = HashMap::from([(start, 0)]);
  let mut current = start;

  loop {
    let next = deps(current).into_iter().filter(|d| remaining.contains_key(d)).min();
    let Some(next) = next else {
      return path;
    };
    if let Some(&at) = position.get(&next) {
      let mut cycle = path.split_off(at);
      cycle.push(next);
      return cycle;
    }
    position.insert(next, path.len());
    path.push(next);
    current = next;
  }
}
