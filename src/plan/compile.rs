//! The compiler/planner: prune a network to a minimal DAG for one request
//! and schedule its steps.

use super::{CompileRequest, Plan, PlanKey, Step};
use crate::config::ExecutionConfig;
use crate::errors::{CompileError, CyclicDependencyError, UnsolvableGraphError};
use crate::modifier::Dep;
use crate::network::{EdgeKind, Network};
use crate::operation::Operation;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiles a network against a request into an executable plan.
///
/// Pruning proceeds in passes: predicate filtering, dropping operations
/// whose provides are all already given as inputs, culling operations with
/// unsatisfied needs to a fixpoint, and (when outputs are asked) dropping
/// operations not on a path to any asked output. The surviving operations
/// are then scheduled topologically with composition-order tie-breaking.
///
/// # Errors
///
/// [`CompileError::Unsolvable`] when an asked output is neither an input
/// nor provided by a surviving operation; [`CompileError::Cycle`] when the
/// data-flow subgraph over the survivors is cyclic.
pub fn compile(
    network: &Network,
    request: &CompileRequest,
    config: &ExecutionConfig,
) -> Result<Plan, CompileError> {
    let all_ops = network.ops();
    let n = all_ops.len();
    let mut alive = vec![true; n];
    let mut comments: HashMap<String, String> = HashMap::new();

    // Pass 1: predicate filter.
    if let Some(pred) = &request.predicate {
        for (i, op) in all_ops.iter().enumerate() {
            if !pred.test(op) {
                alive[i] = false;
                comments.insert(op.name().to_string(), "excluded by predicate".to_string());
            }
        }
    }

    // Pass 2: given intermediates win over recomputation.
    for (i, op) in all_ops.iter().enumerate() {
        if !alive[i] {
            continue;
        }
        let mut provides = op
            .provides()
            .iter()
            .filter(|d| !d.is_sideffect())
            .map(Dep::base)
            .peekable();
        if provides.peek().is_some() && provides.all(|p| request.inputs.contains(p)) {
            alive[i] = false;
            comments.insert(
                op.name().to_string(),
                "all provides already supplied as inputs".to_string(),
            );
            debug!(op = %op.name(), "pruned: provides already given");
        }
    }

    // Pass 3: cull operations with unsatisfied needs, to a fixpoint.
    loop {
        let produced: HashSet<&str> = all_ops
            .iter()
            .enumerate()
            .filter(|(i, _)| alive[*i])
            .flat_map(|(_, op)| {
                op.provides()
                    .iter()
                    .filter(|d| !d.is_sideffect())
                    .map(Dep::base)
            })
            .collect();

        let mut removed = Vec::new();
        for (i, op) in all_ops.iter().enumerate() {
            if !alive[i] {
                continue;
            }
            if let Some(missing) = op
                .required_need_bases()
                .find(|b| !request.inputs.contains(*b) && !produced.contains(b))
            {
                removed.push((i, format!("unsatisfied need '{missing}'")));
            }
        }
        if removed.is_empty() {
            break;
        }
        for (i, reason) in removed {
            alive[i] = false;
            debug!(op = %all_ops[i].name(), %reason, "pruned");
            comments.insert(all_ops[i].name().to_string(), reason);
        }
    }

    // Pass 4: drop operations not on a path to an asked output.
    if !request.outputs.is_empty() {
        let mut needed: HashSet<String> = request.outputs.iter().cloned().collect();
        let mut frontier: Vec<String> = request.outputs.iter().cloned().collect();
        let mut wanted: HashSet<usize> = HashSet::new();

        while let Some(data) = frontier.pop() {
            for (i, op) in all_ops.iter().enumerate() {
                if !alive[i] || wanted.contains(&i) {
                    continue;
                }
                if op.provides().iter().any(|p| p.base() == data) {
                    wanted.insert(i);
                    for need in op.needs() {
                        if needed.insert(need.base().to_string()) {
                            frontier.push(need.base().to_string());
                        }
                    }
                }
            }
        }

        for (i, op) in all_ops.iter().enumerate() {
            if alive[i] && !wanted.contains(&i) {
                alive[i] = false;
                comments.insert(
                    op.name().to_string(),
                    "not needed for asked outputs".to_string(),
                );
                debug!(op = %op.name(), "pruned: not on a path to asked outputs");
            }
        }

        // Every asked output must now be an input or provided by a
        // survivor.
        let produced: HashSet<&str> = all_ops
            .iter()
            .enumerate()
            .filter(|(i, _)| alive[*i])
            .flat_map(|(_, op)| {
                op.provides()
                    .iter()
                    .filter(|d| !d.is_sideffect())
                    .map(Dep::base)
            })
            .collect();
        let missing: Vec<String> = request
            .outputs
            .iter()
            .filter(|o| !request.inputs.contains(*o) && !produced.contains(o.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let pruned = all_ops
                .iter()
                .filter(|op| {
                    comments.contains_key(op.name())
                        && op
                            .provides()
                            .iter()
                            .any(|p| missing.iter().any(|m| m == p.base()))
                })
                .map(|op| format!("{} ({})", op.name(), comments[op.name()]))
                .collect();
            return Err(UnsolvableGraphError {
                outputs: missing,
                pruned,
            }
            .into());
        }
    }

    let survivors: Vec<usize> = (0..n).filter(|&i| alive[i]).collect();

    // An operation both consuming and providing the same real data name is
    // a one-node data cycle.
    for &i in &survivors {
        let op = &all_ops[i];
        let needs: HashSet<&str> = op
            .needs()
            .iter()
            .filter(|d| !d.is_sideffect())
            .map(Dep::base)
            .collect();
        if let Some(dep) = op
            .provides()
            .iter()
            .find(|d| !d.is_sideffect() && needs.contains(d.base()))
        {
            return Err(CyclicDependencyError {
                cycle: vec![
                    op.name().to_string(),
                    dep.base().to_string(),
                    op.name().to_string(),
                ],
            }
            .into());
        }
    }

    // Producer indexes over the survivors.
    let mut flow_producers: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut sfx_producer_idx: HashMap<&str, Vec<usize>> = HashMap::new();
    for &i in &survivors {
        for dep in all_ops[i].provides() {
            if dep.is_sideffect() {
                sfx_producer_idx.entry(dep.base()).or_default().push(i);
            } else {
                flow_producers.entry(dep.base()).or_default().push(i);
            }
        }
    }

    // Operation-level scheduling graph. Flow edges first; the data-flow
    // subgraph must be acyclic.
    let mut graph: DiGraph<usize, EdgeKind> = DiGraph::new();
    let mut node_of: HashMap<usize, NodeIndex> = HashMap::new();
    for &i in &survivors {
        node_of.insert(i, graph.add_node(i));
    }
    let mut edge_seen: HashSet<(usize, usize)> = HashSet::new();
    for &b in &survivors {
        for dep in all_ops[b].needs() {
            if dep.is_sideffect() {
                continue;
            }
            if let Some(producers) = flow_producers.get(dep.base()) {
                for &a in producers {
                    if a != b && edge_seen.insert((a, b)) {
                        graph.add_edge(node_of[&a], node_of[&b], EdgeKind::Flow);
                    }
                }
            }
        }
    }

    if let Some(cycle) = find_cycle(&graph, all_ops) {
        return Err(CyclicDependencyError { cycle }.into());
    }

    // Ordering edges from sideffect tokens. An ordering edge that would
    // close a cycle is an apparent cycle and is skipped.
    for &b in &survivors {
        for dep in all_ops[b].needs() {
            if !dep.is_sideffect() {
                continue;
            }
            if let Some(producers) = sfx_producer_idx.get(dep.base()) {
                for &a in producers {
                    if a == b || edge_seen.contains(&(a, b)) {
                        continue;
                    }
                    if has_path_connecting(&graph, node_of[&b], node_of[&a], None) {
                        warn!(
                            from = %all_ops[a].name(),
                            to = %all_ops[b].name(),
                            token = %dep.base(),
                            "skipping ordering edge that would close a cycle"
                        );
                        continue;
                    }
                    edge_seen.insert((a, b));
                    graph.add_edge(node_of[&a], node_of[&b], EdgeKind::Order);
                }
            }
        }
    }

    // Kahn topological order, ties broken by composition order.
    let mut indegree: HashMap<usize, usize> = survivors
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .neighbors_directed(node_of[&i], Direction::Incoming)
                    .count(),
            )
        })
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&i, _)| Reverse(i))
        .collect();
    let mut topo: Vec<usize> = Vec::with_capacity(survivors.len());
    while let Some(Reverse(i)) = ready.pop() {
        topo.push(i);
        for succ in graph.neighbors_directed(node_of[&i], Direction::Outgoing) {
            let j = graph[succ];
            if let Some(deg) = indegree.get_mut(&j) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(j));
                }
            }
        }
    }
    if topo.len() != survivors.len() {
        // Only reachable through an ordering-edge cycle the break above
        // missed, which construction precludes; report the stragglers.
        let cycle = survivors
            .iter()
            .filter(|&&i| !topo.contains(&i))
            .map(|&i| all_ops[i].name().to_string())
            .collect();
        return Err(CyclicDependencyError { cycle }.into());
    }

    // Dependency layers: longest-path depth over the scheduling graph.
    let mut level: HashMap<usize, usize> = HashMap::new();
    for &i in &topo {
        let depth = graph
            .neighbors_directed(node_of[&i], Direction::Incoming)
            .map(|pred| level[&graph[pred]] + 1)
            .max()
            .unwrap_or(0);
        level.insert(i, depth);
    }
    let layer_count = topo.iter().map(|i| level[i] + 1).max().unwrap_or(0);
    let mut layers: Vec<Vec<String>> = vec![Vec::new(); layer_count];
    for &i in &topo {
        layers[level[&i]].push(all_ops[i].name().to_string());
    }

    // Eviction placement: after the last consumer of every non-asked,
    // non-sideffect data name. Only meaningful when outputs were asked;
    // with an open request every produced value is wanted.
    let mut evict_after: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut layer_evictions: Vec<Vec<String>> = vec![Vec::new(); layer_count];
    if !config.skip_evictions && !request.outputs.is_empty() {
        let mut last_use: BTreeMap<&str, usize> = BTreeMap::new();
        for (pos, &i) in topo.iter().enumerate() {
            for dep in all_ops[i].needs() {
                if !dep.is_sideffect() && !request.outputs.contains(dep.base()) {
                    last_use.insert(dep.base(), pos);
                }
            }
        }
        for (data, pos) in last_use {
            evict_after
                .entry(pos)
                .or_default()
                .push(data.to_string());
            layer_evictions[level[&topo[pos]]].push(data.to_string());
        }
    }

    let mut steps = Vec::with_capacity(topo.len() + evict_after.len());
    for (pos, &i) in topo.iter().enumerate() {
        steps.push(Step::Compute(all_ops[i].name().to_string()));
        if let Some(evictions) = evict_after.get(&pos) {
            steps.extend(evictions.iter().cloned().map(Step::Evict));
        }
    }

    // Direct successor map for failure cancellation.
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    for edge in graph.edge_indices() {
        if let Some((a, b)) = graph.edge_endpoints(edge) {
            successors
                .entry(all_ops[graph[a]].name().to_string())
                .or_default()
                .push(all_ops[graph[b]].name().to_string());
        }
    }

    let sfx_producers = sfx_producer_idx
        .into_iter()
        .map(|(token, idxs)| {
            (
                token.to_string(),
                idxs.into_iter()
                    .map(|i| all_ops[i].name().to_string())
                    .collect(),
            )
        })
        .collect();

    let ops = survivors.iter().map(|&i| all_ops[i].clone()).collect();

    Ok(Plan {
        key: PlanKey::derive(network.uid(), request),
        network_uid: network.uid(),
        ops,
        steps,
        layers,
        layer_evictions,
        asked_outs: request.outputs.clone(),
        known_inputs: request.inputs.clone(),
        predicate: request.predicate.clone(),
        comments,
        successors,
        sfx_producers,
    })
}

/// Recovers a readable cycle path from the data-flow subgraph, if any.
fn find_cycle(graph: &DiGraph<usize, EdgeKind>, all_ops: &[Arc<Operation>]) -> Option<Vec<String>> {
    for scc in tarjan_scc(graph) {
        if scc.len() > 1 {
            let mut cycle: Vec<String> = scc
                .iter()
                .rev()
                .map(|&node| all_ops[graph[node]].name().to_string())
                .collect();
            let first = cycle[0].clone();
            cycle.push(first);
            return Some(cycle);
        }
    }
    None
}
