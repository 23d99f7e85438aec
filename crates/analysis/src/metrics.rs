//! Analytical metrics used to judge an obfuscated module against its input.
//!
//! Metrics are quantified per function by block and edge counts, cyclomatic
//! complexity and dominator overlap, and rolled up into a module summary with
//! a composite potency score. Code size comes from the emitter layout, so the
//! caller passes it in.
//!
//! # Usage
//! ```rust,ignore
//! let module = shroud_core::decode_object(&bytes)?;
//! let size = shroud_core::measure(&module)?;
//! let metrics = metrics::collect_metrics(&module, size)?;
//! println!("{}", serde_json::to_string_pretty(&metrics)?);
//! ```
use indexmap::IndexMap;
use petgraph::{
    algo::dominators::simple_fast,
    graph::{DiGraph, NodeIndex},
    visit::Reversed,
};
use serde::{Deserialize, Serialize};
use shroud_core::cfg_ir::{CfgGraph, EdgeKind, Function};
use shroud_core::module::Module;
use shroud_utils::errors::MetricsError;
use std::collections::HashMap;

/// Metrics of one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetrics {
    /// Reachable blocks.
    pub blocks: usize,
    /// Intra-function edges between reachable blocks.
    pub edges: usize,
    /// `E - N + 2`.
    pub cyclomatic: i64,
    /// Laid-out instructions, terminators included.
    pub instructions: usize,
    /// Fraction of blocks that are the immediate post-dominator of their own
    /// immediate dominator, i.e. that always run together with it.
    pub dom_overlap: f64,
}

/// Module-wide metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Bytes of code produced by the emitter layout.
    pub code_size: u64,
    /// Blocks in the emission layout.
    pub block_cnt: usize,
    /// CFG edges between laid-out blocks.
    pub edge_cnt: usize,
    /// Sum of per-function cyclomatic complexity.
    pub cyclomatic: i64,
    /// Instructions, terminators included.
    pub instruction_cnt: usize,
    /// Composite potency score (heuristic based on nodes, edges, and overlap).
    pub potency: f64,
    /// Per-function breakdown, keyed by function name.
    pub functions: IndexMap<String, FunctionMetrics>,
}

/// Differences between two [`Metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDelta {
    /// Change in total cyclomatic complexity.
    pub cyclomatic: i64,
    /// Change in instruction count.
    pub instructions: i64,
    /// Change in code bytes.
    pub code_size: i64,
    /// Code size growth in percent of the original size.
    pub size_growth_pct: f64,
    /// Potency gained, penalized by size growth.
    pub score: f64,
}

/// Collects metrics for every function of `module`.
///
/// Returns [`MetricsError::EmptyModule`] when the module has no functions and
/// [`MetricsError::NoBlocks`] when a function has no reachable block.
pub fn collect_metrics(module: &Module, code_size: u64) -> Result<Metrics, MetricsError> {
    if module.functions.is_empty() {
        return Err(MetricsError::EmptyModule);
    }

    let mut metrics = Metrics {
        code_size,
        ..Metrics::default()
    };
    let mut overlap_sum = 0.0;
    for function in &module.functions {
        let m = function_metrics(function)?;
        metrics.block_cnt += m.blocks;
        metrics.edge_cnt += m.edges;
        metrics.cyclomatic += m.cyclomatic;
        metrics.instruction_cnt += m.instructions;
        overlap_sum += m.dom_overlap;
        metrics.functions.insert(function.name.clone(), m);
    }
    let overlap = overlap_sum / module.functions.len() as f64;
    metrics.potency = score(overlap, metrics.block_cnt, metrics.edge_cnt);
    Ok(metrics)
}

/// Metrics of a single function.
pub fn function_metrics(function: &Function) -> Result<FunctionMetrics, MetricsError> {
    let reachable = function.reachable();
    let blocks = reachable.count_ones();
    if blocks == 0 {
        return Err(MetricsError::NoBlocks(function.name.clone()));
    }
    let graph = function.to_graph();
    let edges = graph.graph.edge_count();
    Ok(FunctionMetrics {
        blocks,
        edges,
        cyclomatic: edges as i64 - blocks as i64 + 2,
        instructions: function.instruction_count(),
        dom_overlap: dom_overlap(&graph, function),
    })
}

type DominatorMap = HashMap<NodeIndex, NodeIndex>;

/// Computes immediate dominators from the entry and immediate post-dominators
/// towards a virtual exit joined to every exiting block.
fn dominator_pairs(cfg: &CfgGraph, function: &Function) -> (DominatorMap, DominatorMap) {
    let entry = cfg.nodes[function.entry.0];
    let doms = simple_fast(&cfg.graph, entry);
    let mut dom_map = HashMap::new();
    for n in cfg.graph.node_indices() {
        if let Some(idom) = doms.immediate_dominator(n) {
            dom_map.insert(n, idom);
        }
    }

    let mut with_exit: DiGraph<Option<usize>, EdgeKind> = cfg.graph.map(|_, b| Some(b.0), |_, e| *e);
    let exit = with_exit.add_node(None);
    for block in &function.blocks {
        if block.terminator.exits() {
            with_exit.add_edge(cfg.nodes[block.id.0], exit, EdgeKind::Jump);
        }
    }
    let post = simple_fast(Reversed(&with_exit), exit);
    let mut pdom_map = HashMap::new();
    for n in cfg.graph.node_indices() {
        if let Some(ipdom) = post.immediate_dominator(n) {
            if ipdom != exit {
                pdom_map.insert(n, ipdom);
            }
        }
    }

    (dom_map, pdom_map)
}

/// Fraction of dominated nodes that also post-dominate their immediate
/// dominator. A higher overlap suggests a more linear CFG.
fn dom_overlap(cfg: &CfgGraph, function: &Function) -> f64 {
    let (doms, pdoms) = dominator_pairs(cfg, function);
    let common = doms
        .iter()
        .filter(|(n, d)| pdoms.get(*d) == Some(*n))
        .count();
    if doms.is_empty() {
        0.0
    } else {
        common as f64 / doms.len() as f64
    }
}

/// Combines block count, edge count, and dominator overlap into a heuristic
/// estimate of analyst effort.
fn score(overlap: f64, nodes: usize, edges: usize) -> f64 {
    5.0 * (nodes.max(1) as f64).log2() + edges as f64 + 30.0 * (1.0 - overlap)
}

/// Compares metrics before and after obfuscation.
pub fn compare(before: &Metrics, after: &Metrics) -> MetricsDelta {
    let code_size = after.code_size as i64 - before.code_size as i64;
    let size_growth_pct = if before.code_size == 0 {
        0.0
    } else {
        code_size as f64 * 100.0 / before.code_size as f64
    };
    MetricsDelta {
        cyclomatic: after.cyclomatic - before.cyclomatic,
        instructions: after.instruction_cnt as i64 - before.instruction_cnt as i64,
        code_size,
        size_growth_pct,
        score: after.potency - before.potency - 0.25 * code_size as f64,
    }
}
