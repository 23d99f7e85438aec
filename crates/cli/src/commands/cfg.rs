//! `shroud cfg`: Graphviz export of one function's control-flow graph.

use super::CliError;
use async_trait::async_trait;
use clap::Args;
use iced_x86::{Formatter, IntelFormatter};
use shroud_core::cfg_ir::{BlockKind, EdgeKind, Function};
use shroud_core::decoder::read_object;
use shroud_utils::errors::ConfigError;
use std::fmt::Write;
use std::fs;
use std::path::PathBuf;

/// Arguments of `shroud cfg`.
#[derive(Args)]
pub struct CfgArgs {
    /// ELF relocatable object
    pub input: PathBuf,

    /// Function to draw (default: every function, one cluster each)
    #[arg(short, long)]
    pub function: Option<String>,

    /// Output file for Graphviz .dot (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[async_trait]
impl super::Command for CfgArgs {
    async fn execute(self) -> Result<(), CliError> {
        let (module, _) = read_object(&self.input)?;
        let functions: Vec<&Function> = match &self.function {
            Some(name) => {
                let id = module
                    .function_by_name(name)
                    .ok_or_else(|| ConfigError::Invalid(format!("no function named `{name}`")))?;
                vec![module.function(id)]
            }
            None => module.functions.iter().collect(),
        };

        let dot = generate_dot(&functions);
        if let Some(out_path) = self.output {
            fs::write(out_path, &dot)?;
        } else {
            println!("{dot}");
        }
        Ok(())
    }
}

/// Graphviz source for `functions`, one cluster per function.
pub fn generate_dot(functions: &[&Function]) -> String {
    let mut formatter = IntelFormatter::new();
    let mut dot = String::from("digraph CFG {\n    node [shape=box, fontname=monospace];\n");

    for (index, function) in functions.iter().enumerate() {
        let cfg = function.to_graph();
        let reachable = function.reachable();
        let _ = writeln!(dot, "    subgraph cluster_{index} {{\n        label=\"{}\";", escape(&function.name));

        for node in cfg.graph.node_indices() {
            let id = cfg.graph[node];
            let block = function.block(id);
            let mut label = format!("{id} ({:?})", block.kind);
            let mut text = String::new();
            for insn in block.instructions.iter().chain(block.terminator.instruction()) {
                text.clear();
                formatter.format(insn.insn(), &mut text);
                label.push_str("\\l");
                label.push_str(&escape(&text));
            }
            label.push_str("\\l");
            let style = match block.kind {
                _ if !reachable[id.0] => ", style=dashed",
                BlockKind::Dead => ", color=gray",
                BlockKind::Guard | BlockKind::Dispatch => ", color=blue",
                _ => "",
            };
            let _ = writeln!(dot, "        f{index}_{} [label=\"{label}\"{style}];", id.0);
        }

        for edge in cfg.graph.edge_indices() {
            let Some((src, dst)) = cfg.graph.edge_endpoints(edge) else {
                continue;
            };
            let label = match cfg.graph[edge] {
                EdgeKind::Fallthrough => "Fallthrough",
                EdgeKind::Jump => "Jump",
                EdgeKind::Taken => "Taken",
            };
            let _ = writeln!(
                dot,
                "        f{index}_{} -> f{index}_{} [label=\"{label}\"];",
                cfg.graph[src].0,
                cfg.graph[dst].0
            );
        }
        dot.push_str("    }\n");
    }

    dot.push_str("}\n");
    dot
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::add_object;

    #[test]
    fn one_cluster_per_function() {
        let module = shroud_core::decode_object(&add_object()).unwrap();
        let functions: Vec<&Function> = module.functions.iter().collect();
        let dot = generate_dot(&functions);
        assert!(dot.starts_with("digraph CFG {"));
        assert!(dot.contains("subgraph cluster_0"));
        assert!(dot.contains("label=\"add\""));
        assert!(dot.contains("f0_0 [label=\"bb0 (Original)"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
