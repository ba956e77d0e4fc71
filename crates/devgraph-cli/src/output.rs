//! Rendering of command results as text or JSON.

use crate::demo::Demo;
use anyhow::Result;
use devgraph_runtime::{ConcurrencyPlan, ExecutionReport};
use serde::Serialize;
use std::fmt::Write as _;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format '{other}'. Expected one of: text, json")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Serialize)]
struct PlanView<'a> {
    graph: String,
    nodes: usize,
    memory_validated: bool,
    groups: Vec<Vec<GroupNode<'a>>>,
    concurrency_list: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GroupNode<'a> {
    node: usize,
    op: &'a str,
    dst: &'a str,
}

/// Render the plan computed for `demo`.
pub fn render_plan(demo: &Demo, plan: &ConcurrencyPlan, format: OutputFormat) -> Result<String> {
    let nodes = demo.graph.nodes();
    let view = PlanView {
        graph: demo.kind.to_string(),
        nodes: plan.node_count(),
        memory_validated: plan.memory_validated(),
        groups: plan
            .groups()
            .iter()
            .map(|g| {
                g.nodes()
                    .iter()
                    .map(|&i| GroupNode {
                        node: i,
                        op: nodes[i].op.name(),
                        dst: &nodes[i].dst.name,
                    })
                    .collect()
            })
            .collect(),
        concurrency_list: plan.concurrency_list().iter().map(ToString::to_string).collect(),
    };
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => {
            let mut out = String::new();
            writeln!(
                out,
                "{} graph: {} nodes in {} groups (memory validation {})",
                view.graph,
                view.nodes,
                view.groups.len(),
                if view.memory_validated { "on" } else { "off" }
            )?;
            for (i, group) in view.groups.iter().enumerate() {
                let members: Vec<String> =
                    group.iter().map(|n| format!("{}:{}->{}", n.node, n.op, n.dst)).collect();
                writeln!(out, "  group {i}: {}", members.join(", "))?;
            }
            writeln!(out, "  list: {}", view.concurrency_list.join(" "))?;
            Ok(out)
        }
    }
}

/// Result of a `run` invocation.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub graph: String,
    pub device: String,
    pub memory_model: String,
    pub streams: usize,
    pub output: String,
    pub output_elements: usize,
    pub checksum: f64,
    pub report: ExecutionReport,
}

pub fn render_run(summary: &RunSummary, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => {
            let r = &summary.report;
            let mut out = String::new();
            writeln!(
                out,
                "{} graph on {} ({}, {} streams)",
                summary.graph, summary.device, summary.memory_model, summary.streams
            )?;
            writeln!(
                out,
                "  {} dispatches in {} groups, {} streams used, plan {}",
                r.dispatches.len(),
                r.groups,
                r.streams_used,
                if r.used_plan { "used" } else { "not used" }
            )?;
            if !r.skipped_nodes.is_empty() {
                writeln!(out, "  skipped nodes: {:?}", r.skipped_nodes)?;
            }
            writeln!(out, "  elapsed: {:?}", r.elapsed)?;
            writeln!(
                out,
                "  {} ({} elements) checksum {:.6}",
                summary.output, summary.output_elements, summary.checksum
            )?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoKind;
    use devgraph_runtime::plan_concurrency;

    #[test]
    fn format_parses() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn diamond_plan_renders_three_groups() {
        let demo = Demo::build(DemoKind::Diamond, 4).unwrap();
        let plan = plan_concurrency(&demo.graph, true);
        let text = render_plan(&demo, &plan, OutputFormat::Text).unwrap();
        assert!(text.contains("4 nodes in 3 groups"));
        assert!(text.contains("group 1: 1:silu"));

        let json: serde_json::Value =
            serde_json::from_str(&render_plan(&demo, &plan, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["groups"].as_array().unwrap().len(), 3);
        assert_eq!(json["groups"][1][1]["op"], "scale");
    }
}
