//! `plan` and `run` subcommands.

use crate::demo::{Demo, DemoKind, checksum};
use crate::output::{OutputFormat, RunSummary, render_plan, render_run};
use anyhow::{Context, Result};
use clap::Args;
use devgraph_common::DeviceConfig;
use devgraph_runtime::{DeviceContext, plan_concurrency};
use tracing::info;

/// Which demo graph to build.
#[derive(Debug, Clone, Args)]
pub struct GraphArgs {
    /// Demo graph (chain, diamond, fanout, mlp)
    #[arg(short, long, value_name = "NAME", default_value = "diamond")]
    pub graph: DemoKind,

    /// Elements per vector (matrix side for mlp)
    #[arg(short, long, value_name = "N", default_value_t = 1024)]
    pub width: usize,
}

impl GraphArgs {
    fn build(&self) -> Result<Demo> {
        Demo::build(self.graph, self.width)
    }
}

/// Show the concurrency plan for a demo graph
#[derive(Debug, Clone, Args)]
pub struct PlanCommand {
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Group by data dependencies only, ignoring memory aliasing
    #[arg(long)]
    pub no_validate: bool,

    /// Output format (text or json)
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

impl PlanCommand {
    pub fn execute(&self, config: &DeviceConfig) -> Result<String> {
        let demo = self.graph.build()?;
        let validate = config.validate_memory_safety && !self.no_validate;
        let plan = plan_concurrency(&demo.graph, validate);
        render_plan(&demo, &plan, self.format)
    }
}

/// Execute a demo graph on the simulated device
#[derive(Debug, Clone, Args)]
pub struct RunCommand {
    #[command(flatten)]
    pub graph: GraphArgs,

    /// Command streams to drive (overrides configuration)
    #[arg(short, long, value_name = "N")]
    pub streams: Option<usize>,

    /// Skip planning and execute one node at a time
    #[arg(long)]
    pub serial: bool,

    /// Submit in the background and wait on the completion handle
    #[arg(long = "async")]
    pub background: bool,

    /// Group by data dependencies only, ignoring memory aliasing
    #[arg(long)]
    pub no_validate: bool,

    /// Output format (text or json)
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

impl RunCommand {
    pub fn execute(&self, config: &DeviceConfig) -> Result<String> {
        let summary = self.run(config)?;
        render_run(&summary, self.format)
    }

    /// Register, upload, plan, execute and read back the demo output.
    pub fn run(&self, config: &DeviceConfig) -> Result<RunSummary> {
        let mut config = config.clone();
        if let Some(streams) = self.streams {
            config.stream_count = streams;
        }
        let validate = config.validate_memory_safety && !self.no_validate;
        let demo = self.graph.build()?;
        let mut ctx = DeviceContext::with_config(config).context("invalid device configuration")?;

        let max_tensor_size = demo.max_tensor_size();
        for (name, buffer) in &demo.buffers {
            ctx.register_buffer(name, buffer, max_tensor_size)
                .with_context(|| format!("failed to register buffer {name}"))?;
        }
        demo.seed_inputs()?;
        for input in demo.inputs() {
            ctx.push_tensor(input)?;
        }

        if !self.serial {
            let groups = ctx.compute_concurrency_plan(&demo.graph, validate)?.group_count();
            info!(graph = %demo.kind, groups, "plan computed");
        }
        let report = if self.background {
            ctx.execute_graph_async(&demo.graph)?.wait()?
        } else {
            ctx.execute_graph(&demo.graph)?
        };

        ctx.pull_tensor(&demo.output)?;
        let values = demo.buffer_of(&demo.output)?.read_f32(&demo.output)?;
        Ok(RunSummary {
            graph: demo.kind.to_string(),
            device: ctx.device().name().to_string(),
            memory_model: ctx.device().memory_model().to_string(),
            streams: ctx.stream_count(),
            output: demo.output.name.clone(),
            output_elements: values.len(),
            checksum: checksum(&values),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgraph_common::MemoryModel;

    fn run_cmd(graph: DemoKind, serial: bool) -> RunCommand {
        RunCommand {
            graph: GraphArgs { graph, width: 32 },
            streams: Some(4),
            serial,
            background: false,
            no_validate: false,
            format: OutputFormat::Json,
        }
    }

    #[test]
    fn planned_and_serial_runs_agree() {
        let config = DeviceConfig::default();
        for kind in DemoKind::ALL {
            let planned = run_cmd(kind, false).run(&config).unwrap();
            let serial = run_cmd(kind, true).run(&config).unwrap();
            assert!((planned.checksum - serial.checksum).abs() < 1e-6, "{kind}");
            assert!(!serial.report.used_plan);
            assert_eq!(serial.report.streams_used, 1);
        }
    }

    #[test]
    fn fanout_uses_four_streams() {
        let summary = run_cmd(DemoKind::Fanout, false).run(&DeviceConfig::default()).unwrap();
        assert!(summary.report.used_plan);
        assert_eq!(summary.report.groups, 3);
        assert_eq!(summary.report.streams_used, 4);
    }

    #[test]
    fn async_run_matches_sync() {
        let config = DeviceConfig { memory_model: MemoryModel::Unified, ..DeviceConfig::default() };
        let sync = run_cmd(DemoKind::Mlp, false).run(&config).unwrap();
        let mut cmd = run_cmd(DemoKind::Mlp, false);
        cmd.background = true;
        let background = cmd.run(&config).unwrap();
        assert!((sync.checksum - background.checksum).abs() < 1e-6);
    }

    #[test]
    fn invalid_stream_override_is_rejected() {
        let mut cmd = run_cmd(DemoKind::Chain, false);
        cmd.streams = Some(0);
        assert!(cmd.run(&DeviceConfig::default()).is_err());
    }

    #[test]
    fn mlp_softmax_rows_sum_to_one() {
        let summary = run_cmd(DemoKind::Mlp, false).run(&DeviceConfig::default()).unwrap();
        assert!((summary.checksum - 4.0).abs() < 1e-4);
    }
}
