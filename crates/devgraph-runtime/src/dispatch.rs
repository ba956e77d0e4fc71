//! Graph execution over a pool of command streams.
//!
//! Execution is two-phase. Encoding resolves every operand through the
//! buffer registry and binds every node to its kernel before anything is
//! submitted, so a missing mapping or kernel fails the run with no device
//! work done. Submission then walks the dispatch groups in order: each
//! group's commands are spread over up to `width` streams that run in
//! parallel, and all of them must finish before the next group starts.

use crate::command::{BoundTensor, CommandStream, EncodedCommand, StreamState};
use crate::device::SimDevice;
use crate::kernels::KernelLibrary;
use crate::planner::ConcurrencyPlan;
use crate::registry::BufferRegistry;
use devgraph_common::{ExecError, MAX_COMMAND_STREAMS};
use devgraph_graph::{ComputeGraph, GraphNode, OpKind, TensorRef};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where one execution is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Planning,
    Encoding,
    Submitted,
    Complete,
    Failed,
}

impl ExecutionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use ExecutionState::{Complete, Encoding, Failed, Idle, Planning, Submitted};
        matches!(
            (self, to),
            (Idle | Planning, Planning | Encoding)
                | (Planning, Idle)
                | (Encoding, Submitted | Failed)
                | (Submitted, Complete | Failed)
                | (Complete | Failed, Idle)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Encoding => "encoding",
            Self::Submitted => "submitted",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One kernel dispatch as scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub node: usize,
    pub kernel: String,
    pub stream: usize,
    pub group: usize,
    pub grid: u32,
}

/// Summary of a finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Whether a concurrency plan drove the grouping.
    pub used_plan: bool,
    /// Dispatch groups submitted, each behind a barrier.
    pub groups: usize,
    pub dispatches: Vec<DispatchRecord>,
    /// Metadata-only nodes that needed no kernel.
    pub skipped_nodes: Vec<usize>,
    /// Most streams used by any one group.
    pub streams_used: usize,
    pub elapsed: Duration,
}

/// Everything encoding needs to look up.
#[derive(Debug, Clone, Copy)]
pub struct Encoder<'a> {
    pub registry: &'a BufferRegistry,
    pub kernels: &'a KernelLibrary,
    pub device: &'a SimDevice,
}

impl Encoder<'_> {
    fn bind(&self, node: usize, op: &OpKind, tensor: &TensorRef) -> Result<BoundTensor, ExecError> {
        let res = self.registry.resolve_tensor(tensor).map_err(|source| ExecError::Resolve {
            node,
            op: op.name().to_string(),
            source,
        })?;
        Ok(BoundTensor {
            name: tensor.name.clone(),
            memory: res.memory,
            offset: res.memory_offset,
            nbytes: tensor.nbytes,
            dtype: tensor.dtype,
            shape: tensor.shape.clone(),
            buffer: res.buffer,
            view: res.view,
        })
    }

    /// Bind one node; metadata-only nodes yield `None`.
    fn encode_node(
        &self,
        index: usize,
        node: &GraphNode,
    ) -> Result<Option<EncodedCommand>, ExecError> {
        let Some(kernel_name) = node.op.kernel_name() else {
            return Ok(None);
        };
        let srcs = node
            .srcs
            .iter()
            .map(|t| self.bind(index, &node.op, t))
            .collect::<Result<Vec<_>, _>>()?;
        let dst = self.bind(index, &node.op, &node.dst)?;
        let kernel = self.kernels.get(kernel_name).map_err(|source| ExecError::Encode {
            node: index,
            op: node.op.name().to_string(),
            source,
        })?;
        Ok(Some(EncodedCommand {
            node: index,
            op: node.op.clone(),
            kernel_name: kernel_name.to_string(),
            kernel,
            srcs,
            dst,
            grid: self.device.grid_size(node.dst.elements()),
        }))
    }
}

/// Commands per stream, per group.
type Batches = Vec<Vec<Vec<EncodedCommand>>>;

struct Schedule {
    batches: Batches,
    used_plan: bool,
    dispatches: Vec<DispatchRecord>,
    skipped_nodes: Vec<usize>,
    streams_used: usize,
}

impl Schedule {
    fn into_parts(self) -> (Batches, ScheduleSummary) {
        let summary = ScheduleSummary {
            used_plan: self.used_plan,
            groups: self.batches.len(),
            dispatches: self.dispatches,
            skipped_nodes: self.skipped_nodes,
            streams_used: self.streams_used,
        };
        (self.batches, summary)
    }
}

struct ScheduleSummary {
    used_plan: bool,
    groups: usize,
    dispatches: Vec<DispatchRecord>,
    skipped_nodes: Vec<usize>,
    streams_used: usize,
}

impl ScheduleSummary {
    fn finish(self, elapsed: Duration) -> ExecutionReport {
        ExecutionReport {
            used_plan: self.used_plan,
            groups: self.groups,
            dispatches: self.dispatches,
            skipped_nodes: self.skipped_nodes,
            streams_used: self.streams_used,
            elapsed,
        }
    }
}

/// Split `items` into at most `width` contiguous, non-empty batches whose
/// sizes differ by at most one.
fn split_batches<T>(items: Vec<T>, width: usize) -> Vec<Vec<T>> {
    let k = width.min(items.len()).max(1);
    let (base, extra) = (items.len() / k, items.len() % k);
    let mut iter = items.into_iter();
    (0..k).map(|i| iter.by_ref().take(base + usize::from(i < extra)).collect()).collect()
}

fn encode_schedule(
    encoder: &Encoder<'_>,
    graph: &ComputeGraph,
    plan: Option<&ConcurrencyPlan>,
    width: usize,
) -> Result<Schedule, ExecError> {
    if let Some(plan) = plan {
        let actual = graph.fingerprint();
        if plan.fingerprint() != actual {
            return Err(ExecError::StalePlan { planned: plan.fingerprint(), actual });
        }
    }
    let order: Vec<Vec<usize>> = match plan {
        Some(plan) if !plan.is_trivial() => {
            plan.groups().iter().map(|g| g.nodes().to_vec()).collect()
        }
        _ => (0..graph.len()).map(|i| vec![i]).collect(),
    };
    let used_plan = plan.is_some_and(|p| !p.is_trivial());

    let mut schedule = Schedule {
        batches: Vec::with_capacity(order.len()),
        used_plan,
        dispatches: Vec::new(),
        skipped_nodes: Vec::new(),
        streams_used: 0,
    };
    for group in order {
        let mut commands = Vec::with_capacity(group.len());
        for index in group {
            let node = &graph.nodes()[index];
            match encoder.encode_node(index, node)? {
                Some(command) => commands.push(command),
                None => schedule.skipped_nodes.push(index),
            }
        }
        if commands.is_empty() {
            continue;
        }
        let group_index = schedule.batches.len();
        let batches = split_batches(commands, width);
        for (stream, batch) in batches.iter().enumerate() {
            schedule.dispatches.extend(batch.iter().map(|c| DispatchRecord {
                node: c.node,
                kernel: c.kernel_name.clone(),
                stream,
                group: group_index,
                grid: c.grid,
            }));
        }
        schedule.streams_used = schedule.streams_used.max(batches.len());
        schedule.batches.push(batches);
    }
    schedule.skipped_nodes.sort_unstable();
    debug!(
        groups = schedule.batches.len(),
        dispatches = schedule.dispatches.len(),
        skipped = schedule.skipped_nodes.len(),
        used_plan,
        "encoded graph"
    );
    Ok(schedule)
}

/// Submit every group in order, with a barrier after each.
fn run_schedule(streams: &mut [CommandStream], batches: Batches) -> Result<(), ExecError> {
    for (group, group_batches) in batches.into_iter().enumerate() {
        let active = group_batches.len();
        for (stream, batch) in streams.iter_mut().zip(group_batches) {
            stream.begin()?;
            for command in batch {
                stream.encode(command)?;
            }
            stream.commit()?;
        }

        if active == 1 {
            let stream = &mut streams[0];
            panic::catch_unwind(AssertUnwindSafe(|| stream.execute()))
                .unwrap_or(Err(ExecError::WorkerPanicked))?;
        } else {
            let results: Vec<Result<(), ExecError>> = thread::scope(|scope| {
                let handles: Vec<_> = streams[..active]
                    .iter_mut()
                    .map(|stream| scope.spawn(move || stream.execute()))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(Err(ExecError::WorkerPanicked)))
                    .collect()
            });
            results.into_iter().collect::<Result<(), _>>()?;
        }
        debug!(group, streams = active, "group barrier reached");
    }
    Ok(())
}

/// The reusable command streams of a device context.
#[derive(Debug)]
pub struct StreamPool {
    width: usize,
    slots: Vec<CommandStream>,
}

impl StreamPool {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self { width, slots: (0..width).map(CommandStream::new).collect() }
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// States of the streams currently held by the pool.
    #[must_use]
    pub fn states(&self) -> Vec<StreamState> {
        self.slots.iter().map(CommandStream::state).collect()
    }

    fn release_all(&mut self) {
        self.slots.iter_mut().for_each(CommandStream::release);
    }
}

/// Drives graph executions and tracks their state.
#[derive(Debug)]
pub struct Dispatcher {
    pool: StreamPool,
    state: ExecutionState,
}

/// Clamp a requested stream count into `1..=MAX_COMMAND_STREAMS`.
#[must_use]
pub fn clamp_stream_count(requested: usize) -> usize {
    let clamped = requested.clamp(1, MAX_COMMAND_STREAMS);
    if clamped != requested {
        warn!(requested, clamped, max = MAX_COMMAND_STREAMS, "stream count clamped");
    }
    clamped
}

impl Dispatcher {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self { pool: StreamPool::new(clamp_stream_count(width)), state: ExecutionState::Idle }
    }

    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.pool.width
    }

    #[must_use]
    pub const fn pool(&self) -> &StreamPool {
        &self.pool
    }

    /// Resize the stream pool; returns the width actually used.
    pub fn set_width(&mut self, width: usize) -> usize {
        let width = clamp_stream_count(width);
        if width != self.pool.width {
            debug!(from = self.pool.width, to = width, "resizing stream pool");
            self.pool = StreamPool::new(width);
        }
        width
    }

    pub fn transition(&mut self, to: ExecutionState) -> Result<(), ExecError> {
        if !self.state.can_transition_to(to) {
            return Err(ExecError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self.state, to = %to, "execution state");
        self.state = to;
        Ok(())
    }

    /// A finished execution leaves its terminal state at the next call.
    fn reset_if_terminal(&mut self) {
        if self.state.is_terminal() {
            self.state = ExecutionState::Idle;
        }
    }

    /// Enter Planning ahead of an execution.
    pub fn begin_planning(&mut self) -> Result<(), ExecError> {
        self.reset_if_terminal();
        self.transition(ExecutionState::Planning)
    }

    /// Leave Planning without executing.
    pub fn abandon_planning(&mut self) {
        if self.state == ExecutionState::Planning {
            self.state = ExecutionState::Idle;
        }
    }

    fn encode(
        &mut self,
        encoder: &Encoder<'_>,
        graph: &ComputeGraph,
        plan: Option<&ConcurrencyPlan>,
    ) -> Result<Schedule, ExecError> {
        self.reset_if_terminal();
        self.transition(ExecutionState::Encoding)?;
        match encode_schedule(encoder, graph, plan, self.pool.width) {
            Ok(schedule) => {
                self.transition(ExecutionState::Submitted)?;
                Ok(schedule)
            }
            Err(e) => {
                self.transition(ExecutionState::Failed)?;
                error!(error = %e, "graph encoding failed");
                Err(e)
            }
        }
    }

    fn finish(
        &mut self,
        result: Result<ExecutionReport, ExecError>,
    ) -> Result<ExecutionReport, ExecError> {
        match result {
            Ok(report) => {
                self.transition(ExecutionState::Complete)?;
                info!(
                    groups = report.groups,
                    dispatches = report.dispatches.len(),
                    streams = report.streams_used,
                    used_plan = report.used_plan,
                    elapsed_us = report.elapsed.as_micros(),
                    "graph execution complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(ExecutionState::Failed)?;
                error!(error = %e, "graph execution failed");
                Err(e)
            }
        }
    }

    /// Execute `graph`, blocking until every stream has completed.
    pub fn execute(
        &mut self,
        encoder: &Encoder<'_>,
        graph: &ComputeGraph,
        plan: Option<&ConcurrencyPlan>,
    ) -> Result<ExecutionReport, ExecError> {
        let start = Instant::now();
        let (batches, summary) = self.encode(encoder, graph, plan)?.into_parts();
        let result = run_schedule(&mut self.pool.slots, batches);
        self.pool.release_all();
        self.finish(result.map(|()| summary.finish(start.elapsed())))
    }

    /// Encode `graph` now and run it on a driver thread.
    ///
    /// The returned handle borrows the dispatcher until the run is joined.
    pub fn execute_async(
        &mut self,
        encoder: &Encoder<'_>,
        graph: &ComputeGraph,
        plan: Option<&ConcurrencyPlan>,
    ) -> Result<ExecutionHandle<'_>, ExecError> {
        let start = Instant::now();
        let (batches, summary) = self.encode(encoder, graph, plan)?.into_parts();
        let mut slots = std::mem::take(&mut self.pool.slots);
        let worker = thread::spawn(move || {
            let result = run_schedule(&mut slots, batches);
            slots.iter_mut().for_each(CommandStream::release);
            (slots, result.map(|()| summary.finish(start.elapsed())))
        });
        Ok(ExecutionHandle { dispatcher: self, worker: Some(worker) })
    }
}

type WorkerOutput = (Vec<CommandStream>, Result<ExecutionReport, ExecError>);

/// Completion handle of an asynchronous execution.
///
/// Dropping the handle waits for the run to finish.
#[derive(Debug)]
pub struct ExecutionHandle<'a> {
    dispatcher: &'a mut Dispatcher,
    worker: Option<JoinHandle<WorkerOutput>>,
}

impl ExecutionHandle<'_> {
    /// Whether the device work has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the run completes.
    pub fn wait(mut self) -> Result<ExecutionReport, ExecError> {
        self.join()
    }

    fn join(&mut self) -> Result<ExecutionReport, ExecError> {
        let Some(worker) = self.worker.take() else {
            return Err(ExecError::InvalidTransition {
                from: self.dispatcher.state.to_string(),
                to: ExecutionState::Complete.to_string(),
            });
        };
        let result = match worker.join() {
            Ok((slots, result)) => {
                self.dispatcher.pool.slots = slots;
                result
            }
            Err(_) => {
                self.dispatcher.pool = StreamPool::new(self.dispatcher.pool.width);
                Err(ExecError::WorkerPanicked)
            }
        };
        self.dispatcher.finish(result)
    }
}

impl Drop for ExecutionHandle<'_> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            // `finish` has already logged a failed run.
            let _ = self.join();
        }
    }
}
