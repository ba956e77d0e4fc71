//! Command stream lifecycle.
//!
//! A stream is one device submission channel: Idle → Encoding → Committed →
//! Completed (or Failed). Streams are reused across dispatch groups and
//! released back to Idle at the end of an execution.

use crate::kernels::{KernelArgs, KernelFn, TensorData};
use crate::memory::DeviceMemory;
use devgraph_common::{DType, ExecError, KernelError};
use devgraph_graph::OpKind;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A tensor operand bound to device memory.
#[derive(Debug, Clone)]
pub struct BoundTensor {
    pub name: String,
    pub memory: Arc<DeviceMemory>,
    /// Byte offset inside `memory`.
    pub offset: usize,
    pub nbytes: usize,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Registry slot and view the operand was resolved through.
    pub buffer: usize,
    pub view: usize,
}

/// One encoded kernel invocation.
#[derive(Clone)]
pub struct EncodedCommand {
    pub node: usize,
    pub op: OpKind,
    pub kernel_name: String,
    pub kernel: KernelFn,
    pub srcs: Vec<BoundTensor>,
    pub dst: BoundTensor,
    /// Work groups launched.
    pub grid: u32,
}

impl fmt::Debug for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedCommand")
            .field("node", &self.node)
            .field("kernel", &self.kernel_name)
            .field("srcs", &self.srcs.len())
            .field("dst", &self.dst.name)
            .field("grid", &self.grid)
            .finish()
    }
}

impl EncodedCommand {
    /// Run the kernel: read operands, compute, write the destination.
    pub fn execute(&self) -> Result<(), KernelError> {
        let inputs: Vec<Vec<u8>> = self
            .srcs
            .iter()
            .map(|s| s.memory.read(s.offset, s.nbytes))
            .collect::<Result<_, _>>()?;
        let data: Vec<TensorData<'_>> = self
            .srcs
            .iter()
            .zip(&inputs)
            .map(|(s, bytes)| TensorData {
                dtype: s.dtype,
                shape: &s.shape,
                bytes: bytes.as_slice(),
            })
            .collect();
        let args = KernelArgs {
            op: &self.op,
            inputs: &data,
            output_dtype: self.dst.dtype,
            output_shape: &self.dst.shape,
        };
        let out = (self.kernel)(&args)?;
        if out.len() != self.dst.nbytes {
            return Err(KernelError::Failed {
                kernel: self.kernel_name.clone(),
                reason: format!("produced {} bytes, expected {}", out.len(), self.dst.nbytes),
            });
        }
        self.dst.memory.write(self.dst.offset, &out)?;
        trace!(node = self.node, kernel = %self.kernel_name, grid = self.grid, "kernel complete");
        Ok(())
    }
}

/// State of a command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Encoding,
    Committed,
    Completed,
    Failed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Encoding => "encoding",
            Self::Committed => "committed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A reusable command submission channel.
#[derive(Debug)]
pub struct CommandStream {
    index: usize,
    state: StreamState,
    commands: Vec<EncodedCommand>,
}

impl CommandStream {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self { index, state: StreamState::Idle, commands: Vec::new() }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Commands encoded since the last `begin`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn invalid(&self, to: StreamState) -> ExecError {
        ExecError::InvalidTransition {
            from: format!("stream {} {}", self.index, self.state),
            to: to.to_string(),
        }
    }

    /// Start encoding a batch. Valid from Idle, or from Completed when the
    /// stream is reused for the next dispatch group.
    pub fn begin(&mut self) -> Result<(), ExecError> {
        match self.state {
            StreamState::Idle | StreamState::Completed => {
                self.commands.clear();
                self.state = StreamState::Encoding;
                Ok(())
            }
            _ => Err(self.invalid(StreamState::Encoding)),
        }
    }

    pub fn encode(&mut self, command: EncodedCommand) -> Result<(), ExecError> {
        if self.state != StreamState::Encoding {
            return Err(self.invalid(StreamState::Encoding));
        }
        trace!(stream = self.index, node = command.node, kernel = %command.kernel_name, "encode");
        self.commands.push(command);
        Ok(())
    }

    /// Close the batch for submission; at least one command must be encoded.
    pub fn commit(&mut self) -> Result<usize, ExecError> {
        if self.state != StreamState::Encoding || self.commands.is_empty() {
            return Err(self.invalid(StreamState::Committed));
        }
        debug!(stream = self.index, commands = self.commands.len(), "committing command stream");
        self.state = StreamState::Committed;
        Ok(self.commands.len())
    }

    /// Run the committed commands in order, stopping at the first failure.
    pub fn execute(&mut self) -> Result<(), ExecError> {
        if self.state != StreamState::Committed {
            return Err(self.invalid(StreamState::Completed));
        }
        for command in &self.commands {
            if let Err(source) = command.execute() {
                self.state = StreamState::Failed;
                return Err(ExecError::Device { stream: self.index, node: command.node, source });
            }
        }
        self.state = StreamState::Completed;
        Ok(())
    }

    /// Drop any encoded work and return to Idle.
    pub fn release(&mut self) {
        self.commands.clear();
        self.state = StreamState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelLibrary;
    use devgraph_graph::HostBuffer;

    fn bound(memory: &Arc<DeviceMemory>, offset: usize) -> BoundTensor {
        BoundTensor {
            name: format!("t{offset}"),
            memory: Arc::clone(memory),
            offset,
            nbytes: 8,
            dtype: DType::F32,
            shape: vec![2],
            buffer: 0,
            view: 0,
        }
    }

    fn relu_command(memory: &Arc<DeviceMemory>) -> EncodedCommand {
        EncodedCommand {
            node: 0,
            op: OpKind::Relu,
            kernel_name: "relu".into(),
            kernel: KernelLibrary::with_builtins().get("relu").unwrap(),
            srcs: vec![bound(memory, 0)],
            dst: bound(memory, 8),
            grid: 1,
        }
    }

    fn memory() -> Arc<DeviceMemory> {
        let host = HostBuffer::alloc("h", 16).unwrap();
        host.write(0, bytemuck::cast_slice(&[-1.0f32, 3.0])).unwrap();
        Arc::new(DeviceMemory::shared(host, 0, 16))
    }

    #[test]
    fn new_stream_is_idle() {
        let s = CommandStream::new(3);
        assert_eq!(s.state(), StreamState::Idle);
        assert_eq!(s.index(), 3);
        assert!(s.is_empty());
    }

    #[test]
    fn full_lifecycle_runs_kernel() {
        let mem = memory();
        let mut s = CommandStream::new(0);
        s.begin().unwrap();
        s.encode(relu_command(&mem)).unwrap();
        assert_eq!(s.commit().unwrap(), 1);
        s.execute().unwrap();
        assert_eq!(s.state(), StreamState::Completed);
        let out: Vec<f32> = bytemuck::pod_collect_to_vec(&mem.read(8, 8).unwrap());
        assert_eq!(out, vec![0.0, 3.0]);
        s.release();
        assert_eq!(s.state(), StreamState::Idle);
    }

    #[test]
    fn commit_without_encode_fails() {
        let mut s = CommandStream::new(0);
        s.begin().unwrap();
        assert!(matches!(s.commit(), Err(ExecError::InvalidTransition { .. })));
    }

    #[test]
    fn encode_before_begin_fails() {
        let mem = memory();
        let mut s = CommandStream::new(0);
        assert!(s.encode(relu_command(&mem)).is_err());
    }

    #[test]
    fn execute_without_commit_fails() {
        let mem = memory();
        let mut s = CommandStream::new(0);
        s.begin().unwrap();
        s.encode(relu_command(&mem)).unwrap();
        assert!(s.execute().is_err());
    }

    #[test]
    fn completed_stream_can_be_reused() {
        let mem = memory();
        let mut s = CommandStream::new(0);
        for _ in 0..2 {
            s.begin().unwrap();
            s.encode(relu_command(&mem)).unwrap();
            s.commit().unwrap();
            s.execute().unwrap();
        }
        assert_eq!(s.state(), StreamState::Completed);
    }

    #[test]
    fn kernel_failure_fails_stream() {
        let mem = memory();
        let mut cmd = relu_command(&mem);
        cmd.kernel = Arc::new(|_: &KernelArgs<'_>| -> Result<Vec<u8>, KernelError> {
            Err(KernelError::Failed { kernel: "relu".into(), reason: "fault".into() })
        });
        let mut s = CommandStream::new(2);
        s.begin().unwrap();
        s.encode(cmd).unwrap();
        s.commit().unwrap();
        let err = s.execute().unwrap_err();
        assert!(matches!(err, ExecError::Device { stream: 2, node: 0, .. }));
        assert_eq!(s.state(), StreamState::Failed);
        assert!(s.begin().is_err());
    }

    #[test]
    fn wrong_output_size_is_a_failure() {
        let mem = memory();
        let mut cmd = relu_command(&mem);
        cmd.kernel = Arc::new(|_: &KernelArgs<'_>| Ok::<_, KernelError>(vec![0u8; 3]));
        assert!(matches!(cmd.execute(), Err(KernelError::Failed { .. })));
    }
}
