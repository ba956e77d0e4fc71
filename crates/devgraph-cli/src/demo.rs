//! Built-in demo graphs driven by the `plan` and `run` commands.

use anyhow::{Context, Result};
use devgraph_common::DType;
use devgraph_graph::{ComputeGraph, GraphBuilder, HostBuffer, TensorRef};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Shape of the demo graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoKind {
    /// Four element-wise ops in a straight line.
    Chain,
    /// relu feeding silu and scale, joined by add.
    Diamond,
    /// Four independent activations reduced pairwise.
    Fanout,
    /// Two-layer perceptron over separate weight and scratch buffers.
    Mlp,
}

impl DemoKind {
    pub const ALL: [Self; 4] = [Self::Chain, Self::Diamond, Self::Fanout, Self::Mlp];
}

impl FromStr for DemoKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chain" => Ok(Self::Chain),
            "diamond" => Ok(Self::Diamond),
            "fanout" => Ok(Self::Fanout),
            "mlp" => Ok(Self::Mlp),
            other => Err(format!(
                "unknown graph '{other}'. Expected one of: chain, diamond, fanout, mlp"
            )),
        }
    }
}

impl fmt::Display for DemoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chain => "chain",
            Self::Diamond => "diamond",
            Self::Fanout => "fanout",
            Self::Mlp => "mlp",
        };
        f.write_str(s)
    }
}

/// A demo graph together with the host buffers it lives in.
pub struct Demo {
    pub kind: DemoKind,
    /// Buffers to register, in registration order.
    pub buffers: Vec<(String, Arc<HostBuffer>)>,
    pub graph: ComputeGraph,
    pub output: TensorRef,
}

impl Demo {
    /// Build `kind` with vectors of `width` elements.
    pub fn build(kind: DemoKind, width: usize) -> Result<Self> {
        anyhow::ensure!(width > 0, "width must be positive");
        match kind {
            DemoKind::Chain => chain(width),
            DemoKind::Diamond => diamond(width),
            DemoKind::Fanout => fanout(width),
            DemoKind::Mlp => mlp(width),
        }
        .with_context(|| format!("failed to build {kind} graph with width {width}"))
    }

    /// Inputs the graph reads but never writes.
    #[must_use]
    pub fn inputs(&self) -> &[TensorRef] {
        self.graph.leafs()
    }

    /// Largest tensor in the graph; registrations must cover it in one view.
    #[must_use]
    pub fn max_tensor_size(&self) -> usize {
        self.graph
            .leafs()
            .iter()
            .chain(self.graph.nodes().iter().map(|n| &n.dst))
            .map(|t| t.nbytes)
            .max()
            .unwrap_or(0)
    }

    /// The buffer holding `tensor`.
    pub fn buffer_of(&self, tensor: &TensorRef) -> Result<&Arc<HostBuffer>> {
        self.buffers
            .iter()
            .map(|(_, b)| b)
            .find(|b| b.contains(tensor.addr, tensor.nbytes))
            .with_context(|| format!("tensor {} is outside every demo buffer", tensor.name))
    }

    /// Fill every input with a deterministic pattern.
    pub fn seed_inputs(&self) -> Result<()> {
        for (i, input) in self.inputs().iter().enumerate() {
            self.buffer_of(input)?.write_f32(input, &pattern(i, input.elements()))?;
        }
        Ok(())
    }
}

/// Values in `[-1, 1)` that differ per input.
#[must_use]
pub fn pattern(seed: usize, len: usize) -> Vec<f32> {
    (0..len).map(|j| ((seed * 31 + j * 7) % 17) as f32 / 8.5 - 1.0).collect()
}

/// Sum of `values` accumulated in f64.
#[must_use]
pub fn checksum(values: &[f32]) -> f64 {
    values.iter().map(|&v| f64::from(v)).sum()
}

fn arena(label: &str, width: usize, tensors: usize) -> Result<Arc<HostBuffer>> {
    let bytes = (width * 4).next_multiple_of(32) * tensors;
    Ok(HostBuffer::alloc(label, bytes)?)
}

fn chain(width: usize) -> Result<Demo> {
    let buf = arena("chain", width, 5)?;
    let mut b = GraphBuilder::new(Arc::clone(&buf));
    let x = b.tensor("x", DType::F32, &[width])?;
    let t = b.relu(&x)?;
    let t = b.scale(&t, 2.0)?;
    let t = b.silu(&t)?;
    let output = b.scale(&t, 0.5)?;
    Ok(Demo {
        kind: DemoKind::Chain,
        buffers: vec![("chain".into(), buf)],
        graph: b.build(),
        output,
    })
}

fn diamond(width: usize) -> Result<Demo> {
    let buf = arena("diamond", width, 5)?;
    let mut b = GraphBuilder::new(Arc::clone(&buf));
    let x = b.tensor("x", DType::F32, &[width])?;
    let a = b.relu(&x)?;
    let left = b.silu(&a)?;
    let right = b.scale(&a, 2.0)?;
    let output = b.add(&left, &right)?;
    Ok(Demo {
        kind: DemoKind::Diamond,
        buffers: vec![("diamond".into(), buf)],
        graph: b.build(),
        output,
    })
}

fn fanout(width: usize) -> Result<Demo> {
    let buf = arena("fanout", width, 8)?;
    let mut b = GraphBuilder::new(Arc::clone(&buf));
    let x = b.tensor("x", DType::F32, &[width])?;
    let r = b.relu(&x)?;
    let s = b.silu(&x)?;
    let g = b.gelu(&x)?;
    let k = b.scale(&x, -1.0)?;
    let rs = b.add(&r, &s)?;
    let gk = b.add(&g, &k)?;
    let output = b.add(&rs, &gk)?;
    Ok(Demo {
        kind: DemoKind::Fanout,
        buffers: vec![("fanout".into(), buf)],
        graph: b.build(),
        output,
    })
}

/// `softmax(relu(rms_norm(x) · w1) · w2)` over a batch of four rows.
fn mlp(width: usize) -> Result<Demo> {
    let rows = 4;
    let weights = HostBuffer::alloc("weights", (width * width * 4).next_multiple_of(32) * 2)?;
    let scratch = arena("scratch", rows * width, 6)?;
    let mut b = GraphBuilder::new(Arc::clone(&weights));
    let w1 = b.tensor("w1", DType::F32, &[width, width])?;
    let w2 = b.tensor("w2", DType::F32, &[width, width])?;
    b.use_arena(&scratch);
    let x = b.tensor("x", DType::F32, &[rows, width])?;
    let n = b.rms_norm(&x, 1e-5)?;
    let h = b.matmul(&n, &w1)?;
    let h = b.relu(&h)?;
    let o = b.matmul(&h, &w2)?;
    let output = b.softmax(&o)?;
    Ok(Demo {
        kind: DemoKind::Mlp,
        buffers: vec![("weights".into(), weights), ("scratch".into(), scratch)],
        graph: b.build(),
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_demo_builds() {
        for kind in DemoKind::ALL {
            let demo = Demo::build(kind, 8).unwrap();
            assert!(!demo.graph.is_empty(), "{kind}");
            assert!(!demo.inputs().is_empty(), "{kind}");
            demo.seed_inputs().unwrap();
            assert!(demo.buffer_of(&demo.output).is_ok());
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Diamond".parse::<DemoKind>().unwrap(), DemoKind::Diamond);
        assert!("ring".parse::<DemoKind>().is_err());
        for kind in DemoKind::ALL {
            assert_eq!(kind.to_string().parse::<DemoKind>().unwrap(), kind);
        }
    }

    #[test]
    fn mlp_uses_two_buffers() {
        let demo = Demo::build(DemoKind::Mlp, 16).unwrap();
        assert_eq!(demo.buffers.len(), 2);
        assert_eq!(demo.inputs().len(), 3);
        assert_eq!(demo.max_tensor_size(), 16 * 16 * 4);
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(Demo::build(DemoKind::Chain, 0).is_err());
    }

    #[test]
    fn pattern_is_bounded() {
        assert!(pattern(3, 100).iter().all(|v| (-1.0..1.0).contains(v)));
        assert_ne!(pattern(0, 8), pattern(1, 8));
    }
}
