//! Integration tests for graph construction and host arenas.

use devgraph_common::DType;
use devgraph_graph::{GraphBuilder, HostBuffer, OpKind};
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn mlp_block_builds_in_order() {
    let weights = HostBuffer::alloc("weights", 4096).unwrap();
    let scratch = HostBuffer::alloc("scratch", 4096).unwrap();
    let mut b = GraphBuilder::new(Arc::clone(&weights));
    let w = b.tensor("w", DType::F32, &[8, 4]).unwrap();
    b.use_arena(&scratch);
    let x = b.tensor("x", DType::F32, &[2, 8]).unwrap();
    let h = b.matmul(&x, &w).unwrap();
    let a = b.silu(&h).unwrap();
    let n = b.rms_norm(&a, 1e-5).unwrap();
    let g = b.build();

    assert_eq!(g.len(), 3);
    assert_eq!(g.nodes()[0].op, OpKind::MatMul);
    assert_eq!(g.nodes()[2].dst.id, n.id);
    assert!(weights.contains(w.addr, w.nbytes));
    assert!(scratch.contains(x.addr, x.nbytes));
    assert_eq!(g.leafs().len(), 2);
}

#[test]
fn f32_round_trip_through_host_buffer() {
    let buf = HostBuffer::alloc("io", 256).unwrap();
    let mut b = GraphBuilder::new(Arc::clone(&buf));
    let x = b.tensor("x", DType::F32, &[4]).unwrap();
    buf.write_f32(&x, &[1.0, -2.0, 3.5, 0.25]).unwrap();
    assert_eq!(buf.read_f32(&x).unwrap(), vec![1.0, -2.0, 3.5, 0.25]);
}

#[test]
fn foreign_tensor_is_rejected() {
    let a = HostBuffer::alloc("a", 256).unwrap();
    let other = HostBuffer::alloc("other", 256).unwrap();
    let mut b = GraphBuilder::new(Arc::clone(&a));
    let x = b.tensor("x", DType::F32, &[4]).unwrap();
    assert!(other.read_tensor(&x).is_err());
}

proptest! {
    #[test]
    fn arena_allocations_are_disjoint_and_aligned(
        sizes in prop::collection::vec(1usize..64, 1..24),
    ) {
        let buf = HostBuffer::alloc("arena", 64 * 1024).unwrap();
        let mut b = GraphBuilder::new(Arc::clone(&buf));
        let tensors: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| b.tensor(&format!("t{i}"), DType::F32, &[n]).unwrap())
            .collect();
        for (i, t) in tensors.iter().enumerate() {
            prop_assert!(buf.contains(t.addr, t.nbytes));
            prop_assert_eq!((t.addr.get() - buf.base().get()) % 32, 0);
            for u in &tensors[i + 1..] {
                prop_assert!(!t.overlaps(u));
            }
        }
    }

    #[test]
    fn fingerprint_is_deterministic(len in 1usize..12) {
        let build = || {
            let buf = HostBuffer::alloc("arena", 16 * 1024).unwrap();
            let mut b = GraphBuilder::new(buf);
            let mut t = b.tensor("x", DType::F32, &[16]).unwrap();
            for _ in 0..len {
                t = b.relu(&t).unwrap();
            }
            b.build()
        };
        let g = build();
        prop_assert_eq!(g.fingerprint(), g.clone().fingerprint());
        prop_assert_eq!(g.len(), len);
    }
}
