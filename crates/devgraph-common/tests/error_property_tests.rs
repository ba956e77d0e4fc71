//! Property tests for error formatting and configuration validation.

use devgraph_common::{
    DeviceConfig, ExecError, MAX_COMMAND_STREAMS, RegistryError, ResolveError, SyncError,
    align_up,
};
use proptest::prelude::*;

proptest! {
    /// Every unmapped-tensor message names the tensor and its byte count.
    #[test]
    fn prop_unmapped_message_names_tensor(
        name in "[a-z][a-z0-9_]{0,15}",
        addr in any::<usize>(),
        nbytes in 1usize..1 << 20,
    ) {
        let e = ResolveError::Unmapped { tensor: name.clone(), addr, nbytes };
        let msg = e.to_string();
        prop_assert!(msg.contains(&name));
        prop_assert!(msg.contains(&nbytes.to_string()));
    }

    /// Resolution failures always convert into sync and execution errors
    /// without losing the message.
    #[test]
    fn prop_resolve_error_survives_wrapping(node in 0usize..10_000) {
        let inner = ResolveError::Unmapped { tensor: "t".into(), addr: 0x10, nbytes: 4 };
        let sync: SyncError = inner.clone().into();
        prop_assert_eq!(sync.to_string(), inner.to_string());

        let exec = ExecError::Resolve { node, op: "add".into(), source: inner };
        prop_assert!(exec.is_encoding_failure());
        let node_prefix = format!("node {node} ");
        prop_assert!(exec.to_string().starts_with(&node_prefix));
    }

    /// Stream counts inside the supported range validate; others do not.
    #[test]
    fn prop_stream_count_validation(n in 0usize..=2 * MAX_COMMAND_STREAMS) {
        let cfg = DeviceConfig { stream_count: n, ..DeviceConfig::default() };
        prop_assert_eq!(cfg.validate().is_ok(), (1..=MAX_COMMAND_STREAMS).contains(&n));
    }

    /// `align_up` returns the smallest multiple of `align` not below `value`.
    #[test]
    fn prop_align_up_is_minimal(value in 0usize..1 << 30, shift in 0u32..16) {
        let align = 1usize << shift;
        let aligned = align_up(value, align).unwrap();
        prop_assert!(aligned >= value);
        prop_assert_eq!(aligned % align, 0);
        prop_assert!(aligned - value < align);
    }

    /// Registry messages always carry the offending buffer name.
    #[test]
    fn prop_registry_messages_name_buffer(name in "[a-z]{1,12}") {
        let dup = RegistryError::DuplicateName(name.clone());
        prop_assert!(dup.to_string().contains(&name));
        let empty = RegistryError::EmptyRegion { name: name.clone() };
        prop_assert!(empty.to_string().contains(&name));
    }
}
