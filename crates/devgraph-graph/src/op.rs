//! Operation kinds and the device programs that implement them.

use std::fmt;
use std::hash::{Hash, Hasher};

/// What a graph node computes.
///
/// Every computing kind names the installed device program that runs it;
/// [`OpKind::Reshape`] and [`OpKind::View`] only reinterpret memory and are
/// never dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Add,
    Mul,
    Scale(f32),
    Relu,
    Silu,
    Gelu,
    /// `[m, k] x [k, n] -> [m, n]`.
    MatMul,
    /// Softmax over the last dimension.
    SoftMax,
    /// RMS normalisation over the last dimension.
    RmsNorm { eps: f32 },
    /// Element copy with dtype conversion.
    Copy,
    Reshape,
    View,
    /// A program installed by name at runtime.
    Custom(String),
}

impl OpKind {
    /// Human-readable operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Scale(_) => "scale",
            Self::Relu => "relu",
            Self::Silu => "silu",
            Self::Gelu => "gelu",
            Self::MatMul => "mul_mat",
            Self::SoftMax => "soft_max",
            Self::RmsNorm { .. } => "rms_norm",
            Self::Copy => "cpy",
            Self::Reshape => "reshape",
            Self::View => "view",
            Self::Custom(name) => name,
        }
    }

    /// Name of the device program that executes this operation, or `None`
    /// for metadata-only operations.
    #[must_use]
    pub fn kernel_name(&self) -> Option<&str> {
        if self.is_noop() { None } else { Some(self.name()) }
    }

    /// Whether the node only reinterprets memory and writes nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::Reshape | Self::View)
    }

    /// Number of source operands, when fixed.
    #[must_use]
    pub const fn arity(&self) -> Option<usize> {
        match self {
            Self::Add | Self::Mul | Self::MatMul => Some(2),
            Self::Scale(_)
            | Self::Relu
            | Self::Silu
            | Self::Gelu
            | Self::SoftMax
            | Self::RmsNorm { .. }
            | Self::Copy
            | Self::Reshape
            | Self::View => Some(1),
            Self::Custom(_) => None,
        }
    }
}

impl Hash for OpKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Scale(s) => s.to_bits().hash(state),
            Self::RmsNorm { eps } => eps.to_bits().hash(state),
            Self::Custom(name) => name.hash(state),
            _ => {}
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_have_no_kernel() {
        assert_eq!(OpKind::Reshape.kernel_name(), None);
        assert_eq!(OpKind::View.kernel_name(), None);
        assert!(OpKind::View.is_noop());
    }

    #[test]
    fn kernel_names() {
        assert_eq!(OpKind::MatMul.kernel_name(), Some("mul_mat"));
        assert_eq!(OpKind::RmsNorm { eps: 1e-5 }.kernel_name(), Some("rms_norm"));
        assert_eq!(OpKind::Custom("fused".into()).kernel_name(), Some("fused"));
    }

    #[test]
    fn arity() {
        assert_eq!(OpKind::Add.arity(), Some(2));
        assert_eq!(OpKind::Silu.arity(), Some(1));
        assert_eq!(OpKind::Custom("x".into()).arity(), None);
    }

    #[test]
    fn hash_distinguishes_parameters() {
        use std::collections::hash_map::DefaultHasher;
        let h = |op: &OpKind| {
            let mut s = DefaultHasher::new();
            op.hash(&mut s);
            s.finish()
        };
        assert_ne!(h(&OpKind::Scale(1.0)), h(&OpKind::Scale(2.0)));
        assert_eq!(h(&OpKind::Scale(0.5)), h(&OpKind::Scale(0.5)));
        assert_ne!(h(&OpKind::Relu), h(&OpKind::Silu));
    }
}
