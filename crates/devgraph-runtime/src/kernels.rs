//! Installed device programs.
//!
//! The simulated device runs kernels on the host. Built-in kernels are
//! straightforward reference implementations, accumulating in `f64`
//! where a reduction is involved; callers can install their own under any
//! name and reach them through `OpKind::Custom`.

use devgraph_common::{DType, KernelError};
use devgraph_graph::OpKind;
use half::f16;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One kernel input as seen by a device program.
#[derive(Debug, Clone, Copy)]
pub struct TensorData<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    pub bytes: &'a [u8],
}

/// Arguments of one kernel invocation.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    pub op: &'a OpKind,
    pub inputs: &'a [TensorData<'a>],
    pub output_dtype: DType,
    pub output_shape: &'a [usize],
}

impl KernelArgs<'_> {
    /// Number of elements the kernel must produce.
    #[must_use]
    pub fn output_elements(&self) -> usize {
        self.output_shape.iter().product()
    }

    fn kernel(&self) -> String {
        self.op.name().to_string()
    }

    fn input(&self, index: usize) -> Result<&TensorData<'_>, KernelError> {
        self.inputs.get(index).ok_or_else(|| KernelError::InvalidArguments {
            kernel: self.kernel(),
            reason: format!("missing input {index}"),
        })
    }

    fn f32_input(&self, index: usize) -> Result<Vec<f32>, KernelError> {
        let input = self.input(index)?;
        if input.dtype != DType::F32 {
            return Err(KernelError::UnsupportedDType {
                kernel: self.kernel(),
                dtype: input.dtype.to_string(),
            });
        }
        Ok(bytemuck::pod_collect_to_vec(input.bytes))
    }

    fn require_f32_output(&self) -> Result<(), KernelError> {
        if self.output_dtype == DType::F32 {
            Ok(())
        } else {
            Err(KernelError::UnsupportedDType {
                kernel: self.kernel(),
                dtype: self.output_dtype.to_string(),
            })
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> KernelError {
        KernelError::InvalidArguments { kernel: self.kernel(), reason: reason.into() }
    }
}

/// A device program: consumes input bytes, returns the output tensor's bytes.
pub type KernelFn = Arc<dyn Fn(&KernelArgs<'_>) -> Result<Vec<u8>, KernelError> + Send + Sync>;

/// Kernels installed on the device, keyed by name.
#[derive(Clone)]
pub struct KernelLibrary {
    kernels: HashMap<String, KernelFn>,
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLibrary").field("kernels", &self.names()).finish()
    }
}

impl Default for KernelLibrary {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl KernelLibrary {
    /// A library with nothing installed.
    #[must_use]
    pub fn empty() -> Self {
        Self { kernels: HashMap::new() }
    }

    /// A library with the reference kernels for every built-in operation.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut lib = Self::empty();
        lib.install("add", |a| binary(a, |x, y| x + y));
        lib.install("mul", |a| binary(a, |x, y| x * y));
        lib.install("scale", scale);
        lib.install("relu", |a| unary(a, |x| x.max(0.0)));
        lib.install("silu", |a| unary(a, |x| x / (1.0 + (-x).exp())));
        lib.install("gelu", |a| unary(a, gelu));
        lib.install("mul_mat", mul_mat);
        lib.install("soft_max", soft_max);
        lib.install("rms_norm", rms_norm);
        lib.install("cpy", cpy);
        lib
    }

    /// Install `kernel` under `name`, replacing any kernel already there.
    pub fn install<F>(&mut self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&KernelArgs<'_>) -> Result<Vec<u8>, KernelError> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(kernel));
    }

    pub fn get(&self, name: &str) -> Result<KernelFn, KernelError> {
        self.kernels
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::NotInstalled { kernel: name.to_string() })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    /// Installed kernel names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn unary(args: &KernelArgs<'_>, f: impl Fn(f32) -> f32) -> Result<Vec<u8>, KernelError> {
    args.require_f32_output()?;
    let x = args.f32_input(0)?;
    if x.len() != args.output_elements() {
        let reason = format!("{} inputs for {} outputs", x.len(), args.output_elements());
        return Err(args.invalid(reason));
    }
    Ok(f32_bytes(&x.into_iter().map(f).collect::<Vec<_>>()))
}

fn binary(args: &KernelArgs<'_>, f: impl Fn(f32, f32) -> f32) -> Result<Vec<u8>, KernelError> {
    args.require_f32_output()?;
    let (x, y) = (args.f32_input(0)?, args.f32_input(1)?);
    if x.len() != y.len() || x.len() != args.output_elements() {
        return Err(args.invalid(format!("element counts {} and {} differ", x.len(), y.len())));
    }
    let out: Vec<f32> = x.iter().zip(&y).map(|(&a, &b)| f(a, b)).collect();
    Ok(f32_bytes(&out))
}

fn scale(args: &KernelArgs<'_>) -> Result<Vec<u8>, KernelError> {
    let OpKind::Scale(factor) = *args.op else {
        return Err(args.invalid("scale kernel needs a scale factor"));
    };
    unary(args, |x| x * factor)
}

fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

fn mul_mat(args: &KernelArgs<'_>) -> Result<Vec<u8>, KernelError> {
    args.require_f32_output()?;
    let (a_shape, b_shape) = (args.input(0)?.shape, args.input(1)?.shape);
    let (&[m, k], &[k2, n]) = (a_shape, b_shape) else {
        return Err(args.invalid("operands must be matrices"));
    };
    if k != k2 || args.output_shape != [m, n] {
        return Err(args.invalid(format!("cannot multiply {a_shape:?} by {b_shape:?}")));
    }
    let (a, b) = (args.f32_input(0)?, args.f32_input(1)?);
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let sum: f64 =
                (0..k).map(|p| f64::from(a[i * k + p]) * f64::from(b[p * n + j])).sum();
            c[i * n + j] = sum as f32;
        }
    }
    Ok(f32_bytes(&c))
}

/// Split `x` into rows along the last output dimension.
fn rows<'a>(
    args: &KernelArgs<'_>,
    x: &'a mut [f32],
) -> Result<std::slice::ChunksMut<'a, f32>, KernelError> {
    let width = args.output_shape.last().copied().unwrap_or(0);
    if width == 0 || x.len() != args.output_elements() {
        return Err(args.invalid("input does not match output shape"));
    }
    Ok(x.chunks_mut(width))
}

fn soft_max(args: &KernelArgs<'_>) -> Result<Vec<u8>, KernelError> {
    args.require_f32_output()?;
    let mut x = args.f32_input(0)?;
    for row in rows(args, &mut x)? {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f64;
        for v in row.iter_mut() {
            let e = f64::from(*v - max).exp();
            *v = e as f32;
            sum += e;
        }
        for v in row.iter_mut() {
            *v = (f64::from(*v) / sum) as f32;
        }
    }
    Ok(f32_bytes(&x))
}

fn rms_norm(args: &KernelArgs<'_>) -> Result<Vec<u8>, KernelError> {
    let OpKind::RmsNorm { eps } = *args.op else {
        return Err(args.invalid("rms_norm kernel needs an epsilon"));
    };
    args.require_f32_output()?;
    let mut x = args.f32_input(0)?;
    for row in rows(args, &mut x)? {
        let sum_sq: f64 = row.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        let mean_sq = sum_sq / row.len() as f64;
        let rms = (mean_sq + f64::from(eps)).sqrt();
        for v in row.iter_mut() {
            *v = (f64::from(*v) / rms) as f32;
        }
    }
    Ok(f32_bytes(&x))
}

fn cpy(args: &KernelArgs<'_>) -> Result<Vec<u8>, KernelError> {
    let input = args.input(0)?;
    let values: Vec<f32> = match input.dtype {
        DType::F32 => bytemuck::pod_collect_to_vec(input.bytes),
        DType::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(input.bytes)
            .into_iter()
            .map(f16::to_f32)
            .collect(),
        other => {
            return Err(KernelError::UnsupportedDType {
                kernel: args.kernel(),
                dtype: other.to_string(),
            });
        }
    };
    if values.len() != args.output_elements() {
        return Err(args.invalid("element counts differ"));
    }
    match args.output_dtype {
        DType::F32 => Ok(f32_bytes(&values)),
        DType::F16 => {
            let halves: Vec<f16> = values.into_iter().map(f16::from_f32).collect();
            Ok(bytemuck::cast_slice(&halves).to_vec())
        }
        other => Err(KernelError::UnsupportedDType {
            kernel: args.kernel(),
            dtype: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: &OpKind, inputs: &[(&[usize], &[f32])], out_shape: &[usize]) -> Vec<f32> {
        let data: Vec<TensorData<'_>> = inputs
            .iter()
            .map(|(shape, values)| TensorData {
                dtype: DType::F32,
                shape,
                bytes: bytemuck::cast_slice(values),
            })
            .collect();
        let args = KernelArgs {
            op,
            inputs: &data,
            output_dtype: DType::F32,
            output_shape: out_shape,
        };
        let lib = KernelLibrary::with_builtins();
        let kernel = lib.get(op.kernel_name().unwrap()).unwrap();
        bytemuck::pod_collect_to_vec(&kernel(&args).unwrap())
    }

    #[test]
    fn builtins_are_installed() {
        let lib = KernelLibrary::default();
        for name in [
            "add", "mul", "scale", "relu", "silu", "gelu", "mul_mat", "soft_max", "rms_norm", "cpy",
        ] {
            assert!(lib.contains(name), "{name} missing");
        }
        assert!(matches!(lib.get("nope"), Err(KernelError::NotInstalled { .. })));
    }

    #[test]
    fn elementwise() {
        let s: &[usize] = &[3];
        let (x, y) = ([1.0, 2.0, 3.0], [2.0, 2.0, 2.0]);
        assert_eq!(run(&OpKind::Add, &[(s, &x), (s, &y)], s), vec![3.0, 4.0, 5.0]);
        assert_eq!(run(&OpKind::Mul, &[(s, &x), (s, &y)], s), vec![2.0, 4.0, 6.0]);
        assert_eq!(run(&OpKind::Relu, &[(s, &[-1.0, 0.0, 2.0])], s), vec![0.0, 0.0, 2.0]);
        assert_eq!(run(&OpKind::Scale(0.5), &[(s, &[2.0, 4.0, 6.0])], s), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn activations() {
        let s: &[usize] = &[2];
        let silu = run(&OpKind::Silu, &[(s, &[0.0, 1.0])], s);
        assert_eq!(silu[0], 0.0);
        assert!((silu[1] - 0.731_058_6).abs() < 1e-5);
        let gelu = run(&OpKind::Gelu, &[(s, &[0.0, 1.0])], s);
        assert_eq!(gelu[0], 0.0);
        assert!((gelu[1] - 0.841_192).abs() < 1e-4);
    }

    #[test]
    fn matmul_2x3_by_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let c = run(&OpKind::MatMul, &[(&[2, 3], &a), (&[3, 2], &b)], &[2, 2]);
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let out = run(&OpKind::SoftMax, &[(&[2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0])], &[2, 3]);
        for row in out.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn rms_norm_unit_rms() {
        let out = run(&OpKind::RmsNorm { eps: 0.0 }, &[(&[4], &[2.0, 2.0, 2.0, 2.0])], &[4]);
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn cpy_converts_f32_to_f16() {
        let values = [1.0f32, -0.5, 2.0];
        let data =
            [TensorData { dtype: DType::F32, shape: &[3], bytes: bytemuck::cast_slice(&values) }];
        let args = KernelArgs {
            op: &OpKind::Copy,
            inputs: &data,
            output_dtype: DType::F16,
            output_shape: &[3],
        };
        let out = cpy(&args).unwrap();
        let halves: Vec<f16> = bytemuck::pod_collect_to_vec(&out);
        assert_eq!(halves.iter().map(|h| h.to_f32()).collect::<Vec<_>>(), values.to_vec());
    }

    #[test]
    fn f16_input_rejected_by_arithmetic() {
        let data = [TensorData { dtype: DType::F16, shape: &[2], bytes: &[0; 4] }];
        let args = KernelArgs {
            op: &OpKind::Relu,
            inputs: &data,
            output_dtype: DType::F32,
            output_shape: &[2],
        };
        let kernel = KernelLibrary::with_builtins().get("relu").unwrap();
        assert!(matches!(kernel(&args), Err(KernelError::UnsupportedDType { .. })));
    }

    #[test]
    fn custom_kernel_install() {
        let mut lib = KernelLibrary::empty();
        lib.install("fill7", |a: &KernelArgs<'_>| {
            Ok(f32_bytes(&vec![7.0; a.output_elements()]))
        });
        let args = KernelArgs {
            op: &OpKind::Custom("fill7".into()),
            inputs: &[],
            output_dtype: DType::F32,
            output_shape: &[2],
        };
        let kernel = lib.get("fill7").unwrap();
        let out: Vec<f32> = bytemuck::pod_collect_to_vec(&kernel(&args).unwrap());
        assert_eq!(out, vec![7.0, 7.0]);
        assert_eq!(lib.names(), vec!["fill7"]);
    }
}
