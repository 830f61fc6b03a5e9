use std::{sync::Arc, time::Duration};

use log::debug;
use parking_lot::RwLock;
use snafu::ensure;

use crate::{
    dtype::{DType, Elem},
    error::{DTypeMismatchSnafu, Result},
    ops::{LazyOp, OpInfo},
    symbolic::{sym_infer, VarVals},
};

/// Device memory. Clones share the same bytes, which is how a contiguous
/// copy of a contiguous buffer aliases its source. `device` is the backend
/// that handed the buffer out, if any.
#[derive(Clone, Debug)]
pub struct RawBuffer {
    dtype: DType,
    size: usize,
    device: Option<Arc<str>>,
    data: Arc<RwLock<Vec<u8>>>,
}

impl RawBuffer {
    /// `size` zeroed elements.
    pub fn new(size: usize, dtype: DType) -> RawBuffer {
        RawBuffer {
            dtype,
            size,
            device: None,
            data: Arc::new(RwLock::new(vec![0; size * dtype.itemsize()])),
        }
    }

    /// # Errors
    ///
    /// `DTypeMismatch` if the byte count isn't a multiple of the item size.
    pub fn from_bytes(bytes: &[u8], dtype: DType) -> Result<RawBuffer> {
        ensure!(
            bytes.len() % dtype.itemsize() == 0,
            DTypeMismatchSnafu {
                expected: format!("multiple of {} bytes", dtype.itemsize()),
                actual: format!("{} bytes", bytes.len()),
            }
        );
        Ok(RawBuffer {
            dtype,
            size: bytes.len() / dtype.itemsize(),
            device: None,
            data: Arc::new(RwLock::new(bytes.to_vec())),
        })
    }

    pub fn from_values(values: &[f64], dtype: DType) -> RawBuffer {
        RawBuffer {
            dtype,
            size: values.len(),
            device: None,
            data: Arc::new(RwLock::new(dtype.encode(values))),
        }
    }

    pub fn from_elems<E: Elem>(values: &[E]) -> RawBuffer {
        RawBuffer {
            dtype: E::DTYPE,
            size: values.len(),
            device: None,
            data: Arc::new(RwLock::new(E::to_buffer(values).into_owned())),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: &str) -> RawBuffer {
        self.device = Some(device.into());
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn read_f64(&self) -> Vec<f64> {
        self.dtype.decode(&self.data.read())
    }

    /// Overwrite the first `values.len()` elements.
    pub fn write_f64(&self, values: &[f64]) {
        let bytes = self.dtype.encode(values);
        let mut data = self.data.write();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
    }

    /// # Errors
    ///
    /// `DTypeMismatch` if `E` isn't the buffer's dtype.
    pub fn to_vec<E: Elem>(&self) -> Result<Vec<E>> {
        ensure!(
            E::DTYPE == self.dtype,
            DTypeMismatchSnafu {
                expected: self.dtype.to_string(),
                actual: E::DTYPE.to_string(),
            }
        );
        Ok(E::from_buffer(&self.data.read()))
    }

    /// Whether both handles point at the same memory.
    pub fn ptr_eq(&self, other: &RawBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Interpreted devices walk the AST directly. Compiled devices lower it to
/// a kernel and inline unrealized constants into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Interpreted,
    Compiled,
}

/// A device that can hold buffers and run scheduled ASTs.
pub trait Backend {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Buffers handed out by a backend carry its name.
    ///
    /// # Errors
    ///
    /// Backend specific allocation failures.
    fn allocate(&self, size: usize, dtype: DType) -> Result<RawBuffer> {
        Ok(RawBuffer::new(size, dtype).with_device(self.name()))
    }

    /// # Errors
    ///
    /// `DTypeMismatch` if `bytes` doesn't hold whole elements.
    fn from_host(&self, bytes: &[u8], dtype: DType) -> Result<RawBuffer> {
        Ok(RawBuffer::from_bytes(bytes, dtype)?.with_device(self.name()))
    }

    /// # Errors
    ///
    /// Backend specific transfer failures.
    fn to_host(&self, buf: &RawBuffer) -> Result<Vec<u8>> {
        Ok(buf.bytes())
    }

    /// Run `ast` writing into `output`. `inputs[i]` is buffer slot `i + 1`.
    /// Returns the kernel time if the backend measured it.
    ///
    /// # Errors
    ///
    /// Anything the backend can't execute.
    fn exec_ast(
        &mut self,
        ast: &LazyOp,
        output: &RawBuffer,
        inputs: &[RawBuffer],
        var_vals: &VarVals,
    ) -> Result<Option<Duration>>;
}

/// Running totals over executed kernels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub kernel_count: usize,
    pub global_ops: i64,
    pub global_mem: i64,
    pub time_sum: Duration,
}

impl Stats {
    pub fn record(&mut self, name: &str, info: &OpInfo, var_vals: &VarVals, elapsed: Option<Duration>) {
        let ops = sym_infer(&info.flops, var_vals).unwrap_or(0);
        let mem = sym_infer(&info.mem_estimate(), var_vals).unwrap_or(0);
        self.kernel_count += 1;
        self.global_ops += ops;
        self.global_mem += mem;
        if let Some(et) = elapsed {
            self.time_sum += et;
        }
        debug!(
            "*** {:4} {name:<24} ops {ops:>10} mem {mem:>10} tm {:>9.2?} tot ops {:>12} mem {:>12}",
            self.kernel_count,
            elapsed.unwrap_or_default(),
            self.global_ops,
            self.global_mem
        );
    }
}
