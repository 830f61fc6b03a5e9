use std::{borrow::Cow, cmp::Ordering, fmt::Display};

use half::f16;

/// Element type of a buffer. Ordering follows promotion priority, so the
/// result type of an elementwise op is the `max` of its sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    Uint8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    Half4,
    Float2,
    Float4,
    /// Two int32 packed, used for image coordinates.
    Int2,
    /// A 2d image of `height x width` float4 texels.
    Image {
        half: bool,
        height: i64,
        width: i64,
    },
}

impl DType {
    pub fn priority(self) -> u8 {
        match self {
            DType::Bool
            | DType::Int8
            | DType::Uint8
            | DType::Float16
            | DType::Float64
            | DType::Half4 => 0,
            DType::Int32 => 1,
            DType::Int64 | DType::Int2 => 2,
            DType::Float32 | DType::Float2 | DType::Float4 => 4,
            DType::Image { .. } => 100,
        }
    }

    pub fn itemsize(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::Uint8 => 1,
            DType::Float16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 | DType::Half4 | DType::Float2 | DType::Int2 => 8,
            DType::Float4 => 16,
            DType::Image { half, .. } => {
                if half {
                    2
                } else {
                    4
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "char",
            DType::Uint8 => "unsigned char",
            DType::Int32 => "int",
            DType::Int64 => "long",
            DType::Float16 => "half",
            DType::Float32 => "float",
            DType::Float64 => "double",
            DType::Half4 => "half4",
            DType::Float2 => "float2",
            DType::Float4 => "float4",
            DType::Int2 => "int2",
            DType::Image { half: true, .. } => "imageh",
            DType::Image { half: false, .. } => "imagef",
        }
    }

    /// Number of scalar lanes.
    pub fn sz(self) -> usize {
        match self {
            DType::Half4 | DType::Float4 => 4,
            DType::Float2 | DType::Int2 => 2,
            _ => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DType::Float16
                | DType::Float32
                | DType::Float64
                | DType::Half4
                | DType::Float2
                | DType::Float4
                | DType::Image { .. }
        )
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            DType::Int8 | DType::Uint8 | DType::Int32 | DType::Int64 | DType::Int2
        )
    }

    pub fn is_image(self) -> bool {
        matches!(self, DType::Image { .. })
    }

    /// The scalar type a buffer of this dtype is stored as on the host.
    /// Images are stored as their texel element type.
    #[must_use]
    pub fn scalar(self) -> DType {
        match self {
            DType::Image { half: true, .. } | DType::Half4 => DType::Float16,
            DType::Image { half: false, .. } | DType::Float2 | DType::Float4 => DType::Float32,
            DType::Int2 => DType::Int32,
            d => d,
        }
    }

    /// Number of elements of an image, `height * width * 4`.
    pub fn image_shape(self) -> Option<[i64; 3]> {
        match self {
            DType::Image { height, width, .. } => Some([height, width, 4]),
            _ => None,
        }
    }

    /// Decode a host byte buffer of this dtype into f64 values.
    pub fn decode(self, bytes: &[u8]) -> Vec<f64> {
        match self.scalar() {
            DType::Bool => bool::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Int8 => i8::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Uint8 => u8::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Int32 => i32::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Int64 => i64::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Float16 => f16::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
            DType::Float64 => f64::from_buffer(bytes),
            _ => f32::from_buffer(bytes).into_iter().map(Elem::to_f64).collect(),
        }
    }

    /// Encode f64 values as host bytes of this dtype, truncating toward zero for ints.
    pub fn encode(self, values: &[f64]) -> Vec<u8> {
        fn enc<E: Elem>(values: &[f64]) -> Vec<u8> {
            let typed: Vec<E> = values.iter().map(|v| E::from_f64(*v)).collect();
            E::to_buffer(&typed).into_owned()
        }
        match self.scalar() {
            DType::Bool => enc::<bool>(values),
            DType::Int8 => enc::<i8>(values),
            DType::Uint8 => enc::<u8>(values),
            DType::Int32 => enc::<i32>(values),
            DType::Int64 => enc::<i64>(values),
            DType::Float16 => enc::<f16>(values),
            DType::Float64 => enc::<f64>(values),
            _ => enc::<f32>(values),
        }
    }

    /// Round a value through this dtype, as storing and loading it would.
    pub fn cast_value(self, v: f64) -> f64 {
        match self.scalar() {
            DType::Bool => bool::from_f64(v).to_f64(),
            DType::Int8 => i8::from_f64(v).to_f64(),
            DType::Uint8 => u8::from_f64(v).to_f64(),
            DType::Int32 => i32::from_f64(v).to_f64(),
            DType::Int64 => i64::from_f64(v).to_f64(),
            DType::Float16 => f16::from_f64(v).to_f64(),
            DType::Float64 => v,
            _ => f32::from_f64(v).to_f64(),
        }
    }
}

impl PartialOrd for DType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DType {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority(), self.itemsize(), self.name(), self.image_shape()).cmp(&(
            other.priority(),
            other.itemsize(),
            other.name(),
            other.image_shape(),
        ))
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Image {
                height, width, ..
            } => write!(f, "dtypes.{}(({height}, {width}, 4))", self.name()),
            _ => write!(f, "dtypes.{}", self.name()),
        }
    }
}

/// A host element type that can be stored in a buffer.
pub trait Elem: 'static + Copy
where
    Self: Sized,
{
    const DTYPE: DType;
    fn from_buffer(array: &[u8]) -> Vec<Self>;
    fn to_buffer(array: &[Self]) -> Cow<'_, [u8]>;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_pod_elem {
    ($t:ty, $dtype:expr) => {
        impl Elem for $t {
            const DTYPE: DType = $dtype;

            fn from_buffer(array: &[u8]) -> Vec<Self> {
                array
                    .chunks_exact(std::mem::size_of::<Self>())
                    .map(bytemuck::pod_read_unaligned::<Self>)
                    .collect()
            }

            fn to_buffer(array: &[Self]) -> Cow<'_, [u8]> {
                Cow::Borrowed(bytemuck::cast_slice(array))
            }

            #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

impl_pod_elem!(f32, DType::Float32);
impl_pod_elem!(f64, DType::Float64);
impl_pod_elem!(i8, DType::Int8);
impl_pod_elem!(u8, DType::Uint8);
impl_pod_elem!(i32, DType::Int32);
impl_pod_elem!(i64, DType::Int64);

impl Elem for f16 {
    const DTYPE: DType = DType::Float16;

    fn from_buffer(array: &[u8]) -> Vec<Self> {
        array
            .chunks_exact(2)
            .map(bytemuck::pod_read_unaligned::<Self>)
            .collect()
    }

    fn to_buffer(array: &[Self]) -> Cow<'_, [u8]> {
        Cow::Borrowed(bytemuck::cast_slice(array))
    }

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }
}

// bool isn't Pod, so it goes through a byte per element.
impl Elem for bool {
    const DTYPE: DType = DType::Bool;

    fn from_buffer(array: &[u8]) -> Vec<Self> {
        array.iter().map(|x| *x != 0).collect()
    }

    fn to_buffer(array: &[Self]) -> Cow<'_, [u8]> {
        Cow::Owned(array.iter().map(|b| u8::from(*b)).collect())
    }

    fn to_f64(self) -> f64 {
        f64::from(u8::from(self))
    }

    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_order() {
        assert_eq!(DType::Int32.max(DType::Float32), DType::Float32);
        assert_eq!(DType::Bool.max(DType::Int32), DType::Int32);
        assert_eq!(DType::Int64.max(DType::Int32), DType::Int64);
        let img = DType::Image {
            half: false,
            height: 4,
            width: 4,
        };
        assert_eq!(img.max(DType::Float32), img);
    }

    #[test]
    fn test_encode_decode_unaligned() {
        let bytes = DType::Float32.encode(&[1.0, -2.5, 3.0]);
        // a slice starting at an odd offset must still decode
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(DType::Float32.decode(&shifted[1..]), vec![1.0, -2.5, 3.0]);
    }

    #[test]
    fn test_int_encode_truncates() {
        let bytes = DType::Int32.encode(&[1.9, -1.9]);
        assert_eq!(DType::Int32.decode(&bytes), vec![1.0, -1.0]);
        assert_eq!(DType::Bool.cast_value(0.3), 1.0);
        assert_eq!(DType::Float16.cast_value(1.0 / 3.0), f16::from_f64(1.0 / 3.0).to_f64());
    }
}
