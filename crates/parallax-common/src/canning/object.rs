//! The dynamic value model that crosses the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::CanningError;

/// A transportable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    /// Raw memory that is always sent out-of-band.
    Buffer(Bytes),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    Dict(BTreeMap<String, Object>),
    Array(NdArray),
    Function(FunctionRef),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::Buffer(_) => "buffer",
            Object::List(_) => "list",
            Object::Tuple(_) => "tuple",
            Object::Dict(_) => "dict",
            Object::Array(_) => "ndarray",
            Object::Function(_) => "function",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Object::Float(f) => Some(*f),
            Object::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Object]> {
        match self {
            Object::List(items) | Object::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Object>> {
        match self {
            Object::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Object::None)
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Object::Bool(v)
    }
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Object::Int(v)
    }
}

impl From<i32> for Object {
    fn from(v: i32) -> Self {
        Object::Int(v as i64)
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Object::Float(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Object::Str(v.to_string())
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Object::Str(v)
    }
}

impl From<Vec<Object>> for Object {
    fn from(v: Vec<Object>) -> Self {
        Object::List(v)
    }
}

impl From<BTreeMap<String, Object>> for Object {
    fn from(v: BTreeMap<String, Object>) -> Self {
        Object::Dict(v)
    }
}

impl From<NdArray> for Object {
    fn from(v: NdArray) -> Self {
        Object::Array(v)
    }
}

impl From<FunctionRef> for Object {
    fn from(v: FunctionRef) -> Self {
        Object::Function(v)
    }
}

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn itemsize(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// A dense, C-contiguous array of little-endian elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NdArrayParts")]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

/// Unchecked wire form of [`NdArray`].
#[derive(Deserialize)]
struct NdArrayParts {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl TryFrom<NdArrayParts> for NdArray {
    type Error = CanningError;

    fn try_from(parts: NdArrayParts) -> Result<Self, Self::Error> {
        Self::new(parts.dtype, parts.shape, parts.data)
    }
}

impl NdArray {
    /// Wraps `data`, which must hold exactly `product(shape)` elements.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self, CanningError> {
        let expected = shape
            .iter()
            .try_fold(dtype.itemsize(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| CanningError::Malformed(format!("array shape {:?} is too large", shape)))?;
        if data.len() != expected {
            return Err(CanningError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, CanningError> {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(DType::F64, shape, Bytes::from(data))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>, CanningError> {
        if self.dtype != DType::F64 {
            return Err(CanningError::Malformed(format!(
                "expected f64 array, got {:?}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect())
    }
}

/// A function named by its registration, plus default argument values.
///
/// Only the name travels; each side resolves it against its own
/// [`FunctionRegistry`](super::FunctionRegistry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub defaults: Vec<Object>,
}

impl FunctionRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            defaults: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<Object>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndarray_shape_checked() {
        let err = NdArray::new(DType::F64, vec![2, 2], Bytes::from(vec![0u8; 24])).unwrap_err();
        assert!(matches!(err, CanningError::ShapeMismatch { expected: 32, actual: 24 }));
    }

    #[test]
    fn test_ndarray_oversized_shape_rejected() {
        let shape = vec![usize::MAX, 2];
        let err = NdArray::new(DType::F64, shape, Bytes::from(vec![0u8; 8])).unwrap_err();
        assert!(matches!(err, CanningError::Malformed(_)));
    }

    #[test]
    fn test_ndarray_decode_checks_shape() {
        let arr = NdArray::from_f64(vec![2], &[1.0, 2.0]).unwrap();
        let mut bad = arr.clone();
        bad.shape = vec![usize::MAX / 2, 4];
        let encoded = postcard::to_allocvec(&bad).unwrap();
        assert!(postcard::from_bytes::<NdArray>(&encoded).is_err());

        let encoded = postcard::to_allocvec(&arr).unwrap();
        assert_eq!(postcard::from_bytes::<NdArray>(&encoded).unwrap(), arr);
    }

    #[test]
    fn test_ndarray_f64_values() {
        let arr = NdArray::from_f64(vec![3], &[1.0, 2.5, -4.0]).unwrap();
        assert_eq!(arr.nbytes(), 24);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.to_f64_vec().unwrap(), vec![1.0, 2.5, -4.0]);
    }

    #[test]
    fn test_ndarray_wrong_dtype_read() {
        let arr = NdArray::new(DType::U8, vec![4], Bytes::from_static(&[1, 2, 3, 4])).unwrap();
        assert!(arr.to_f64_vec().is_err());
    }

    #[test]
    fn test_function_ref_name() {
        let f = FunctionRef::new("math", "add").with_defaults(vec![Object::Int(1)]);
        assert_eq!(f.qualified_name(), "math.add");
        assert_eq!(f.defaults, vec![Object::Int(1)]);
    }
}
