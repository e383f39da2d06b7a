//! Host-side tensors exchanged with callers and stored as graph constants.

use std::fmt;
use std::sync::Arc;

use crate::backend::ir::{DType, LiteralData, Shape, TensorLiteral};
use crate::error::{OnnxXlaError, Result};

/// ONNX element types (`TensorProto.DataType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    Float,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    Uint32,
    Uint64,
    Complex64,
    Complex128,
    Bfloat16,
}

impl ElemType {
    pub fn from_onnx(code: i32) -> Option<Self> {
        Some(match code {
            1 => ElemType::Float,
            2 => ElemType::Uint8,
            3 => ElemType::Int8,
            4 => ElemType::Uint16,
            5 => ElemType::Int16,
            6 => ElemType::Int32,
            7 => ElemType::Int64,
            8 => ElemType::String,
            9 => ElemType::Bool,
            10 => ElemType::Float16,
            11 => ElemType::Double,
            12 => ElemType::Uint32,
            13 => ElemType::Uint64,
            14 => ElemType::Complex64,
            15 => ElemType::Complex128,
            16 => ElemType::Bfloat16,
            _ => return None,
        })
    }

    pub fn onnx_code(self) -> i32 {
        match self {
            ElemType::Float => 1,
            ElemType::Uint8 => 2,
            ElemType::Int8 => 3,
            ElemType::Uint16 => 4,
            ElemType::Int16 => 5,
            ElemType::Int32 => 6,
            ElemType::Int64 => 7,
            ElemType::String => 8,
            ElemType::Bool => 9,
            ElemType::Float16 => 10,
            ElemType::Double => 11,
            ElemType::Uint32 => 12,
            ElemType::Uint64 => 13,
            ElemType::Complex64 => 14,
            ElemType::Complex128 => 15,
            ElemType::Bfloat16 => 16,
        }
    }

    /// Storage size of one element; `None` for strings.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            ElemType::Uint8 | ElemType::Int8 | ElemType::Bool => Some(1),
            ElemType::Uint16 | ElemType::Int16 | ElemType::Float16 | ElemType::Bfloat16 => Some(2),
            ElemType::Float | ElemType::Int32 | ElemType::Uint32 => Some(4),
            ElemType::Int64 | ElemType::Double | ElemType::Uint64 | ElemType::Complex64 => Some(8),
            ElemType::Complex128 => Some(16),
            ElemType::String => None,
        }
    }

    /// Program dtype this element type lowers to, if any.
    pub fn to_dtype(self) -> Option<DType> {
        match self {
            ElemType::Float => Some(DType::F32),
            ElemType::Int64 => Some(DType::Si64),
            _ => None,
        }
    }

    pub fn from_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F32 => ElemType::Float,
            DType::Si64 => ElemType::Int64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElemType::Float => "float32",
            ElemType::Uint8 => "uint8",
            ElemType::Int8 => "int8",
            ElemType::Uint16 => "uint16",
            ElemType::Int16 => "int16",
            ElemType::Int32 => "int32",
            ElemType::Int64 => "int64",
            ElemType::String => "string",
            ElemType::Bool => "bool",
            ElemType::Float16 => "float16",
            ElemType::Double => "float64",
            ElemType::Uint32 => "uint32",
            ElemType::Uint64 => "uint64",
            ElemType::Complex64 => "complex64",
            ElemType::Complex128 => "complex128",
            ElemType::Bfloat16 => "bfloat16",
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type plus (possibly symbolic) shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub elem_type: ElemType,
    pub shape: Shape,
}

impl TensorDesc {
    pub fn new(elem_type: ElemType, shape: Shape) -> Self {
        Self { elem_type, shape }
    }

    pub fn from_dims(elem_type: ElemType, dims: &[usize]) -> Self {
        Self::new(elem_type, Shape::from_static(dims))
    }

    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.shape.static_dims()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.elem_type, self.shape)
    }
}

/// Element storage. Types without a dedicated variant keep their little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    U8(Arc<[u8]>),
    Bool(Arc<[bool]>),
    Strings(Arc<[String]>),
    Raw(Arc<[u8]>),
}

/// Dense host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    elem_type: ElemType,
    dims: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Builds a tensor after checking the payload against `elem_type` and `dims`.
    pub fn new(elem_type: ElemType, dims: Vec<usize>, data: TensorData) -> Result<Self> {
        let count = dims
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| OnnxXlaError::InvalidArgument("tensor element count overflows".into()))?;
        let (len, matches_type) = match &data {
            TensorData::F32(values) => (values.len(), elem_type == ElemType::Float),
            TensorData::F64(values) => (values.len(), elem_type == ElemType::Double),
            TensorData::I32(values) => (values.len(), elem_type == ElemType::Int32),
            TensorData::I64(values) => (values.len(), elem_type == ElemType::Int64),
            TensorData::U8(values) => (values.len(), elem_type == ElemType::Uint8),
            TensorData::Bool(values) => (values.len(), elem_type == ElemType::Bool),
            TensorData::Strings(values) => (values.len(), elem_type == ElemType::String),
            TensorData::Raw(bytes) => {
                let size = elem_type.size_in_bytes().ok_or_else(|| {
                    OnnxXlaError::InvalidArgument(format!("{elem_type} has no raw encoding"))
                })?;
                if bytes.len() % size != 0 {
                    return Err(OnnxXlaError::InvalidArgument(format!(
                        "{} raw bytes are not a whole number of {elem_type} elements",
                        bytes.len()
                    )));
                }
                (bytes.len() / size, true)
            }
        };
        if !matches_type {
            return Err(OnnxXlaError::InvalidArgument(format!(
                "payload does not hold {elem_type} elements"
            )));
        }
        if len != count {
            return Err(OnnxXlaError::InvalidArgument(format!(
                "shape {dims:?} needs {count} elements, payload has {len}"
            )));
        }
        Ok(Self {
            elem_type,
            dims,
            data,
        })
    }

    pub fn from_f32(dims: &[usize], values: impl Into<Arc<[f32]>>) -> Result<Self> {
        Self::new(ElemType::Float, dims.to_vec(), TensorData::F32(values.into()))
    }

    pub fn from_i64(dims: &[usize], values: impl Into<Arc<[i64]>>) -> Result<Self> {
        Self::new(ElemType::Int64, dims.to_vec(), TensorData::I64(values.into()))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            elem_type: ElemType::Float,
            dims: Vec::new(),
            data: TensorData::F32(Arc::from(vec![value])),
        }
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::from_dims(self.elem_type, &self.dims)
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(values) => Some(values),
            _ => None,
        }
    }

    /// Integer view used for shape-like constants (`int64` or `int32`).
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match &self.data {
            TensorData::I64(values) => Some(values.to_vec()),
            TensorData::I32(values) => Some(values.iter().map(|&v| v as i64).collect()),
            _ => None,
        }
    }

    /// Converts to a program literal; only element types with a program dtype convert.
    pub fn to_literal(&self) -> Result<TensorLiteral> {
        let data = match &self.data {
            TensorData::F32(values) => LiteralData::F32(values.clone()),
            TensorData::I64(values) => LiteralData::Si64(values.clone()),
            _ => {
                return Err(OnnxXlaError::InvalidArgument(format!(
                    "{} tensors cannot be passed to a device",
                    self.elem_type
                )))
            }
        };
        let dtype = data.dtype();
        TensorLiteral::new(crate::backend::ir::TensorSpec::from_dims(dtype, &self.dims), data)
            .map_err(|err| OnnxXlaError::InvalidArgument(err.to_string()))
    }

    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        let dims = literal.spec.static_dims().ok_or_else(|| {
            OnnxXlaError::InvalidArgument("device returned a dynamically shaped literal".into())
        })?;
        match &literal.data {
            LiteralData::F32(values) => Self::from_f32(&dims, values.clone()),
            LiteralData::Si64(values) => Self::from_i64(&dims, values.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_is_checked() {
        let err = Tensor::from_f32(&[2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidArgument(_)));
        let tensor = Tensor::from_f32(&[2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(tensor.len(), 6);
        assert_eq!(tensor.desc(), TensorDesc::from_dims(ElemType::Float, &[2, 3]));
    }

    #[test]
    fn raw_payloads_must_align_to_element_size() {
        let err = Tensor::new(
            ElemType::Float16,
            vec![2],
            TensorData::Raw(Arc::from(vec![0u8; 3])),
        )
        .unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidArgument(_)));
        assert!(Tensor::new(
            ElemType::Float16,
            vec![2],
            TensorData::Raw(Arc::from(vec![0u8; 4]))
        )
        .is_ok());
    }

    #[test]
    fn only_device_types_convert_to_literals() {
        let tensor = Tensor::from_i64(&[3], vec![1, 2, 3]).unwrap();
        let literal = tensor.to_literal().unwrap();
        assert_eq!(literal.as_i64(), Some(&[1i64, 2, 3][..]));
        assert_eq!(Tensor::from_literal(&literal).unwrap(), tensor);

        let doubles =
            Tensor::new(ElemType::Double, vec![1], TensorData::F64(Arc::from(vec![1.0]))).unwrap();
        assert!(doubles.to_literal().is_err());
    }

    #[test]
    fn onnx_codes_round_trip() {
        for code in 1..=16 {
            let elem = ElemType::from_onnx(code).unwrap();
            assert_eq!(elem.onnx_code(), code);
        }
        assert_eq!(ElemType::from_onnx(0), None);
        assert_eq!(ElemType::from_onnx(17), None);
    }
}
