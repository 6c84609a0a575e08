//! Value model
//!
//! Scalar and vector values stored in entity columns. Rows are positional:
//! `Tuple::values[i]` belongs to the i-th column of the entity, `None` is NULL.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a row within its entity
pub type TupleId = u64;

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    BooleanVector(usize),
    IntVector(usize),
    LongVector(usize),
    FloatVector(usize),
    DoubleVector(usize),
}

impl Type {
    /// Numeric scalar types
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Long | Type::Float | Type::Double)
    }

    pub fn is_vector(&self) -> bool {
        self.dimension().is_some()
    }

    /// Number of components for vector types
    pub fn dimension(&self) -> Option<usize> {
        match self {
            Type::BooleanVector(d)
            | Type::IntVector(d)
            | Type::LongVector(d)
            | Type::FloatVector(d)
            | Type::DoubleVector(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Boolean => write!(f, "BOOLEAN"),
            Type::Int => write!(f, "INTEGER"),
            Type::Long => write!(f, "LONG"),
            Type::Float => write!(f, "FLOAT"),
            Type::Double => write!(f, "DOUBLE"),
            Type::String => write!(f, "STRING"),
            Type::BooleanVector(d) => write!(f, "BOOL_VEC({})", d),
            Type::IntVector(d) => write!(f, "INT_VEC({})", d),
            Type::LongVector(d) => write!(f, "LONG_VEC({})", d),
            Type::FloatVector(d) => write!(f, "FLOAT_VEC({})", d),
            Type::DoubleVector(d) => write!(f, "DOUBLE_VEC({})", d),
        }
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    BooleanVector(Vec<bool>),
    IntVector(Vec<i32>),
    LongVector(Vec<i64>),
    FloatVector(Vec<f32>),
    DoubleVector(Vec<f64>),
}

impl Value {
    /// The type this value belongs to
    pub fn value_type(&self) -> Type {
        match self {
            Value::Boolean(_) => Type::Boolean,
            Value::Int(_) => Type::Int,
            Value::Long(_) => Type::Long,
            Value::Float(_) => Type::Float,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::BooleanVector(v) => Type::BooleanVector(v.len()),
            Value::IntVector(v) => Type::IntVector(v.len()),
            Value::LongVector(v) => Type::LongVector(v.len()),
            Value::FloatVector(v) => Type::FloatVector(v.len()),
            Value::DoubleVector(v) => Type::DoubleVector(v.len()),
        }
    }

    /// Whether this value may be stored in a column of type `ty`
    pub fn conforms_to(&self, ty: Type) -> bool {
        self.value_type() == ty
    }

    /// Numeric scalar as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Vector components as f64; booleans map to 0.0 and 1.0
    pub fn as_f64_vector(&self) -> Option<Vec<f64>> {
        match self {
            Value::BooleanVector(v) => Some(v.iter().map(|b| if *b { 1.0 } else { 0.0 }).collect()),
            Value::IntVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::LongVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::FloatVector(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Value::DoubleVector(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A row read from an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub tuple_id: TupleId,
    pub values: Vec<Option<Value>>,
}

impl Tuple {
    pub fn new(tuple_id: TupleId, values: Vec<Option<Value>>) -> Self {
        Self { tuple_id, values }
    }

    pub fn get(&self, position: usize) -> Option<&Value> {
        self.values.get(position).and_then(|v| v.as_ref())
    }
}
