//! IR types.
//!
//! The type language is deliberately small: integers, an untyped pointer,
//! the two high-level pair types (`iface` and `func`), aggregates, named
//! references and `opaque` storage whose internal layout is unknown.

use std::fmt;

/// A type in the IR.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Void,
    /// Integer of the given bit width (`i1`, `i8`, ..., `i64`).
    Int(u32),
    /// Untyped pointer.
    Ptr,
    /// Interface value: `{ i32 typecode, ptr data }`.
    Iface,
    /// Function value: `{ ptr context, ptr code }`.
    Func,
    Struct(Vec<Type>),
    Array(u64, Box<Type>),
    /// Reference to a `type %Name = ...` definition.
    Named(String),
    /// `opaque N`: N bytes the compiler cannot see into.
    Opaque(u32),
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    /// Field types of the structural expansion of a pair or struct type.
    ///
    /// `iface` and `func` expand to their two fields; named types are not
    /// resolved here (see [`Module::resolve`](crate::Module::resolve)).
    pub fn fields(&self) -> Option<Vec<Type>> {
        match self {
            Type::Iface => Some(vec![Type::I32, Type::Ptr]),
            Type::Func => Some(vec![Type::Ptr, Type::Ptr]),
            Type::Struct(fields) => Some(fields.clone()),
            _ => None,
        }
    }

    /// Collect the names of every named type referenced by this type.
    pub fn named_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Type::Named(name) => out.push(name),
            Type::Struct(fields) => {
                for field in fields {
                    field.named_refs(out);
                }
            }
            Type::Array(_, elem) => elem.named_refs(out),
            _ => {}
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Ptr => f.write_str("ptr"),
            Type::Iface => f.write_str("iface"),
            Type::Func => f.write_str("func"),
            Type::Struct(fields) => {
                if fields.is_empty() {
                    return f.write_str("{}");
                }
                f.write_str("{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str(" }")
            }
            Type::Array(len, elem) => write!(f, "[{len} x {elem}]"),
            Type::Named(name) => {
                f.write_str("%")?;
                crate::print::write_name(f, name)
            }
            Type::Opaque(size) => write!(f, "opaque {size}"),
        }
    }
}

/// A `type %Name = T` definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub ty: Type,
}
