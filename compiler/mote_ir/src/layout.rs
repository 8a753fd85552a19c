//! Target data layout: sizes, alignments and pointer maps.
//!
//! Integers are naturally aligned, aggregates take the alignment of their
//! most aligned field and are padded to a multiple of it. `opaque N` storage
//! has pointer alignment and an unknown pointer map.

use crate::module::Module;
use crate::types::Type;

/// Where the pointers inside a value are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PointerMap {
    /// The value holds no pointers.
    None,
    /// Exact byte offsets of every pointer field.
    Precise(Vec<u32>),
    /// Part of the layout is unknown (`opaque` storage or an unresolved type).
    Unknown,
}

impl PointerMap {
    pub fn has_pointers(&self) -> bool {
        !matches!(self, PointerMap::None)
    }
}

/// A type whose size or field offsets do not fit in 32 bits.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("type `{ty}` is too large to lay out")]
pub struct LayoutOverflow {
    pub ty: String,
}

/// Layout queries against the named types of one module.
#[derive(Clone, Copy)]
pub struct DataLayout<'m> {
    module: &'m Module,
    pointer_size: u32,
}

const MAX_DEPTH: u32 = 64;

/// Pointer maps longer than this are reported as [`PointerMap::Unknown`]
/// and scanned conservatively.
const MAX_POINTER_OFFSETS: usize = 4096;

#[inline]
fn align_to(offset: u32, align: u32) -> Option<u32> {
    let align = align.max(1);
    offset.div_ceil(align).checked_mul(align)
}

impl<'m> DataLayout<'m> {
    pub fn new(module: &'m Module, pointer_size: u32) -> Self {
        DataLayout {
            module,
            pointer_size,
        }
    }

    #[inline]
    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    fn int_bytes(bits: u32) -> u32 {
        bits.div_ceil(8).next_power_of_two()
    }

    fn overflow(ty: &Type) -> LayoutOverflow {
        LayoutOverflow { ty: ty.to_string() }
    }

    pub fn size_of(&self, ty: &Type) -> Result<u32, LayoutOverflow> {
        self.size_at(ty, 0).ok_or_else(|| Self::overflow(ty))
    }

    pub fn align_of(&self, ty: &Type) -> u32 {
        self.align_at(ty, 0)
    }

    /// `None` when the size does not fit in a `u32`.
    fn size_at(&self, ty: &Type, depth: u32) -> Option<u32> {
        if depth > MAX_DEPTH {
            return Some(0);
        }
        match ty {
            Type::Void => Some(0),
            Type::Int(bits) => Some(Self::int_bytes(*bits)),
            Type::Ptr => Some(self.pointer_size),
            Type::Iface | Type::Func | Type::Struct(_) => {
                let fields = ty.fields().unwrap_or_default();
                let mut offset = 0u32;
                let mut align = 1;
                for field in &fields {
                    let field_align = self.align_at(field, depth + 1);
                    align = align.max(field_align);
                    offset = align_to(offset, field_align)?
                        .checked_add(self.size_at(field, depth + 1)?)?;
                }
                align_to(offset, align)
            }
            Type::Array(len, elem) => {
                let count = u32::try_from(*len).ok()?;
                self.size_at(elem, depth + 1)?.checked_mul(count)
            }
            Type::Named(name) => self
                .module
                .type_def(name)
                .map_or(Some(0), |def| self.size_at(def, depth + 1)),
            Type::Opaque(size) => Some(*size),
        }
    }

    fn align_at(&self, ty: &Type, depth: u32) -> u32 {
        if depth > MAX_DEPTH {
            return 1;
        }
        match ty {
            Type::Void => 1,
            Type::Int(bits) => Self::int_bytes(*bits),
            Type::Ptr | Type::Opaque(_) => self.pointer_size,
            Type::Iface | Type::Func | Type::Struct(_) => ty
                .fields()
                .unwrap_or_default()
                .iter()
                .map(|f| self.align_at(f, depth + 1))
                .max()
                .unwrap_or(1),
            Type::Array(_, elem) => self.align_at(elem, depth + 1),
            Type::Named(name) => self
                .module
                .type_def(name)
                .map_or(1, |def| self.align_at(def, depth + 1)),
        }
    }

    /// Byte offset of every field of a struct-like type.
    pub fn field_offsets(&self, ty: &Type) -> Result<Vec<u32>, LayoutOverflow> {
        let Some(resolved) = self.module.resolve(ty) else {
            return Ok(Vec::new());
        };
        let Some(fields) = resolved.fields() else {
            return Ok(Vec::new());
        };
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        for field in &fields {
            offset = align_to(offset, self.align_of(field)).ok_or_else(|| Self::overflow(ty))?;
            offsets.push(offset);
            offset = offset
                .checked_add(self.size_of(field)?)
                .ok_or_else(|| Self::overflow(ty))?;
        }
        Ok(offsets)
    }

    /// Pointer map of a value of type `ty`.
    pub fn pointer_map(&self, ty: &Type) -> PointerMap {
        let mut offsets = Vec::new();
        if self.collect_pointers(ty, 0, 0, &mut offsets) {
            if offsets.is_empty() {
                PointerMap::None
            } else {
                PointerMap::Precise(offsets)
            }
        } else {
            PointerMap::Unknown
        }
    }

    /// Returns `false` when part of the layout cannot be seen, an offset
    /// overflows or the map grows past [`MAX_POINTER_OFFSETS`].
    fn collect_pointers(&self, ty: &Type, base: u32, depth: u32, out: &mut Vec<u32>) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        match ty {
            Type::Void | Type::Int(_) => true,
            Type::Ptr => {
                out.push(base);
                out.len() <= MAX_POINTER_OFFSETS
            }
            Type::Opaque(_) => false,
            Type::Iface | Type::Func | Type::Struct(_) => {
                let fields = ty.fields().unwrap_or_default();
                let mut offset = 0u32;
                for field in &fields {
                    let Some(start) = align_to(offset, self.align_at(field, depth + 1)) else {
                        return false;
                    };
                    let Some(at) = base.checked_add(start) else {
                        return false;
                    };
                    if !self.collect_pointers(field, at, depth + 1, out) {
                        return false;
                    }
                    let Some(end) = self
                        .size_at(field, depth + 1)
                        .and_then(|size| start.checked_add(size))
                    else {
                        return false;
                    };
                    offset = end;
                }
                true
            }
            Type::Array(len, elem) => {
                let mut inner = Vec::new();
                if !self.collect_pointers(elem, 0, depth + 1, &mut inner) {
                    return false;
                }
                if inner.is_empty() {
                    return true;
                }
                let (Some(stride), Ok(count)) = (self.size_at(elem, depth + 1), u32::try_from(*len))
                else {
                    return false;
                };
                let total = (count as usize).saturating_mul(inner.len());
                if total.saturating_add(out.len()) > MAX_POINTER_OFFSETS {
                    return false;
                }
                for i in 0..count {
                    let Some(start) = i.checked_mul(stride).and_then(|s| base.checked_add(s)) else {
                        return false;
                    };
                    for &o in &inner {
                        let Some(at) = start.checked_add(o) else {
                            return false;
                        };
                        out.push(at);
                    }
                }
                true
            }
            Type::Named(name) => match self.module.type_def(name) {
                Some(def) => self.collect_pointers(def, base, depth + 1, out),
                None => false,
            },
        }
    }
}
