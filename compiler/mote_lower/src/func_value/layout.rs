//! Closure context layouts.

use mote_ir::{DataLayout, Module, Type};
use rustc_hash::FxHashMap;

use crate::error::LowerResult;

/// How a closure's captured values are passed in its context pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextLayout {
    /// No captures: the context is `null`.
    Empty,
    /// A single pointer capture is the context itself.
    Direct,
    /// Captures live in a record the context points to.
    Record {
        /// Named struct type of the record.
        ty: Type,
        /// Record field holding each capture, by capture index.
        fields: Vec<u32>,
        size: u32,
    },
}

/// Assigns layouts, sharing one record type between identical field lists.
#[derive(Default)]
pub(super) struct LayoutInterner {
    records: FxHashMap<Vec<Type>, Type>,
    next: u32,
}

impl LayoutInterner {
    pub fn layout(
        &mut self,
        module: &mut Module,
        pointer_size: u32,
        captures: &[Type],
    ) -> LowerResult<ContextLayout> {
        match captures {
            [] => return Ok(ContextLayout::Empty),
            [Type::Ptr] => return Ok(ContextLayout::Direct),
            _ => {}
        }

        // Largest alignment first; ties keep capture order.
        let mut order: Vec<usize> = (0..captures.len()).collect();
        {
            let data = DataLayout::new(module, pointer_size);
            order.sort_by_key(|&i| std::cmp::Reverse(data.align_of(&captures[i])));
        }
        let mut fields = vec![0u32; captures.len()];
        for (position, &capture) in order.iter().enumerate() {
            fields[capture] = position as u32;
        }
        let sorted: Vec<Type> = order.iter().map(|&i| captures[i].clone()).collect();

        let ty = match self.records.get(&sorted) {
            Some(ty) => ty.clone(),
            None => {
                let name = loop {
                    let candidate = format!("ctx.{}", self.next);
                    self.next += 1;
                    if module.type_def(&candidate).is_none() {
                        break candidate;
                    }
                };
                let ty = module.intern_type(&name, Type::Struct(sorted.clone()));
                self.records.insert(sorted, ty.clone());
                ty
            }
        };
        let size = DataLayout::new(module, pointer_size).size_of(&ty)?;
        Ok(ContextLayout::Record { ty, fields, size })
    }
}
