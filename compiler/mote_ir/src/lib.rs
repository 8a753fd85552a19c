//! Whole-program IR for the mote compiler.
//!
//! This crate provides:
//!
//! - **Module model** ([`Module`], [`Function`], [`Body`], [`Inst`]): one
//!   link unit of functions, globals, named types, and the concrete-type and
//!   interface declarations consumed by interface lowering.
//! - **Text format**: a logos lexer, [`parse_module`] and a canonical
//!   printer (`Display` for [`Module`]). Printing is deterministic and
//!   parse → print is a fixed point.
//! - **Analyses** shared by the lowering passes: CFG utilities
//!   ([`graph`]), SSA liveness ([`liveness`]), target layout ([`layout`]).
//! - **Verification** ([`verify_module`]) and package linking
//!   ([`link_modules`]).
//! - **GC root table** ([`RootTable`]) attached to the module by GC
//!   instrumentation.
//!
//! The IR is backend-neutral: nothing here knows about machine code.

pub mod graph;
pub mod ir;
pub mod layout;
mod lexer;
pub mod link;
pub mod liveness;
pub mod module;
pub mod parse;
pub mod print;
pub mod roots;
pub mod types;
pub mod verify;

#[cfg(test)]
mod test_helpers;

pub use ir::{
    Arg, BinOp, Block, BlockId, BlockingOp, Body, CallConv, DebugLoc, FnAttrs, Function,
    ICmpPred, Inst, InstKind, Operand, Placement, Terminator, ValueDef, ValueId, ValueInfo,
};
pub use layout::{DataLayout, LayoutOverflow, PointerMap};
pub use link::{link_modules, LinkError};
pub use liveness::{compute_liveness, BlockLiveness, LiveSet};
pub use module::{ConcreteDecl, Constant, Global, InterfaceDecl, Linkage, Module};
pub use parse::{parse_module, ParseError};
pub use print::{inst_to_string, print_module, FunctionDisplay, InstDisplay, TermDisplay};
pub use roots::{FrameDescriptor, FrameSlot, GlobalRoot, RootTable, SlotLayout};
pub use types::{Type, TypeDef};
pub use verify::{verify_module, VerifyError};
