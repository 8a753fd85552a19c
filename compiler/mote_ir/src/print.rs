//! Canonical printer for the textual IR.
//!
//! Output is a pure function of the module: the same module always prints
//! to the same bytes, and printing then parsing is a fixed point.

use std::fmt::{self, Write};

use crate::ir::{
    Arg, Block, BlockId, BlockingOp, Body, CallConv, DebugLoc, FnAttrs, Function, Inst, InstKind,
    Operand, Terminator,
};
use crate::module::{Constant, Global, Module};
use crate::roots::{RootTable, SlotLayout};
use crate::types::Type;

/// Characters allowed in an unquoted name.
pub(crate) fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '$')
}

/// Write a symbol or local name, quoting it when necessary.
pub fn write_name(f: &mut impl Write, name: &str) -> fmt::Result {
    if !name.is_empty() && name.chars().all(is_name_char) {
        f.write_str(name)
    } else {
        f.write_char('"')?;
        for c in name.chars() {
            if matches!(c, '"' | '\\') {
                f.write_char('\\')?;
            }
            f.write_char(c)?;
        }
        f.write_char('"')
    }
}

fn write_string(f: &mut impl Write, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                f.write_char('\\')?;
                f.write_char(c)?;
            }
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            _ => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

fn write_loc(f: &mut impl Write, loc: Option<&DebugLoc>) -> fmt::Result {
    if let Some(loc) = loc {
        f.write_str(" !loc(")?;
        write_string(f, &loc.file)?;
        write!(f, ", {}, {})", loc.line, loc.column)?;
    }
    Ok(())
}

// ── Module ──────────────────────────────────────────────────────────

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut section = false;
        if let Some(name) = &self.source_filename {
            f.write_str("source_filename = ")?;
            write_string(f, name)?;
            f.write_char('\n')?;
            section = true;
        }
        if let Some(triple) = &self.target_triple {
            f.write_str("target triple = ")?;
            write_string(f, triple)?;
            f.write_char('\n')?;
            section = true;
        }

        let mut begin_section = |f: &mut fmt::Formatter<'_>, non_empty: bool| -> fmt::Result {
            if non_empty && section {
                f.write_char('\n')?;
            }
            section |= non_empty;
            Ok(())
        };

        begin_section(f, !self.types.is_empty())?;
        for def in &self.types {
            f.write_str("type %")?;
            write_name(f, &def.name)?;
            writeln!(f, " = {}", def.ty)?;
        }

        begin_section(f, !self.concretes.is_empty() || !self.interfaces.is_empty())?;
        for concrete in &self.concretes {
            f.write_str("concrete %")?;
            write_name(f, &concrete.name)?;
            f.write_str(" {")?;
            for (i, (method, imp)) in concrete.methods.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                write_name(f, method)?;
                f.write_str(" = @")?;
                write_name(f, imp)?;
            }
            f.write_str(if concrete.methods.is_empty() { "}\n" } else { " }\n" })?;
        }
        for iface in &self.interfaces {
            f.write_str("interface %")?;
            write_name(f, &iface.name)?;
            f.write_str(" {")?;
            for (i, method) in iface.methods.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                write_name(f, method)?;
            }
            f.write_str(if iface.methods.is_empty() { "}\n" } else { " }\n" })?;
        }

        begin_section(f, !self.globals.is_empty())?;
        for global in &self.globals {
            write_global(f, self, global)?;
        }

        let mut prev_was_decl = false;
        for function in &self.functions {
            let is_decl = function.is_declaration();
            if !(is_decl && prev_was_decl) {
                begin_section(f, true)?;
            }
            write_function(f, function)?;
            prev_was_decl = is_decl;
        }

        if let Some(roots) = &self.roots {
            begin_section(f, true)?;
            write_roots(f, roots)?;
        }
        Ok(())
    }
}

fn write_global(f: &mut impl Write, module: &Module, global: &Global) -> fmt::Result {
    f.write_char('@')?;
    write_name(f, &global.name)?;
    f.write_str(" = ")?;
    if let Some(kw) = global.linkage.keyword() {
        write!(f, "{kw} ")?;
    }
    f.write_str(if global.constant { "constant " } else { "global " })?;
    write!(f, "{}", global.ty)?;
    if let Some(init) = &global.init {
        f.write_char(' ')?;
        write_constant(f, module, &global.ty, init)?;
    }
    if let Some(align) = global.align {
        write!(f, ", align {align}")?;
    }
    f.write_char('\n')
}

fn write_constant(f: &mut impl Write, module: &Module, ty: &Type, c: &Constant) -> fmt::Result {
    match c {
        Constant::Int(n) => write!(f, "{n}"),
        Constant::Null => f.write_str("null"),
        Constant::Undef => f.write_str("undef"),
        Constant::Zero => f.write_str("zeroinitializer"),
        Constant::Symbol(name) => {
            f.write_char('@')?;
            write_name(f, name)
        }
        Constant::Aggregate(elems) => {
            let is_array = matches!(module.resolve(ty), Some(Type::Array(..)));
            f.write_str(if is_array { "[" } else { "{ " })?;
            for (i, (elem_ty, elem)) in elems.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{elem_ty} ")?;
                write_constant(f, module, elem_ty, elem)?;
            }
            f.write_str(if is_array { "]" } else { " }" })
        }
    }
}

// ── Functions ───────────────────────────────────────────────────────

fn write_fn_prefix(f: &mut impl Write, function: &Function) -> fmt::Result {
    f.write_str(if function.is_declaration() {
        "declare"
    } else {
        "define"
    })?;
    for (flag, kw) in FnAttrs::KEYWORDS {
        if function.attrs.contains(*flag) {
            write!(f, " {kw}")?;
        }
    }
    if function.cc == CallConv::Closure {
        f.write_str(" closurecc")?;
    }
    write!(f, " {} @", function.ret)?;
    write_name(f, &function.name)
}

fn write_function(f: &mut impl Write, function: &Function) -> fmt::Result {
    write_fn_prefix(f, function)?;
    f.write_char('(')?;
    match &function.body {
        None => {
            for (i, ty) in function.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{ty}")?;
            }
            f.write_char(')')?;
            write_loc(f, function.loc.as_ref())?;
            f.write_char('\n')
        }
        Some(body) => {
            for (i, param) in body.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{} ", body.value_type(*param))?;
                write_local(f, body, *param)?;
            }
            f.write_char(')')?;
            write_loc(f, function.loc.as_ref())?;
            f.write_str(" {\n")?;
            for (i, block) in body.blocks.iter().enumerate() {
                if i > 0 {
                    f.write_char('\n')?;
                }
                write_block(f, body, block)?;
            }
            f.write_str("}\n")
        }
    }
}

fn write_block(f: &mut impl Write, body: &Body, block: &Block) -> fmt::Result {
    write_name(f, &block.name)?;
    f.write_str(":\n")?;
    for inst in &block.insts {
        f.write_str("  ")?;
        write_inst(f, body, inst)?;
        f.write_char('\n')?;
    }
    f.write_str("  ")?;
    write_term(f, body, &block.term)?;
    write_loc(f, block.term_loc.as_ref())?;
    f.write_char('\n')
}

fn write_local(f: &mut impl Write, body: &Body, v: crate::ir::ValueId) -> fmt::Result {
    f.write_char('%')?;
    write_name(f, body.value_name(v))
}

fn write_label(f: &mut impl Write, body: &Body, b: BlockId) -> fmt::Result {
    f.write_str("label %")?;
    write_name(f, &body.block(b).name)
}

fn write_operand(f: &mut impl Write, body: &Body, op: &Operand) -> fmt::Result {
    match op {
        Operand::Local(v) => write_local(f, body, *v),
        Operand::Global(name) => {
            f.write_char('@')?;
            write_name(f, name)
        }
        Operand::Int(n) => write!(f, "{n}"),
        Operand::Null => f.write_str("null"),
        Operand::Undef => f.write_str("undef"),
        Operand::Zero => f.write_str("zeroinitializer"),
    }
}

fn write_typed(f: &mut impl Write, body: &Body, ty: &Type, op: &Operand) -> fmt::Result {
    write!(f, "{ty} ")?;
    write_operand(f, body, op)
}

fn write_args(f: &mut impl Write, body: &Body, args: &[Arg]) -> fmt::Result {
    for (i, (ty, op)) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_typed(f, body, ty, op)?;
    }
    Ok(())
}

fn write_align(f: &mut impl Write, align: Option<u32>) -> fmt::Result {
    match align {
        Some(align) => write!(f, ", align {align}"),
        None => Ok(()),
    }
}

fn write_inst(f: &mut impl Write, body: &Body, inst: &Inst) -> fmt::Result {
    if let Some(result) = inst.result {
        write_local(f, body, result)?;
        f.write_str(" = ")?;
    }
    match &inst.kind {
        InstKind::Binary { op, ty, lhs, rhs } => {
            write!(f, "{} ", op.as_str())?;
            write_typed(f, body, ty, lhs)?;
            f.write_str(", ")?;
            write_operand(f, body, rhs)?;
        }
        InstKind::ICmp { pred, ty, lhs, rhs } => {
            write!(f, "icmp {} ", pred.as_str())?;
            write_typed(f, body, ty, lhs)?;
            f.write_str(", ")?;
            write_operand(f, body, rhs)?;
        }
        InstKind::Alloca { ty, align } => {
            write!(f, "alloca {ty}")?;
            write_align(f, *align)?;
        }
        InstKind::Load { ty, ptr, align } => {
            write!(f, "load {ty}, ")?;
            write_typed(f, body, &Type::Ptr, ptr)?;
            write_align(f, *align)?;
        }
        InstKind::Store {
            ty,
            value,
            ptr,
            align,
        } => {
            f.write_str("store ")?;
            write_typed(f, body, ty, value)?;
            f.write_str(", ")?;
            write_typed(f, body, &Type::Ptr, ptr)?;
            write_align(f, *align)?;
        }
        InstKind::Gep { ty, base, index } => {
            write!(f, "gep {ty}, ")?;
            write_typed(f, body, &Type::Ptr, base)?;
            f.write_str(", ")?;
            write_typed(f, body, &Type::I32, index)?;
        }
        InstKind::Call { ret, callee, args } => {
            write!(f, "call {ret} ")?;
            write_operand(f, body, callee)?;
            f.write_char('(')?;
            write_args(f, body, args)?;
            f.write_char(')')?;
        }
        InstKind::Phi { ty, incoming } => {
            write!(f, "phi {ty} ")?;
            for (i, (value, from)) in incoming.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                f.write_str("[ ")?;
                write_operand(f, body, value)?;
                f.write_str(", %")?;
                write_name(f, &body.block(*from).name)?;
                f.write_str(" ]")?;
            }
        }
        InstKind::ExtractValue { ty, agg, index } => {
            f.write_str("extractvalue ")?;
            write_typed(f, body, ty, agg)?;
            write!(f, ", {index}")?;
        }
        InstKind::InsertValue {
            ty,
            agg,
            elem_ty,
            elem,
            index,
        } => {
            f.write_str("insertvalue ")?;
            write_typed(f, body, ty, agg)?;
            f.write_str(", ")?;
            write_typed(f, body, elem_ty, elem)?;
            write!(f, ", {index}")?;
        }
        InstKind::MakeIface { concrete, value } => {
            f.write_str("makeiface %")?;
            write_name(f, concrete)?;
            f.write_str(", ")?;
            write_typed(f, body, &Type::Ptr, value)?;
        }
        InstKind::DynIface {
            interface,
            typecode,
            value,
        } => {
            f.write_str("dyniface %")?;
            write_name(f, interface)?;
            f.write_str(", ")?;
            write_typed(f, body, &Type::I32, typecode)?;
            f.write_str(", ")?;
            write_typed(f, body, &Type::Ptr, value)?;
        }
        InstKind::IfaceCall {
            ret,
            method,
            receiver,
            args,
        } => {
            write!(f, "ifacecall {ret} ")?;
            write_name(f, method)?;
            f.write_char('(')?;
            write_typed(f, body, &Type::Iface, receiver)?;
            for (ty, op) in args {
                f.write_str(", ")?;
                write_typed(f, body, ty, op)?;
            }
            f.write_char(')')?;
        }
        InstKind::TypeAssert { value, concrete } => {
            f.write_str("typeassert ")?;
            write_typed(f, body, &Type::Iface, value)?;
            f.write_str(", %")?;
            write_name(f, concrete)?;
        }
        InstKind::Implements { value, interface } => {
            f.write_str("implements ")?;
            write_typed(f, body, &Type::Iface, value)?;
            f.write_str(", %")?;
            write_name(f, interface)?;
        }
        InstKind::MakeFunc {
            placement,
            target,
            captures,
        } => {
            write!(f, "makefunc {} @", placement.as_str())?;
            write_name(f, target)?;
            f.write_char('(')?;
            write_args(f, body, captures)?;
            f.write_char(')')?;
        }
        InstKind::CallFunc { ret, func, args } => {
            write!(f, "callfunc {ret} ")?;
            write_operand(f, body, func)?;
            f.write_char('(')?;
            write_args(f, body, args)?;
            f.write_char(')')?;
        }
        InstKind::Capture { ty, index } => write!(f, "capture {ty} {index}")?,
        InstKind::Spawn { target, args } => {
            f.write_str("spawn @")?;
            write_name(f, target)?;
            f.write_char('(')?;
            write_args(f, body, args)?;
            f.write_char(')')?;
        }
        InstKind::Blocking(op) => {
            write!(f, "{} ", op.mnemonic())?;
            match op {
                BlockingOp::ChanSend { ty, value, chan } => {
                    write_typed(f, body, ty, value)?;
                    f.write_str(", ")?;
                    write_typed(f, body, &Type::Ptr, chan)?;
                }
                BlockingOp::ChanRecv { ty, chan } => {
                    write!(f, "{ty}, ")?;
                    write_typed(f, body, &Type::Ptr, chan)?;
                }
                BlockingOp::Sleep { duration } => write_typed(f, body, &Type::I64, duration)?,
                BlockingOp::MutexLock { mutex } => write_typed(f, body, &Type::Ptr, mutex)?,
                BlockingOp::WaitGroupWait { group } => write_typed(f, body, &Type::Ptr, group)?,
            }
        }
    }
    write_loc(f, inst.loc.as_ref())
}

fn write_term(f: &mut impl Write, body: &Body, term: &Terminator) -> fmt::Result {
    match term {
        Terminator::Ret(None) => f.write_str("ret void"),
        Terminator::Ret(Some((ty, value))) => {
            f.write_str("ret ")?;
            write_typed(f, body, ty, value)
        }
        Terminator::Br(target) => {
            f.write_str("br ")?;
            write_label(f, body, *target)
        }
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => {
            f.write_str("br ")?;
            write_typed(f, body, &Type::I1, cond)?;
            f.write_str(", ")?;
            write_label(f, body, *then_block)?;
            f.write_str(", ")?;
            write_label(f, body, *else_block)
        }
        Terminator::Switch {
            ty,
            value,
            default,
            cases,
        } => {
            f.write_str("switch ")?;
            write_typed(f, body, ty, value)?;
            f.write_str(", ")?;
            write_label(f, body, *default)?;
            if cases.is_empty() {
                return f.write_str(" []");
            }
            f.write_str(" [ ")?;
            for (i, (val, target)) in cases.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{ty} {val}, ")?;
                write_label(f, body, *target)?;
            }
            f.write_str(" ]")
        }
        Terminator::IndirectBr { addr, targets } => {
            f.write_str("indirectbr ")?;
            write_typed(f, body, &Type::Ptr, addr)?;
            f.write_str(", [")?;
            for (i, target) in targets.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                write_label(f, body, *target)?;
            }
            f.write_str(if targets.is_empty() { "]" } else { " ]" })
        }
        Terminator::Unreachable => f.write_str("unreachable"),
    }
}

// ── Root table ──────────────────────────────────────────────────────

fn write_layout(f: &mut impl Write, layout: &SlotLayout) -> fmt::Result {
    match layout {
        SlotLayout::Precise { size, offsets } => {
            write!(f, "precise {size} ")?;
            write_index_list(f, offsets)
        }
        SlotLayout::Conservative { size } => write!(f, "conservative {size}"),
    }
}

fn write_index_list(f: &mut impl Write, items: &[u32]) -> fmt::Result {
    f.write_char('[')?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_char(']')
}

fn write_roots(f: &mut impl Write, roots: &RootTable) -> fmt::Result {
    f.write_str("gcroots {\n")?;
    for global in &roots.globals {
        f.write_str("  global @")?;
        write_name(f, &global.name)?;
        f.write_char(' ')?;
        write_layout(f, &global.layout)?;
        f.write_char('\n')?;
    }
    for frame in &roots.frames {
        write!(f, "  frame {} @", frame.id)?;
        write_name(f, &frame.function)?;
        f.write_str(" {\n")?;
        for slot in &frame.slots {
            write!(f, "    slot {} ", slot.offset)?;
            write_layout(f, &slot.layout)?;
            f.write_char('\n')?;
        }
        for (id, live) in frame.safe_points.iter().enumerate() {
            write!(f, "    safepoint {id} ")?;
            write_index_list(f, live)?;
            f.write_char('\n')?;
        }
        f.write_str("  }\n")?;
    }
    f.write_str("}\n")
}

// ── Display adapters ────────────────────────────────────────────────

/// Display adapter for one instruction in the context of its body.
pub struct InstDisplay<'a> {
    pub body: &'a Body,
    pub inst: &'a Inst,
}

impl fmt::Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_inst(f, self.body, self.inst)
    }
}

/// Display adapter for a block terminator.
pub struct TermDisplay<'a> {
    pub body: &'a Body,
    pub term: &'a Terminator,
}

impl fmt::Display for TermDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_term(f, self.body, self.term)
    }
}

/// Display adapter for one function.
pub struct FunctionDisplay<'a>(pub &'a Function);

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_function(f, self.0)
    }
}

/// Render one instruction as it would appear in the module text.
pub fn inst_to_string(body: &Body, inst: &Inst) -> String {
    InstDisplay { body, inst }.to_string()
}

/// Render a whole module.
pub fn print_module(module: &Module) -> String {
    module.to_string()
}
