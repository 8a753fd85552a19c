//! Function-level IR: values, instructions, terminators, blocks and bodies.
//!
//! # Architecture
//!
//! - **[`Function`]**: signature, attributes, calling convention and an
//!   optional [`Body`] (absent for declarations)
//! - **[`Body`]**: value table plus ordered basic blocks; the first block is
//!   the entry block
//! - **[`Block`]**: straight-line [`Inst`]s ending in a [`Terminator`]
//!
//! Values are SSA: each [`ValueId`] is defined exactly once, either as a
//! parameter or as the result of an instruction. Value names are unique
//! within a body and survive printing.

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::types::Type;

// ── ID newtypes ─────────────────────────────────────────────────────

/// SSA value within a single [`Body`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueId(u32);

impl ValueId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Basic block within a single [`Body`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ── Debug locations ─────────────────────────────────────────────────

/// Source position attached to an instruction or function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for DebugLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

// ── Operands ────────────────────────────────────────────────────────

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Local(ValueId),
    Global(String),
    Int(i64),
    Null,
    Undef,
    Zero,
}

impl Operand {
    pub fn global(name: impl Into<String>) -> Self {
        Operand::Global(name.into())
    }

    #[inline]
    pub fn as_local(&self) -> Option<ValueId> {
        match self {
            Operand::Local(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_global(&self) -> Option<&str> {
        match self {
            Operand::Global(name) => Some(name),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Operand::Null | Operand::Zero)
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Local(v)
    }
}

/// Typed operand, as found in argument lists.
pub type Arg = (Type, Operand);

// ── Primitive operators ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    pub const ALL: &'static [BinOp] = &[
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::UDiv,
        BinOp::SDiv,
        BinOp::URem,
        BinOp::SRem,
        BinOp::And,
        BinOp::Or,
        BinOp::Xor,
        BinOp::Shl,
        BinOp::LShr,
        BinOp::AShr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::UDiv => "udiv",
            BinOp::SDiv => "sdiv",
            BinOp::URem => "urem",
            BinOp::SRem => "srem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ICmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl ICmpPred {
    pub const ALL: &'static [ICmpPred] = &[
        ICmpPred::Eq,
        ICmpPred::Ne,
        ICmpPred::Ult,
        ICmpPred::Ule,
        ICmpPred::Ugt,
        ICmpPred::Uge,
        ICmpPred::Slt,
        ICmpPred::Sle,
        ICmpPred::Sgt,
        ICmpPred::Sge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ICmpPred::Eq => "eq",
            ICmpPred::Ne => "ne",
            ICmpPred::Ult => "ult",
            ICmpPred::Ule => "ule",
            ICmpPred::Ugt => "ugt",
            ICmpPred::Uge => "uge",
            ICmpPred::Slt => "slt",
            ICmpPred::Sle => "sle",
            ICmpPred::Sgt => "sgt",
            ICmpPred::Sge => "sge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == name)
    }
}

/// Where a function value's captured context lives. Decided upstream by
/// escape analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    Heap,
    Stack,
}

impl Placement {
    pub fn as_str(self) -> &'static str {
        match self {
            Placement::Heap => "heap",
            Placement::Stack => "stack",
        }
    }
}

/// An operation that may suspend the current concurrency unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockingOp {
    /// `chan.send T %v, ptr %ch`
    ChanSend {
        ty: Type,
        value: Operand,
        chan: Operand,
    },
    /// `%v = chan.recv T, ptr %ch`
    ChanRecv { ty: Type, chan: Operand },
    /// `sleep i64 %d`
    Sleep { duration: Operand },
    /// `mutex.lock ptr %m`
    MutexLock { mutex: Operand },
    /// `wg.wait ptr %wg`
    WaitGroupWait { group: Operand },
}

impl BlockingOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            BlockingOp::ChanSend { .. } => "chan.send",
            BlockingOp::ChanRecv { .. } => "chan.recv",
            BlockingOp::Sleep { .. } => "sleep",
            BlockingOp::MutexLock { .. } => "mutex.lock",
            BlockingOp::WaitGroupWait { .. } => "wg.wait",
        }
    }
}

// ── Instructions ────────────────────────────────────────────────────

/// The operation performed by an [`Inst`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstKind {
    Binary {
        op: BinOp,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        pred: ICmpPred,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    Alloca {
        ty: Type,
        align: Option<u32>,
    },
    Load {
        ty: Type,
        ptr: Operand,
        align: Option<u32>,
    },
    Store {
        ty: Type,
        value: Operand,
        ptr: Operand,
        align: Option<u32>,
    },
    /// Address arithmetic. For struct-like `ty` the index selects a field
    /// (and must be a literal); otherwise it scales by the size of `ty`.
    Gep {
        ty: Type,
        base: Operand,
        index: Operand,
    },
    Call {
        ret: Type,
        callee: Operand,
        args: Vec<Arg>,
    },
    Phi {
        ty: Type,
        incoming: Vec<(Operand, BlockId)>,
    },
    ExtractValue {
        ty: Type,
        agg: Operand,
        index: u32,
    },
    InsertValue {
        ty: Type,
        agg: Operand,
        elem_ty: Type,
        elem: Operand,
        index: u32,
    },

    // ── High-level constructs ───────────────────────────────────
    /// Box a value of a statically known concrete type into an interface.
    MakeIface { concrete: String, value: Operand },
    /// Build an interface value from a run-time typecode.
    DynIface {
        interface: String,
        typecode: Operand,
        value: Operand,
    },
    /// Dynamic method invocation on an interface value.
    IfaceCall {
        ret: Type,
        method: String,
        receiver: Operand,
        args: Vec<Arg>,
    },
    /// Does the interface value hold the given concrete type?
    TypeAssert { value: Operand, concrete: String },
    /// Does the dynamic type of the interface value implement `interface`?
    Implements { value: Operand, interface: String },
    /// Create a function value closing over `captures`.
    MakeFunc {
        placement: Placement,
        target: String,
        captures: Vec<Arg>,
    },
    /// Invoke a function value.
    CallFunc {
        ret: Type,
        func: Operand,
        args: Vec<Arg>,
    },
    /// Read captured value `index` inside a closure body.
    Capture { ty: Type, index: u32 },
    /// Launch a new concurrency unit.
    Spawn { target: String, args: Vec<Arg> },
    Blocking(BlockingOp),
}

impl InstKind {
    /// All operands read by this instruction, in textual order.
    pub fn operands(&self) -> SmallVec<[&Operand; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            InstKind::Alloca { .. } | InstKind::Capture { .. } => {}
            InstKind::Load { ptr, .. } => out.push(ptr),
            InstKind::Store { value, ptr, .. } => {
                out.push(value);
                out.push(ptr);
            }
            InstKind::Gep { base, index, .. } => {
                out.push(base);
                out.push(index);
            }
            InstKind::Call { callee, args, .. } => {
                out.push(callee);
                out.extend(args.iter().map(|(_, a)| a));
            }
            InstKind::Phi { incoming, .. } => out.extend(incoming.iter().map(|(v, _)| v)),
            InstKind::ExtractValue { agg, .. } => out.push(agg),
            InstKind::InsertValue { agg, elem, .. } => {
                out.push(agg);
                out.push(elem);
            }
            InstKind::MakeIface { value, .. }
            | InstKind::TypeAssert { value, .. }
            | InstKind::Implements { value, .. } => out.push(value),
            InstKind::DynIface {
                typecode, value, ..
            } => {
                out.push(typecode);
                out.push(value);
            }
            InstKind::IfaceCall { receiver, args, .. } => {
                out.push(receiver);
                out.extend(args.iter().map(|(_, a)| a));
            }
            InstKind::MakeFunc { captures, .. } => out.extend(captures.iter().map(|(_, a)| a)),
            InstKind::CallFunc { func, args, .. } => {
                out.push(func);
                out.extend(args.iter().map(|(_, a)| a));
            }
            InstKind::Spawn { args, .. } => out.extend(args.iter().map(|(_, a)| a)),
            InstKind::Blocking(op) => match op {
                BlockingOp::ChanSend { value, chan, .. } => {
                    out.push(value);
                    out.push(chan);
                }
                BlockingOp::ChanRecv { chan, .. } => out.push(chan),
                BlockingOp::Sleep { duration } => out.push(duration),
                BlockingOp::MutexLock { mutex } => out.push(mutex),
                BlockingOp::WaitGroupWait { group } => out.push(group),
            },
        }
        out
    }

    /// Visit every operand mutably, in the same order as [`operands`](Self::operands).
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Alloca { .. } | InstKind::Capture { .. } => {}
            InstKind::Load { ptr, .. } => f(ptr),
            InstKind::Store { value, ptr, .. } => {
                f(value);
                f(ptr);
            }
            InstKind::Gep { base, index, .. } => {
                f(base);
                f(index);
            }
            InstKind::Call { callee, args, .. } => {
                f(callee);
                args.iter_mut().for_each(|(_, a)| f(a));
            }
            InstKind::Phi { incoming, .. } => incoming.iter_mut().for_each(|(v, _)| f(v)),
            InstKind::ExtractValue { agg, .. } => f(agg),
            InstKind::InsertValue { agg, elem, .. } => {
                f(agg);
                f(elem);
            }
            InstKind::MakeIface { value, .. }
            | InstKind::TypeAssert { value, .. }
            | InstKind::Implements { value, .. } => f(value),
            InstKind::DynIface {
                typecode, value, ..
            } => {
                f(typecode);
                f(value);
            }
            InstKind::IfaceCall { receiver, args, .. } => {
                f(receiver);
                args.iter_mut().for_each(|(_, a)| f(a));
            }
            InstKind::MakeFunc { captures, .. } => captures.iter_mut().for_each(|(_, a)| f(a)),
            InstKind::CallFunc { func, args, .. } => {
                f(func);
                args.iter_mut().for_each(|(_, a)| f(a));
            }
            InstKind::Spawn { args, .. } => args.iter_mut().for_each(|(_, a)| f(a)),
            InstKind::Blocking(op) => match op {
                BlockingOp::ChanSend { value, chan, .. } => {
                    f(value);
                    f(chan);
                }
                BlockingOp::ChanRecv { chan, .. } => f(chan),
                BlockingOp::Sleep { duration } => f(duration),
                BlockingOp::MutexLock { mutex } => f(mutex),
                BlockingOp::WaitGroupWait { group } => f(group),
            },
        }
    }

    /// Local values read by this instruction.
    pub fn used_values(&self) -> SmallVec<[ValueId; 4]> {
        self.operands().into_iter().filter_map(Operand::as_local).collect()
    }

    /// Symbols (functions or globals) this instruction refers to by name.
    pub fn symbol_refs(&self) -> SmallVec<[&str; 2]> {
        let mut out: SmallVec<[&str; 2]> = self
            .operands()
            .into_iter()
            .filter_map(Operand::as_global)
            .collect();
        match self {
            InstKind::MakeFunc { target, .. } | InstKind::Spawn { target, .. } => {
                out.push(target);
            }
            _ => {}
        }
        out
    }

    /// Type of the value this instruction produces, if any.
    ///
    /// `field_type` resolves extraction from named aggregate types.
    pub fn result_type(&self, field_type: impl Fn(&Type, u32) -> Option<Type>) -> Option<Type> {
        match self {
            InstKind::Binary { ty, .. }
            | InstKind::Load { ty, .. }
            | InstKind::Phi { ty, .. }
            | InstKind::InsertValue { ty, .. }
            | InstKind::Capture { ty, .. } => Some(ty.clone()),
            InstKind::ICmp { .. } | InstKind::TypeAssert { .. } | InstKind::Implements { .. } => {
                Some(Type::I1)
            }
            InstKind::Alloca { .. } | InstKind::Gep { .. } => Some(Type::Ptr),
            InstKind::Call { ret, .. }
            | InstKind::IfaceCall { ret, .. }
            | InstKind::CallFunc { ret, .. } => (!ret.is_void()).then(|| ret.clone()),
            InstKind::ExtractValue { ty, index, .. } => field_type(ty, *index),
            InstKind::MakeIface { .. } | InstKind::DynIface { .. } => Some(Type::Iface),
            InstKind::MakeFunc { .. } => Some(Type::Func),
            InstKind::Blocking(BlockingOp::ChanRecv { ty, .. }) => Some(ty.clone()),
            InstKind::Store { .. } | InstKind::Spawn { .. } | InstKind::Blocking(_) => None,
        }
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        matches!(self, InstKind::Blocking(_))
    }

    /// Name of the directly called function, if this is a direct call.
    pub fn direct_callee(&self) -> Option<&str> {
        match self {
            InstKind::Call { callee, .. } => callee.as_global(),
            _ => None,
        }
    }

    /// Interface-related constructs removed by interface lowering.
    pub fn is_interface_construct(&self) -> bool {
        matches!(
            self,
            InstKind::MakeIface { .. }
                | InstKind::DynIface { .. }
                | InstKind::IfaceCall { .. }
                | InstKind::TypeAssert { .. }
                | InstKind::Implements { .. }
        )
    }

    /// Function-value constructs removed by function-value lowering.
    pub fn is_func_value_construct(&self) -> bool {
        matches!(
            self,
            InstKind::MakeFunc { .. } | InstKind::CallFunc { .. } | InstKind::Capture { .. }
        )
    }

    /// Concurrency constructs removed by concurrency lowering.
    pub fn is_concurrency_construct(&self) -> bool {
        matches!(self, InstKind::Spawn { .. } | InstKind::Blocking(_))
    }
}

/// A single instruction: an optional result value, the operation and an
/// optional debug location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
    pub loc: Option<DebugLoc>,
}

impl Inst {
    pub fn new(result: Option<ValueId>, kind: InstKind) -> Self {
        Inst {
            result,
            kind,
            loc: None,
        }
    }

    /// Instruction without a result.
    pub fn effect(kind: InstKind) -> Self {
        Self::new(None, kind)
    }

    #[must_use]
    pub fn with_loc(mut self, loc: Option<DebugLoc>) -> Self {
        self.loc = loc;
        self
    }
}

// ── Terminators ─────────────────────────────────────────────────────

/// Block exit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Terminator {
    Ret(Option<Arg>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        ty: Type,
        value: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    IndirectBr {
        addr: Operand,
        targets: Vec<BlockId>,
    },
    Unreachable,
}

impl Terminator {
    /// Successor blocks, in order, duplicates removed.
    pub fn successors(&self) -> SmallVec<[BlockId; 4]> {
        let mut out: SmallVec<[BlockId; 4]> = SmallVec::new();
        let mut push = |b: BlockId| {
            if !out.contains(&b) {
                out.push(b);
            }
        };
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => {}
            Terminator::Br(target) => push(*target),
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                push(*then_block);
                push(*else_block);
            }
            Terminator::Switch { default, cases, .. } => {
                push(*default);
                for (_, target) in cases {
                    push(*target);
                }
            }
            Terminator::IndirectBr { targets, .. } => {
                for target in targets {
                    push(*target);
                }
            }
        }
        out
    }

    pub fn operands(&self) -> SmallVec<[&Operand; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Ret(Some((_, v))) => out.push(v),
            Terminator::CondBr { cond, .. } => out.push(cond),
            Terminator::Switch { value, .. } => out.push(value),
            Terminator::IndirectBr { addr, .. } => out.push(addr),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
        }
        out
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            Terminator::Ret(Some((_, v))) => f(v),
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
            Terminator::IndirectBr { addr, .. } => f(addr),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
        }
    }

    /// Visit every successor edge mutably.
    pub fn for_each_target_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => {}
            Terminator::Br(target) => f(target),
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                f(then_block);
                f(else_block);
            }
            Terminator::Switch { default, cases, .. } => {
                f(default);
                cases.iter_mut().for_each(|(_, t)| f(t));
            }
            Terminator::IndirectBr { targets, .. } => targets.iter_mut().for_each(f),
        }
    }

    pub fn used_values(&self) -> SmallVec<[ValueId; 2]> {
        self.operands().into_iter().filter_map(Operand::as_local).collect()
    }

    /// Symbols this terminator refers to by name, e.g. `ret ptr @f`.
    pub fn symbol_refs(&self) -> SmallVec<[&str; 2]> {
        self.operands().into_iter().filter_map(Operand::as_global).collect()
    }
}

// ── Blocks and bodies ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub term: Terminator,
    pub term_loc: Option<DebugLoc>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Block {
            name: name.into(),
            insts: Vec::new(),
            term: Terminator::Unreachable,
            term_loc: None,
        }
    }

    /// Index of the first non-phi instruction.
    pub fn first_non_phi(&self) -> usize {
        self.insts
            .iter()
            .position(|inst| !inst.kind.is_phi())
            .unwrap_or(self.insts.len())
    }
}

/// Name and type of an SSA value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueInfo {
    pub name: String,
    pub ty: Type,
}

/// Where a value is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDef {
    Param(usize),
    Inst(BlockId, usize),
}

/// A function body: value table, parameters and blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Body {
    pub values: Vec<ValueInfo>,
    pub params: Vec<ValueId>,
    pub blocks: Vec<Block>,
    names: FxHashMap<String, ValueId>,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a value. The name is made unique by appending `.N` when
    /// `hint` is taken.
    pub fn add_value(&mut self, hint: &str, ty: Type) -> ValueId {
        let name = if self.names.contains_key(hint) {
            let mut n = 1u32;
            loop {
                let candidate = format!("{hint}.{n}");
                if !self.names.contains_key(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        } else {
            hint.to_owned()
        };
        let id = ValueId::new(self.values.len() as u32);
        self.names.insert(name.clone(), id);
        self.values.push(ValueInfo { name, ty });
        id
    }

    /// Allocate a parameter value.
    pub fn add_param(&mut self, hint: &str, ty: Type) -> ValueId {
        let id = self.add_value(hint, ty);
        self.params.push(id);
        id
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.index()]
    }

    #[inline]
    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id.index()].name
    }

    #[inline]
    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.index()].ty
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: Type) {
        self.values[id.index()].ty = ty;
    }

    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    #[inline]
    pub fn entry(&self) -> BlockId {
        BlockId::new(0)
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId::new)
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| BlockId::new(i as u32))
    }

    /// Append a block with a unique name derived from `hint`.
    pub fn add_block(&mut self, hint: &str) -> BlockId {
        let taken = |name: &str| self.blocks.iter().any(|b| b.name == name);
        let name = if taken(hint) {
            let mut n = 1u32;
            loop {
                let candidate = format!("{hint}.{n}");
                if !taken(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        } else {
            hint.to_owned()
        };
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(Block::new(name));
        id
    }

    /// Definition site of every value.
    pub fn definitions(&self) -> Vec<Option<ValueDef>> {
        let mut defs = vec![None; self.values.len()];
        for (i, param) in self.params.iter().enumerate() {
            defs[param.index()] = Some(ValueDef::Param(i));
        }
        for block_id in self.block_ids() {
            for (i, inst) in self.block(block_id).insts.iter().enumerate() {
                if let Some(result) = inst.result {
                    defs[result.index()] = Some(ValueDef::Inst(block_id, i));
                }
            }
        }
        defs
    }

    /// Replace every use of `old` with `new` (definitions are untouched).
    pub fn replace_uses(&mut self, old: ValueId, new: &Operand) {
        let target = Operand::Local(old);
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                inst.kind.for_each_operand_mut(|op| {
                    if *op == target {
                        *op = new.clone();
                    }
                });
            }
            block.term.for_each_operand_mut(|op| {
                if *op == target {
                    *op = new.clone();
                }
            });
        }
    }

    /// Number of uses of each value.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.values.len()];
        for block in &self.blocks {
            for inst in &block.insts {
                for v in inst.kind.used_values() {
                    counts[v.index()] += 1;
                }
            }
            for v in block.term.used_values() {
                counts[v.index()] += 1;
            }
        }
        counts
    }

    /// Drop the phi incoming entries of `block` that come from `pred`.
    pub fn remove_phi_incoming(&mut self, block: BlockId, pred: BlockId) {
        for inst in &mut self.block_mut(block).insts {
            if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                incoming.retain(|(_, from)| *from != pred);
            }
        }
    }

    /// Rename the predecessor `old` to `new` in the phis of `block`.
    pub fn retarget_phi_incoming(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        for inst in &mut self.block_mut(block).insts {
            if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                for (_, from) in incoming.iter_mut() {
                    if *from == old {
                        *from = new;
                    }
                }
            }
        }
    }

    /// Keep exactly the blocks in `order`, in that order, renumbering every
    /// branch target and phi predecessor. Phi entries from dropped blocks
    /// are removed; branches into dropped blocks are the caller's problem.
    pub fn reorder_blocks(&mut self, order: &[BlockId]) {
        let mut remap: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        for (new, old) in order.iter().enumerate() {
            remap[old.index()] = Some(BlockId::new(new as u32));
        }
        let mut old_blocks: Vec<Option<Block>> =
            std::mem::take(&mut self.blocks).into_iter().map(Some).collect();
        for old in order {
            if let Some(mut block) = old_blocks[old.index()].take() {
                for inst in &mut block.insts {
                    if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                        incoming.retain(|(_, from)| remap[from.index()].is_some());
                        for (_, from) in incoming.iter_mut() {
                            if let Some(new) = remap[from.index()] {
                                *from = new;
                            }
                        }
                    }
                }
                block.term.for_each_target_mut(|target| {
                    if let Some(new) = remap[target.index()] {
                        *target = new;
                    }
                });
                self.blocks.push(block);
            }
        }
    }

    /// Drop blocks unreachable from the entry block. Returns how many were
    /// removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let reachable = crate::graph::reachable_blocks(self);
        let order: Vec<BlockId> = self.block_ids().filter(|b| reachable[b.index()]).collect();
        let removed = self.blocks.len() - order.len();
        if removed > 0 {
            self.reorder_blocks(&order);
        }
        removed
    }

    /// Drop values that are neither a parameter nor an instruction result,
    /// renumbering the rest. Remaining uses of dropped values become `undef`.
    pub fn compact_values(&mut self) -> usize {
        let mut defined = vec![false; self.values.len()];
        for param in &self.params {
            defined[param.index()] = true;
        }
        for block in &self.blocks {
            for inst in &block.insts {
                if let Some(result) = inst.result {
                    defined[result.index()] = true;
                }
            }
        }
        if defined.iter().all(|d| *d) {
            return 0;
        }

        let mut remap: Vec<Option<ValueId>> = Vec::with_capacity(self.values.len());
        let mut values = Vec::with_capacity(self.values.len());
        for (info, is_defined) in std::mem::take(&mut self.values).into_iter().zip(&defined) {
            if *is_defined {
                remap.push(Some(ValueId::new(values.len() as u32)));
                values.push(info);
            } else {
                remap.push(None);
            }
        }
        let removed = remap.len() - values.len();
        self.values = values;
        self.names = self
            .values
            .iter()
            .enumerate()
            .map(|(i, info)| (info.name.clone(), ValueId::new(i as u32)))
            .collect();

        let fix = |op: &mut Operand| {
            if let Operand::Local(v) = op {
                *op = match remap[v.index()] {
                    Some(new) => Operand::Local(new),
                    None => Operand::Undef,
                };
            }
        };
        for param in &mut self.params {
            if let Some(new) = remap[param.index()] {
                *param = new;
            }
        }
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                inst.result = inst.result.and_then(|r| remap[r.index()]);
                inst.kind.for_each_operand_mut(fix);
            }
            block.term.for_each_operand_mut(fix);
        }
        removed
    }
}

// ── Functions ───────────────────────────────────────────────────────

bitflags! {
    /// Function attributes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FnAttrs: u8 {
        /// Not visible outside the link unit.
        const INTERNAL = 1 << 0;
        /// Exported symbol; a dead-code root.
        const EXPORT = 1 << 1;
        /// Program entry point; a dead-code root and a concurrency unit.
        const ENTRY = 1 << 2;
        /// Interrupt handler; a dead-code root that must never block.
        const INTERRUPT = 1 << 3;
        /// Compiler-generated trampoline; removable when unreferenced.
        const WRAPPER = 1 << 4;
        /// Never triggers a collection; calls to it are not safe points.
        const NOGC = 1 << 5;
    }
}

impl FnAttrs {
    /// Keyword spelling, in canonical print order.
    pub const KEYWORDS: &'static [(FnAttrs, &'static str)] = &[
        (FnAttrs::INTERNAL, "internal"),
        (FnAttrs::EXPORT, "export"),
        (FnAttrs::ENTRY, "entry"),
        (FnAttrs::INTERRUPT, "interrupt"),
        (FnAttrs::WRAPPER, "wrapper"),
        (FnAttrs::NOGC, "nogc"),
    ];

    pub fn from_keyword(word: &str) -> Option<Self> {
        Self::KEYWORDS
            .iter()
            .find(|(_, kw)| *kw == word)
            .map(|(flag, _)| *flag)
    }

    /// Dead-code elimination roots.
    pub fn is_root(self) -> bool {
        self.intersects(FnAttrs::EXPORT | FnAttrs::ENTRY | FnAttrs::INTERRUPT)
    }
}

/// Calling convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallConv {
    #[default]
    C,
    /// Closure body: the captured context is the trailing `ptr` parameter.
    Closure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub ret: Type,
    pub params: Vec<Type>,
    pub attrs: FnAttrs,
    pub cc: CallConv,
    pub loc: Option<DebugLoc>,
    pub body: Option<Body>,
}

impl Function {
    /// An external declaration.
    pub fn declaration(name: impl Into<String>, ret: Type, params: Vec<Type>) -> Self {
        Function {
            name: name.into(),
            ret,
            params,
            attrs: FnAttrs::empty(),
            cc: CallConv::C,
            loc: None,
            body: None,
        }
    }

    /// A definition with parameters named after `param_names`.
    pub fn definition(
        name: impl Into<String>,
        ret: Type,
        params: Vec<(&str, Type)>,
        attrs: FnAttrs,
    ) -> Self {
        let mut body = Body::new();
        let mut types = Vec::with_capacity(params.len());
        for (hint, ty) in params {
            body.add_param(hint, ty.clone());
            types.push(ty);
        }
        Function {
            name: name.into(),
            ret,
            params: types,
            attrs,
            cc: CallConv::C,
            loc: None,
            body: Some(body),
        }
    }

    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    #[inline]
    pub fn has(&self, attr: FnAttrs) -> bool {
        self.attrs.contains(attr)
    }
}
