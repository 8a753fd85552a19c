//! Recursive-descent parser for the textual IR.
//!
//! Function bodies are pre-scanned so that block and value ids follow
//! textual definition order; forward references (phi operands, branch
//! targets) then resolve without placeholders. Value types are inferred
//! once the whole module, including later type definitions, is known.

use rustc_hash::FxHashMap;

use crate::ir::{
    Arg, BinOp, Block, BlockId, BlockingOp, Body, CallConv, DebugLoc, FnAttrs, Function,
    ICmpPred, Inst, InstKind, Operand, Placement, Terminator, ValueId,
};
use crate::lexer::{lex, Spanned, Token};
use crate::module::{ConcreteDecl, Constant, Global, InterfaceDecl, Linkage, Module};
use crate::roots::{FrameDescriptor, FrameSlot, GlobalRoot, RootTable, SlotLayout};
use crate::types::{Type, TypeDef};

/// A syntax or name-resolution error with its 1-based source position.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl ParseError {
    /// Error at byte offset `pos` of `source`.
    pub fn at(source: &str, pos: usize, message: impl Into<String>) -> Self {
        let pos = pos.min(source.len());
        let before = &source[..pos];
        let line = before.matches('\n').count() + 1;
        let column = pos - before.rfind('\n').map_or(0, |i| i + 1) + 1;
        ParseError {
            line: line as u32,
            column: column as u32,
            message: message.into(),
        }
    }
}

type PResult<T> = Result<T, ParseError>;

/// Parse a whole module.
pub fn parse_module(source: &str) -> PResult<Module> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let mut module = parser.module()?;
    infer_value_types(&mut module).map_err(|message| ParseError {
        line: 0,
        column: 0,
        message,
    })?;
    tracing::trace!(
        functions = module.functions.len(),
        globals = module.globals.len(),
        "parsed module"
    );
    Ok(module)
}

/// Per-body name tables built by the pre-scan.
struct Scope {
    values: FxHashMap<String, ValueId>,
    blocks: FxHashMap<String, BlockId>,
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    // ── Token plumbing ──────────────────────────────────────────

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let pos = self
            .tokens
            .get(self.pos)
            .map_or(self.source.len(), |s| s.start);
        ParseError::at(self.source, pos, message)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(token) => self.error(format!("expected {expected}, found {token}")),
            None => self.error(format!("expected {expected}, found end of input")),
        }
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> PResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(&expected.to_string()))
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> PResult<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{word}'")))
        }
    }

    fn word(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Word(w)) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn local_name(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Local(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("'%name'")),
        }
    }

    fn global_name(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Global(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("'@name'")),
        }
    }

    fn int(&mut self) -> PResult<i64> {
        match self.peek() {
            Some(Token::Int(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected("integer")),
        }
    }

    fn uint(&mut self) -> PResult<u32> {
        let n = self.int()?;
        u32::try_from(n).map_err(|_| {
            self.pos -= 1;
            self.error(format!("expected unsigned 32-bit integer, found {n}"))
        })
    }

    fn string(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("string")),
        }
    }

    /// Parse `[`? items separated by commas until `close`.
    fn comma_list<T>(
        &mut self,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> PResult<T>,
    ) -> PResult<Vec<T>> {
        let mut out = Vec::new();
        if self.eat(close) {
            return Ok(out);
        }
        loop {
            out.push(item(self)?);
            if self.eat(close) {
                return Ok(out);
            }
            self.expect(&Token::Comma)?;
        }
    }

    // ── Module level ────────────────────────────────────────────

    fn module(&mut self) -> PResult<Module> {
        let mut module = Module::new();
        while let Some(token) = self.peek() {
            match token {
                Token::Word(w) if w == "source_filename" => {
                    self.pos += 1;
                    self.expect(&Token::Eq)?;
                    module.source_filename = Some(self.string()?);
                }
                Token::Word(w) if w == "target" => {
                    self.pos += 1;
                    self.expect_word("triple")?;
                    self.expect(&Token::Eq)?;
                    module.target_triple = Some(self.string()?);
                }
                Token::Word(w) if w == "type" => {
                    self.pos += 1;
                    let name = self.local_name()?;
                    self.expect(&Token::Eq)?;
                    let ty = self.ty()?;
                    if module.type_def(&name).is_some() {
                        return Err(self.error(format!("type %{name} defined twice")));
                    }
                    module.types.push(TypeDef { name, ty });
                }
                Token::Word(w) if w == "concrete" => {
                    self.pos += 1;
                    let decl = self.concrete()?;
                    if module.concrete(&decl.name).is_some() {
                        return Err(self.error(format!("concrete %{} declared twice", decl.name)));
                    }
                    module.concretes.push(decl);
                }
                Token::Word(w) if w == "interface" => {
                    self.pos += 1;
                    let decl = self.interface()?;
                    if module.interface(&decl.name).is_some() {
                        return Err(self.error(format!("interface %{} declared twice", decl.name)));
                    }
                    module.interfaces.push(decl);
                }
                Token::Word(w) if w == "declare" || w == "define" => {
                    let define = w == "define";
                    self.pos += 1;
                    let function = self.function(define)?;
                    if module.has_symbol(&function.name) {
                        return Err(self.error(format!("symbol @{} defined twice", function.name)));
                    }
                    module.functions.push(function);
                }
                Token::Word(w) if w == "gcroots" => {
                    self.pos += 1;
                    module.roots = Some(self.roots()?);
                }
                Token::Global(_) => {
                    let global = self.global()?;
                    if module.has_symbol(&global.name) {
                        return Err(self.error(format!("symbol @{} defined twice", global.name)));
                    }
                    module.globals.push(global);
                }
                _ => return Err(self.unexpected("top-level item")),
            }
        }
        Ok(module)
    }

    fn concrete(&mut self) -> PResult<ConcreteDecl> {
        let name = self.local_name()?;
        self.expect(&Token::LBrace)?;
        let methods = self.comma_list(&Token::RBrace, |p| {
            let method = p.word()?;
            p.expect(&Token::Eq)?;
            let imp = p.global_name()?;
            Ok((method, imp))
        })?;
        Ok(ConcreteDecl { name, methods })
    }

    fn interface(&mut self) -> PResult<InterfaceDecl> {
        let name = self.local_name()?;
        self.expect(&Token::LBrace)?;
        let methods = self.comma_list(&Token::RBrace, Self::word)?;
        Ok(InterfaceDecl { name, methods })
    }

    fn global(&mut self) -> PResult<Global> {
        let name = self.global_name()?;
        self.expect(&Token::Eq)?;
        let linkage = if self.eat_word("internal") {
            Linkage::Internal
        } else if self.eat_word("export") {
            Linkage::Export
        } else if self.eat_word("external") {
            Linkage::External
        } else {
            Linkage::Default
        };
        let constant = if self.eat_word("constant") {
            true
        } else {
            self.expect_word("global")?;
            false
        };
        let ty = self.ty()?;
        let init = if linkage == Linkage::External {
            None
        } else {
            Some(self.constant()?)
        };
        let align = self.align()?;
        Ok(Global {
            name,
            ty,
            linkage,
            constant,
            init,
            align,
        })
    }

    fn constant(&mut self) -> PResult<Constant> {
        match self.peek() {
            Some(Token::Int(_)) => Ok(Constant::Int(self.int()?)),
            Some(Token::Global(_)) => Ok(Constant::Symbol(self.global_name()?)),
            Some(Token::LBrace) => {
                self.pos += 1;
                Ok(Constant::Aggregate(
                    self.comma_list(&Token::RBrace, Self::typed_constant)?,
                ))
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                Ok(Constant::Aggregate(
                    self.comma_list(&Token::RBracket, Self::typed_constant)?,
                ))
            }
            Some(Token::Word(w)) => {
                let c = match w.as_str() {
                    "null" => Constant::Null,
                    "undef" => Constant::Undef,
                    "zeroinitializer" => Constant::Zero,
                    "true" => Constant::Int(1),
                    "false" => Constant::Int(0),
                    _ => return Err(self.unexpected("constant")),
                };
                self.pos += 1;
                Ok(c)
            }
            _ => Err(self.unexpected("constant")),
        }
    }

    fn typed_constant(&mut self) -> PResult<(Type, Constant)> {
        let ty = self.ty()?;
        let c = self.constant()?;
        Ok((ty, c))
    }

    fn align(&mut self) -> PResult<Option<u32>> {
        if self.peek() == Some(&Token::Comma) && matches!(self.peek_at(1), Some(Token::Word(w)) if w == "align")
        {
            self.pos += 2;
            return Ok(Some(self.uint()?));
        }
        Ok(None)
    }

    fn loc(&mut self) -> PResult<Option<DebugLoc>> {
        if !self.eat(&Token::Bang) {
            return Ok(None);
        }
        self.expect_word("loc")?;
        self.expect(&Token::LParen)?;
        let file = self.string()?;
        self.expect(&Token::Comma)?;
        let line = self.uint()?;
        self.expect(&Token::Comma)?;
        let column = self.uint()?;
        self.expect(&Token::RParen)?;
        Ok(Some(DebugLoc { file, line, column }))
    }

    // ── Types ───────────────────────────────────────────────────

    fn ty(&mut self) -> PResult<Type> {
        match self.peek() {
            Some(Token::Local(_)) => Ok(Type::Named(self.local_name()?)),
            Some(Token::LBrace) => {
                self.pos += 1;
                Ok(Type::Struct(self.comma_list(&Token::RBrace, Self::ty)?))
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let len = self.int()?;
                let len = u64::try_from(len).map_err(|_| self.error("negative array length"))?;
                self.expect_word("x")?;
                let elem = self.ty()?;
                self.expect(&Token::RBracket)?;
                Ok(Type::Array(len, Box::new(elem)))
            }
            Some(Token::Word(w)) => {
                let ty = match w.as_str() {
                    "void" => Type::Void,
                    "ptr" => Type::Ptr,
                    "iface" => Type::Iface,
                    "func" => Type::Func,
                    "opaque" => {
                        self.pos += 1;
                        return Ok(Type::Opaque(self.uint()?));
                    }
                    other => match other.strip_prefix('i').map(str::parse::<u32>) {
                        Some(Ok(bits)) if (1..=64).contains(&bits) => Type::Int(bits),
                        _ => return Err(self.unexpected("type")),
                    },
                };
                self.pos += 1;
                Ok(ty)
            }
            _ => Err(self.unexpected("type")),
        }
    }

    // ── Functions ───────────────────────────────────────────────

    fn function(&mut self, define: bool) -> PResult<Function> {
        let mut attrs = FnAttrs::empty();
        let mut cc = CallConv::C;
        loop {
            match self.peek() {
                Some(Token::Word(w)) if w == "closurecc" => {
                    cc = CallConv::Closure;
                    self.pos += 1;
                }
                Some(Token::Word(w)) => match FnAttrs::from_keyword(w) {
                    Some(flag) => {
                        attrs |= flag;
                        self.pos += 1;
                    }
                    None => break,
                },
                _ => break,
            }
        }
        let ret = self.ty()?;
        let name = self.global_name()?;
        self.expect(&Token::LParen)?;
        let params: Vec<(Type, Option<String>)> = self.comma_list(&Token::RParen, |p| {
            let ty = p.ty()?;
            let name = match p.peek() {
                Some(Token::Local(_)) => Some(p.local_name()?),
                _ => None,
            };
            Ok((ty, name))
        })?;
        let loc = self.loc()?;

        let mut function = Function {
            name,
            ret,
            params: params.iter().map(|(ty, _)| ty.clone()).collect(),
            attrs,
            cc,
            loc,
            body: None,
        };
        if define {
            function.body = Some(self.body(&params)?);
        }
        Ok(function)
    }

    /// Collect block labels and value definitions of the body starting at
    /// the current `{`, in textual order.
    fn prescan(&self) -> PResult<(Vec<String>, Vec<(String, usize)>)> {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        let mut depth = 0usize;
        let mut i = self.pos;
        while let Some(spanned) = self.tokens.get(i) {
            match &spanned.token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((labels, values));
                    }
                }
                Token::Label(name) => labels.push(name.clone()),
                Token::Local(name)
                    if self.tokens.get(i + 1).map(|s| &s.token) == Some(&Token::Eq) =>
                {
                    values.push((name.clone(), spanned.start));
                }
                _ => {}
            }
            i += 1;
        }
        Err(self.error("unterminated function body"))
    }

    fn body(&mut self, params: &[(Type, Option<String>)]) -> PResult<Body> {
        if self.peek() != Some(&Token::LBrace) {
            return Err(self.unexpected("'{'"));
        }
        let (labels, defs) = self.prescan()?;
        self.pos += 1;

        let mut body = Body::new();
        let mut scope = Scope {
            values: FxHashMap::default(),
            blocks: FxHashMap::default(),
        };
        for (i, (ty, name)) in params.iter().enumerate() {
            let name = name.clone().unwrap_or_else(|| i.to_string());
            if scope.values.contains_key(&name) {
                return Err(self.error(format!("parameter %{name} defined twice")));
            }
            let id = body.add_param(&name, ty.clone());
            scope.values.insert(name, id);
        }
        for (name, start) in defs {
            if scope.values.contains_key(&name) {
                return Err(ParseError::at(
                    self.source,
                    start,
                    format!("value %{name} defined twice"),
                ));
            }
            // Placeholder type; fixed by `infer_value_types`.
            let id = body.add_value(&name, Type::Void);
            scope.values.insert(name, id);
        }
        for label in labels {
            if scope.blocks.contains_key(&label) {
                return Err(self.error(format!("block %{label} defined twice")));
            }
            let id = BlockId::new(body.blocks.len() as u32);
            body.blocks.push(Block::new(label.clone()));
            scope.blocks.insert(label, id);
        }
        if body.blocks.is_empty() {
            return Err(self.error("function body has no blocks"));
        }

        let mut current: Option<BlockId> = None;
        loop {
            match self.bump() {
                Some(Token::RBrace) => {
                    if current.is_some() {
                        return Err(self.error("block is missing a terminator"));
                    }
                    return Ok(body);
                }
                Some(Token::Label(name)) => {
                    if current.is_some() {
                        return Err(self.error("block is missing a terminator"));
                    }
                    current = scope.blocks.get(&name).copied();
                }
                Some(_) => {
                    self.pos -= 1;
                    let Some(block) = current else {
                        return Err(self.unexpected("block label"));
                    };
                    if self.is_terminator_start() {
                        let term = self.terminator(&scope)?;
                        let loc = self.loc()?;
                        let block = body.block_mut(block);
                        block.term = term;
                        block.term_loc = loc;
                        current = None;
                    } else {
                        let inst = self.inst(&scope)?;
                        body.block_mut(block).insts.push(inst);
                    }
                }
                None => return Err(self.error("unterminated function body")),
            }
        }
    }

    fn is_terminator_start(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Word(w)) if matches!(w.as_str(), "ret" | "br" | "switch" | "indirectbr" | "unreachable")
        )
    }

    // ── Operands ────────────────────────────────────────────────

    fn operand(&mut self, scope: &Scope) -> PResult<Operand> {
        match self.peek() {
            Some(Token::Local(name)) => {
                let Some(id) = scope.values.get(name).copied() else {
                    return Err(self.error(format!("use of undefined value %{name}")));
                };
                self.pos += 1;
                Ok(Operand::Local(id))
            }
            Some(Token::Global(_)) => Ok(Operand::Global(self.global_name()?)),
            Some(Token::Int(_)) => Ok(Operand::Int(self.int()?)),
            Some(Token::Word(w)) => {
                let op = match w.as_str() {
                    "null" => Operand::Null,
                    "undef" => Operand::Undef,
                    "zeroinitializer" => Operand::Zero,
                    "true" => Operand::Int(1),
                    "false" => Operand::Int(0),
                    _ => return Err(self.unexpected("operand")),
                };
                self.pos += 1;
                Ok(op)
            }
            _ => Err(self.unexpected("operand")),
        }
    }

    fn typed_operand(&mut self, scope: &Scope) -> PResult<Arg> {
        let ty = self.ty()?;
        let op = self.operand(scope)?;
        Ok((ty, op))
    }

    /// `ptr <operand>`, discarding the type.
    fn ptr_operand(&mut self, scope: &Scope) -> PResult<Operand> {
        self.expect_word("ptr")?;
        self.operand(scope)
    }

    fn label(&mut self, scope: &Scope) -> PResult<BlockId> {
        self.expect_word("label")?;
        self.block_ref(scope)
    }

    fn block_ref(&mut self, scope: &Scope) -> PResult<BlockId> {
        let name = self.local_name()?;
        scope.blocks.get(&name).copied().ok_or_else(|| {
            self.pos -= 1;
            self.error(format!("use of undefined block %{name}"))
        })
    }

    fn args(&mut self, scope: &Scope) -> PResult<Vec<Arg>> {
        self.expect(&Token::LParen)?;
        self.comma_list(&Token::RParen, |p| p.typed_operand(scope))
    }

    // ── Instructions ────────────────────────────────────────────

    fn inst(&mut self, scope: &Scope) -> PResult<Inst> {
        let result = if matches!(self.peek(), Some(Token::Local(_)))
            && self.peek_at(1) == Some(&Token::Eq)
        {
            let name = self.local_name()?;
            self.pos += 1;
            scope.values.get(&name).copied()
        } else {
            None
        };
        let opcode = self.word()?;
        let kind = self.inst_kind(&opcode, scope)?;
        let loc = self.loc()?;

        let produces = kind.result_type(|_, _| Some(Type::Void)).is_some();
        match (result, produces) {
            (Some(_), false) => {
                return Err(self.error(format!("`{opcode}` does not produce a value")));
            }
            (None, true) if !matches!(kind, InstKind::Call { .. } | InstKind::IfaceCall { .. } | InstKind::CallFunc { .. }) => {
                return Err(self.error(format!("result of `{opcode}` must be named")));
            }
            _ => {}
        }
        Ok(Inst { result, kind, loc })
    }

    fn inst_kind(&mut self, opcode: &str, scope: &Scope) -> PResult<InstKind> {
        if let Some(op) = BinOp::from_name(opcode) {
            let (ty, lhs) = self.typed_operand(scope)?;
            self.expect(&Token::Comma)?;
            let rhs = self.operand(scope)?;
            return Ok(InstKind::Binary { op, ty, lhs, rhs });
        }
        let kind = match opcode {
            "icmp" => {
                let pred_name = self.word()?;
                let pred = ICmpPred::from_name(&pred_name)
                    .ok_or_else(|| self.error(format!("unknown icmp predicate `{pred_name}`")))?;
                let (ty, lhs) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let rhs = self.operand(scope)?;
                InstKind::ICmp { pred, ty, lhs, rhs }
            }
            "alloca" => {
                let ty = self.ty()?;
                let align = self.align()?;
                InstKind::Alloca { ty, align }
            }
            "load" => {
                let ty = self.ty()?;
                self.expect(&Token::Comma)?;
                let ptr = self.ptr_operand(scope)?;
                let align = self.align()?;
                InstKind::Load { ty, ptr, align }
            }
            "store" => {
                let (ty, value) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let ptr = self.ptr_operand(scope)?;
                let align = self.align()?;
                InstKind::Store {
                    ty,
                    value,
                    ptr,
                    align,
                }
            }
            "gep" => {
                let ty = self.ty()?;
                self.expect(&Token::Comma)?;
                let base = self.ptr_operand(scope)?;
                self.expect(&Token::Comma)?;
                let (_, index) = self.typed_operand(scope)?;
                InstKind::Gep { ty, base, index }
            }
            "call" => {
                let ret = self.ty()?;
                let callee = self.operand(scope)?;
                let args = self.args(scope)?;
                InstKind::Call { ret, callee, args }
            }
            "phi" => {
                let ty = self.ty()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect(&Token::LBracket)?;
                    let value = self.operand(scope)?;
                    self.expect(&Token::Comma)?;
                    let from = self.block_ref(scope)?;
                    self.expect(&Token::RBracket)?;
                    incoming.push((value, from));
                    if !(self.peek() == Some(&Token::Comma)
                        && self.peek_at(1) == Some(&Token::LBracket))
                    {
                        break;
                    }
                    self.pos += 1;
                }
                InstKind::Phi { ty, incoming }
            }
            "extractvalue" => {
                let (ty, agg) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let index = self.uint()?;
                InstKind::ExtractValue { ty, agg, index }
            }
            "insertvalue" => {
                let (ty, agg) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let (elem_ty, elem) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let index = self.uint()?;
                InstKind::InsertValue {
                    ty,
                    agg,
                    elem_ty,
                    elem,
                    index,
                }
            }
            "makeiface" => {
                let concrete = self.local_name()?;
                self.expect(&Token::Comma)?;
                let value = self.ptr_operand(scope)?;
                InstKind::MakeIface { concrete, value }
            }
            "dyniface" => {
                let interface = self.local_name()?;
                self.expect(&Token::Comma)?;
                let (_, typecode) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let value = self.ptr_operand(scope)?;
                InstKind::DynIface {
                    interface,
                    typecode,
                    value,
                }
            }
            "ifacecall" => {
                let ret = self.ty()?;
                let method = self.word()?;
                self.expect(&Token::LParen)?;
                self.expect_word("iface")?;
                let receiver = self.operand(scope)?;
                let args = if self.eat(&Token::Comma) {
                    let mut args = vec![self.typed_operand(scope)?];
                    while self.eat(&Token::Comma) {
                        args.push(self.typed_operand(scope)?);
                    }
                    self.expect(&Token::RParen)?;
                    args
                } else {
                    self.expect(&Token::RParen)?;
                    Vec::new()
                };
                InstKind::IfaceCall {
                    ret,
                    method,
                    receiver,
                    args,
                }
            }
            "typeassert" => {
                self.expect_word("iface")?;
                let value = self.operand(scope)?;
                self.expect(&Token::Comma)?;
                let concrete = self.local_name()?;
                InstKind::TypeAssert { value, concrete }
            }
            "implements" => {
                self.expect_word("iface")?;
                let value = self.operand(scope)?;
                self.expect(&Token::Comma)?;
                let interface = self.local_name()?;
                InstKind::Implements { value, interface }
            }
            "makefunc" => {
                let placement = if self.eat_word("heap") {
                    Placement::Heap
                } else {
                    self.expect_word("stack")?;
                    Placement::Stack
                };
                let target = self.global_name()?;
                let captures = self.args(scope)?;
                InstKind::MakeFunc {
                    placement,
                    target,
                    captures,
                }
            }
            "callfunc" => {
                let ret = self.ty()?;
                let func = self.operand(scope)?;
                let args = self.args(scope)?;
                InstKind::CallFunc { ret, func, args }
            }
            "capture" => {
                let ty = self.ty()?;
                let index = self.uint()?;
                InstKind::Capture { ty, index }
            }
            "spawn" => {
                let target = self.global_name()?;
                let args = self.args(scope)?;
                InstKind::Spawn { target, args }
            }
            "chan.send" => {
                let (ty, value) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let chan = self.ptr_operand(scope)?;
                InstKind::Blocking(BlockingOp::ChanSend { ty, value, chan })
            }
            "chan.recv" => {
                let ty = self.ty()?;
                self.expect(&Token::Comma)?;
                let chan = self.ptr_operand(scope)?;
                InstKind::Blocking(BlockingOp::ChanRecv { ty, chan })
            }
            "sleep" => {
                let (_, duration) = self.typed_operand(scope)?;
                InstKind::Blocking(BlockingOp::Sleep { duration })
            }
            "mutex.lock" => InstKind::Blocking(BlockingOp::MutexLock {
                mutex: self.ptr_operand(scope)?,
            }),
            "wg.wait" => InstKind::Blocking(BlockingOp::WaitGroupWait {
                group: self.ptr_operand(scope)?,
            }),
            other => {
                self.pos -= 1;
                return Err(self.error(format!("unknown instruction `{other}`")));
            }
        };
        Ok(kind)
    }

    fn terminator(&mut self, scope: &Scope) -> PResult<Terminator> {
        let opcode = self.word()?;
        let term = match opcode.as_str() {
            "ret" => {
                if self.eat_word("void") {
                    Terminator::Ret(None)
                } else {
                    Terminator::Ret(Some(self.typed_operand(scope)?))
                }
            }
            "br" => {
                if self.is_word("label") {
                    Terminator::Br(self.label(scope)?)
                } else {
                    let (_, cond) = self.typed_operand(scope)?;
                    self.expect(&Token::Comma)?;
                    let then_block = self.label(scope)?;
                    self.expect(&Token::Comma)?;
                    let else_block = self.label(scope)?;
                    Terminator::CondBr {
                        cond,
                        then_block,
                        else_block,
                    }
                }
            }
            "switch" => {
                let (ty, value) = self.typed_operand(scope)?;
                self.expect(&Token::Comma)?;
                let default = self.label(scope)?;
                self.expect(&Token::LBracket)?;
                let cases = self.comma_list(&Token::RBracket, |p| {
                    let _ = p.ty()?;
                    let val = p.int()?;
                    p.expect(&Token::Comma)?;
                    let target = p.label(scope)?;
                    Ok((val, target))
                })?;
                Terminator::Switch {
                    ty,
                    value,
                    default,
                    cases,
                }
            }
            "indirectbr" => {
                let addr = self.ptr_operand(scope)?;
                self.expect(&Token::Comma)?;
                self.expect(&Token::LBracket)?;
                let targets = self.comma_list(&Token::RBracket, |p| p.label(scope))?;
                Terminator::IndirectBr { addr, targets }
            }
            "unreachable" => Terminator::Unreachable,
            other => return Err(self.error(format!("unknown terminator `{other}`"))),
        };
        Ok(term)
    }

    // ── Root table ──────────────────────────────────────────────

    fn roots(&mut self) -> PResult<RootTable> {
        self.expect(&Token::LBrace)?;
        let mut table = RootTable::default();
        loop {
            if self.eat(&Token::RBrace) {
                return Ok(table);
            }
            if self.eat_word("global") {
                let name = self.global_name()?;
                let layout = self.slot_layout()?;
                table.globals.push(GlobalRoot { name, layout });
            } else if self.eat_word("frame") {
                let id = self.uint()?;
                let function = self.global_name()?;
                self.expect(&Token::LBrace)?;
                let mut frame = FrameDescriptor {
                    id,
                    function,
                    slots: Vec::new(),
                    safe_points: Vec::new(),
                };
                while !self.eat(&Token::RBrace) {
                    if self.eat_word("slot") {
                        let offset = self.uint()?;
                        let layout = self.slot_layout()?;
                        frame.slots.push(FrameSlot { offset, layout });
                    } else {
                        self.expect_word("safepoint")?;
                        let _ = self.uint()?;
                        frame.safe_points.push(self.index_list()?);
                    }
                }
                table.frames.push(frame);
            } else {
                return Err(self.unexpected("'global' or 'frame'"));
            }
        }
    }

    fn slot_layout(&mut self) -> PResult<SlotLayout> {
        if self.eat_word("conservative") {
            return Ok(SlotLayout::Conservative {
                size: self.uint()?,
            });
        }
        self.expect_word("precise")?;
        let size = self.uint()?;
        let offsets = self.index_list()?;
        Ok(SlotLayout::Precise { size, offsets })
    }

    fn index_list(&mut self) -> PResult<Vec<u32>> {
        self.expect(&Token::LBracket)?;
        self.comma_list(&Token::RBracket, Self::uint)
    }
}

/// Assign result types now that every named type is known.
fn infer_value_types(module: &mut Module) -> Result<(), String> {
    let mut updates: Vec<(usize, ValueId, Type)> = Vec::new();
    for (fi, function) in module.functions.iter().enumerate() {
        let Some(body) = &function.body else { continue };
        for block in &body.blocks {
            for inst in &block.insts {
                let Some(result) = inst.result else { continue };
                let ty = inst
                    .kind
                    .result_type(|agg, index| module.field_type(agg, index))
                    .ok_or_else(|| {
                        format!(
                            "cannot infer the type of %{} in @{}",
                            body.value_name(result),
                            function.name
                        )
                    })?;
                updates.push((fi, result, ty));
            }
        }
    }
    for (fi, value, ty) in updates {
        if let Some(body) = module.functions[fi].body.as_mut() {
            body.set_value_type(value, ty);
        }
    }
    Ok(())
}
