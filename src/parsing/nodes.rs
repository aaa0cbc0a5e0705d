//! SafeC programs are declarations and the statements and expressions inside
//! them. The AST's shape is fixed at parse time; semantic analysis mutates it
//! in place to attach resolved types, symbol links, bounds-check requests,
//! and `if const` branch selections, and monomorphization appends the
//! instantiated declarations it creates. Otherwise the tree is append-only.
//!
//! The parser never computes types, resolves names, or evaluates constants:
//! everything here that mentions `TypeId` or `SymbolId` starts out `None`.

use crate::common::interning::Name;
use crate::sema::scope::SymbolId;
use crate::source::Position;
use crate::types::{CallConv, NominalId, Region, TypeId};

use bitflags::bitflags;

bitflags! {
    /// Function and declaration attributes. Parsed up front, enforced by the
    /// analyzer, and forwarded to lowering where relevant.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FnAttrs: u16 {
        const CONST      = 1 << 0;
        const CONSTEVAL  = 1 << 1;
        const INLINE     = 1 << 2;
        const EXTERN     = 1 << 3;
        const VARIADIC   = 1 << 4;
        const MUST_USE   = 1 << 5;
        const PURE       = 1 << 6;
        const NAKED      = 1 << 7;
        const INTERRUPT  = 1 << 8;
        const NORETURN   = 1 << 9;
    }
}

/// A type as written. Resolved against the pool during analysis.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeExpr {
    /// A named type: primitive, nominal, or generic parameter.
    Named(Name),
    /// An instantiation of a generic type, `Box<int>`.
    Generic { name: Name, args: Vec<TypeExpr> },
    Pointer {
        pointee: Box<TypeExpr>,
        mutable: bool,
    },
    Reference {
        pointee: Box<TypeExpr>,
        region: Region,
        mutable: bool,
        nullable: bool,
    },
    Array {
        element: Box<TypeExpr>,
        /// Compile-time length expression, const-evaluated by the analyzer.
        length: Box<Expr>,
    },
    Slice {
        element: Box<TypeExpr>,
    },
    Tuple(Vec<TypeExpr>),
    Typeof(Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddrOf,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    AddWrap,
    SubWrap,
    MulWrap,
    AddSat,
    SubSat,
    MulSat,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    /// Surface spelling, used in diagnostics and operator-method lookup
    /// (`operator+`).
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::AddWrap => "+|",
            BinaryOp::SubWrap => "-|",
            BinaryOp::MulWrap => "*|",
            BinaryOp::AddSat => "+%",
            BinaryOp::SubSat => "-%",
            BinaryOp::MulSat => "*%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// An expression with the annotation slots the analyzer fills.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: Position,
    /// Resolved type, filled bottom-up by the analyzer.
    pub ty: Option<TypeId>,
    pub lvalue: bool,
    /// Set on dynamic subscripts outside `unsafe`; lowering turns it into a
    /// conditional trap.
    pub needs_bounds_check: bool,
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self {
            kind,
            position,
            ty: None,
            lvalue: false,
            needs_bounds_check: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GenericArg {
    Type(TypeExpr),
    Value(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClosureParam {
    pub name: Name,
    pub ty: TypeExpr,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    IntLit {
        value: u128,
        /// Suffix-selected type; unsuffixed literals adapt to the expected
        /// integer type and default to `i32`.
        suffix: Option<crate::types::IntType>,
    },
    FloatLit {
        value: f64,
        single: bool,
    },
    StrLit(Name),
    CharLit(char),
    BoolLit(bool),
    NullLit,
    Ident {
        name: Name,
        /// Resolved by the analyzer.
        symbol: Option<SymbolId>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        /// `Some` for compound assignment (`+=` carries `Add`).
        op: Option<BinaryOp>,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        /// Explicit `::<...>` arguments on generic calls.
        generic_args: Vec<GenericArg>,
        args: Vec<Expr>,
    },
    /// `receiver.method(args)`; resolved against the receiver's struct.
    MethodCall {
        receiver: Box<Expr>,
        method: Name,
        args: Vec<Expr>,
        /// The stitched method symbol, resolved by the analyzer.
        symbol: Option<SymbolId>,
    },
    Field {
        base: Box<Expr>,
        name: Name,
        /// `->` access through a pointer or reference.
        through_pointer: bool,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// `a[lo..hi]` and `case lo..hi` bounds.
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    Cast {
        ty: TypeExpr,
        operand: Box<Expr>,
    },
    Sizeof(TypeExpr),
    Alignof(TypeExpr),
    Fieldcount(TypeExpr),
    /// `sizeof...(T)`, the length of a variadic type pack.
    SizeofPack(Name),
    /// `new T`, `new<R> T`, optionally with an initializer argument.
    New {
        region: Option<Name>,
        ty: TypeExpr,
        init: Option<Box<Expr>>,
    },
    Try(Box<Expr>),
    Spawn(Box<Expr>),
    Closure {
        params: Vec<ClosureParam>,
        body: Box<Expr>,
    },
    VolatileLoad(Box<Expr>),
    VolatileStore {
        pointer: Box<Expr>,
        value: Box<Expr>,
    },
    Asm(Name),
    /// Positional brace initializer `{ a, b, c }`.
    InitList(Vec<Expr>),
    Tuple(Vec<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalDecl {
    pub name: Name,
    pub ty: TypeExpr,
    pub init: Option<Expr>,
    pub is_const: bool,
    pub position: Position,
    pub symbol: Option<SymbolId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    /// `case .Variant(binding):`
    Variant {
        name: Name,
        binding: Option<Name>,
        /// Binding symbol, filled by the analyzer.
        symbol: Option<SymbolId>,
    },
    /// `case lo..hi:`, inclusive on both ends.
    Range { lo: Expr, hi: Expr },
    /// `case expr:` with a constant expression.
    Expr(Expr),
    Default,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegionDecl {
    pub name: Name,
    pub capacity: Expr,
    pub position: Position,
    pub symbol: Option<SymbolId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Local(LocalDecl),
    Block(Block),
    If {
        cond: Expr,
        then: Block,
        else_branch: Option<Box<Stmt>>,
    },
    /// `if const`: the analyzer const-evaluates the condition, records the
    /// selection, and only the selected branch is checked or lowered.
    IfConst {
        cond: Expr,
        then: Block,
        else_branch: Option<Box<Stmt>>,
        taken: Option<bool>,
    },
    While {
        label: Option<Name>,
        cond: Expr,
        body: Block,
    },
    For {
        label: Option<Name>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Block,
    },
    Match {
        scrutinee: Expr,
        arms: Vec<MatchArm>,
    },
    Return(Option<Expr>),
    Break(Option<Name>),
    Continue(Option<Name>),
    Defer(Expr),
    Unsafe {
        /// `unsafe escape { ... }`.
        escape: bool,
        body: Block,
    },
    Region(RegionDecl),
    StaticAssert {
        cond: Expr,
        message: Option<Name>,
    },
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: Name,
    pub ty: TypeExpr,
    /// `T... name`: a variadic generic type pack, not C variadic `...`.
    pub pack: bool,
    pub position: Position,
    pub symbol: Option<SymbolId>,
}

/// One `generic<...>` parameter: a type parameter with an optional
/// constraint, a type pack, or a value parameter (`generic<int N>`).
#[derive(Clone, Debug, PartialEq)]
pub struct GenericParam {
    pub name: Name,
    pub constraint: Option<Name>,
    pub pack: bool,
    /// `Some` for value parameters; the declared value type.
    pub value_type: Option<TypeExpr>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: Name,
    /// `Struct::method` definitions carry the owning struct's name.
    pub owner: Option<Name>,
    pub generics: Vec<GenericParam>,
    pub params: Vec<Param>,
    pub return_type: TypeExpr,
    pub attrs: FnAttrs,
    pub section: Option<Name>,
    pub convention: CallConv,
    /// `None` for extern declarations and in-struct method signatures.
    pub body: Option<Block>,
    pub position: Position,
    pub symbol: Option<SymbolId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDecl {
    pub name: Name,
    pub ty: TypeExpr,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructDecl {
    pub name: Name,
    pub is_union: bool,
    pub packed: bool,
    pub generics: Vec<GenericParam>,
    pub fields: Vec<FieldDecl>,
    /// Method signatures declared in the body, stitched to later
    /// `Struct::method` definitions by name.
    pub methods: Vec<FunctionDecl>,
    pub position: Position,
    pub nominal: Option<NominalId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariantDecl {
    pub name: Name,
    pub payload: Option<TypeExpr>,
    pub position: Position,
}

/// `enum union Name { ... }`: a tagged union.
#[derive(Clone, Debug, PartialEq)]
pub struct TaggedDecl {
    pub name: Name,
    pub variants: Vec<VariantDecl>,
    pub position: Position,
    pub nominal: Option<NominalId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumeratorDecl {
    pub name: Name,
    pub value: Option<Expr>,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumDecl {
    pub name: Name,
    /// Underlying integer type; `int` when omitted.
    pub underlying: Option<TypeExpr>,
    pub enumerators: Vec<EnumeratorDecl>,
    pub position: Position,
    pub nominal: Option<NominalId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewtypeDecl {
    pub name: Name,
    pub target: TypeExpr,
    pub position: Position,
    pub nominal: Option<NominalId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalDecl {
    pub name: Name,
    pub ty: TypeExpr,
    pub init: Option<Expr>,
    /// `const` globals are const-evaluated; `static` globals are runtime
    /// storage in the static region.
    pub is_const: bool,
    pub position: Position,
    pub symbol: Option<SymbolId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Function(FunctionDecl),
    Struct(StructDecl),
    Tagged(TaggedDecl),
    Enum(EnumDecl),
    Newtype(NewtypeDecl),
    Region(RegionDecl),
    Global(GlobalDecl),
    StaticAssert {
        cond: Expr,
        message: Option<Name>,
        position: Position,
    },
}

impl Decl {
    pub fn position(&self) -> Position {
        match self {
            Decl::Function(d) => d.position,
            Decl::Struct(d) => d.position,
            Decl::Tagged(d) => d.position,
            Decl::Enum(d) => d.position,
            Decl::Newtype(d) => d.position,
            Decl::Region(d) => d.position,
            Decl::Global(d) => d.position,
            Decl::StaticAssert { position, .. } => *position,
        }
    }
}

/// One translation unit. Monomorphization appends instantiated declarations
/// at the end; nothing is ever removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Unit {
    pub decls: Vec<Decl>,
}
