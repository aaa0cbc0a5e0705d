//! # SafeC Lowering Gateway
//!
//! Transforms the analyzed AST into the simplified typed tree the external
//! backend consumes:
//!
//! * Reference types erase to raw pointers carrying attributes (non-null,
//!   noalias, dereferenceable size, alignment); all region metadata is gone.
//! * Bounds-check requests become explicit conditional-trap nodes.
//! * `if const` keeps only the selected branch.
//! * `defer` expands into explicit statements in reverse registration order,
//!   duplicated at every exit point of the defining scope.
//! * `match` lowers to a compare cascade or a jump table depending on arm
//!   density; tagged-union matches decode the discriminant first.
//! * Zero-capture closures are rewritten to top-level anonymous functions
//!   plus an (empty) capture struct.
//!
//! The gateway emits a `LoweredUnit` and hands it across the `Backend`
//! trait; it never generates code itself.

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::consteval::{Budget, Evaluator, Value};
use crate::diagnostics::Diagnostics;
use crate::parsing::nodes::*;
use crate::sema::scope::{Storage, SymbolId, SymbolKind};
use crate::sema::Analysis;
use crate::types::{CallConv, FloatType, IntType, Layout, Type, TypeId, TypePool};

/// Attributes attached to an erased pointer so the backend can emit the
/// matching metadata.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PtrAttrs {
    pub nonnull: bool,
    pub noalias: bool,
    pub dereferenceable: Option<u64>,
    pub align: u64,
}

/// The type vocabulary the backend sees: integers, floats, raw pointers,
/// and opaque aggregates.
#[derive(Clone, Debug, PartialEq)]
pub enum LTy {
    Void,
    Bool,
    Char,
    Int(IntType),
    Float(FloatType),
    Ptr {
        pointee: Box<LTy>,
        attrs: PtrAttrs,
    },
    Aggregate {
        size: u64,
        align: u64,
    },
    Func,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LExpr {
    Int { value: i128, ty: IntType },
    Float { value: f64, single: bool },
    Bool(bool),
    Char(char),
    Str(Name),
    Null,
    Local(Name),
    Global(Name),
    FunctionRef(Name),
    Unary {
        op: UnaryOp,
        operand: Box<LExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<LExpr>,
        rhs: Box<LExpr>,
    },
    Call {
        callee: Box<LExpr>,
        args: Vec<LExpr>,
    },
    /// A call dispatched onto a new thread by the external runtime.
    SpawnCall {
        callee: Box<LExpr>,
        args: Vec<LExpr>,
    },
    AddrOf(Box<LExpr>),
    FieldAccess {
        base: Box<LExpr>,
        offset: u64,
    },
    IndexAccess {
        base: Box<LExpr>,
        index: Box<LExpr>,
        element_size: u64,
    },
    SliceLen(Box<LExpr>),
    SliceOf {
        base: Box<LExpr>,
        lo: Box<LExpr>,
        hi: Box<LExpr>,
    },
    Cast {
        value: Box<LExpr>,
        to: LTy,
    },
    VolatileLoad(Box<LExpr>),
    VolatileStore {
        pointer: Box<LExpr>,
        value: Box<LExpr>,
    },
    Asm(Name),
    /// Heap or arena allocation through the external allocator.
    Alloc {
        region: Option<Name>,
        size: u64,
        align: u64,
        init: Option<Box<LExpr>>,
    },
    Aggregate(Vec<LExpr>),
    /// Tagged-union discriminant read.
    TagOf(Box<LExpr>),
    /// Tagged-union payload access.
    PayloadOf {
        base: Box<LExpr>,
        offset: u64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LStmt {
    Expr(LExpr),
    Local {
        name: Name,
        ty: LTy,
        init: Option<LExpr>,
    },
    Assign {
        target: LExpr,
        value: LExpr,
    },
    If {
        cond: LExpr,
        then: Vec<LStmt>,
        otherwise: Vec<LStmt>,
    },
    While {
        label: Option<Name>,
        cond: LExpr,
        body: Vec<LStmt>,
    },
    For {
        label: Option<Name>,
        init: Vec<LStmt>,
        cond: Option<LExpr>,
        step: Vec<LStmt>,
        body: Vec<LStmt>,
    },
    Switch {
        value: LExpr,
        cases: Vec<(i128, Vec<LStmt>)>,
        default: Vec<LStmt>,
        /// Chosen by arm density; the backend may still override.
        jump_table: bool,
    },
    Return(Option<LExpr>),
    Break(Option<Name>),
    Continue(Option<Name>),
    /// Aborts deterministically when the condition is true.
    Trap {
        cond: LExpr,
    },
    Block(Vec<LStmt>),
}

#[derive(Clone, Debug)]
pub struct LFunction {
    pub name: Name,
    pub params: Vec<(Name, LTy)>,
    pub ret: LTy,
    pub body: Vec<LStmt>,
    pub attrs: FnAttrs,
    pub section: Option<Name>,
    pub convention: CallConv,
}

#[derive(Clone, Debug)]
pub struct LGlobal {
    pub name: Name,
    pub ty: LTy,
    pub constant: bool,
    pub value: Option<Value>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DebugInfo {
    #[default]
    None,
    Lines,
    Full,
}

/// Driver knobs that ride along to the external backend.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    pub output: Option<std::path::PathBuf>,
    pub emit_llvm: bool,
    pub debug_info: DebugInfo,
    pub freestanding: bool,
}

#[derive(Debug, Default)]
pub struct LoweredUnit {
    pub functions: Vec<LFunction>,
    pub globals: Vec<LGlobal>,
    pub options: BackendOptions,
}

/// The seam to the external code generator.
pub trait Backend {
    fn emit(&mut self, unit: &LoweredUnit) -> Result<(), String>;
}

enum FrameKind {
    Function,
    Loop(Option<Name>),
    Block,
}

struct Frame {
    kind: FrameKind,
    defers: Vec<LStmt>,
}

enum UnwindTarget {
    Function,
    Break(Option<Name>),
    Continue(Option<Name>),
}

pub fn lower(
    unit: &Unit,
    pool: &mut TypePool,
    analysis: &Analysis,
    options: BackendOptions,
) -> LoweredUnit {
    let mut lowerer = Lowerer {
        pool,
        analysis,
        unit,
        consts: analysis.consts.clone(),
        budget: Budget::default(),
        frames: Vec::new(),
        lifted: Vec::new(),
        temps: 0,
    };
    let mut lowered = LoweredUnit {
        functions: Vec::new(),
        globals: Vec::new(),
        options,
    };
    for decl in &unit.decls {
        match decl {
            Decl::Function(f) if f.body.is_some() && f.generics.is_empty() => {
                if let Some(function) = lowerer.lower_function(f) {
                    lowered.functions.push(function);
                }
            }
            Decl::Global(g) => {
                if let Some(global) = lowerer.lower_global(g) {
                    lowered.globals.push(global);
                }
            }
            _ => {}
        }
    }
    lowered.functions.append(&mut lowerer.lifted);
    lowered
}

struct Lowerer<'a> {
    pool: &'a mut TypePool,
    analysis: &'a Analysis,
    unit: &'a Unit,
    consts: HashMap<SymbolId, Value>,
    budget: Budget,
    frames: Vec<Frame>,
    lifted: Vec<LFunction>,
    temps: u32,
}

impl Lowerer<'_> {
    fn fresh(&mut self, prefix: &str) -> Name {
        self.temps += 1;
        Name::from(format!("{}{}", prefix, self.temps))
    }

    fn try_eval(&mut self, e: &Expr) -> Option<Value> {
        let mut scratch = Diagnostics::new();
        let mut evaluator = Evaluator::new(
            &mut *self.pool,
            &self.analysis.scopes,
            self.unit,
            &mut scratch,
            &mut self.budget,
            &mut self.consts,
        );
        let value = evaluator.eval(e).ok()?;
        if scratch.has_errors() {
            None
        } else {
            Some(value)
        }
    }

    /// Region erasure: references become raw pointers with attributes.
    fn lty(&mut self, ty: TypeId) -> LTy {
        match self.pool.get(ty).clone() {
            Type::Void | Type::Error => LTy::Void,
            Type::Bool => LTy::Bool,
            Type::Char => LTy::Char,
            Type::Int(int) => LTy::Int(int),
            Type::Float(float) => LTy::Float(float),
            Type::Reference {
                pointee,
                mutable,
                nullable,
                ..
            } => {
                let layout = self.pool.layout_of(pointee);
                LTy::Ptr {
                    pointee: Box::new(self.lty(pointee)),
                    attrs: PtrAttrs {
                        nonnull: !nullable,
                        noalias: mutable,
                        dereferenceable: layout.map(|l| l.size),
                        align: layout.map(|l| l.align).unwrap_or(1),
                    },
                }
            }
            Type::Pointer { pointee, .. } => LTy::Ptr {
                pointee: Box::new(self.lty(pointee)),
                attrs: PtrAttrs {
                    align: self.pool.layout_of(pointee).map(|l| l.align).unwrap_or(1),
                    ..PtrAttrs::default()
                },
            },
            Type::Enum(nominal) | Type::Newtype(nominal) => {
                match self.pool.nominal(nominal).underlying {
                    Some(underlying) => self.lty(underlying),
                    None => LTy::Void,
                }
            }
            Type::Function(_) | Type::GenericParam { .. } => LTy::Func,
            Type::Array { .. }
            | Type::Slice { .. }
            | Type::Tuple(_)
            | Type::Struct(_)
            | Type::Union(_)
            | Type::TaggedUnion(_) => {
                let layout = self.pool.layout_of(ty).unwrap_or(Layout { size: 0, align: 1 });
                LTy::Aggregate {
                    size: layout.size,
                    align: layout.align,
                }
            }
        }
    }

    fn expr_lty(&mut self, e: &Expr) -> LTy {
        match e.ty {
            Some(ty) => self.lty(ty),
            None => LTy::Void,
        }
    }

    // ---- functions ----

    fn lower_function(&mut self, f: &FunctionDecl) -> Option<LFunction> {
        let symbol = f.symbol?;
        let sig = match &self.analysis.scopes.symbol(symbol).kind {
            SymbolKind::Function { ty, .. } => match self.pool.get(*ty).clone() {
                Type::Function(sig) => sig,
                _ => return None,
            },
            _ => return None,
        };
        let name = match &f.owner {
            Some(owner) => Name::from(format!("{}::{}", owner, f.name)),
            None => f.name.clone(),
        };
        let mut params: Vec<(Name, LTy)> = Vec::new();
        if let Some(owner) = &f.owner {
            let owner_ty = self
                .analysis
                .scopes
                .lookup(self.analysis.scopes.root(), owner)
                .and_then(|s| match &self.analysis.scopes.symbol(s).kind {
                    SymbolKind::Type { ty } => Some(*ty),
                    _ => None,
                });
            let self_ty = match owner_ty {
                Some(ty) => {
                    let layout = self.pool.layout_of(ty);
                    LTy::Ptr {
                        pointee: Box::new(self.lty(ty)),
                        attrs: PtrAttrs {
                            nonnull: true,
                            noalias: true,
                            dereferenceable: layout.map(|l| l.size),
                            align: layout.map(|l| l.align).unwrap_or(1),
                        },
                    }
                }
                None => LTy::Func,
            };
            params.push((Name::from("self"), self_ty));
        }
        for (param, &ty) in f.params.iter().zip(&sig.params) {
            let lty = self.lty(ty);
            params.push((param.name.clone(), lty));
        }
        let ret = self.lty(sig.ret);

        let body = f.body.as_ref()?;
        self.frames.push(Frame {
            kind: FrameKind::Function,
            defers: Vec::new(),
        });
        let mut out = Vec::new();
        for stmt in &body.stmts {
            self.lower_stmt(stmt, &mut out);
        }
        let frame = self.frames.pop().expect("function frame");
        for defer in frame.defers.iter().rev() {
            out.push(defer.clone());
        }

        Some(LFunction {
            name,
            params,
            ret,
            body: out,
            attrs: f.attrs,
            section: f.section.clone(),
            convention: f.convention,
        })
    }

    fn lower_global(&mut self, g: &GlobalDecl) -> Option<LGlobal> {
        let symbol = g.symbol?;
        let ty = match &self.analysis.scopes.symbol(symbol).kind {
            SymbolKind::Variable { ty, .. } => *ty,
            _ => return None,
        };
        let value = self
            .consts
            .get(&symbol)
            .cloned()
            .or_else(|| g.init.as_ref().and_then(|init| self.try_eval(init)));
        let lty = self.lty(ty);
        Some(LGlobal {
            name: g.name.clone(),
            ty: lty,
            constant: g.is_const,
            value,
        })
    }

    // ---- statements ----

    fn lower_block_stmts(&mut self, stmts: &[Stmt]) -> Vec<LStmt> {
        self.frames.push(Frame {
            kind: FrameKind::Block,
            defers: Vec::new(),
        });
        let mut out = Vec::new();
        for stmt in stmts {
            self.lower_stmt(stmt, &mut out);
        }
        let frame = self.frames.pop().expect("block frame");
        for defer in frame.defers.iter().rev() {
            out.push(defer.clone());
        }
        out
    }

    /// Duplicate the unwinding code for one exit path: the defer stacks of
    /// every frame the exit crosses, innermost first, each in reverse
    /// registration order.
    fn emit_unwind(&mut self, out: &mut Vec<LStmt>, target: UnwindTarget) {
        for frame in self.frames.iter().rev() {
            for defer in frame.defers.iter().rev() {
                out.push(defer.clone());
            }
            match (&frame.kind, &target) {
                (FrameKind::Function, UnwindTarget::Function) => return,
                (FrameKind::Loop(label), UnwindTarget::Break(wanted)) => {
                    if wanted.is_none() || label == wanted {
                        return;
                    }
                }
                (FrameKind::Loop(label), UnwindTarget::Continue(wanted)) => {
                    if wanted.is_none() || label == wanted {
                        // Continue re-enters the loop; the loop frame itself
                        // is not torn down. Its defers were not emitted
                        // because loop frames hold none.
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt, out: &mut Vec<LStmt>) {
        match &stmt.kind {
            StmtKind::Empty | StmtKind::Region(_) | StmtKind::StaticAssert { .. } => {}
            StmtKind::Expr(e) => self.lower_expr_stmt(e, out),
            StmtKind::Local(local) => {
                let ty = local
                    .symbol
                    .and_then(|s| match &self.analysis.scopes.symbol(s).kind {
                        SymbolKind::Variable { ty, .. } => Some(*ty),
                        _ => None,
                    });
                let lty = match ty {
                    Some(ty) => self.lty(ty),
                    None => LTy::Void,
                };
                let init = local.init.as_ref().map(|init| self.lower_expr(init, out));
                out.push(LStmt::Local {
                    name: local.name.clone(),
                    ty: lty,
                    init,
                });
            }
            StmtKind::Block(block) => {
                let stmts = self.lower_block_stmts(&block.stmts);
                out.push(LStmt::Block(stmts));
            }
            StmtKind::If {
                cond,
                then,
                else_branch,
            } => {
                let cond = self.lower_expr(cond, out);
                let then = self.lower_block_stmts(&then.stmts);
                let otherwise = match else_branch {
                    Some(else_branch) => {
                        let mut stmts = Vec::new();
                        self.lower_stmt(else_branch, &mut stmts);
                        stmts
                    }
                    None => Vec::new(),
                };
                out.push(LStmt::If {
                    cond,
                    then,
                    otherwise,
                });
            }
            StmtKind::IfConst {
                then,
                else_branch,
                taken,
                ..
            } => match taken {
                // Only the selected branch survives lowering.
                Some(true) => {
                    let stmts = self.lower_block_stmts(&then.stmts);
                    out.push(LStmt::Block(stmts));
                }
                _ => {
                    if let Some(else_branch) = else_branch {
                        self.lower_stmt(else_branch, out);
                    }
                }
            },
            StmtKind::While { label, cond, body } => {
                let mut cond_stmts = Vec::new();
                let cond = self.lower_expr(cond, &mut cond_stmts);
                out.extend(cond_stmts.iter().cloned());
                self.frames.push(Frame {
                    kind: FrameKind::Loop(label.clone()),
                    defers: Vec::new(),
                });
                let mut body_stmts = self.lower_block_stmts(&body.stmts);
                body_stmts.extend(cond_stmts);
                self.frames.pop();
                out.push(LStmt::While {
                    label: label.clone(),
                    cond,
                    body: body_stmts,
                });
            }
            StmtKind::For {
                label,
                init,
                cond,
                step,
                body,
            } => {
                self.frames.push(Frame {
                    kind: FrameKind::Block,
                    defers: Vec::new(),
                });
                let mut init_stmts = Vec::new();
                if let Some(init) = init {
                    self.lower_stmt(init, &mut init_stmts);
                }
                let cond = cond.as_ref().map(|cond| {
                    let mut cond_stmts = Vec::new();
                    let lowered = self.lower_expr(cond, &mut cond_stmts);
                    init_stmts.extend(cond_stmts);
                    lowered
                });
                self.frames.push(Frame {
                    kind: FrameKind::Loop(label.clone()),
                    defers: Vec::new(),
                });
                let body_stmts = self.lower_block_stmts(&body.stmts);
                let mut step_stmts = Vec::new();
                if let Some(step) = step {
                    self.lower_expr_stmt(step, &mut step_stmts);
                }
                self.frames.pop();
                let for_scope = self.frames.pop().expect("for frame");
                out.push(LStmt::For {
                    label: label.clone(),
                    init: init_stmts,
                    cond,
                    step: step_stmts,
                    body: body_stmts,
                });
                for defer in for_scope.defers.iter().rev() {
                    out.push(defer.clone());
                }
            }
            StmtKind::Match { scrutinee, arms } => self.lower_match(scrutinee, arms, out),
            StmtKind::Return(value) => {
                let value = value.as_ref().map(|value| self.lower_expr(value, out));
                self.emit_unwind(out, UnwindTarget::Function);
                out.push(LStmt::Return(value));
            }
            StmtKind::Break(label) => {
                self.emit_unwind(out, UnwindTarget::Break(label.clone()));
                out.push(LStmt::Break(label.clone()));
            }
            StmtKind::Continue(label) => {
                self.emit_unwind(out, UnwindTarget::Continue(label.clone()));
                out.push(LStmt::Continue(label.clone()));
            }
            StmtKind::Defer(e) => {
                // Lower once at registration; the stored statements are
                // duplicated at each exit point.
                let mut stmts = Vec::new();
                self.lower_expr_stmt(e, &mut stmts);
                let registered = if stmts.len() == 1 {
                    stmts.pop().unwrap()
                } else {
                    LStmt::Block(stmts)
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.defers.push(registered);
                }
            }
            StmtKind::Unsafe { body, .. } => {
                let stmts = self.lower_block_stmts(&body.stmts);
                out.push(LStmt::Block(stmts));
            }
        }
    }

    fn lower_expr_stmt(&mut self, e: &Expr, out: &mut Vec<LStmt>) {
        match &e.kind {
            ExprKind::Assign { op, lhs, rhs } => {
                let target = self.lower_expr(lhs, out);
                let mut value = self.lower_expr(rhs, out);
                if let Some(op) = op {
                    value = LExpr::Binary {
                        op: *op,
                        lhs: Box::new(target.clone()),
                        rhs: Box::new(value),
                    };
                }
                out.push(LStmt::Assign { target, value });
            }
            _ => {
                let value = self.lower_expr(e, out);
                out.push(LStmt::Expr(value));
            }
        }
    }

    // ---- match ----

    fn lower_match(&mut self, scrutinee: &Expr, arms: &[MatchArm], out: &mut Vec<LStmt>) {
        let value = self.lower_expr(scrutinee, out);
        let tmp = self.fresh("__match");
        let lty = self.expr_lty(scrutinee);
        out.push(LStmt::Local {
            name: tmp.clone(),
            ty: lty,
            init: Some(value),
        });

        let tagged = scrutinee.ty.and_then(|ty| match self.pool.get(ty) {
            Type::TaggedUnion(nominal) => Some(*nominal),
            _ => None,
        });

        if let Some(nominal) = tagged {
            // Decode the discriminant first, then dispatch on it.
            let payload_offset = self.pool.payload_offset(nominal);
            let variants = self.pool.nominal(nominal).variants.clone();
            let mut cases = Vec::new();
            let mut default = Vec::new();
            for arm in arms {
                match &arm.pattern {
                    Pattern::Variant { name, binding, symbol } => {
                        let discriminant = variants
                            .iter()
                            .find(|v| &v.name == name)
                            .map(|v| v.discriminant as i128)
                            .unwrap_or(0);
                        let mut body = Vec::new();
                        if let (Some(binding), Some(symbol)) = (binding, symbol) {
                            let binding_ty = match &self.analysis.scopes.symbol(*symbol).kind {
                                SymbolKind::Variable { ty, .. } => Some(*ty),
                                _ => None,
                            };
                            let lty = match binding_ty {
                                Some(ty) => self.lty(ty),
                                None => LTy::Void,
                            };
                            body.push(LStmt::Local {
                                name: binding.clone(),
                                ty: lty,
                                init: Some(LExpr::PayloadOf {
                                    base: Box::new(LExpr::Local(tmp.clone())),
                                    offset: payload_offset,
                                }),
                            });
                        }
                        body.extend(self.lower_block_stmts(&arm.body));
                        cases.push((discriminant, body));
                    }
                    Pattern::Default => {
                        default = self.lower_block_stmts(&arm.body);
                    }
                    _ => {}
                }
            }
            let jump_table = cases.len() >= 4;
            out.push(LStmt::Switch {
                value: LExpr::TagOf(Box::new(LExpr::Local(tmp))),
                cases,
                default,
                jump_table,
            });
            return;
        }

        // Integer match: a jump table when the constant arms are dense
        // enough, otherwise a compare cascade.
        let mut constant_arms: Vec<(i128, &MatchArm)> = Vec::new();
        let mut all_constant = true;
        for arm in arms {
            match &arm.pattern {
                Pattern::Expr(e) => match self.try_eval(e).and_then(|v| v.as_int()) {
                    Some(value) => constant_arms.push((value, arm)),
                    None => all_constant = false,
                },
                Pattern::Default => {}
                _ => all_constant = false,
            }
        }
        if all_constant && dense_enough(&constant_arms.iter().map(|(v, _)| *v).collect::<Vec<_>>())
        {
            let mut cases = Vec::new();
            let mut default = Vec::new();
            for arm in arms {
                match &arm.pattern {
                    Pattern::Expr(e) => {
                        let value = self
                            .try_eval(e)
                            .and_then(|v| v.as_int())
                            .unwrap_or_default();
                        let body = self.lower_block_stmts(&arm.body);
                        cases.push((value, body));
                    }
                    Pattern::Default => default = self.lower_block_stmts(&arm.body),
                    _ => {}
                }
            }
            out.push(LStmt::Switch {
                value: LExpr::Local(tmp),
                cases,
                default,
                jump_table: true,
            });
            return;
        }

        // Compare cascade, built back to front with the default arm as the
        // final else.
        let mut cascade: Vec<LStmt> = arms
            .iter()
            .find(|arm| matches!(arm.pattern, Pattern::Default))
            .map(|arm| self.lower_block_stmts(&arm.body))
            .unwrap_or_default();
        for arm in arms.iter().rev() {
            let cond = match &arm.pattern {
                Pattern::Default => continue,
                Pattern::Expr(e) => {
                    // Pattern constants have no side effects to hoist.
                    let mut discarded = Vec::new();
                    let expected = self.lower_expr(e, &mut discarded);
                    LExpr::Binary {
                        op: BinaryOp::Eq,
                        lhs: Box::new(LExpr::Local(tmp.clone())),
                        rhs: Box::new(expected),
                    }
                }
                Pattern::Range { lo, hi } => {
                    let mut discarded = Vec::new();
                    let lo = self.lower_expr(lo, &mut discarded);
                    let hi = self.lower_expr(hi, &mut discarded);
                    LExpr::Binary {
                        op: BinaryOp::And,
                        lhs: Box::new(LExpr::Binary {
                            op: BinaryOp::Ge,
                            lhs: Box::new(LExpr::Local(tmp.clone())),
                            rhs: Box::new(lo),
                        }),
                        rhs: Box::new(LExpr::Binary {
                            op: BinaryOp::Le,
                            lhs: Box::new(LExpr::Local(tmp.clone())),
                            rhs: Box::new(hi),
                        }),
                    }
                }
                Pattern::Variant { .. } => continue,
            };
            let then = self.lower_block_stmts(&arm.body);
            cascade = vec![LStmt::If {
                cond,
                then,
                otherwise: cascade,
            }];
        }
        out.extend(cascade);
    }

    // ---- expressions ----

    fn lower_expr(&mut self, e: &Expr, out: &mut Vec<LStmt>) -> LExpr {
        match &e.kind {
            ExprKind::IntLit { value, .. } => {
                let ty = match e.ty.map(|t| self.pool.get(t).clone()) {
                    Some(Type::Int(int)) => int,
                    _ => IntType::I32,
                };
                LExpr::Int {
                    value: *value as i128,
                    ty,
                }
            }
            ExprKind::FloatLit { value, single } => LExpr::Float {
                value: *value,
                single: *single,
            },
            ExprKind::BoolLit(b) => LExpr::Bool(*b),
            ExprKind::CharLit(c) => LExpr::Char(*c),
            ExprKind::StrLit(s) => LExpr::Str(s.clone()),
            ExprKind::NullLit => LExpr::Null,
            ExprKind::Ident { name, symbol } => match symbol {
                Some(symbol) => match &self.analysis.scopes.symbol(*symbol).kind {
                    SymbolKind::Variable { storage, .. } => match storage {
                        Storage::Local | Storage::Param => LExpr::Local(name.clone()),
                        Storage::Static | Storage::Const => LExpr::Global(name.clone()),
                    },
                    SymbolKind::Enumerator { value, .. } => LExpr::Int {
                        value: *value,
                        ty: IntType::I32,
                    },
                    SymbolKind::Function { .. } => LExpr::FunctionRef(name.clone()),
                    _ => LExpr::Local(name.clone()),
                },
                None => LExpr::Local(name.clone()),
            },
            ExprKind::Unary { op, operand } => {
                let lowered = self.lower_expr(operand, out);
                match op {
                    UnaryOp::AddrOf => LExpr::AddrOf(Box::new(lowered)),
                    op => LExpr::Unary {
                        op: *op,
                        operand: Box::new(lowered),
                    },
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs, out);
                let rhs = self.lower_expr(rhs, out);
                LExpr::Binary {
                    op: *op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            ExprKind::Assign { .. } => {
                // Assignment in expression position: emit the store, then
                // reload the target.
                self.lower_expr_stmt(e, out);
                match &e.kind {
                    ExprKind::Assign { lhs, .. } => self.lower_expr(lhs, out),
                    _ => unreachable!(),
                }
            }
            ExprKind::Call { callee, args, .. } => {
                let callee = self.lower_expr(callee, out);
                let args = args.iter().map(|arg| self.lower_expr(arg, out)).collect();
                LExpr::Call {
                    callee: Box::new(callee),
                    args,
                }
            }
            ExprKind::MethodCall {
                receiver,
                method,
                args,
                ..
            } => {
                let owner = receiver
                    .ty
                    .map(|t| {
                        let inner = self.deref_ty(t);
                        match self.pool.get(inner) {
                            Type::Struct(n) | Type::Union(n) => {
                                self.pool.nominal(*n).name.to_string()
                            }
                            _ => self.pool.display(inner),
                        }
                    })
                    .unwrap_or_default();
                let receiver_value = self.lower_expr(receiver, out);
                let mut lowered_args = vec![LExpr::AddrOf(Box::new(receiver_value))];
                for arg in args {
                    lowered_args.push(self.lower_expr(arg, out));
                }
                LExpr::Call {
                    callee: Box::new(LExpr::FunctionRef(Name::from(format!(
                        "{}::{}",
                        owner, method
                    )))),
                    args: lowered_args,
                }
            }
            ExprKind::Field {
                base,
                name,
                ..
            } => {
                let base_nominal = base.ty.and_then(|t| {
                    let inner = self.deref_ty(t);
                    match self.pool.get(inner) {
                        Type::Struct(n) | Type::Union(n) => Some(*n),
                        _ => None,
                    }
                });
                let tuple_elements = base.ty.and_then(|t| {
                    let inner = self.deref_ty(t);
                    match self.pool.get(inner) {
                        Type::Tuple(elements) => Some(elements.clone()),
                        _ => None,
                    }
                });
                let lowered = self.lower_expr(base, out);
                if let Some(nominal) = base_nominal {
                    let offset = self
                        .pool
                        .field_offset(nominal, name)
                        .map(|(offset, _)| offset)
                        .unwrap_or(0);
                    LExpr::FieldAccess {
                        base: Box::new(lowered),
                        offset,
                    }
                } else if let Some(elements) = tuple_elements {
                    let index = name.as_str().parse::<usize>().unwrap_or(0);
                    let offset = self.tuple_offset(&elements, index);
                    LExpr::FieldAccess {
                        base: Box::new(lowered),
                        offset,
                    }
                } else {
                    LExpr::FieldAccess {
                        base: Box::new(lowered),
                        offset: 0,
                    }
                }
            }
            ExprKind::Index { base, index } => {
                let element_size = e
                    .ty
                    .and_then(|t| self.pool.layout_of(t))
                    .map(|l| l.size)
                    .unwrap_or(1);
                let length = base.ty.map(|t| self.deref_ty(t)).and_then(|t| {
                    match self.pool.get(t) {
                        Type::Array { length, .. } => Some(*length),
                        _ => None,
                    }
                });
                let lowered_base = self.lower_expr(base, out);
                if let ExprKind::Range { lo, hi } = &index.kind {
                    let lo = self.lower_expr(lo, out);
                    let hi = self.lower_expr(hi, out);
                    return LExpr::SliceOf {
                        base: Box::new(lowered_base),
                        lo: Box::new(lo),
                        hi: Box::new(hi),
                    };
                }
                let lowered_index = self.lower_expr(index, out);
                if e.needs_bounds_check {
                    // The request from analysis becomes an explicit
                    // conditional trap; a true condition aborts.
                    let limit = match length {
                        Some(length) => LExpr::Int {
                            value: length as i128,
                            ty: IntType::U64,
                        },
                        None => LExpr::SliceLen(Box::new(lowered_base.clone())),
                    };
                    out.push(LStmt::Trap {
                        cond: LExpr::Binary {
                            op: BinaryOp::Ge,
                            lhs: Box::new(lowered_index.clone()),
                            rhs: Box::new(limit),
                        },
                    });
                }
                LExpr::IndexAccess {
                    base: Box::new(lowered_base),
                    index: Box::new(lowered_index),
                    element_size,
                }
            }
            ExprKind::Range { lo, .. } => self.lower_expr(lo, out),
            ExprKind::Cast { operand, .. } => {
                let to = self.expr_lty(e);
                let value = self.lower_expr(operand, out);
                LExpr::Cast {
                    value: Box::new(value),
                    to,
                }
            }
            ExprKind::Sizeof(_) | ExprKind::Alignof(_) | ExprKind::Fieldcount(_)
            | ExprKind::SizeofPack(_) => {
                let value = self.try_eval(e).and_then(|v| v.as_int()).unwrap_or(0);
                LExpr::Int {
                    value,
                    ty: IntType::U64,
                }
            }
            ExprKind::New { region, init, .. } => {
                let pointee_layout = e
                    .ty
                    .and_then(|t| match self.pool.get(t).clone() {
                        Type::Reference { pointee, .. } => self.pool.layout_of(pointee),
                        _ => None,
                    })
                    .unwrap_or(Layout { size: 0, align: 1 });
                let init = init
                    .as_ref()
                    .map(|init| Box::new(self.lower_expr(init, out)));
                LExpr::Alloc {
                    region: region.clone(),
                    size: pointee_layout.size,
                    align: pointee_layout.align,
                    init,
                }
            }
            ExprKind::Try(operand) => self.lower_try(e, operand, out),
            ExprKind::Spawn(operand) => {
                let lowered = self.lower_expr(operand, out);
                match lowered {
                    LExpr::Call { callee, args } => LExpr::SpawnCall { callee, args },
                    other => other,
                }
            }
            ExprKind::Closure { params, body } => self.lower_closure(e, params, body),
            ExprKind::VolatileLoad(pointer) => {
                let pointer = self.lower_expr(pointer, out);
                LExpr::VolatileLoad(Box::new(pointer))
            }
            ExprKind::VolatileStore { pointer, value } => {
                let pointer = self.lower_expr(pointer, out);
                let value = self.lower_expr(value, out);
                LExpr::VolatileStore {
                    pointer: Box::new(pointer),
                    value: Box::new(value),
                }
            }
            ExprKind::Asm(text) => LExpr::Asm(text.clone()),
            ExprKind::InitList(elements) | ExprKind::Tuple(elements) => {
                let values = elements
                    .iter()
                    .map(|element| self.lower_expr(element, out))
                    .collect();
                LExpr::Aggregate(values)
            }
        }
    }

    fn deref_ty(&self, ty: TypeId) -> TypeId {
        match self.pool.get(ty) {
            Type::Reference { pointee, .. } | Type::Pointer { pointee, .. } => *pointee,
            _ => ty,
        }
    }

    fn tuple_offset(&mut self, elements: &[TypeId], index: usize) -> u64 {
        let mut offset = 0u64;
        for (i, &element) in elements.iter().enumerate() {
            let layout = self
                .pool
                .layout_of(element)
                .unwrap_or(Layout { size: 0, align: 1 });
            offset = offset.div_ceil(layout.align) * layout.align;
            if i == index {
                return offset;
            }
            offset += layout.size;
        }
        offset
    }

    /// `try e`: stash the operand, propagate the empty variant through every
    /// enclosing defer, otherwise yield the payload.
    fn lower_try(&mut self, _e: &Expr, operand: &Expr, out: &mut Vec<LStmt>) -> LExpr {
        let nominal = operand.ty.and_then(|t| match self.pool.get(t) {
            Type::TaggedUnion(nominal) => Some(*nominal),
            _ => None,
        });
        let value = self.lower_expr(operand, out);
        let Some(nominal) = nominal else {
            return value;
        };
        let empty_discriminant = self
            .pool
            .nominal(nominal)
            .variants
            .iter()
            .find(|v| v.payload.is_none())
            .map(|v| v.discriminant as i128)
            .unwrap_or(0);
        let payload_offset = self.pool.payload_offset(nominal);

        let tmp = self.fresh("__try");
        let lty = self.expr_lty(operand);
        out.push(LStmt::Local {
            name: tmp.clone(),
            ty: lty,
            init: Some(value),
        });
        let mut propagate = Vec::new();
        self.emit_unwind(&mut propagate, UnwindTarget::Function);
        propagate.push(LStmt::Return(Some(LExpr::Local(tmp.clone()))));
        out.push(LStmt::If {
            cond: LExpr::Binary {
                op: BinaryOp::Eq,
                lhs: Box::new(LExpr::TagOf(Box::new(LExpr::Local(tmp.clone())))),
                rhs: Box::new(LExpr::Int {
                    value: empty_discriminant,
                    ty: IntType::U32,
                }),
            },
            then: propagate,
            otherwise: Vec::new(),
        });
        LExpr::PayloadOf {
            base: Box::new(LExpr::Local(tmp)),
            offset: payload_offset,
        }
    }

    /// Closures lift to top-level anonymous functions plus a capture struct;
    /// only zero-capture closures reach lowering, so the capture struct is
    /// empty and the value is just the function address.
    fn lower_closure(&mut self, e: &Expr, params: &[ClosureParam], body: &Expr) -> LExpr {
        let name = self.fresh("__closure");
        let sig = match e.ty.map(|t| self.pool.get(t).clone()) {
            Some(Type::Function(sig)) => sig,
            _ => return LExpr::FunctionRef(name),
        };
        let lowered_params: Vec<(Name, LTy)> = params
            .iter()
            .zip(&sig.params)
            .map(|(param, &ty)| (param.name.clone(), self.lty(ty)))
            .collect();
        let ret = self.lty(sig.ret);

        // The closure body is its own function: fresh frame stack.
        let saved_frames = std::mem::take(&mut self.frames);
        self.frames.push(Frame {
            kind: FrameKind::Function,
            defers: Vec::new(),
        });
        let mut fn_body = Vec::new();
        let result = self.lower_expr(body, &mut fn_body);
        fn_body.push(LStmt::Return(Some(result)));
        self.frames = saved_frames;

        self.lifted.push(LFunction {
            name: name.clone(),
            params: lowered_params,
            ret,
            body: fn_body,
            attrs: FnAttrs::empty(),
            section: None,
            convention: CallConv::Default,
        });
        LExpr::FunctionRef(name)
    }
}

/// Jump-table heuristic: at least four integer arms covering at least half
/// of the value span.
fn dense_enough(values: &[i128]) -> bool {
    if values.len() < 4 {
        return false;
    }
    let (min, max) = match (values.iter().min(), values.iter().max()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return false,
    };
    let span = (max - min + 1) as usize;
    values.len() * 2 >= span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_table_heuristic() {
        assert!(dense_enough(&[0, 1, 2, 3]));
        assert!(dense_enough(&[0, 1, 2, 3, 10, 11, 12, 13]));
        assert!(!dense_enough(&[0, 1, 2]));
        assert!(!dense_enough(&[0, 100, 200, 300]));
    }

    #[test]
    fn pointer_attrs_default_to_unknown() {
        let attrs = PtrAttrs::default();
        assert!(!attrs.nonnull);
        assert!(!attrs.noalias);
        assert_eq!(attrs.dereferenceable, None);
    }
}
