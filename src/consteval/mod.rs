//! # SafeC Compile-Time Evaluation
//!
//! A tree-walking evaluator over a subset of expressions and statements.
//! Triggered for `const` global initializers, array lengths,
//! `static_assert`, `if const` conditions, enum enumerator values, and
//! `consteval`/`const` function bodies.
//!
//! Deliberately an interpreter, not a bytecode VM: the performance target is
//! tens of thousands of steps, and the hard caps are the failsafe. Limits
//! are enforced per evaluation request (recursion depth), per frame (loop
//! iterations), and cumulatively per compilation (total steps).
//!
//! Rules: only `const`/`consteval` callees; no I/O, no extern calls, no
//! addresses of non-static locations; local mutation within a call is fine,
//! non-local mutation is not. Signed overflow, division by zero, and
//! out-of-range shifts are hard errors, never wrapping.

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::diagnostics::{Category, Diagnostics};
use crate::parsing::nodes::{
    BinaryOp, Block, Decl, Expr, ExprKind, FnAttrs, MatchArm, Pattern, Stmt, StmtKind, TypeExpr,
    UnaryOp, Unit,
};
use crate::sema::scope::{ScopeTree, SymbolId, SymbolKind};
use crate::source::Position;
use crate::types::{primitive_by_name, FloatType, IntType, Type, TypeId, TypePool};

pub const MAX_RECURSION_DEPTH: u32 = 256;
pub const MAX_LOOP_ITERATIONS: u64 = 1_000_000;
pub const MAX_TOTAL_STEPS: u64 = 10_000_000;

/// Cumulative step budget for one whole compilation.
#[derive(Debug, Default)]
pub struct Budget {
    pub steps: u64,
}

/// A compile-time value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Char(char),
    Int { value: i128, ty: IntType },
    Float { value: f64, single: bool },
    Str(Name),
    Null,
    Struct {
        nominal: crate::types::NominalId,
        fields: Vec<(Name, Value)>,
    },
    Union {
        nominal: crate::types::NominalId,
        tag: Name,
        payload: Option<Box<Value>>,
    },
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int { value, .. } => Some(*value),
            Value::Char(c) => Some(*c as i128),
            Value::Bool(b) => Some(i128::from(*b)),
            _ => None,
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int { value, .. } => Some(*value != 0),
            _ => None,
        }
    }
}

/// Why evaluation stopped early.
pub enum Stop {
    /// A diagnostic has already been emitted.
    Error,
    /// `try` hit the empty variant; the enclosing function returns it.
    Propagate(Value),
}

type EvalResult<T> = Result<T, Stop>;

enum Flow {
    Normal,
    Return(Value),
    Break(Option<Name>),
    Continue(Option<Name>),
}

/// Per-evaluation environment: call frames of block scopes mapping names to
/// values. A fresh environment is made for every function call, so callers'
/// locals are invisible to callees.
#[derive(Default)]
struct Env {
    frames: Vec<HashMap<Name, Value>>,
}

impl Env {
    fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
    }

    fn define(&mut self, name: Name, value: Value) {
        self.frames
            .last_mut()
            .expect("environment has no frame")
            .insert(name, value);
    }

    fn get(&self, name: &Name) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    fn get_mut(&mut self, name: &Name) -> Option<&mut Value> {
        self.frames
            .iter_mut()
            .rev()
            .find_map(|frame| frame.get_mut(name))
    }

    /// Assign to an existing binding, or create one in the innermost frame.
    fn assign(&mut self, name: Name, value: Value) {
        match self.get_mut(&name) {
            Some(slot) => *slot = value,
            None => self.define(name, value),
        }
    }
}

pub struct Evaluator<'a> {
    pool: &'a mut TypePool,
    scopes: &'a ScopeTree,
    unit: &'a Unit,
    diagnostics: &'a mut Diagnostics,
    budget: &'a mut Budget,
    /// Evaluated const globals and const locals, memoized for the whole
    /// compilation.
    consts: &'a mut HashMap<SymbolId, Value>,
    in_progress: Vec<SymbolId>,
    depth: u32,
    root: Position,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        pool: &'a mut TypePool,
        scopes: &'a ScopeTree,
        unit: &'a Unit,
        diagnostics: &'a mut Diagnostics,
        budget: &'a mut Budget,
        consts: &'a mut HashMap<SymbolId, Value>,
    ) -> Self {
        Self {
            pool,
            scopes,
            unit,
            diagnostics,
            budget,
            consts,
            in_progress: Vec::new(),
            depth: 0,
            root: Position::default(),
        }
    }

    /// Evaluate one const context. Diagnostics are emitted on failure.
    pub fn eval(&mut self, expr: &Expr) -> Result<Value, ()> {
        self.root = expr.position;
        self.depth = 0;
        let mut env = Env::default();
        env.push_frame();
        match self.eval_expr(&mut env, expr) {
            Ok(value) => Ok(value),
            Err(Stop::Propagate(_)) => {
                self.error(
                    Category::ConstContext,
                    expr.position,
                    "try propagation outside a constant function",
                );
                Err(())
            }
            Err(Stop::Error) => Err(()),
        }
    }

    pub fn eval_int(&mut self, expr: &Expr) -> Option<i128> {
        let value = self.eval(expr).ok()?;
        match value.as_int() {
            Some(value) => Some(value),
            None => {
                self.error(
                    Category::ConstContext,
                    expr.position,
                    "an integer constant is required here",
                );
                None
            }
        }
    }

    pub fn eval_array_length(&mut self, expr: &Expr) -> Option<u64> {
        let value = self.eval_int(expr)?;
        if (0..=u64::MAX as i128).contains(&value) {
            Some(value as u64)
        } else {
            self.error(
                Category::ConstContext,
                expr.position,
                "array length must be non-negative",
            );
            None
        }
    }

    fn error(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.diagnostics.error(category, position, message);
    }

    fn stop(&mut self, category: Category, position: Position, message: impl Into<String>) -> Stop {
        self.error(category, position, message);
        Stop::Error
    }

    fn step(&mut self, position: Position) -> EvalResult<()> {
        self.budget.steps += 1;
        if self.budget.steps > MAX_TOTAL_STEPS {
            let root = self.root;
            self.error(
                Category::ConstLimit,
                root,
                format!(
                    "constant evaluation exceeded the total step limit ({}); last at {}:{}",
                    MAX_TOTAL_STEPS, position.line, position.column
                ),
            );
            return Err(Stop::Error);
        }
        Ok(())
    }

    // ---- names ----

    fn lookup_symbol_value(&mut self, symbol: SymbolId, position: Position) -> EvalResult<Value> {
        if let Some(value) = self.consts.get(&symbol) {
            return Ok(value.clone());
        }
        let kind = self.scopes.symbol(symbol).kind.clone();
        match kind {
            SymbolKind::Enumerator { value, ty } => {
                let int = match self.pool.get(ty).clone() {
                    Type::Enum(nominal) => self
                        .pool
                        .nominal(nominal)
                        .underlying
                        .and_then(|u| match self.pool.get(u) {
                            Type::Int(int) => Some(*int),
                            _ => None,
                        })
                        .unwrap_or(IntType::I32),
                    _ => IntType::I32,
                };
                Ok(Value::Int { value, ty: int })
            }
            SymbolKind::Variable {
                storage: crate::sema::scope::Storage::Const,
                decl: Some(decl),
                ..
            } => self.force_const_global(symbol, decl, position),
            _ => Err(self.stop(
                Category::ConstContext,
                position,
                format!(
                    "{} is not usable in a constant expression",
                    self.scopes.symbol(symbol).name
                ),
            )),
        }
    }

    /// Evaluate a const global's initializer on demand, memoized, with cycle
    /// detection.
    fn force_const_global(
        &mut self,
        symbol: SymbolId,
        decl: usize,
        position: Position,
    ) -> EvalResult<Value> {
        if let Some(value) = self.consts.get(&symbol) {
            return Ok(value.clone());
        }
        if self.in_progress.contains(&symbol) {
            return Err(self.stop(
                Category::ResolveCycle,
                position,
                format!(
                    "cyclic initialization of constant {}",
                    self.scopes.symbol(symbol).name
                ),
            ));
        }
        let init = match &self.unit.decls[decl] {
            Decl::Global(global) => match &global.init {
                Some(init) => init.clone(),
                None => {
                    return Err(self.stop(
                        Category::ConstContext,
                        position,
                        format!(
                            "constant {} has no initializer",
                            self.scopes.symbol(symbol).name
                        ),
                    ))
                }
            },
            _ => {
                return Err(self.stop(
                    Category::ConstContext,
                    position,
                    "malformed constant declaration",
                ))
            }
        };
        self.in_progress.push(symbol);
        let mut env = Env::default();
        env.push_frame();
        let value = self.eval_expr(&mut env, &init);
        self.in_progress.pop();
        let value = value?;
        self.consts.insert(symbol, value.clone());
        Ok(value)
    }

    // ---- expressions ----

    fn eval_expr(&mut self, env: &mut Env, e: &Expr) -> EvalResult<Value> {
        self.step(e.position)?;
        match &e.kind {
            ExprKind::IntLit { value, suffix } => {
                let ty = suffix.unwrap_or_else(|| self.int_type_of(e).unwrap_or(IntType::I32));
                Ok(Value::Int {
                    value: *value as i128,
                    ty,
                })
            }
            ExprKind::FloatLit { value, single } => Ok(Value::Float {
                value: *value,
                single: *single,
            }),
            ExprKind::StrLit(s) => Ok(Value::Str(s.clone())),
            ExprKind::CharLit(c) => Ok(Value::Char(*c)),
            ExprKind::BoolLit(b) => Ok(Value::Bool(*b)),
            ExprKind::NullLit => Ok(Value::Null),
            ExprKind::Ident { name, symbol } => {
                if let Some(value) = env.get(name) {
                    return Ok(value.clone());
                }
                let symbol = symbol
                    .or_else(|| self.scopes.lookup(self.scopes.root(), name));
                match symbol {
                    Some(symbol) => self.lookup_symbol_value(symbol, e.position),
                    None => Err(self.stop(
                        Category::ResolveUndefined,
                        e.position,
                        format!("undefined name {} in constant expression", name),
                    )),
                }
            }
            ExprKind::Unary { op, operand } => self.eval_unary(env, e, *op, operand),
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(env, e, *op, lhs, rhs),
            ExprKind::Assign { op, lhs, rhs } => {
                let mut value = self.eval_expr(env, rhs)?;
                if let Some(op) = op {
                    let current = self.eval_expr(env, lhs)?;
                    value = self.apply_binary(*op, current, value, e.position)?;
                }
                self.assign_lvalue(env, lhs, value.clone())?;
                Ok(value)
            }
            ExprKind::Call { callee, args, .. } => self.eval_call(env, e, callee, args),
            ExprKind::MethodCall { .. } => Err(self.stop(
                Category::ConstCall,
                e.position,
                "method calls are not available in constant evaluation",
            )),
            ExprKind::Field { base, name, .. } => {
                let base = self.eval_expr(env, base)?;
                match base {
                    Value::Struct { fields, .. } => fields
                        .iter()
                        .find(|(field, _)| field == name)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| {
                            self.stop(
                                Category::ConstContext,
                                e.position,
                                format!("no field {} in constant struct", name),
                            )
                        }),
                    Value::Tuple(elements) => name
                        .as_str()
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| elements.get(i).cloned())
                        .ok_or_else(|| {
                            self.stop(
                                Category::ConstContext,
                                e.position,
                                "no such tuple element in constant expression",
                            )
                        }),
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "field access on a non-aggregate constant",
                    )),
                }
            }
            ExprKind::Index { base, index } => {
                let base = self.eval_expr(env, base)?;
                let index_value = self.eval_expr(env, index)?;
                let i = index_value.as_int().ok_or_else(|| {
                    self.stop(
                        Category::ConstContext,
                        index.position,
                        "array index must be an integer",
                    )
                })?;
                match base {
                    Value::Array(elements) => {
                        if i < 0 || i as usize >= elements.len() {
                            Err(self.stop(
                                Category::TypeBounds,
                                e.position,
                                format!(
                                    "index {} out of bounds for array of length {}",
                                    i,
                                    elements.len()
                                ),
                            ))
                        } else {
                            Ok(elements[i as usize].clone())
                        }
                    }
                    Value::Str(s) => s
                        .as_str()
                        .chars()
                        .nth(i.max(0) as usize)
                        .map(Value::Char)
                        .ok_or_else(|| {
                            self.stop(
                                Category::TypeBounds,
                                e.position,
                                "string index out of bounds",
                            )
                        }),
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "indexing a non-array constant",
                    )),
                }
            }
            ExprKind::Cast { operand, .. } => {
                let value = self.eval_expr(env, operand)?;
                let target = e.ty.ok_or_else(|| {
                    self.stop(
                        Category::ConstContext,
                        e.position,
                        "cast target unavailable in this constant context",
                    )
                })?;
                self.cast_value(value, target, e.position)
            }
            ExprKind::Sizeof(ty) => {
                let layout = self.layout_of_type_expr(ty, e.position)?;
                Ok(Value::Int {
                    value: layout.size as i128,
                    ty: IntType::U64,
                })
            }
            ExprKind::Alignof(ty) => {
                let layout = self.layout_of_type_expr(ty, e.position)?;
                Ok(Value::Int {
                    value: layout.align as i128,
                    ty: IntType::U64,
                })
            }
            ExprKind::Fieldcount(ty) => {
                let id = self.resolve_type_expr(ty, e.position)?;
                match self.pool.get(id).clone() {
                    Type::Struct(n) | Type::Union(n) => Ok(Value::Int {
                        value: self.pool.nominal(n).fields.len() as i128,
                        ty: IntType::U64,
                    }),
                    Type::TaggedUnion(n) => Ok(Value::Int {
                        value: self.pool.nominal(n).variants.len() as i128,
                        ty: IntType::U64,
                    }),
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "fieldcount requires a struct, union, or tagged union",
                    )),
                }
            }
            ExprKind::SizeofPack(_) => Err(self.stop(
                Category::ConstContext,
                e.position,
                "sizeof... is only valid inside a generic function",
            )),
            ExprKind::InitList(elements) => self.eval_init_list(env, e, elements),
            ExprKind::Tuple(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expr(env, element)?);
                }
                Ok(Value::Tuple(values))
            }
            ExprKind::Try(operand) => {
                let value = self.eval_expr(env, operand)?;
                match &value {
                    Value::Union { nominal, tag, payload } => {
                        let empty_tag = self
                            .pool
                            .nominal(*nominal)
                            .variants
                            .iter()
                            .find(|v| v.payload.is_none())
                            .map(|v| v.name.clone());
                        match empty_tag {
                            Some(empty) if *tag == empty => Err(Stop::Propagate(value)),
                            _ => match payload {
                                Some(payload) => Ok((**payload).clone()),
                                None => Ok(Value::Void),
                            },
                        }
                    }
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "try requires a tagged union value",
                    )),
                }
            }
            ExprKind::Range { .. } => Err(self.stop(
                Category::ConstContext,
                e.position,
                "ranges are not constant values",
            )),
            ExprKind::New { .. } | ExprKind::Spawn(_) | ExprKind::Closure { .. } => Err(self.stop(
                Category::ConstContext,
                e.position,
                "allocation, spawn, and closures are not available in constant evaluation",
            )),
            ExprKind::VolatileLoad(_) | ExprKind::VolatileStore { .. } | ExprKind::Asm(_) => {
                Err(self.stop(
                    Category::ConstIo,
                    e.position,
                    "I/O is not available in constant evaluation",
                ))
            }
        }
    }

    /// The expected integer type recorded on the expression by analysis.
    fn int_type_of(&self, e: &Expr) -> Option<IntType> {
        match self.pool.get(e.ty?) {
            Type::Int(int) => Some(*int),
            _ => None,
        }
    }

    fn eval_init_list(
        &mut self,
        env: &mut Env,
        e: &Expr,
        elements: &[Expr],
    ) -> EvalResult<Value> {
        let ty = e.ty.ok_or_else(|| {
            self.stop(
                Category::ConstContext,
                e.position,
                "initializer list needs a known type in this constant context",
            )
        })?;
        match self.pool.get(ty).clone() {
            Type::Struct(nominal) => {
                let field_names: Vec<Name> = self
                    .pool
                    .nominal(nominal)
                    .fields
                    .iter()
                    .map(|f| f.name.clone())
                    .collect();
                let mut fields = Vec::with_capacity(elements.len());
                for (name, element) in field_names.iter().zip(elements) {
                    fields.push((name.clone(), self.eval_expr(env, element)?));
                }
                Ok(Value::Struct { nominal, fields })
            }
            Type::Array { .. } => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expr(env, element)?);
                }
                Ok(Value::Array(values))
            }
            Type::Tuple(_) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expr(env, element)?);
                }
                Ok(Value::Tuple(values))
            }
            _ => Err(self.stop(
                Category::ConstContext,
                e.position,
                "initializer list for a non-aggregate type",
            )),
        }
    }

    fn eval_unary(
        &mut self,
        env: &mut Env,
        e: &Expr,
        op: UnaryOp,
        operand: &Expr,
    ) -> EvalResult<Value> {
        match op {
            UnaryOp::Neg => {
                let value = self.eval_expr(env, operand)?;
                match value {
                    Value::Int { value, ty } => {
                        let negated = -value;
                        if ty.signed() && !ty.contains(negated) {
                            Err(self.stop(
                                Category::ConstOverflow,
                                e.position,
                                format!("negation overflows {}", ty.name()),
                            ))
                        } else if !ty.signed() && negated < 0 {
                            Err(self.stop(
                                Category::ConstOverflow,
                                e.position,
                                format!("negation underflows {}", ty.name()),
                            ))
                        } else {
                            Ok(Value::Int { value: negated, ty })
                        }
                    }
                    Value::Float { value, single } => Ok(Value::Float {
                        value: -value,
                        single,
                    }),
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "negation needs a numeric constant",
                    )),
                }
            }
            UnaryOp::Not => {
                let value = self.eval_expr(env, operand)?;
                match value.truthy() {
                    Some(b) => Ok(Value::Bool(!b)),
                    None => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "logical not needs a boolean constant",
                    )),
                }
            }
            UnaryOp::BitNot => {
                let value = self.eval_expr(env, operand)?;
                match value {
                    Value::Int { value, ty } => Ok(Value::Int {
                        value: ty.wrap(!value),
                        ty,
                    }),
                    _ => Err(self.stop(
                        Category::ConstContext,
                        e.position,
                        "bitwise not needs an integer constant",
                    )),
                }
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let current = self.eval_expr(env, operand)?;
                let (delta, pre) = match op {
                    UnaryOp::PreInc => (1, true),
                    UnaryOp::PreDec => (-1, true),
                    UnaryOp::PostInc => (1, false),
                    _ => (-1, false),
                };
                let one = Value::Int {
                    value: delta,
                    ty: match current {
                        Value::Int { ty, .. } => ty,
                        _ => IntType::I32,
                    },
                };
                let updated =
                    self.apply_binary(BinaryOp::Add, current.clone(), one, e.position)?;
                self.assign_lvalue(env, operand, updated.clone())?;
                Ok(if pre { updated } else { current })
            }
            UnaryOp::Deref | UnaryOp::AddrOf => Err(self.stop(
                Category::ConstContext,
                e.position,
                "addresses of non-static locations are not available in constant evaluation",
            )),
        }
    }

    fn eval_binary(
        &mut self,
        env: &mut Env,
        e: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> EvalResult<Value> {
        // Logical operators short-circuit.
        if op.is_logical() {
            let lhs = self.eval_expr(env, lhs)?;
            let lhs = lhs.truthy().ok_or_else(|| {
                self.stop(
                    Category::ConstContext,
                    e.position,
                    "logical operator needs boolean operands",
                )
            })?;
            return match (op, lhs) {
                (BinaryOp::And, false) => Ok(Value::Bool(false)),
                (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                _ => {
                    let rhs = self.eval_expr(env, rhs)?;
                    rhs.truthy().map(Value::Bool).ok_or_else(|| {
                        self.stop(
                            Category::ConstContext,
                            e.position,
                            "logical operator needs boolean operands",
                        )
                    })
                }
            };
        }
        let lhs = self.eval_expr(env, lhs)?;
        let rhs = self.eval_expr(env, rhs)?;
        self.apply_binary(op, lhs, rhs, e.position)
    }

    fn apply_binary(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        position: Position,
    ) -> EvalResult<Value> {
        if op.is_comparison() {
            return self.compare(op, lhs, rhs, position);
        }
        match (lhs, rhs) {
            (Value::Int { value: a, ty }, Value::Int { value: b, .. }) => {
                self.int_arithmetic(op, a, b, ty, position)
            }
            (Value::Float { value: a, single }, Value::Float { value: b, .. }) => {
                let value = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    _ => {
                        return Err(self.stop(
                            Category::ConstContext,
                            position,
                            format!("operator {} is not defined for floats", op.symbol()),
                        ))
                    }
                };
                Ok(Value::Float { value, single })
            }
            _ => Err(self.stop(
                Category::ConstContext,
                position,
                format!("operator {} needs matching numeric operands", op.symbol()),
            )),
        }
    }

    fn compare(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        position: Position,
    ) -> EvalResult<Value> {
        let ordering = match (&lhs, &rhs) {
            (Value::Int { value: a, .. }, Value::Int { value: b, .. }) => a.partial_cmp(b),
            (Value::Float { value: a, .. }, Value::Float { value: b, .. }) => a.partial_cmp(b),
            (Value::Char(a), Value::Char(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.as_str().partial_cmp(b.as_str()),
            (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
            (Value::Null, _) | (_, Value::Null) => None,
            _ => None,
        };
        match op {
            BinaryOp::Eq | BinaryOp::Ne => {
                let equal = match ordering {
                    Some(ordering) => ordering == std::cmp::Ordering::Equal,
                    // Null compared against a non-null constant.
                    None => false,
                };
                Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
            }
            _ => match ordering {
                Some(ordering) => Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })),
                None => Err(self.stop(
                    Category::ConstContext,
                    position,
                    "ordered comparison needs matching operands",
                )),
            },
        }
    }

    fn int_arithmetic(
        &mut self,
        op: BinaryOp,
        a: i128,
        b: i128,
        ty: IntType,
        position: Position,
    ) -> EvalResult<Value> {
        let checked = |this: &mut Self, raw: i128| -> EvalResult<Value> {
            if ty.contains(raw) {
                Ok(Value::Int { value: raw, ty })
            } else if ty.signed() {
                Err(this.stop(
                    Category::ConstOverflow,
                    position,
                    format!("signed overflow in {} arithmetic", ty.name()),
                ))
            } else {
                // Unsigned arithmetic wraps, as at runtime.
                Ok(Value::Int {
                    value: ty.wrap(raw),
                    ty,
                })
            }
        };
        match op {
            BinaryOp::Add => checked(self, a + b),
            BinaryOp::Sub => checked(self, a - b),
            BinaryOp::Mul => checked(self, a * b),
            BinaryOp::Div | BinaryOp::Rem => {
                if b == 0 {
                    return Err(self.stop(
                        Category::ConstDivZero,
                        position,
                        "division by zero in constant evaluation",
                    ));
                }
                let raw = if op == BinaryOp::Div { a / b } else { a % b };
                checked(self, raw)
            }
            BinaryOp::AddWrap => Ok(Value::Int {
                value: ty.wrap(a + b),
                ty,
            }),
            BinaryOp::SubWrap => Ok(Value::Int {
                value: ty.wrap(a - b),
                ty,
            }),
            BinaryOp::MulWrap => Ok(Value::Int {
                value: ty.wrap(a * b),
                ty,
            }),
            BinaryOp::AddSat => Ok(Value::Int {
                value: (a + b).clamp(ty.min(), ty.max()),
                ty,
            }),
            BinaryOp::SubSat => Ok(Value::Int {
                value: (a - b).clamp(ty.min(), ty.max()),
                ty,
            }),
            BinaryOp::MulSat => Ok(Value::Int {
                value: (a * b).clamp(ty.min(), ty.max()),
                ty,
            }),
            BinaryOp::Shl | BinaryOp::Shr => {
                if b < 0 || b >= i128::from(ty.bits()) {
                    return Err(self.stop(
                        Category::ConstShift,
                        position,
                        format!(
                            "shift amount {} is outside [0, {}) for {}",
                            b,
                            ty.bits(),
                            ty.name()
                        ),
                    ));
                }
                let raw = if op == BinaryOp::Shl { a << b } else { a >> b };
                Ok(Value::Int {
                    value: ty.wrap(raw),
                    ty,
                })
            }
            BinaryOp::BitAnd => Ok(Value::Int { value: a & b, ty }),
            BinaryOp::BitOr => Ok(Value::Int { value: a | b, ty }),
            BinaryOp::BitXor => Ok(Value::Int { value: a ^ b, ty }),
            _ => Err(self.stop(
                Category::ConstContext,
                position,
                format!("operator {} is not integer arithmetic", op.symbol()),
            )),
        }
    }

    fn cast_value(&mut self, value: Value, target: TypeId, position: Position) -> EvalResult<Value> {
        let target_ty = self.pool.get(target).clone();
        match (&value, &target_ty) {
            (Value::Int { value, .. }, Type::Int(int)) => Ok(Value::Int {
                value: int.wrap(*value),
                ty: *int,
            }),
            (Value::Int { value, .. }, Type::Float(float)) => Ok(Value::Float {
                value: *value as f64,
                single: *float == FloatType::F32,
            }),
            (Value::Float { value, .. }, Type::Int(int)) => {
                let truncated = value.trunc();
                if !truncated.is_finite()
                    || truncated < ty_min_f64(*int)
                    || truncated > ty_max_f64(*int)
                {
                    Err(self.stop(
                        Category::ConstOverflow,
                        position,
                        format!("float value does not fit {}", int.name()),
                    ))
                } else {
                    Ok(Value::Int {
                        value: truncated as i128,
                        ty: *int,
                    })
                }
            }
            (Value::Float { value, .. }, Type::Float(float)) => Ok(Value::Float {
                value: *value,
                single: *float == FloatType::F32,
            }),
            (Value::Char(c), Type::Int(int)) => Ok(Value::Int {
                value: int.wrap(*c as i128),
                ty: *int,
            }),
            (Value::Int { value, .. }, Type::Char) => {
                char::from_u32((*value).clamp(0, u32::MAX as i128) as u32)
                    .map(Value::Char)
                    .ok_or_else(|| {
                        self.stop(
                            Category::ConstOverflow,
                            position,
                            "value is not a valid character",
                        )
                    })
            }
            (Value::Bool(b), Type::Int(int)) => Ok(Value::Int {
                value: i128::from(*b),
                ty: *int,
            }),
            (_, Type::Newtype(nominal)) => {
                let underlying = self.pool.nominal(*nominal).underlying;
                match underlying {
                    Some(underlying) => self.cast_value(value, underlying, position),
                    None => Ok(value),
                }
            }
            (Value::Int { value, .. }, Type::Enum(_)) => Ok(Value::Int {
                value: *value,
                ty: IntType::I32,
            }),
            _ => Err(self.stop(
                Category::ConstContext,
                position,
                "this cast is not available in constant evaluation",
            )),
        }
    }

    // ---- calls ----

    fn eval_call(
        &mut self,
        env: &mut Env,
        e: &Expr,
        callee: &Expr,
        args: &[Expr],
    ) -> EvalResult<Value> {
        let name = match &callee.kind {
            ExprKind::Ident { name, .. } => name.clone(),
            _ => {
                return Err(self.stop(
                    Category::ConstCall,
                    e.position,
                    "only direct calls to const functions are available in constant evaluation",
                ))
            }
        };
        let symbol = self.scopes.lookup(self.scopes.root(), &name);
        let (decl, generic) = match symbol.map(|s| self.scopes.symbol(s).kind.clone()) {
            Some(SymbolKind::Function { decl, generic, .. }) => (decl, generic),
            _ => {
                return Err(self.stop(
                    Category::ResolveUndefined,
                    e.position,
                    format!("undefined function {} in constant expression", name),
                ))
            }
        };
        if generic {
            return Err(self.stop(
                Category::ConstCall,
                e.position,
                format!(
                    "generic function {} cannot be called from a constant expression",
                    name
                ),
            ));
        }
        let function = match &self.unit.decls[decl] {
            Decl::Function(function) => function,
            _ => {
                return Err(self.stop(
                    Category::ConstCall,
                    e.position,
                    "malformed function declaration",
                ))
            }
        };
        if !function
            .attrs
            .intersects(FnAttrs::CONST | FnAttrs::CONSTEVAL)
        {
            return Err(self.stop(
                Category::ConstCall,
                e.position,
                format!("{} is not a const function", name),
            ));
        }
        if function.attrs.contains(FnAttrs::EXTERN) {
            return Err(self.stop(
                Category::ConstIo,
                e.position,
                format!("extern function {} cannot run at compile time", name),
            ));
        }
        let body = match &function.body {
            Some(body) => body.clone(),
            None => {
                return Err(self.stop(
                    Category::ConstCall,
                    e.position,
                    format!("{} has no body available at compile time", name),
                ))
            }
        };
        if args.len() != function.params.len() {
            return Err(self.stop(
                Category::TypeArity,
                e.position,
                format!(
                    "{} expects {} argument(s), got {}",
                    name,
                    function.params.len(),
                    args.len()
                ),
            ));
        }
        if self.depth + 1 > MAX_RECURSION_DEPTH {
            let root = self.root;
            return Err(self.stop(
                Category::ConstLimit,
                root,
                format!(
                    "constant evaluation exceeded the recursion limit ({})",
                    MAX_RECURSION_DEPTH
                ),
            ));
        }

        let param_names: Vec<Name> = function.params.iter().map(|p| p.name.clone()).collect();
        let mut callee_env = Env::default();
        callee_env.push_frame();
        for (param, arg) in param_names.iter().zip(args) {
            let value = self.eval_expr(env, arg)?;
            callee_env.define(param.clone(), value);
        }

        self.depth += 1;
        let flow = self.exec_block(&mut callee_env, &body);
        self.depth -= 1;
        match flow {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::Void),
            Err(Stop::Propagate(value)) => Ok(value),
            Err(Stop::Error) => Err(Stop::Error),
        }
    }

    // ---- statements ----

    fn exec_block(&mut self, env: &mut Env, block: &Block) -> EvalResult<Flow> {
        env.push_frame();
        let mut defers: Vec<&Expr> = Vec::new();
        let mut flow = Flow::Normal;
        for stmt in &block.stmts {
            match self.exec_stmt(env, stmt, &mut defers) {
                Ok(Flow::Normal) => {}
                Ok(other) => {
                    flow = other;
                    break;
                }
                Err(stop) => {
                    env.pop_frame();
                    return Err(stop);
                }
            }
        }
        // Scope teardown: the defer stack unwinds in reverse registration
        // order on every exit path.
        for defer in defers.iter().rev() {
            self.eval_expr(env, defer)?;
        }
        env.pop_frame();
        Ok(flow)
    }

    fn exec_stmt<'s>(
        &mut self,
        env: &mut Env,
        stmt: &'s Stmt,
        defers: &mut Vec<&'s Expr>,
    ) -> EvalResult<Flow> {
        self.step(stmt.position)?;
        match &stmt.kind {
            StmtKind::Empty => Ok(Flow::Normal),
            StmtKind::Expr(e) => {
                self.eval_expr(env, e)?;
                Ok(Flow::Normal)
            }
            StmtKind::Local(local) => {
                if let Some(init) = &local.init {
                    let value = self.eval_expr(env, init)?;
                    env.define(local.name.clone(), value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Block(block) => self.exec_block(env, block),
            StmtKind::If {
                cond,
                then,
                else_branch,
            } => {
                let taken = self.eval_expr(env, cond)?.truthy().ok_or_else(|| {
                    self.stop(
                        Category::ConstContext,
                        cond.position,
                        "if condition must be a boolean constant",
                    )
                })?;
                if taken {
                    self.exec_block(env, then)
                } else if let Some(else_branch) = else_branch {
                    self.exec_stmt(env, else_branch, defers)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::IfConst {
                cond,
                then,
                else_branch,
                taken,
            } => {
                let taken = match taken {
                    Some(taken) => *taken,
                    None => self.eval_expr(env, cond)?.truthy().ok_or_else(|| {
                        self.stop(
                            Category::ConstContext,
                            cond.position,
                            "if const condition must be a boolean constant",
                        )
                    })?,
                };
                if taken {
                    self.exec_block(env, then)
                } else if let Some(else_branch) = else_branch {
                    self.exec_stmt(env, else_branch, defers)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While { label, cond, body } => {
                let mut iterations = 0u64;
                loop {
                    let go = self.eval_expr(env, cond)?.truthy().ok_or_else(|| {
                        self.stop(
                            Category::ConstContext,
                            cond.position,
                            "while condition must be a boolean constant",
                        )
                    })?;
                    if !go {
                        break Ok(Flow::Normal);
                    }
                    iterations += 1;
                    if iterations > MAX_LOOP_ITERATIONS {
                        let root = self.root;
                        break Err(self.stop(
                            Category::ConstLimit,
                            root,
                            format!(
                                "loop exceeded {} iterations in constant evaluation",
                                MAX_LOOP_ITERATIONS
                            ),
                        ));
                    }
                    match self.exec_block(env, body)? {
                        Flow::Normal => {}
                        Flow::Continue(target)
                            if target.is_none() || target == *label => {}
                        Flow::Break(target) if target.is_none() || target == *label => {
                            break Ok(Flow::Normal)
                        }
                        other => break Ok(other),
                    }
                }
            }
            StmtKind::For {
                label,
                init,
                cond,
                step,
                body,
            } => {
                env.push_frame();
                let result = (|| {
                    if let Some(init) = init {
                        let mut ignored = Vec::new();
                        match self.exec_stmt(env, init, &mut ignored)? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    let mut iterations = 0u64;
                    loop {
                        if let Some(cond) = cond {
                            let go = self.eval_expr(env, cond)?.truthy().ok_or_else(|| {
                                self.stop(
                                    Category::ConstContext,
                                    cond.position,
                                    "for condition must be a boolean constant",
                                )
                            })?;
                            if !go {
                                break Ok(Flow::Normal);
                            }
                        }
                        iterations += 1;
                        if iterations > MAX_LOOP_ITERATIONS {
                            let root = self.root;
                            break Err(self.stop(
                                Category::ConstLimit,
                                root,
                                format!(
                                    "loop exceeded {} iterations in constant evaluation",
                                    MAX_LOOP_ITERATIONS
                                ),
                            ));
                        }
                        match self.exec_block(env, body)? {
                            Flow::Normal => {}
                            Flow::Continue(target)
                                if target.is_none() || target == *label => {}
                            Flow::Break(target)
                                if target.is_none() || target == *label =>
                            {
                                break Ok(Flow::Normal)
                            }
                            other => break Ok(other),
                        }
                        if let Some(step) = step {
                            self.eval_expr(env, step)?;
                        }
                    }
                })();
                env.pop_frame();
                result
            }
            StmtKind::Match { scrutinee, arms } => {
                let value = self.eval_expr(env, scrutinee)?;
                self.exec_match(env, &value, arms)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(value) => self.eval_expr(env, value)?,
                    None => Value::Void,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break(label) => Ok(Flow::Break(label.clone())),
            StmtKind::Continue(label) => Ok(Flow::Continue(label.clone())),
            StmtKind::Defer(e) => {
                defers.push(e);
                Ok(Flow::Normal)
            }
            StmtKind::StaticAssert { cond, message } => {
                let value = self.eval_expr(env, cond)?.truthy().ok_or_else(|| {
                    self.stop(
                        Category::ConstContext,
                        cond.position,
                        "static_assert condition must be a boolean constant",
                    )
                })?;
                if !value {
                    let text = message
                        .as_ref()
                        .map(|m| format!(": {}", m))
                        .unwrap_or_default();
                    return Err(self.stop(
                        Category::SemaStaticAssert,
                        stmt.position,
                        format!("static assertion failed{}", text),
                    ));
                }
                Ok(Flow::Normal)
            }
            StmtKind::Unsafe { .. } => Err(self.stop(
                Category::ConstContext,
                stmt.position,
                "unsafe blocks are not available in constant evaluation",
            )),
            StmtKind::Region(region) => Err(self.stop(
                Category::ConstContext,
                region.position,
                "regions are not available in constant evaluation",
            )),
        }
    }

    fn exec_match(
        &mut self,
        env: &mut Env,
        value: &Value,
        arms: &[MatchArm],
    ) -> EvalResult<Flow> {
        for arm in arms {
            let (matched, binding) = self.pattern_matches(env, value, &arm.pattern)?;
            if !matched {
                continue;
            }
            env.push_frame();
            if let (Pattern::Variant {
                binding: Some(name),
                ..
            }, Some(payload)) = (&arm.pattern, binding)
            {
                env.define(name.clone(), payload);
            }
            let mut defers = Vec::new();
            let mut flow = Flow::Normal;
            for stmt in &arm.body {
                match self.exec_stmt(env, stmt, &mut defers) {
                    Ok(Flow::Normal) => {}
                    Ok(other) => {
                        flow = other;
                        break;
                    }
                    Err(stop) => {
                        env.pop_frame();
                        return Err(stop);
                    }
                }
            }
            for defer in defers.iter().rev() {
                self.eval_expr(env, defer)?;
            }
            env.pop_frame();
            return Ok(flow);
        }
        Ok(Flow::Normal)
    }

    fn pattern_matches(
        &mut self,
        env: &mut Env,
        value: &Value,
        pattern: &Pattern,
    ) -> EvalResult<(bool, Option<Value>)> {
        match pattern {
            Pattern::Default => Ok((true, None)),
            Pattern::Variant { name, .. } => match value {
                Value::Union { tag, payload, .. } => Ok((
                    tag == name,
                    payload.as_ref().map(|p| (**p).clone()),
                )),
                _ => Ok((false, None)),
            },
            Pattern::Range { lo, hi } => {
                let value = match value.as_int() {
                    Some(value) => value,
                    None => return Ok((false, None)),
                };
                let lo = self.eval_expr(env, lo)?.as_int();
                let hi = self.eval_expr(env, hi)?.as_int();
                match (lo, hi) {
                    (Some(lo), Some(hi)) => Ok((lo <= value && value <= hi, None)),
                    _ => Ok((false, None)),
                }
            }
            Pattern::Expr(e) => {
                let expected = self.eval_expr(env, e)?;
                Ok((expected == *value, None))
            }
        }
    }

    // ---- lvalues ----

    fn assign_lvalue(&mut self, env: &mut Env, lvalue: &Expr, value: Value) -> EvalResult<()> {
        enum Seg {
            Field(Name),
            Index(usize),
        }
        let mut path = Vec::new();
        let mut cursor = lvalue;
        let root = loop {
            match &cursor.kind {
                ExprKind::Ident { name, .. } => break name.clone(),
                ExprKind::Field { base, name, .. } => {
                    path.push(Seg::Field(name.clone()));
                    cursor = base;
                }
                ExprKind::Index { base, index } => {
                    let i = self.eval_expr(env, index)?.as_int().ok_or_else(|| {
                        self.stop(
                            Category::ConstContext,
                            index.position,
                            "array index must be an integer",
                        )
                    })?;
                    path.push(Seg::Index(i.max(0) as usize));
                    cursor = base;
                }
                _ => {
                    return Err(self.stop(
                        Category::ConstContext,
                        lvalue.position,
                        "this location cannot be assigned in constant evaluation",
                    ))
                }
            }
        };
        path.reverse();

        if path.is_empty() {
            env.assign(root, value);
            return Ok(());
        }
        let position = lvalue.position;
        let Some(mut slot) = env.get_mut(&root) else {
            return Err(self.stop(
                Category::ConstContext,
                position,
                "assignment to a non-local in constant evaluation",
            ));
        };
        for seg in &path {
            match seg {
                Seg::Field(name) => {
                    slot = match slot {
                        Value::Struct { fields, .. } => {
                            match fields.iter_mut().find(|(f, _)| f == name) {
                                Some((_, value)) => value,
                                None => {
                                    return Err(Stop::Error);
                                }
                            }
                        }
                        _ => return Err(Stop::Error),
                    };
                }
                Seg::Index(i) => {
                    slot = match slot {
                        Value::Array(elements) => match elements.get_mut(*i) {
                            Some(value) => value,
                            None => return Err(Stop::Error),
                        },
                        _ => return Err(Stop::Error),
                    };
                }
            }
        }
        *slot = value;
        Ok(())
    }

    // ---- types in const contexts ----

    fn resolve_type_expr(&mut self, ty: &TypeExpr, position: Position) -> EvalResult<TypeId> {
        match ty {
            TypeExpr::Named(name) => {
                if let Some(id) = primitive_by_name(self.pool, name.as_str()) {
                    return Ok(id);
                }
                match self
                    .scopes
                    .lookup(self.scopes.root(), name)
                    .map(|s| self.scopes.symbol(s).kind.clone())
                {
                    Some(SymbolKind::Type { ty }) => Ok(ty),
                    _ => Err(self.stop(
                        Category::ResolveUndefined,
                        position,
                        format!("undefined type {} in constant expression", name),
                    )),
                }
            }
            TypeExpr::Pointer { pointee, mutable } => {
                let pointee = self.resolve_type_expr(pointee, position)?;
                Ok(self.pool.intern(Type::Pointer {
                    pointee,
                    mutable: *mutable,
                }))
            }
            TypeExpr::Reference {
                pointee,
                region,
                mutable,
                nullable,
            } => {
                let pointee = self.resolve_type_expr(pointee, position)?;
                Ok(self.pool.intern(Type::Reference {
                    pointee,
                    region: region.clone(),
                    mutable: *mutable,
                    nullable: *nullable,
                }))
            }
            TypeExpr::Array { element, length } => {
                let element = self.resolve_type_expr(element, position)?;
                let length = self.eval_array_length(length).ok_or(Stop::Error)?;
                Ok(self.pool.intern(Type::Array { element, length }))
            }
            TypeExpr::Slice { element } => {
                let element = self.resolve_type_expr(element, position)?;
                Ok(self.pool.intern(Type::Slice { element }))
            }
            TypeExpr::Tuple(elements) => {
                let mut ids = Vec::with_capacity(elements.len());
                for element in elements {
                    ids.push(self.resolve_type_expr(element, position)?);
                }
                Ok(self.pool.intern(Type::Tuple(ids)))
            }
            TypeExpr::Typeof(e) => e.ty.ok_or_else(|| {
                self.stop(
                    Category::ConstContext,
                    position,
                    "typeof is not resolved in this constant context",
                )
            }),
            TypeExpr::Generic { name, .. } => Err(self.stop(
                Category::ConstContext,
                position,
                format!(
                    "generic type {} cannot appear in this constant expression",
                    name
                ),
            )),
        }
    }

    fn layout_of_type_expr(
        &mut self,
        ty: &TypeExpr,
        position: Position,
    ) -> EvalResult<crate::types::Layout> {
        let id = self.resolve_type_expr(ty, position)?;
        self.pool.layout_of(id).ok_or_else(|| {
            self.stop(
                Category::ConstContext,
                position,
                "this type has no size",
            )
        })
    }
}

fn ty_min_f64(ty: IntType) -> f64 {
    ty.min() as f64
}

fn ty_max_f64(ty: IntType) -> f64 {
    ty.max() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexing::Tokens;
    use crate::parsing::Parser;
    use crate::source::{FileId, Source};

    struct Fixture {
        pool: TypePool,
        scopes: ScopeTree,
        unit: Unit,
        diagnostics: Diagnostics,
        budget: Budget,
        consts: HashMap<SymbolId, Value>,
    }

    /// Parse declarations and register function symbols by hand: the
    /// evaluator resolves names through the root scope exactly as the
    /// analyzer installs them.
    fn fixture(text: &str) -> Fixture {
        let mut diagnostics = Diagnostics::new();
        let tokens = Tokens::lex(Source::from_text(FileId(0), text), &mut diagnostics);
        let unit = Parser::new(tokens, &mut diagnostics).parse_unit();
        assert!(!diagnostics.has_errors(), "fixture failed to parse");
        let mut pool = TypePool::new();
        let mut scopes = ScopeTree::new();
        let int = pool.int(IntType::I32);
        for (index, decl) in unit.decls.iter().enumerate() {
            match decl {
                Decl::Function(f) => {
                    let ty = pool.intern(Type::Function(crate::types::FnSig {
                        params: vec![int; f.params.len()],
                        ret: int,
                        variadic: false,
                        convention: Default::default(),
                        pure_fn: false,
                        noreturn: false,
                    }));
                    let root = scopes.root();
                    scopes
                        .define(
                            root,
                            crate::sema::scope::Symbol {
                                name: f.name.clone(),
                                kind: SymbolKind::Function {
                                    decl: index,
                                    ty,
                                    generic: !f.generics.is_empty(),
                                },
                                position: f.position,
                                depth: 0,
                                used: false,
                            },
                        )
                        .unwrap();
                }
                Decl::Global(g) => {
                    let root = scopes.root();
                    scopes
                        .define(
                            root,
                            crate::sema::scope::Symbol {
                                name: g.name.clone(),
                                kind: SymbolKind::Variable {
                                    ty: int,
                                    mutable: false,
                                    storage: crate::sema::scope::Storage::Const,
                                    decl: Some(index),
                                    demoted_region: None,
                                },
                                position: g.position,
                                depth: 0,
                                used: false,
                            },
                        )
                        .unwrap();
                }
                _ => {}
            }
        }
        Fixture {
            pool,
            scopes,
            unit,
            diagnostics,
            budget: Budget::default(),
            consts: HashMap::new(),
        }
    }

    fn eval_global(fixture: &mut Fixture, name: &str) -> Result<Value, ()> {
        let symbol = fixture
            .scopes
            .lookup(fixture.scopes.root(), &Name::from(name))
            .expect("global not found");
        let decl = match fixture.scopes.symbol(symbol).kind {
            SymbolKind::Variable { decl: Some(decl), .. } => decl,
            _ => panic!("not a const global"),
        };
        let init = match &fixture.unit.decls[decl] {
            Decl::Global(g) => g.init.clone().unwrap(),
            _ => unreachable!(),
        };
        let mut evaluator = Evaluator::new(
            &mut fixture.pool,
            &fixture.scopes,
            &fixture.unit,
            &mut fixture.diagnostics,
            &mut fixture.budget,
            &mut fixture.consts,
        );
        evaluator.eval(&init)
    }

    #[test]
    fn factorial_evaluates_to_3628800() {
        let mut fixture = fixture(
            "const int factorial(int n) {\n\
               if (n <= 1) { return 1; }\n\
               return n * factorial(n - 1);\n\
             }\n\
             const int F = factorial(10);\n",
        );
        let value = eval_global(&mut fixture, "F").unwrap();
        assert_eq!(
            value,
            Value::Int {
                value: 3_628_800,
                ty: IntType::I32
            }
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let text = "const int f(int n) {\n\
                      int acc = 0;\n\
                      for (int i = 0; i < n; i = i + 1) { acc = acc + i * i; }\n\
                      return acc;\n\
                    }\n\
                    const int V = f(100);\n";
        let mut first = fixture(text);
        let mut second = fixture(text);
        assert_eq!(
            eval_global(&mut first, "V").unwrap(),
            eval_global(&mut second, "V").unwrap()
        );
    }

    #[test]
    fn signed_overflow_is_a_hard_error() {
        let mut fixture = fixture("const int X = 2147483647 + 1;\n");
        assert!(eval_global(&mut fixture, "X").is_err());
        assert!(fixture
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ConstOverflow));
    }

    #[test]
    fn wrapping_operator_wraps_instead() {
        let mut fixture = fixture("const int X = 2147483647 +| 1;\n");
        assert_eq!(
            eval_global(&mut fixture, "X").unwrap(),
            Value::Int {
                value: -2_147_483_648,
                ty: IntType::I32
            }
        );
    }

    #[test]
    fn saturating_operator_clamps() {
        let mut fixture = fixture("const int X = 2147483647 +% 1;\n");
        assert_eq!(
            eval_global(&mut fixture, "X").unwrap(),
            Value::Int {
                value: 2_147_483_647,
                ty: IntType::I32
            }
        );
    }

    #[test]
    fn division_by_zero_and_bad_shift_are_errors() {
        let mut fixture1 = fixture("const int X = 1 / 0;\n");
        assert!(eval_global(&mut fixture1, "X").is_err());
        assert!(fixture1
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ConstDivZero));

        let mut fixture2 = fixture("const int Y = 1 << 32;\n");
        assert!(eval_global(&mut fixture2, "Y").is_err());
        assert!(fixture2
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ConstShift));
    }

    #[test]
    fn recursion_limit_is_enforced() {
        let mut fixture = fixture(
            "const int forever(int n) { return forever(n + 1); }\n\
             const int X = forever(0);\n",
        );
        assert!(eval_global(&mut fixture, "X").is_err());
        assert!(fixture
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ConstLimit));
    }

    #[test]
    fn non_const_callee_is_rejected() {
        let mut fixture = fixture(
            "int runtime_only(int n) { return n; }\n\
             const int X = runtime_only(1);\n",
        );
        assert!(eval_global(&mut fixture, "X").is_err());
        assert!(fixture
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ConstCall));
    }

    #[test]
    fn cyclic_constants_are_detected() {
        let mut fixture = fixture("const int A = B;\nconst int B = A;\n");
        assert!(eval_global(&mut fixture, "A").is_err());
        assert!(fixture
            .diagnostics
            .iter()
            .any(|d| d.category == Category::ResolveCycle));
    }

    #[test]
    fn defers_unwind_in_reverse_on_every_exit() {
        let mut fixture = fixture(
            "const int tally(int stop_early) {\n\
               int acc = 0;\n\
               {\n\
                 defer acc = acc * 10;\n\
                 defer acc = acc + 1;\n\
                 acc = 2;\n\
               }\n\
               return acc;\n\
             }\n\
             const int X = tally(0);\n",
        );
        // acc = 2, then +1 (last defer first), then *10.
        assert_eq!(
            eval_global(&mut fixture, "X").unwrap(),
            Value::Int {
                value: 30,
                ty: IntType::I32
            }
        );
    }
}
