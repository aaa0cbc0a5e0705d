//! # SafeC Monomorphization
//!
//! Generics compile by specialization only: every call to a generic function
//! produces a concrete clone keyed by (symbol, type-argument tuple,
//! value-argument tuple). The analyzer queues the key the first time a call
//! site needs it; this pass drains the queue, clones the template with the
//! parameters substituted, appends the clone to the translation unit, and
//! semantic-checks it exactly once. Instantiations discovered while checking
//! an instantiation simply join the queue; the depth cap shared with
//! const-eval keeps specialization loops from diverging.
//!
//! Variadic type packs expand to a flattened parameter list, and
//! `sizeof...(T)` is rewritten to the pack's length during substitution.

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::parsing::nodes::*;
use crate::sema::scope::SymbolKind;
use crate::sema::{Analyzer, PendingInst};
use crate::source::Position;
use crate::types::{Type, TypeId, TypePool};

/// Drain the analyzer's instantiation queue to a fixed point.
pub fn run(unit: &mut Unit, analyzer: &mut Analyzer) {
    while let Some(pending) = analyzer.pending.pop() {
        instantiate(unit, analyzer, pending);
    }
}

fn instantiate(unit: &mut Unit, analyzer: &mut Analyzer, pending: PendingInst) {
    let template = match &unit.decls[pending.decl] {
        Decl::Function(template) => template.clone(),
        _ => return,
    };

    // Rebuild the substitution from the declaration order the analyzer used
    // to build the key.
    let mut type_map: HashMap<Name, TypeExpr> = HashMap::new();
    let mut value_map: HashMap<Name, i128> = HashMap::new();
    let mut pack_name: Option<Name> = None;
    let mut type_args = pending.type_args.iter();
    let mut value_args = pending.value_args.iter();
    for generic in &template.generics {
        if generic.pack {
            pack_name = Some(generic.name.clone());
        } else if generic.value_type.is_some() {
            if let Some(&value) = value_args.next() {
                value_map.insert(generic.name.clone(), value);
            }
        } else if let Some(&ty) = type_args.next() {
            type_map.insert(generic.name.clone(), type_expr_of(analyzer.pool, ty));
        }
    }
    let pack_types: Vec<TypeExpr> = pending
        .pack_args
        .iter()
        .map(|&ty| type_expr_of(analyzer.pool, ty))
        .collect();

    let mut function = template.clone();
    function.name = pending.mangled.clone();
    function.generics = Vec::new();
    function.symbol = Some(pending.symbol);

    let mut params = Vec::new();
    for param in &template.params {
        if param.pack {
            for (i, ty) in pack_types.iter().enumerate() {
                params.push(Param {
                    name: Name::from(format!("{}{}", param.name, i)),
                    ty: ty.clone(),
                    pack: false,
                    position: param.position,
                    symbol: None,
                });
            }
        } else {
            params.push(Param {
                name: param.name.clone(),
                ty: substitute_type(&param.ty, &type_map),
                pack: false,
                position: param.position,
                symbol: None,
            });
        }
    }
    function.params = params;
    function.return_type = substitute_type(&template.return_type, &type_map);
    let pack_len = pending.pack_args.len() as u128;
    if let Some(body) = &mut function.body {
        substitute_block(body, &type_map, &value_map, pack_name.as_ref(), pack_len);
    }

    let index = unit.decls.len();
    unit.decls.push(Decl::Function(function));
    if let SymbolKind::Function { decl, .. } =
        &mut analyzer.scopes.symbol_mut(pending.symbol).kind
    {
        *decl = index;
    }

    // Each specialization is semantic-checked exactly once, here.
    let saved_depth = analyzer.mono_depth;
    analyzer.mono_depth = pending.depth;
    analyzer.check_function_at(unit, index);
    analyzer.mono_depth = saved_depth;
}

/// Render a concrete type back into surface syntax so the cloned template
/// resolves it through the ordinary path. Nominal types resolve by name;
/// instantiated generic structs were registered under their mangled names.
pub fn type_expr_of(pool: &TypePool, ty: TypeId) -> TypeExpr {
    match pool.get(ty).clone() {
        Type::Void => TypeExpr::Named(Name::from("void")),
        Type::Bool => TypeExpr::Named(Name::from("bool")),
        Type::Char => TypeExpr::Named(Name::from("char")),
        Type::Error => TypeExpr::Named(Name::from("void")),
        Type::Int(int) => TypeExpr::Named(Name::from(int.name())),
        Type::Float(float) => TypeExpr::Named(Name::from(float.name())),
        Type::Pointer { pointee, mutable } => TypeExpr::Pointer {
            pointee: Box::new(type_expr_of(pool, pointee)),
            mutable,
        },
        Type::Reference {
            pointee,
            region,
            mutable,
            nullable,
        } => TypeExpr::Reference {
            pointee: Box::new(type_expr_of(pool, pointee)),
            region,
            mutable,
            nullable,
        },
        Type::Array { element, length } => TypeExpr::Array {
            element: Box::new(type_expr_of(pool, element)),
            length: Box::new(Expr::new(
                ExprKind::IntLit {
                    value: length as u128,
                    suffix: None,
                },
                Position::default(),
            )),
        },
        Type::Slice { element } => TypeExpr::Slice {
            element: Box::new(type_expr_of(pool, element)),
        },
        Type::Tuple(elements) => TypeExpr::Tuple(
            elements
                .into_iter()
                .map(|element| type_expr_of(pool, element))
                .collect(),
        ),
        Type::Struct(n) | Type::Union(n) | Type::TaggedUnion(n) | Type::Enum(n)
        | Type::Newtype(n) => TypeExpr::Named(pool.nominal(n).name.clone()),
        Type::Function(_) | Type::GenericParam { .. } => {
            TypeExpr::Named(Name::from("void"))
        }
    }
}

fn substitute_type(ty: &TypeExpr, type_map: &HashMap<Name, TypeExpr>) -> TypeExpr {
    match ty {
        TypeExpr::Named(name) => match type_map.get(name) {
            Some(replacement) => replacement.clone(),
            None => ty.clone(),
        },
        TypeExpr::Generic { name, args } => TypeExpr::Generic {
            name: name.clone(),
            args: args
                .iter()
                .map(|arg| substitute_type(arg, type_map))
                .collect(),
        },
        TypeExpr::Pointer { pointee, mutable } => TypeExpr::Pointer {
            pointee: Box::new(substitute_type(pointee, type_map)),
            mutable: *mutable,
        },
        TypeExpr::Reference {
            pointee,
            region,
            mutable,
            nullable,
        } => TypeExpr::Reference {
            pointee: Box::new(substitute_type(pointee, type_map)),
            region: region.clone(),
            mutable: *mutable,
            nullable: *nullable,
        },
        TypeExpr::Array { element, length } => TypeExpr::Array {
            element: Box::new(substitute_type(element, type_map)),
            length: length.clone(),
        },
        TypeExpr::Slice { element } => TypeExpr::Slice {
            element: Box::new(substitute_type(element, type_map)),
        },
        TypeExpr::Tuple(elements) => TypeExpr::Tuple(
            elements
                .iter()
                .map(|element| substitute_type(element, type_map))
                .collect(),
        ),
        TypeExpr::Typeof(expr) => TypeExpr::Typeof(expr.clone()),
    }
}

fn substitute_block(
    block: &mut Block,
    type_map: &HashMap<Name, TypeExpr>,
    value_map: &HashMap<Name, i128>,
    pack: Option<&Name>,
    pack_len: u128,
) {
    for stmt in &mut block.stmts {
        substitute_stmt(stmt, type_map, value_map, pack, pack_len);
    }
}

fn substitute_stmt(
    stmt: &mut Stmt,
    type_map: &HashMap<Name, TypeExpr>,
    value_map: &HashMap<Name, i128>,
    pack: Option<&Name>,
    pack_len: u128,
) {
    let mut on_expr = |e: &mut Expr| substitute_expr(e, type_map, value_map, pack, pack_len);
    match &mut stmt.kind {
        StmtKind::Empty | StmtKind::Break(_) | StmtKind::Continue(_) => {}
        StmtKind::Expr(e) | StmtKind::Defer(e) => on_expr(e),
        StmtKind::Local(local) => {
            local.ty = substitute_type(&local.ty, type_map);
            if let Some(init) = &mut local.init {
                on_expr(init);
            }
        }
        StmtKind::Block(block) | StmtKind::Unsafe { body: block, .. } => {
            substitute_block(block, type_map, value_map, pack, pack_len)
        }
        StmtKind::If {
            cond,
            then,
            else_branch,
        }
        | StmtKind::IfConst {
            cond,
            then,
            else_branch,
            ..
        } => {
            on_expr(cond);
            substitute_block(then, type_map, value_map, pack, pack_len);
            if let Some(else_branch) = else_branch {
                substitute_stmt(else_branch, type_map, value_map, pack, pack_len);
            }
        }
        StmtKind::While { cond, body, .. } => {
            on_expr(cond);
            substitute_block(body, type_map, value_map, pack, pack_len);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
            ..
        } => {
            if let Some(init) = init {
                substitute_stmt(init, type_map, value_map, pack, pack_len);
            }
            if let Some(cond) = cond {
                on_expr(cond);
            }
            if let Some(step) = step {
                on_expr(step);
            }
            substitute_block(body, type_map, value_map, pack, pack_len);
        }
        StmtKind::Match { scrutinee, arms } => {
            on_expr(scrutinee);
            for arm in arms {
                match &mut arm.pattern {
                    Pattern::Range { lo, hi } => {
                        substitute_expr(lo, type_map, value_map, pack, pack_len);
                        substitute_expr(hi, type_map, value_map, pack, pack_len);
                    }
                    Pattern::Expr(e) => {
                        substitute_expr(e, type_map, value_map, pack, pack_len)
                    }
                    Pattern::Variant { .. } | Pattern::Default => {}
                }
                for stmt in &mut arm.body {
                    substitute_stmt(stmt, type_map, value_map, pack, pack_len);
                }
            }
        }
        StmtKind::Return(value) => {
            if let Some(value) = value {
                on_expr(value);
            }
        }
        StmtKind::Region(region) => on_expr(&mut region.capacity),
        StmtKind::StaticAssert { cond, .. } => on_expr(cond),
    }
}

fn substitute_expr(
    e: &mut Expr,
    type_map: &HashMap<Name, TypeExpr>,
    value_map: &HashMap<Name, i128>,
    pack: Option<&Name>,
    pack_len: u128,
) {
    // Value parameters and pack lengths rewrite the node itself.
    match &e.kind {
        ExprKind::Ident { name, .. } => {
            if let Some(&value) = value_map.get(name) {
                e.kind = ExprKind::IntLit {
                    value: value as u128,
                    suffix: None,
                };
                return;
            }
        }
        ExprKind::SizeofPack(name) => {
            if pack == Some(name) {
                e.kind = ExprKind::IntLit {
                    value: pack_len,
                    suffix: None,
                };
                return;
            }
        }
        _ => {}
    }
    let mut recurse = |e: &mut Expr| substitute_expr(e, type_map, value_map, pack, pack_len);
    match &mut e.kind {
        ExprKind::IntLit { .. }
        | ExprKind::FloatLit { .. }
        | ExprKind::StrLit(_)
        | ExprKind::CharLit(_)
        | ExprKind::BoolLit(_)
        | ExprKind::NullLit
        | ExprKind::Ident { .. }
        | ExprKind::SizeofPack(_)
        | ExprKind::Asm(_) => {}
        ExprKind::Unary { operand, .. }
        | ExprKind::Try(operand)
        | ExprKind::Spawn(operand)
        | ExprKind::VolatileLoad(operand) => recurse(operand),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Assign { lhs, rhs, .. } => {
            recurse(lhs);
            recurse(rhs);
        }
        ExprKind::Call {
            callee,
            generic_args,
            args,
        } => {
            recurse(callee);
            for arg in generic_args {
                match arg {
                    GenericArg::Type(ty) => *ty = substitute_type(ty, type_map),
                    GenericArg::Value(value) => {
                        substitute_expr(value, type_map, value_map, pack, pack_len)
                    }
                }
            }
            for arg in args {
                substitute_expr(arg, type_map, value_map, pack, pack_len);
            }
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            recurse(receiver);
            for arg in args {
                substitute_expr(arg, type_map, value_map, pack, pack_len);
            }
        }
        ExprKind::Field { base, .. } => recurse(base),
        ExprKind::Index { base, index } => {
            recurse(base);
            recurse(index);
        }
        ExprKind::Range { lo, hi } => {
            recurse(lo);
            recurse(hi);
        }
        ExprKind::Cast { ty, operand } => {
            *ty = substitute_type(ty, type_map);
            recurse(operand);
        }
        ExprKind::Sizeof(ty) | ExprKind::Alignof(ty) | ExprKind::Fieldcount(ty) => {
            *ty = substitute_type(ty, type_map);
        }
        ExprKind::New { ty, init, .. } => {
            *ty = substitute_type(ty, type_map);
            if let Some(init) = init {
                substitute_expr(init, type_map, value_map, pack, pack_len);
            }
        }
        ExprKind::Closure { params, body } => {
            for param in params {
                param.ty = substitute_type(&param.ty, type_map);
            }
            recurse(body);
        }
        ExprKind::VolatileStore { pointer, value } => {
            recurse(pointer);
            recurse(value);
        }
        ExprKind::InitList(elements) | ExprKind::Tuple(elements) => {
            for element in elements {
                substitute_expr(element, type_map, value_map, pack, pack_len);
            }
        }
    }
}
