//! # SafeC Semantic Analysis
//!
//! Two sub-passes over one translation unit. Sub-pass 1 collects top-level
//! declarations: nominal types (with forward references), regions, globals,
//! and function signatures, stitching `Struct::method` definitions to the
//! signatures declared in struct bodies. Sub-pass 2 analyzes each function
//! body in declaration order, maintaining the scope chain, the definite-
//! initialization set, the alias graph, the lexical unsafe flag, the defer
//! stack, and the flow-sensitive nullability map.
//!
//! The analyzer mutates the AST in place: expression types, resolved symbol
//! links, bounds-check requests, and `if const` selections. It reports as
//! many independent errors as it can; an error that invalidates local state
//! stops the current function body but never cancels analysis of another.

pub mod borrows;
pub mod flow;
pub mod scope;

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::consteval::{Budget, Evaluator, Value};
use crate::diagnostics::{Category, Diagnostics};
use crate::parsing::nodes::*;
use crate::source::Position;
use crate::types::{
    primitive_by_name, Assignable, Constraint, Enumerator, Field, FnSig, IntType, NominalDef,
    NominalId, NominalKind, Region, Type, TypeId, TypePool, Variant,
};

use borrows::{Borrow, BorrowKind, BorrowLog};
use flow::{FlowState, SparseSet};
use if_chain::if_chain;
use itertools::Itertools;
use scope::{ScopeFlags, ScopeId, ScopeTree, Storage, Symbol, SymbolId, SymbolKind};

/// A requested monomorphization, queued by call checking and drained by the
/// monomorphizer.
#[derive(Clone, Debug)]
pub struct PendingInst {
    pub decl: usize,
    pub type_args: Vec<TypeId>,
    pub value_args: Vec<i128>,
    pub pack_args: Vec<TypeId>,
    pub mangled: Name,
    pub symbol: SymbolId,
    pub position: Position,
    pub depth: u32,
}

#[derive(Clone, Debug)]
struct MethodSlot {
    symbol: SymbolId,
    declared_at: Position,
    decl: Option<usize>,
}

/// Where a reference variable's storage came from, for escape checking.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RefOrigin {
    /// Borrowed from a local or parameter slot of this function.
    Frame,
    /// Came in from the caller or from longer-lived storage.
    Outside,
}

struct FunCtx {
    return_type: TypeId,
    flow: FlowState,
    borrows: BorrowLog,
    point: u32,
    labels: Vec<Name>,
    loop_depth: u32,
    ever_init: SparseSet,
    is_pure: bool,
    is_const: bool,
    locals: Vec<SymbolId>,
    last_borrow: Option<usize>,
    ref_origins: HashMap<SymbolId, RefOrigin>,
    /// Scope depths of enclosing closure bodies, innermost last; idents
    /// resolving below the innermost entry are captures.
    closure_roots: Vec<u32>,
}

impl FunCtx {
    fn new(return_type: TypeId, is_pure: bool, is_const: bool) -> Self {
        Self {
            return_type,
            flow: FlowState::new(),
            borrows: BorrowLog::new(),
            point: 0,
            labels: Vec::new(),
            loop_depth: 0,
            ever_init: SparseSet::new(),
            is_pure,
            is_const,
            locals: Vec::new(),
            last_borrow: None,
            ref_origins: HashMap::new(),
            closure_roots: Vec::new(),
        }
    }
}

/// The result handed to lowering.
pub struct Analysis {
    pub scopes: ScopeTree,
    pub consts: HashMap<SymbolId, Value>,
    /// Mangled names of every distinct instantiation, in creation order.
    pub instantiations: Vec<Name>,
}

impl Analysis {
    /// Look up an evaluated const global by name; test scaffolding for the
    /// compile-time properties.
    pub fn const_value(&self, name: &str) -> Option<&Value> {
        let symbol = self.scopes.lookup(self.scopes.root(), &Name::from(name))?;
        self.consts.get(&symbol)
    }
}

pub struct Analyzer<'a> {
    pub pool: &'a mut TypePool,
    pub diagnostics: &'a mut Diagnostics,
    pub scopes: ScopeTree,
    pub budget: Budget,
    pub consts: HashMap<SymbolId, Value>,
    methods: HashMap<(NominalId, Name), MethodSlot>,
    struct_cache: HashMap<(usize, Vec<TypeId>), TypeId>,
    pub inst_cache: HashMap<(usize, Vec<TypeId>, Vec<i128>), SymbolId>,
    pub pending: Vec<PendingInst>,
    pub instantiation_order: Vec<Name>,
    pub mono_depth: u32,
    current_scope: ScopeId,
    fun: Option<FunCtx>,
}

impl<'a> Analyzer<'a> {
    pub fn new(pool: &'a mut TypePool, diagnostics: &'a mut Diagnostics) -> Self {
        let scopes = ScopeTree::new();
        let current_scope = scopes.root();
        Self {
            pool,
            diagnostics,
            scopes,
            budget: Budget::default(),
            consts: HashMap::new(),
            methods: HashMap::new(),
            struct_cache: HashMap::new(),
            inst_cache: HashMap::new(),
            pending: Vec::new(),
            instantiation_order: Vec::new(),
            mono_depth: 0,
            current_scope,
            fun: None,
        }
    }

    pub fn finish(self) -> Analysis {
        Analysis {
            scopes: self.scopes,
            consts: self.consts,
            instantiations: self.instantiation_order,
        }
    }

    fn error(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.diagnostics.error(category, position, message);
    }

    fn warning(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.diagnostics.warning(category, position, message);
    }

    fn display(&self, ty: TypeId) -> String {
        self.pool.display(ty)
    }

    // ---- const evaluation hooks ----

    /// Evaluate a const context, reporting failures.
    fn eval_const(&mut self, unit: &Unit, expr: &Expr) -> Option<Value> {
        let mut evaluator = Evaluator::new(
            &mut *self.pool,
            &self.scopes,
            unit,
            &mut *self.diagnostics,
            &mut self.budget,
            &mut self.consts,
        );
        evaluator.eval(expr).ok()
    }

    /// Evaluate quietly; `None` simply means "not a constant".
    fn try_eval_int(&mut self, unit: &Unit, expr: &Expr) -> Option<i128> {
        let mut scratch = Diagnostics::new();
        let mut evaluator = Evaluator::new(
            &mut *self.pool,
            &self.scopes,
            unit,
            &mut scratch,
            &mut self.budget,
            &mut self.consts,
        );
        let value = evaluator.eval(expr).ok()?;
        if scratch.has_errors() {
            return None;
        }
        value.as_int()
    }

    fn eval_array_length(&mut self, unit: &Unit, expr: &Expr) -> Option<u64> {
        let mut evaluator = Evaluator::new(
            &mut *self.pool,
            &self.scopes,
            unit,
            &mut *self.diagnostics,
            &mut self.budget,
            &mut self.consts,
        );
        evaluator.eval_array_length(expr)
    }

    // ---- type resolution ----

    pub fn resolve_type(&mut self, unit: &Unit, scope: ScopeId, ty: &TypeExpr) -> TypeId {
        match ty {
            TypeExpr::Named(name) => {
                if let Some(id) = primitive_by_name(self.pool, name.as_str()) {
                    return id;
                }
                match self
                    .scopes
                    .lookup(scope, name)
                    .map(|s| self.scopes.symbol(s).kind.clone())
                {
                    Some(SymbolKind::Type { ty }) => ty,
                    Some(SymbolKind::GenericType { .. }) => {
                        self.error(
                            Category::TypeArity,
                            Position::default(),
                            format!("generic type {} needs type arguments", name),
                        );
                        self.pool.error()
                    }
                    _ => {
                        self.error(
                            Category::ResolveUndefined,
                            Position::default(),
                            format!("undefined type {}", name),
                        );
                        self.pool.error()
                    }
                }
            }
            TypeExpr::Generic { name, args } => {
                let decl = match self
                    .scopes
                    .lookup(scope, name)
                    .map(|s| self.scopes.symbol(s).kind.clone())
                {
                    Some(SymbolKind::GenericType { decl }) => decl,
                    _ => {
                        self.error(
                            Category::ResolveUndefined,
                            Position::default(),
                            format!("undefined generic type {}", name),
                        );
                        return self.pool.error();
                    }
                };
                let arg_ids: Vec<TypeId> = args
                    .iter()
                    .map(|arg| self.resolve_type(unit, scope, arg))
                    .collect();
                self.instantiate_struct(unit, decl, arg_ids)
            }
            TypeExpr::Pointer { pointee, mutable } => {
                let pointee = self.resolve_type(unit, scope, pointee);
                self.pool.intern(Type::Pointer {
                    pointee,
                    mutable: *mutable,
                })
            }
            TypeExpr::Reference {
                pointee,
                region,
                mutable,
                nullable,
            } => {
                if let Region::Arena(name) = region {
                    let defined = matches!(
                        self.scopes
                            .lookup(scope, name)
                            .map(|s| &self.scopes.symbol(s).kind),
                        Some(SymbolKind::Region { .. })
                    );
                    if !defined {
                        self.error(
                            Category::ResolveUndefined,
                            Position::default(),
                            format!("undefined region {}", name),
                        );
                    }
                }
                let pointee = self.resolve_type(unit, scope, pointee);
                self.pool.intern(Type::Reference {
                    pointee,
                    region: region.clone(),
                    mutable: *mutable,
                    nullable: *nullable,
                })
            }
            TypeExpr::Array { element, length } => {
                let element = self.resolve_type(unit, scope, element);
                match self.eval_array_length(unit, length) {
                    Some(length) => self.pool.intern(Type::Array { element, length }),
                    None => self.pool.error(),
                }
            }
            TypeExpr::Slice { element } => {
                let element = self.resolve_type(unit, scope, element);
                self.pool.intern(Type::Slice { element })
            }
            TypeExpr::Tuple(elements) => {
                let ids: Vec<TypeId> = elements
                    .iter()
                    .map(|element| self.resolve_type(unit, scope, element))
                    .collect();
                self.pool.intern(Type::Tuple(ids))
            }
            TypeExpr::Typeof(expr) => {
                let mut probe = expr.as_ref().clone();
                self.check_expr(unit, &mut probe, None)
            }
        }
    }

    /// Instantiate a generic struct for concrete type arguments, cached by
    /// (declaration, argument tuple).
    fn instantiate_struct(&mut self, unit: &Unit, decl: usize, args: Vec<TypeId>) -> TypeId {
        if let Some(&ty) = self.struct_cache.get(&(decl, args.clone())) {
            return ty;
        }
        let template = match &unit.decls[decl] {
            Decl::Struct(template) => template.clone(),
            _ => return self.pool.error(),
        };
        if template.generics.len() != args.len() {
            self.error(
                Category::TypeArity,
                template.position,
                format!(
                    "{} expects {} type argument(s), got {}",
                    template.name,
                    template.generics.len(),
                    args.len()
                ),
            );
            return self.pool.error();
        }
        let mangled = Name::from(format!(
            "{}<{}>",
            template.name,
            args.iter().map(|&a| self.display(a)).join(", ")
        ));
        let mut def = NominalDef::new(mangled.clone(), NominalKind::Struct);
        def.packed = template.packed;
        let (nominal, ty) = self.pool.declare_nominal(def);
        self.struct_cache.insert((decl, args.clone()), ty);
        // Monomorphized code refers to the instantiation by its rendered
        // name, so it must resolve like any other nominal.
        let _ = self.scopes.define(
            self.scopes.root(),
            Symbol {
                name: mangled,
                kind: SymbolKind::Type { ty },
                position: template.position,
                depth: 0,
                used: true,
            },
        );

        // Bind the parameters in a child scope and resolve the fields there.
        let scope = self.scopes.push(self.scopes.root(), ScopeFlags::empty());
        for (param, &arg) in template.generics.iter().zip(&args) {
            let _ = self.scopes.define(
                scope,
                Symbol {
                    name: param.name.clone(),
                    kind: SymbolKind::Type { ty: arg },
                    position: param.position,
                    depth: self.scopes.depth(scope),
                    used: false,
                },
            );
        }
        let fields: Vec<Field> = template
            .fields
            .iter()
            .map(|field| Field {
                name: field.name.clone(),
                ty: self.resolve_type(unit, scope, &field.ty),
                offset: 0,
            })
            .collect();
        self.pool.nominal_mut(nominal).fields = fields;
        ty
    }

    // ---- sub-pass 1: declaration collection ----

    pub fn collect(&mut self, unit: &mut Unit) {
        self.collect_nominal_shells(unit);
        self.collect_regions(unit);
        self.collect_globals(unit);
        self.collect_nominal_bodies(unit);
        self.collect_struct_methods(unit);
        self.collect_functions(unit);
    }

    fn define_root(&mut self, symbol: Symbol) -> Option<SymbolId> {
        let position = symbol.position;
        let name = symbol.name.clone();
        match self.scopes.define(self.scopes.root(), symbol) {
            Ok(id) => Some(id),
            Err(existing) => {
                let previous = self.scopes.symbol(existing).position;
                self.error(
                    Category::ResolveDuplicate,
                    position,
                    format!(
                        "{} is already declared at {}:{}",
                        name, previous.line, previous.column
                    ),
                );
                None
            }
        }
    }

    fn collect_nominal_shells(&mut self, unit: &mut Unit) {
        for decl in unit.decls.iter_mut() {
            match decl {
                Decl::Struct(s) if s.generics.is_empty() => {
                    let kind = if s.is_union {
                        NominalKind::Union
                    } else {
                        NominalKind::Struct
                    };
                    let mut def = NominalDef::new(s.name.clone(), kind);
                    def.packed = s.packed;
                    let (nominal, ty) = self.pool.declare_nominal(def);
                    s.nominal = Some(nominal);
                    self.define_root(Symbol {
                        name: s.name.clone(),
                        kind: SymbolKind::Type { ty },
                        position: s.position,
                        depth: 0,
                        used: false,
                    });
                }
                Decl::Tagged(t) => {
                    let def = NominalDef::new(t.name.clone(), NominalKind::TaggedUnion);
                    let (nominal, ty) = self.pool.declare_nominal(def);
                    t.nominal = Some(nominal);
                    self.define_root(Symbol {
                        name: t.name.clone(),
                        kind: SymbolKind::Type { ty },
                        position: t.position,
                        depth: 0,
                        used: false,
                    });
                }
                Decl::Enum(e) => {
                    let def = NominalDef::new(e.name.clone(), NominalKind::Enum);
                    let (nominal, ty) = self.pool.declare_nominal(def);
                    e.nominal = Some(nominal);
                    self.define_root(Symbol {
                        name: e.name.clone(),
                        kind: SymbolKind::Type { ty },
                        position: e.position,
                        depth: 0,
                        used: false,
                    });
                }
                Decl::Newtype(n) => {
                    let def = NominalDef::new(n.name.clone(), NominalKind::Newtype);
                    let (nominal, ty) = self.pool.declare_nominal(def);
                    n.nominal = Some(nominal);
                    self.define_root(Symbol {
                        name: n.name.clone(),
                        kind: SymbolKind::Type { ty },
                        position: n.position,
                        depth: 0,
                        used: false,
                    });
                }
                _ => {}
            }
        }
        // Generic struct templates are registered after concrete nominals so
        // their fields can mention any of them.
        for (index, decl) in unit.decls.iter().enumerate() {
            if let Decl::Struct(s) = decl {
                if !s.generics.is_empty() {
                    self.define_root(Symbol {
                        name: s.name.clone(),
                        kind: SymbolKind::GenericType { decl: index },
                        position: s.position,
                        depth: 0,
                        used: false,
                    });
                }
            }
        }
    }

    fn collect_regions(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            let region = match &unit.decls[index] {
                Decl::Region(region) => region.clone(),
                _ => continue,
            };
            let capacity = self
                .try_eval_int(&*unit, &region.capacity)
                .filter(|&v| v >= 0)
                .map(|v| v as u64);
            let capacity = match capacity {
                Some(capacity) => capacity,
                None => {
                    self.error(
                        Category::ConstContext,
                        region.position,
                        format!("region {} needs a constant byte capacity", region.name),
                    );
                    0
                }
            };
            let symbol = self.define_root(Symbol {
                name: region.name.clone(),
                kind: SymbolKind::Region { capacity, depth: 0 },
                position: region.position,
                depth: 0,
                used: false,
            });
            if let Decl::Region(region) = &mut unit.decls[index] {
                region.symbol = symbol;
            }
        }
    }

    fn collect_globals(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            let (ty_expr, name, is_const, position) = match &unit.decls[index] {
                Decl::Global(g) => (g.ty.clone(), g.name.clone(), g.is_const, g.position),
                _ => continue,
            };
            let root = self.scopes.root();
            let ty = self.resolve_type(&*unit, root, &ty_expr);
            let symbol = self.define_root(Symbol {
                name,
                kind: SymbolKind::Variable {
                    ty,
                    mutable: !is_const,
                    storage: if is_const {
                        Storage::Const
                    } else {
                        Storage::Static
                    },
                    decl: Some(index),
                    demoted_region: None,
                },
                position,
                depth: 0,
                used: false,
            });
            if let Decl::Global(g) = &mut unit.decls[index] {
                g.symbol = symbol;
            }
        }
    }

    fn collect_nominal_bodies(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            match unit.decls[index].clone() {
                Decl::Struct(s) if s.generics.is_empty() => {
                    let nominal = match s.nominal {
                        Some(nominal) => nominal,
                        None => continue,
                    };
                    let root = self.scopes.root();
                    let fields: Vec<Field> = s
                        .fields
                        .iter()
                        .map(|field| Field {
                            name: field.name.clone(),
                            ty: self.resolve_type(&*unit, root, &field.ty),
                            offset: 0,
                        })
                        .collect();
                    let any_error = fields.iter().any(|f| self.pool.is_error(f.ty));
                    self.pool.nominal_mut(nominal).fields = fields;
                    let ty = self.pool.intern(match s.is_union {
                        true => Type::Union(nominal),
                        false => Type::Struct(nominal),
                    });
                    if !any_error
                        && !s.fields.is_empty()
                        && self.pool.layout_of(ty).is_none()
                    {
                        self.error(
                            Category::ResolveCycle,
                            s.position,
                            format!("{} contains itself by value", s.name),
                        );
                    }
                }
                Decl::Tagged(t) => {
                    let nominal = match t.nominal {
                        Some(nominal) => nominal,
                        None => continue,
                    };
                    let root = self.scopes.root();
                    let variants: Vec<Variant> = t
                        .variants
                        .iter()
                        .enumerate()
                        .map(|(i, variant)| Variant {
                            name: variant.name.clone(),
                            payload: variant
                                .payload
                                .as_ref()
                                .map(|p| self.resolve_type(&*unit, root, p)),
                            discriminant: i as u64,
                        })
                        .collect();
                    self.pool.nominal_mut(nominal).variants = variants;
                }
                Decl::Enum(e) => {
                    let nominal = match e.nominal {
                        Some(nominal) => nominal,
                        None => continue,
                    };
                    let root = self.scopes.root();
                    let underlying = match &e.underlying {
                        Some(u) => self.resolve_type(&*unit, root, u),
                        None => self.pool.int(IntType::I32),
                    };
                    let int = match self.pool.get(underlying) {
                        Type::Int(int) => *int,
                        _ => {
                            self.error(
                                Category::TypeMismatch,
                                e.position,
                                "enum underlying type must be an integer type",
                            );
                            IntType::I32
                        }
                    };
                    self.pool.nominal_mut(nominal).underlying = Some(underlying);
                    let enum_ty = self.pool.intern(Type::Enum(nominal));
                    let mut next = 0i128;
                    let mut enumerators = Vec::with_capacity(e.enumerators.len());
                    for enumerator in &e.enumerators {
                        let value = match &enumerator.value {
                            Some(expr) => {
                                let mut probe = expr.clone();
                                let _ = self.check_expr(&*unit, &mut probe, None);
                                self.eval_const(&*unit, &probe)
                                    .and_then(|v| v.as_int())
                                    .unwrap_or(next)
                            }
                            None => next,
                        };
                        if !int.contains(value) {
                            self.error(
                                Category::ConstOverflow,
                                enumerator.position,
                                format!(
                                    "enumerator {} does not fit {}",
                                    enumerator.name,
                                    int.name()
                                ),
                            );
                        }
                        next = value + 1;
                        enumerators.push(Enumerator {
                            name: enumerator.name.clone(),
                            value,
                        });
                        self.define_root(Symbol {
                            name: enumerator.name.clone(),
                            kind: SymbolKind::Enumerator {
                                value,
                                ty: enum_ty,
                            },
                            position: enumerator.position,
                            depth: 0,
                            used: false,
                        });
                    }
                    self.pool.nominal_mut(nominal).enumerators = enumerators;
                }
                Decl::Newtype(n) => {
                    let nominal = match n.nominal {
                        Some(nominal) => nominal,
                        None => continue,
                    };
                    let root = self.scopes.root();
                    let target = self.resolve_type(&*unit, root, &n.target);
                    self.pool.nominal_mut(nominal).underlying = Some(target);
                }
                _ => {}
            }
        }
    }

    fn function_type(
        &mut self,
        unit: &Unit,
        scope: ScopeId,
        f: &FunctionDecl,
    ) -> TypeId {
        let params: Vec<TypeId> = f
            .params
            .iter()
            .map(|p| self.resolve_type(unit, scope, &p.ty))
            .collect();
        let ret = self.resolve_type(unit, scope, &f.return_type);
        self.pool.intern(Type::Function(FnSig {
            params,
            ret,
            variadic: f.attrs.contains(FnAttrs::VARIADIC),
            convention: f.convention,
            pure_fn: f.attrs.contains(FnAttrs::PURE),
            noreturn: f.attrs.contains(FnAttrs::NORETURN),
        }))
    }

    fn collect_struct_methods(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            let s = match &unit.decls[index] {
                Decl::Struct(s) if s.generics.is_empty() => s.clone(),
                _ => continue,
            };
            let nominal = match s.nominal {
                Some(nominal) => nominal,
                None => continue,
            };
            for method in &s.methods {
                let root = self.scopes.root();
                let ty = self.function_type(&*unit, root, method);
                let symbol = self.scopes.add_detached(Symbol {
                    name: method.name.clone(),
                    kind: SymbolKind::Function {
                        decl: usize::MAX,
                        ty,
                        generic: false,
                    },
                    position: method.position,
                    depth: 0,
                    used: false,
                });
                if self
                    .methods
                    .insert(
                        (nominal, method.name.clone()),
                        MethodSlot {
                            symbol,
                            declared_at: method.position,
                            decl: None,
                        },
                    )
                    .is_some()
                {
                    self.error(
                        Category::ResolveDuplicate,
                        method.position,
                        format!("duplicate method {} on {}", method.name, s.name),
                    );
                }
            }
        }
    }

    fn collect_functions(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            let f = match &unit.decls[index] {
                Decl::Function(f) => f.clone(),
                _ => continue,
            };
            let generic = !f.generics.is_empty();

            match &f.owner {
                None => {
                    let ty = if generic {
                        // Resolve in a scope where the generic parameters
                        // exist as opaque types.
                        let scope = self.scopes.push(self.scopes.root(), ScopeFlags::empty());
                        for param in &f.generics {
                            let ty = self.generic_param_type(param);
                            let _ = self.scopes.define(
                                scope,
                                Symbol {
                                    name: param.name.clone(),
                                    kind: SymbolKind::Type { ty },
                                    position: param.position,
                                    depth: self.scopes.depth(scope),
                                    used: false,
                                },
                            );
                        }
                        self.function_type(&*unit, scope, &f)
                    } else {
                        let root = self.scopes.root();
                        self.function_type(&*unit, root, &f)
                    };
                    let symbol = self.define_root(Symbol {
                        name: f.name.clone(),
                        kind: SymbolKind::Function {
                            decl: index,
                            ty,
                            generic,
                        },
                        position: f.position,
                        depth: 0,
                        used: false,
                    });
                    if let Decl::Function(f) = &mut unit.decls[index] {
                        f.symbol = symbol;
                    }
                }
                Some(owner) => {
                    // `Struct::method`: stitch to the declared signature.
                    let nominal = match self
                        .scopes
                        .lookup(self.scopes.root(), owner)
                        .map(|s| self.scopes.symbol(s).kind.clone())
                    {
                        Some(SymbolKind::Type { ty }) => match self.pool.get(ty) {
                            Type::Struct(n) | Type::Union(n) => Some(*n),
                            _ => None,
                        },
                        _ => None,
                    };
                    let Some(nominal) = nominal else {
                        self.error(
                            Category::ResolveUndefined,
                            f.position,
                            format!("{} is not a struct with methods", owner),
                        );
                        continue;
                    };
                    let root = self.scopes.root();
                    let ty = self.function_type(&*unit, root, &f);
                    match self.methods.get(&(nominal, f.name.clone())) {
                        Some(slot) => {
                            let declared = match &self.scopes.symbol(slot.symbol).kind {
                                SymbolKind::Function { ty, .. } => *ty,
                                _ => ty,
                            };
                            let declared_at = slot.declared_at;
                            let symbol = slot.symbol;
                            if declared != ty {
                                self.error(
                                    Category::TypeMismatch,
                                    f.position,
                                    format!(
                                        "signature of {}::{} does not match the declaration \
                                         at {}:{}",
                                        owner, f.name, declared_at.line, declared_at.column
                                    ),
                                );
                            }
                            if let Some(slot) = self.methods.get_mut(&(nominal, f.name.clone())) {
                                slot.decl = Some(index);
                            }
                            if let SymbolKind::Function { decl, .. } =
                                &mut self.scopes.symbol_mut(symbol).kind
                            {
                                *decl = index;
                            }
                            if let Decl::Function(f) = &mut unit.decls[index] {
                                f.symbol = Some(symbol);
                            }
                        }
                        None => {
                            self.error(
                                Category::ResolveUndefined,
                                f.position,
                                format!("{} declares no method named {}", owner, f.name),
                            );
                        }
                    }
                }
            }
        }

        // Methods declared but never defined.
        let missing: Vec<(Position, String)> = self
            .methods
            .values()
            .filter(|slot| slot.decl.is_none())
            .map(|slot| {
                (
                    slot.declared_at,
                    self.scopes.symbol(slot.symbol).name.to_string(),
                )
            })
            .collect();
        for (position, name) in missing {
            self.error(
                Category::ResolveUndefined,
                position,
                format!("method {} is declared but never defined", name),
            );
        }
    }

    fn generic_param_type(&mut self, param: &GenericParam) -> TypeId {
        let constraint = param
            .constraint
            .as_ref()
            .and_then(|c| match Constraint::from_name(c.as_str()) {
                Some(constraint) => Some(constraint),
                None => {
                    self.diagnostics.error(
                        Category::MonoConstraint,
                        param.position,
                        format!("unknown constraint {}", c),
                    );
                    None
                }
            });
        self.pool.intern(Type::GenericParam {
            name: param.name.clone(),
            constraint,
            pack: param.pack,
        })
    }

    // ---- sub-pass 2: bodies ----

    /// Analyze every non-generic function body. Const function bodies go
    /// first so later const contexts can call them with full annotations.
    pub fn check_bodies(&mut self, unit: &mut Unit) {
        let mut order: Vec<usize> = Vec::new();
        for (index, decl) in unit.decls.iter().enumerate() {
            if let Decl::Function(f) = decl {
                if f.body.is_some()
                    && f.generics.is_empty()
                    && f.attrs.intersects(FnAttrs::CONST | FnAttrs::CONSTEVAL)
                {
                    order.push(index);
                }
            }
        }
        for (index, decl) in unit.decls.iter().enumerate() {
            if let Decl::Function(f) = decl {
                if f.body.is_some()
                    && f.generics.is_empty()
                    && !f.attrs.intersects(FnAttrs::CONST | FnAttrs::CONSTEVAL)
                {
                    order.push(index);
                }
            }
        }
        for index in order {
            self.check_function_at(unit, index);
        }
    }

    /// Analyze the body of the function declared at `index`. The body is
    /// detached during analysis so const evaluation can read the rest of the
    /// unit.
    pub fn check_function_at(&mut self, unit: &mut Unit, index: usize) {
        let mut body = match &mut unit.decls[index] {
            Decl::Function(f) if f.body.is_some() => f.body.take().unwrap(),
            _ => return,
        };
        self.check_detached_body(&*unit, index, &mut body);
        if let Decl::Function(f) = &mut unit.decls[index] {
            f.body = Some(body);
        }
    }

    fn check_detached_body(&mut self, unit: &Unit, index: usize, body: &mut Block) {
        let f = match &unit.decls[index] {
            Decl::Function(f) => f.clone(),
            _ => return,
        };
        let root = self.scopes.root();
        let return_type = self.resolve_type(unit, root, &f.return_type);
        let is_const = f.attrs.intersects(FnAttrs::CONST | FnAttrs::CONSTEVAL);

        let mut flags = ScopeFlags::FUNCTION_ROOT;
        if is_const {
            flags |= ScopeFlags::CONST_CONTEXT;
        }
        let scope = self.scopes.push(root, flags);
        let saved_scope = self.current_scope;
        self.current_scope = scope;
        self.fun = Some(FunCtx::new(
            return_type,
            f.attrs.contains(FnAttrs::PURE),
            is_const,
        ));

        // The implicit receiver for methods.
        if let Some(owner) = &f.owner {
            if let Some(SymbolKind::Type { ty }) = self
                .scopes
                .lookup(root, owner)
                .map(|s| self.scopes.symbol(s).kind.clone())
            {
                let self_ty = self.pool.intern(Type::Reference {
                    pointee: ty,
                    region: Region::Stack,
                    mutable: true,
                    nullable: false,
                });
                self.define_param(Name::from("self"), self_ty, f.position);
            }
        }
        for param in &f.params {
            let ty = self.resolve_type(unit, scope, &param.ty);
            self.define_param(param.name.clone(), ty, param.position);
        }

        self.check_stmts(unit, &mut body.stmts);

        self.finish_function(&f);
        self.current_scope = saved_scope;
    }

    fn define_param(&mut self, name: Name, ty: TypeId, position: Position) {
        let depth = self.scopes.depth(self.current_scope);
        let result = self.scopes.define(
            self.current_scope,
            Symbol {
                name: name.clone(),
                kind: SymbolKind::Variable {
                    ty,
                    mutable: true,
                    storage: Storage::Param,
                    decl: None,
                    demoted_region: None,
                },
                position,
                depth,
                used: false,
            },
        );
        match result {
            Ok(symbol) => {
                if let Some(fun) = &mut self.fun {
                    fun.flow.init.insert(symbol);
                }
            }
            Err(_) => {
                self.error(
                    Category::ResolveDuplicate,
                    position,
                    format!("duplicate parameter {}", name),
                );
            }
        }
    }

    fn finish_function(&mut self, _f: &FunctionDecl) {
        let Some(fun) = self.fun.take() else { return };

        // Alias-graph verdicts: at most one exclusive borrow, or any number
        // of shared borrows, per storage location.
        for (first, second) in fun.borrows.conflicts() {
            let target = self.scopes.symbol(first.target).name.clone();
            let kind = |k: BorrowKind| match k {
                BorrowKind::Exclusive => "exclusive",
                BorrowKind::Shared => "shared",
            };
            self.error(
                Category::AliasExclusive,
                second.position,
                format!(
                    "conflicting borrows of {}: {} borrow at {}:{} overlaps {} borrow at {}:{}",
                    target,
                    kind(first.kind),
                    first.position.line,
                    first.position.column,
                    kind(second.kind),
                    second.position.line,
                    second.position.column,
                ),
            );
        }

        for symbol in fun.locals {
            let s = self.scopes.symbol(symbol);
            if !s.used && !s.name.as_str().starts_with('_') {
                let (name, position) = (s.name.clone(), s.position);
                self.warning(
                    Category::SemaUnused,
                    position,
                    format!("unused variable {}", name),
                );
            }
        }
    }

    fn fun_mut(&mut self) -> Option<&mut FunCtx> {
        self.fun.as_mut()
    }

    fn tick(&mut self) -> u32 {
        match self.fun_mut() {
            Some(fun) => {
                fun.point += 1;
                fun.point
            }
            None => 0,
        }
    }

    fn in_unsafe(&self) -> bool {
        self.scopes.in_unsafe(self.current_scope)
    }

    fn in_const_context(&self) -> bool {
        self.scopes.in_const_context(self.current_scope)
            || self.fun.as_ref().map_or(false, |f| f.is_const)
    }

    // ---- statements ----

    fn check_stmts(&mut self, unit: &Unit, stmts: &mut [Stmt]) {
        for stmt in stmts {
            self.check_stmt(unit, stmt);
        }
    }

    fn check_stmt(&mut self, unit: &Unit, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Empty => {}
            StmtKind::Expr(e) => {
                self.check_expr(unit, e, None);
                self.check_must_use(unit, e);
            }
            StmtKind::Local(local) => self.check_local(unit, local),
            StmtKind::Block(block) => {
                let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
                let saved = self.current_scope;
                self.current_scope = scope;
                self.check_stmts(unit, &mut block.stmts);
                self.current_scope = saved;
            }
            StmtKind::If {
                cond,
                then,
                else_branch,
            } => {
                let bool_ty = self.pool.bool_ty();
                let cond_ty = self.check_expr(unit, cond, Some(bool_ty));
                if self.pool.common_type(cond_ty, bool_ty).is_none() {
                    self.error(
                        Category::TypeMismatch,
                        cond.position,
                        "if condition must be bool",
                    );
                }
                let refinement = self.null_test(cond);
                let entry = self.fun.as_ref().map(|f| f.flow.clone());

                // Then branch, with the non-null refinement if the condition
                // proves it there.
                if let (Some(fun), Some((symbol, proves_in_then))) =
                    (self.fun_mut(), refinement)
                {
                    if proves_in_then {
                        fun.flow.nonnull.insert(symbol);
                    }
                }
                let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
                let saved = self.current_scope;
                self.current_scope = scope;
                self.check_stmts(unit, &mut then.stmts);
                self.current_scope = saved;
                let after_then = self.fun.as_ref().map(|f| f.flow.clone());

                // Else branch from the entry state, with the complementary
                // refinement.
                if let (Some(fun), Some(entry)) = (self.fun_mut(), entry.clone()) {
                    fun.flow = entry;
                }
                if let (Some(fun), Some((symbol, proves_in_then))) =
                    (self.fun_mut(), refinement)
                {
                    if !proves_in_then {
                        fun.flow.nonnull.insert(symbol);
                    }
                }
                if let Some(else_branch) = else_branch {
                    self.check_stmt(unit, else_branch);
                }
                if let (Some(fun), Some(after_then)) = (self.fun_mut(), after_then) {
                    fun.flow.meet(&after_then);
                }
            }
            StmtKind::IfConst {
                cond,
                then,
                else_branch,
                taken,
            } => {
                // The condition is a const context; the dead branch is
                // discarded before any checking happens in it.
                let bool_ty = self.pool.bool_ty();
                self.check_expr(unit, cond, Some(bool_ty));
                let value = self
                    .eval_const(unit, cond)
                    .and_then(|v| v.truthy())
                    .unwrap_or(false);
                *taken = Some(value);
                if value {
                    let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
                    let saved = self.current_scope;
                    self.current_scope = scope;
                    self.check_stmts(unit, &mut then.stmts);
                    self.current_scope = saved;
                } else if let Some(else_branch) = else_branch {
                    self.check_stmt(unit, else_branch);
                }
            }
            StmtKind::While { label, cond, body } => {
                let bool_ty = self.pool.bool_ty();
                let cond_ty = self.check_expr(unit, cond, Some(bool_ty));
                if self.pool.common_type(cond_ty, bool_ty).is_none() {
                    self.error(
                        Category::TypeMismatch,
                        cond.position,
                        "while condition must be bool",
                    );
                }
                self.check_loop_body(unit, label.clone(), body);
            }
            StmtKind::For {
                label,
                init,
                cond,
                step,
                body,
            } => {
                let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
                let saved = self.current_scope;
                self.current_scope = scope;
                if let Some(init) = init {
                    self.check_stmt(unit, init);
                }
                if let Some(cond) = cond {
                    let bool_ty = self.pool.bool_ty();
                    let cond_ty = self.check_expr(unit, cond, Some(bool_ty));
                    if self.pool.common_type(cond_ty, bool_ty).is_none() {
                        self.error(
                            Category::TypeMismatch,
                            cond.position,
                            "for condition must be bool",
                        );
                    }
                }
                if let Some(step) = step {
                    self.check_expr(unit, step, None);
                }
                self.check_loop_body(unit, label.clone(), body);
                self.current_scope = saved;
            }
            StmtKind::Match { scrutinee, arms } => self.check_match(unit, scrutinee, arms),
            StmtKind::Return(value) => self.check_return(unit, stmt.position, value),
            StmtKind::Break(_) | StmtKind::Continue(_) => {
                let is_break = matches!(&stmt.kind, StmtKind::Break(_));
                let label = match &stmt.kind {
                    StmtKind::Break(label) | StmtKind::Continue(label) => label.clone(),
                    _ => None,
                };
                let position = stmt.position;
                let loop_depth = self.fun.as_ref().map(|f| f.loop_depth);
                let label_known = match (&label, self.fun.as_ref()) {
                    (Some(label), Some(fun)) => fun.labels.contains(label),
                    _ => true,
                };
                if loop_depth == Some(0) {
                    let what = if is_break { "break" } else { "continue" };
                    self.error(
                        Category::ResolveUndefined,
                        position,
                        format!("{} outside of a loop", what),
                    );
                } else if !label_known {
                    self.error(
                        Category::ResolveUndefined,
                        position,
                        format!("unknown loop label {}", label.unwrap()),
                    );
                }
                if let Some(fun) = self.fun_mut() {
                    fun.flow.reachable = false;
                }
            }
            StmtKind::Defer(e) => {
                // Registered here, unwound in reverse at every exit of the
                // defining scope; the expression is checked once.
                self.check_expr(unit, e, None);
            }
            StmtKind::Unsafe { escape, body } => {
                let mut flags = ScopeFlags::UNSAFE;
                if *escape {
                    flags |= ScopeFlags::ESCAPE;
                }
                let scope = self.scopes.push(self.current_scope, flags);
                let saved = self.current_scope;
                self.current_scope = scope;
                self.check_stmts(unit, &mut body.stmts);
                self.current_scope = saved;
            }
            StmtKind::Region(region) => {
                let capacity = self
                    .try_eval_int(unit, &region.capacity)
                    .filter(|&v| v >= 0);
                let capacity = match capacity {
                    Some(capacity) => capacity as u64,
                    None => {
                        self.error(
                            Category::ConstContext,
                            region.position,
                            format!("region {} needs a constant byte capacity", region.name),
                        );
                        0
                    }
                };
                let depth = self.scopes.depth(self.current_scope);
                let result = self.scopes.define(
                    self.current_scope,
                    Symbol {
                        name: region.name.clone(),
                        kind: SymbolKind::Region { capacity, depth },
                        position: region.position,
                        depth,
                        used: false,
                    },
                );
                match result {
                    Ok(symbol) => region.symbol = Some(symbol),
                    Err(_) => {
                        self.error(
                            Category::ResolveDuplicate,
                            region.position,
                            format!("region {} is already declared in this scope", region.name),
                        );
                    }
                }
            }
            StmtKind::StaticAssert { cond, message } => {
                let bool_ty = self.pool.bool_ty();
                self.check_expr(unit, cond, Some(bool_ty));
                if let Some(Value::Bool(false)) = self.eval_const(unit, cond) {
                    let text = message
                        .as_ref()
                        .map(|m| format!(": {}", m))
                        .unwrap_or_default();
                    self.error(
                        Category::SemaStaticAssert,
                        stmt.position,
                        format!("static assertion failed{}", text),
                    );
                }
            }
        }
    }

    fn check_loop_body(&mut self, unit: &Unit, label: Option<Name>, body: &mut Block) {
        let entry = self.fun.as_ref().map(|f| f.flow.clone());
        if let Some(fun) = self.fun_mut() {
            fun.loop_depth += 1;
            if let Some(label) = &label {
                fun.labels.push(label.clone());
            }
        }
        let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
        let saved = self.current_scope;
        self.current_scope = scope;
        self.check_stmts(unit, &mut body.stmts);
        self.current_scope = saved;
        if let Some(fun) = self.fun_mut() {
            fun.loop_depth -= 1;
            if label.is_some() {
                fun.labels.pop();
            }
        }
        // The body may run zero times: everything it established is dropped
        // at the join, and anything it moved stays moved.
        if let (Some(fun), Some(entry)) = (self.fun_mut(), entry) {
            let body_moves = fun.flow.moved.clone();
            let mut after = entry;
            after.moved.union_with(&body_moves);
            fun.flow = after;
        }
    }

    fn check_match(&mut self, unit: &Unit, scrutinee: &mut Expr, arms: &mut [MatchArm]) {
        let scrutinee_ty = self.check_expr(unit, scrutinee, None);
        let tagged = match self.pool.get(scrutinee_ty) {
            Type::TaggedUnion(nominal) => Some(*nominal),
            _ => None,
        };
        let is_integerish = matches!(
            self.pool.get(scrutinee_ty),
            Type::Int(_) | Type::Char | Type::Enum(_) | Type::Error
        );

        let entry = self.fun.as_ref().map(|f| f.flow.clone());
        let mut joined: Option<FlowState> = None;
        for arm in arms {
            if let (Some(fun), Some(entry)) = (self.fun_mut(), entry.clone()) {
                fun.flow = entry;
            }
            let scope = self.scopes.push(self.current_scope, ScopeFlags::empty());
            let saved = self.current_scope;
            self.current_scope = scope;
            match &mut arm.pattern {
                Pattern::Default => {}
                Pattern::Variant {
                    name,
                    binding,
                    symbol,
                } => match tagged {
                    Some(nominal) => {
                        let variant = self
                            .pool
                            .nominal(nominal)
                            .variants
                            .iter()
                            .find(|v| &v.name == name)
                            .cloned();
                        match variant {
                            Some(variant) => {
                                if let Some(binding) = binding {
                                    let payload = variant.payload.unwrap_or(self.pool.void());
                                    let depth = self.scopes.depth(self.current_scope);
                                    if let Ok(id) = self.scopes.define(
                                        self.current_scope,
                                        Symbol {
                                            name: binding.clone(),
                                            kind: SymbolKind::Variable {
                                                ty: payload,
                                                mutable: false,
                                                storage: Storage::Local,
                                                decl: None,
                                                demoted_region: None,
                                            },
                                            position: arm.position,
                                            depth,
                                            used: false,
                                        },
                                    ) {
                                        *symbol = Some(id);
                                        if let Some(fun) = self.fun_mut() {
                                            fun.flow.init.insert(id);
                                        }
                                    }
                                }
                            }
                            None => {
                                let name = name.clone();
                                let display = self.display(scrutinee_ty);
                                self.error(
                                    Category::ResolveUndefined,
                                    arm.position,
                                    format!("{} has no variant {}", display, name),
                                );
                            }
                        }
                    }
                    None => {
                        self.error(
                            Category::TypeMismatch,
                            arm.position,
                            "variant patterns need a tagged union scrutinee",
                        );
                    }
                },
                Pattern::Range { lo, hi } => {
                    if !is_integerish {
                        self.error(
                            Category::TypeMismatch,
                            arm.position,
                            "range patterns need an integer scrutinee",
                        );
                    }
                    self.check_expr(unit, lo, Some(scrutinee_ty));
                    self.check_expr(unit, hi, Some(scrutinee_ty));
                }
                Pattern::Expr(e) => {
                    self.check_expr(unit, e, Some(scrutinee_ty));
                }
            }
            self.check_stmts(unit, &mut arm.body);
            self.current_scope = saved;
            if let Some(fun) = self.fun.as_ref() {
                match &mut joined {
                    Some(joined) => joined.meet(&fun.flow),
                    None => joined = Some(fun.flow.clone()),
                }
            }
        }
        if let (Some(fun), Some(joined)) = (self.fun_mut(), joined) {
            fun.flow = joined;
        }
    }

    fn check_return(&mut self, unit: &Unit, position: Position, value: &mut Option<Expr>) {
        let Some(return_type) = self.fun.as_ref().map(|f| f.return_type) else {
            return;
        };
        match value {
            None => {
                if return_type != self.pool.void() && !self.pool.is_error(return_type) {
                    let display = self.display(return_type);
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("return without a value in a function returning {}", display),
                    );
                }
            }
            Some(expr) => {
                let ty = self.check_expr(unit, expr, Some(return_type));
                let mut reported = false;
                match self.pool.assignable(return_type, ty) {
                    Assignable::Yes => {}
                    Assignable::RequiresUnsafe if self.in_unsafe() => {}
                    _ => {
                        reported = true;
                        let got = self.display(ty);
                        let want = self.display(return_type);
                        if self.regions_differ_only(return_type, ty) {
                            self.error(
                                Category::RegionEscape,
                                position,
                                format!("returning {} where {} escapes its region", got, want),
                            );
                        } else {
                            self.error(
                                Category::TypeMismatch,
                                position,
                                format!("returning {} from a function returning {}", got, want),
                            );
                        }
                    }
                }
                if !reported {
                    self.check_reference_escape_on_return(expr, ty, position);
                }
            }
        }
        if let Some(fun) = self.fun_mut() {
            fun.flow.reachable = false;
        }
    }

    fn regions_differ_only(&self, a: TypeId, b: TypeId) -> bool {
        if_chain! {
            if let Type::Reference { pointee: pa, mutable: ma, nullable: na, .. } = self.pool.get(a);
            if let Type::Reference { pointee: pb, mutable: mb, nullable: nb, .. } = self.pool.get(b);
            then { pa == pb && ma == mb && na == nb }
            else { false }
        }
    }

    /// Rules (a) and (c): a `&stack` reference to this frame's storage, or
    /// an `&arena<R>` reference whose region is declared inside this
    /// function, may not leave through `return`.
    fn check_reference_escape_on_return(&mut self, expr: &Expr, ty: TypeId, position: Position) {
        match self.pool.get(ty).clone() {
            Type::Reference {
                region: Region::Stack,
                ..
            } => {
                if self.ref_origin(expr) == Some(RefOrigin::Frame) {
                    self.error(
                        Category::RegionEscape,
                        position,
                        "returning a &stack reference to storage of this function",
                    );
                }
            }
            Type::Reference {
                region: Region::Arena(name),
                ..
            } => {
                let declared_inside = matches!(
                    self.scopes
                        .lookup(self.current_scope, &name)
                        .map(|s| &self.scopes.symbol(s).kind),
                    Some(SymbolKind::Region { depth, .. }) if *depth > 0
                );
                if declared_inside {
                    self.error(
                        Category::RegionEscape,
                        position,
                        format!("returning an &arena<{}> reference above its region", name),
                    );
                }
            }
            _ => {}
        }
    }

    fn ref_origin(&self, expr: &Expr) -> Option<RefOrigin> {
        match &expr.kind {
            ExprKind::Unary {
                op: UnaryOp::AddrOf,
                operand,
            } => match self.lvalue_root(operand) {
                Some(symbol) => {
                    match &self.scopes.symbol(symbol).kind {
                        SymbolKind::Variable { storage, .. } => match storage {
                            Storage::Local | Storage::Param => Some(RefOrigin::Frame),
                            _ => Some(RefOrigin::Outside),
                        },
                        _ => Some(RefOrigin::Outside),
                    }
                }
                None => None,
            },
            ExprKind::Ident { symbol: Some(s), .. } => self
                .fun
                .as_ref()
                .and_then(|f| f.ref_origins.get(s).copied()),
            _ => None,
        }
    }

    fn lvalue_root(&self, expr: &Expr) -> Option<SymbolId> {
        match &expr.kind {
            ExprKind::Ident { symbol, .. } => *symbol,
            ExprKind::Field { base, .. } | ExprKind::Index { base, .. } => self.lvalue_root(base),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.lvalue_root(operand),
            _ => None,
        }
    }

    fn check_local(&mut self, unit: &Unit, local: &mut LocalDecl) {
        let ty = {
            let scope = self.current_scope;
            self.resolve_type(unit, scope, &local.ty)
        };
        let depth = self.scopes.depth(self.current_scope);
        let result = self.scopes.define(
            self.current_scope,
            Symbol {
                name: local.name.clone(),
                kind: SymbolKind::Variable {
                    ty,
                    mutable: !local.is_const,
                    storage: Storage::Local,
                    decl: None,
                    demoted_region: None,
                },
                position: local.position,
                depth,
                used: false,
            },
        );
        let symbol = match result {
            Ok(symbol) => symbol,
            Err(_) => {
                self.error(
                    Category::ResolveDuplicate,
                    local.position,
                    format!("{} is already declared in this scope", local.name),
                );
                return;
            }
        };
        local.symbol = Some(symbol);
        if let Some(fun) = self.fun_mut() {
            fun.locals.push(symbol);
        }

        if let Some(init) = &mut local.init {
            if let Some(fun) = self.fun_mut() {
                fun.last_borrow = None;
            }
            let init_ty = self.check_expr(unit, init, Some(ty));
            let init_position = init.position;
            self.require_assignable(ty, init_ty, Some(&*init), init_position);
            self.track_reference_flow(symbol, ty, init);
            if let Some(fun) = self.fun_mut() {
                fun.flow.init.insert(symbol);
                fun.ever_init.insert(symbol);
            }
            self.check_region_store(unit, symbol, ty, init_ty, init.position);
            if local.is_const {
                if let Some(value) = self.eval_const(unit, init) {
                    self.consts.insert(symbol, value);
                }
            }
        } else if local.is_const {
            self.error(
                Category::ConstContext,
                local.position,
                format!("constant {} needs an initializer", local.name),
            );
        }
    }

    /// Shared bookkeeping for `var = <expr>` flows: borrow holders, null
    /// states, move-outs, and reference origins.
    fn track_reference_flow(&mut self, symbol: SymbolId, lhs_ty: TypeId, rhs: &Expr) {
        let rhs_ty = rhs.ty;
        let rhs_symbol = match &rhs.kind {
            ExprKind::Ident { symbol, .. } => *symbol,
            _ => None,
        };
        let origin = self.ref_origin(rhs);
        let rhs_is_exclusive_ref = rhs_ty.map_or(false, |ty| {
            matches!(
                self.pool.get(ty),
                Type::Reference { mutable: true, .. }
            )
        });
        let lhs_nullable = matches!(
            self.pool.get(lhs_ty),
            Type::Reference { nullable: true, .. }
        );
        let rhs_nonnull_ref = rhs_ty.map_or(false, |ty| {
            matches!(
                self.pool.get(ty),
                Type::Reference {
                    nullable: false,
                    ..
                }
            )
        });
        if let Some(fun) = self.fun_mut() {
            if let Some(borrow) = fun.last_borrow.take() {
                fun.borrows.set_holder(borrow, symbol);
            }
            if let Some(origin) = origin {
                fun.ref_origins.insert(symbol, origin);
            } else {
                fun.ref_origins.remove(&symbol);
            }
            if lhs_nullable {
                if rhs_nonnull_ref {
                    fun.flow.nonnull.insert(symbol);
                } else {
                    fun.flow.nonnull.remove(symbol);
                }
            }
            fun.flow.moved.remove(symbol);
            // Exclusive references are affine: reading one out of a variable
            // moves it.
            if rhs_is_exclusive_ref {
                if let Some(source) = rhs_symbol {
                    fun.flow.moved.insert(source);
                }
            }
        }
    }

    /// Rules (b) and (c) for stores: a `&stack` reference may not be stored
    /// into longer-lived storage, and an `&arena<R>` reference may not be
    /// stored above R's declaration depth. `unsafe escape` legalizes the
    /// store and permanently demotes the target's region.
    fn check_region_store(
        &mut self,
        _unit: &Unit,
        target: SymbolId,
        _target_ty: TypeId,
        value_ty: TypeId,
        position: Position,
    ) {
        let value_region = match self.pool.get(value_ty) {
            Type::Reference { region, .. } => region.clone(),
            _ => return,
        };
        let target_symbol = self.scopes.symbol(target);
        let target_depth = target_symbol.depth;
        let target_is_global = match &target_symbol.kind {
            SymbolKind::Variable { storage, .. } => {
                matches!(storage, Storage::Static | Storage::Const)
            }
            _ => return,
        };

        match value_region {
            Region::Stack if target_is_global => {
                if self.scopes.in_escape(self.current_scope) {
                    if let SymbolKind::Variable { demoted_region, .. } =
                        &mut self.scopes.symbol_mut(target).kind
                    {
                        *demoted_region = Some(Region::Stack);
                    }
                } else {
                    self.error(
                        Category::RegionGlobal,
                        position,
                        "storing a &stack reference in global storage",
                    );
                }
            }
            Region::Arena(name) => {
                let region_depth = match self
                    .scopes
                    .lookup(self.current_scope, &name)
                    .map(|s| self.scopes.symbol(s).kind.clone())
                {
                    Some(SymbolKind::Region { depth, .. }) => depth,
                    _ => return,
                };
                if target_depth < region_depth {
                    if self.scopes.in_escape(self.current_scope) {
                        if let SymbolKind::Variable { demoted_region, .. } =
                            &mut self.scopes.symbol_mut(target).kind
                        {
                            *demoted_region = Some(Region::Arena(name));
                        }
                    } else {
                        self.error(
                            Category::RegionOutlives,
                            position,
                            format!(
                                "storing an &arena<{}> reference where it outlives its region",
                                name
                            ),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn require_assignable(
        &mut self,
        dst: TypeId,
        src: TypeId,
        source: Option<&Expr>,
        position: Position,
    ) {
        match self.pool.assignable(dst, src) {
            Assignable::Yes => {}
            Assignable::RequiresUnsafe => {
                if !self.in_unsafe() {
                    let got = self.display(src);
                    let want = self.display(dst);
                    let category = match self.pool.get(dst) {
                        Type::Pointer { .. } => Category::RegionFfi,
                        _ => Category::UnsafeRawPointer,
                    };
                    self.error(
                        category,
                        position,
                        format!("converting {} to {} requires an unsafe block", got, want),
                    );
                }
            }
            Assignable::No => {
                // Nullable-to-non-null narrows only with a flow-sensitive
                // proof; everything else is a plain mismatch.
                if self.is_null_narrowing(dst, src) {
                    let proved = if_chain! {
                        if let Some(ExprKind::Ident { symbol: Some(s), .. }) =
                            source.map(|e| &e.kind);
                        if let Some(fun) = self.fun.as_ref();
                        then { fun.flow.nonnull.contains(*s) }
                        else { false }
                    };
                    if !proved {
                        self.error(
                            Category::NullNarrow,
                            position,
                            "a nullable reference needs a non-null proof on all paths here",
                        );
                    }
                    return;
                }
                let got = self.display(src);
                let want = self.display(dst);
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("expected {}, found {}", want, got),
                );
            }
        }
    }

    fn is_null_narrowing(&self, dst: TypeId, src: TypeId) -> bool {
        if_chain! {
            if let Type::Reference { pointee: dp, region: dr, mutable: dm, nullable: false } =
                self.pool.get(dst);
            if let Type::Reference { pointee: sp, region: sr, mutable: sm, nullable: true } =
                self.pool.get(src);
            then { dp == sp && dr == sr && dm == sm }
            else { false }
        }
    }

    fn check_must_use(&mut self, unit: &Unit, e: &Expr) {
        if_chain! {
            if let ExprKind::Call { callee, .. } = &e.kind;
            if let ExprKind::Ident { symbol: Some(symbol), .. } = &callee.kind;
            if let SymbolKind::Function { decl, .. } = &self.scopes.symbol(*symbol).kind;
            if *decl != usize::MAX;
            if let Decl::Function(f) = &unit.decls[*decl];
            if f.attrs.contains(FnAttrs::MUST_USE);
            then {
                let name = f.name.clone();
                let position = e.position;
                self.warning(
                    Category::SemaMustUse,
                    position,
                    format!("ignoring the result of {} (must_use)", name),
                );
            }
        }
    }

    fn null_test(&self, cond: &Expr) -> Option<(SymbolId, bool)> {
        if let ExprKind::Binary { op, lhs, rhs } = &cond.kind {
            let (symbol, other) = match (&lhs.kind, &rhs.kind) {
                (ExprKind::Ident { symbol: Some(s), .. }, _) => (*s, rhs),
                (_, ExprKind::Ident { symbol: Some(s), .. }) => (*s, lhs),
                _ => return None,
            };
            if !matches!(other.kind, ExprKind::NullLit) {
                return None;
            }
            match op {
                BinaryOp::Ne => return Some((symbol, true)),
                BinaryOp::Eq => return Some((symbol, false)),
                _ => {}
            }
        }
        None
    }

    // ---- expressions ----

    /// Type an expression bottom-up, resolving identifiers, marking lvalues,
    /// and requesting bounds checks. `expected` only steers literal typing
    /// and address-of mutability; it never introduces implicit conversions.
    pub fn check_expr(&mut self, unit: &Unit, e: &mut Expr, expected: Option<TypeId>) -> TypeId {
        self.tick();
        let position = e.position;
        let (ty, lvalue, bounds_check) = match &mut e.kind {
            ExprKind::IntLit { value, suffix } => {
                let value = *value;
                let int = match suffix {
                    Some(int) => *int,
                    None => match expected.map(|t| self.pool.get(t).clone()) {
                        Some(Type::Int(int)) if value <= i128::MAX as u128
                            && int.contains(value as i128) =>
                        {
                            int
                        }
                        _ => {
                            if value <= i32::MAX as u128 {
                                IntType::I32
                            } else if value <= i64::MAX as u128 {
                                IntType::I64
                            } else {
                                IntType::U64
                            }
                        }
                    },
                };
                if value > i128::MAX as u128 || !int.contains(value as i128) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("integer literal does not fit {}", int.name()),
                    );
                }
                (self.pool.int(int), false, false)
            }
            ExprKind::FloatLit { single, .. } => {
                let float = if *single {
                    crate::types::FloatType::F32
                } else {
                    match expected.map(|t| self.pool.get(t).clone()) {
                        Some(Type::Float(f)) => f,
                        _ => crate::types::FloatType::F64,
                    }
                };
                (self.pool.float(float), false, false)
            }
            ExprKind::StrLit(_) => {
                let char_ty = self.pool.char_ty();
                let ty = self.pool.intern(Type::Reference {
                    pointee: char_ty,
                    region: Region::Static,
                    mutable: false,
                    nullable: false,
                });
                (ty, false, false)
            }
            ExprKind::CharLit(_) => (self.pool.char_ty(), false, false),
            ExprKind::BoolLit(_) => (self.pool.bool_ty(), false, false),
            ExprKind::NullLit => {
                let ty = match expected.map(|t| (t, self.pool.get(t).clone())) {
                    Some((t, Type::Reference { nullable: true, .. }))
                    | Some((t, Type::Pointer { .. })) => t,
                    Some((_, Type::Error)) | None => self.pool.error(),
                    Some(_) => {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "null needs a nullable reference or pointer context",
                        );
                        self.pool.error()
                    }
                };
                (ty, false, false)
            }
            ExprKind::Ident { name, symbol } => {
                let name = name.clone();
                match self.scopes.lookup(self.current_scope, &name) {
                    None => {
                        self.error(
                            Category::ResolveUndefined,
                            position,
                            format!("undefined name {}", name),
                        );
                        (self.pool.error(), false, false)
                    }
                    Some(id) => {
                        *symbol = Some(id);
                        let kind = self.scopes.symbol(id).kind.clone();
                        let depth = self.scopes.symbol(id).depth;
                        match kind {
                            SymbolKind::Variable { ty, storage, .. } => {
                                self.scopes.symbol_mut(id).used = true;
                                let captured = matches!(
                                    storage,
                                    Storage::Local | Storage::Param
                                ) && self
                                    .fun
                                    .as_ref()
                                    .and_then(|f| f.closure_roots.last().copied())
                                    .map_or(false, |root| depth < root);
                                if captured {
                                    self.error(
                                        Category::TypeMismatch,
                                        position,
                                        format!(
                                            "closures cannot capture {}; only zero-capture \
                                             closures are supported",
                                            name
                                        ),
                                    );
                                }
                                if storage == Storage::Local {
                                    let (initialized, ever) =
                                        self.fun.as_ref().map_or((true, true), |f| {
                                            (
                                                f.flow.init.contains(id) || !f.flow.reachable,
                                                f.ever_init.contains(id),
                                            )
                                        });
                                    if !initialized {
                                        let category = if ever {
                                            Category::InitConditional
                                        } else {
                                            Category::InitUseBeforeInit
                                        };
                                        let message = if ever {
                                            format!("{} may not be initialized on every path", name)
                                        } else {
                                            format!("{} is read before initialization", name)
                                        };
                                        self.error(category, position, message);
                                    }
                                }
                                let moved = self
                                    .fun
                                    .as_ref()
                                    .map_or(false, |f| f.flow.moved.contains(id));
                                if moved {
                                    self.error(
                                        Category::AliasMoved,
                                        position,
                                        format!("use of moved value {}", name),
                                    );
                                }
                                if let Some(fun) = self.fun_mut() {
                                    let point = fun.point;
                                    fun.borrows.record_use(id, point);
                                }
                                (ty, true, false)
                            }
                            SymbolKind::Enumerator { ty, .. } => {
                                self.scopes.symbol_mut(id).used = true;
                                (ty, false, false)
                            }
                            SymbolKind::Function { ty, generic, .. } => {
                                self.scopes.symbol_mut(id).used = true;
                                if generic {
                                    self.error(
                                        Category::TypeMismatch,
                                        position,
                                        format!("generic function {} must be called", name),
                                    );
                                    (self.pool.error(), false, false)
                                } else {
                                    (ty, false, false)
                                }
                            }
                            _ => {
                                self.error(
                                    Category::TypeMismatch,
                                    position,
                                    format!("{} is not a value", name),
                                );
                                (self.pool.error(), false, false)
                            }
                        }
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let result = self.check_unary(unit, position, op, operand, expected);
                result
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                let lhs_ty = self.check_expr(unit, lhs, None);
                let rhs_ty = self.check_expr(unit, rhs, Some(lhs_ty));
                let null_involved = matches!(lhs.kind, ExprKind::NullLit)
                    || matches!(rhs.kind, ExprKind::NullLit);
                let ty =
                    self.check_binary(op, lhs_ty, rhs_ty, null_involved, position);
                (ty, false, false)
            }
            ExprKind::Assign { op, lhs, rhs } => {
                let op = *op;
                let ty = self.check_assign(unit, position, op, lhs, rhs);
                (ty, false, false)
            }
            ExprKind::Call {
                callee,
                generic_args,
                args,
            } => {
                let ty = self.check_call(unit, position, callee, generic_args, args);
                (ty, false, false)
            }
            ExprKind::MethodCall {
                receiver,
                method,
                args,
                symbol,
            } => {
                let method = method.clone();
                let ty =
                    self.check_method_call(unit, position, receiver, &method, args, symbol);
                (ty, false, false)
            }
            ExprKind::Field {
                base,
                name,
                through_pointer,
            } => {
                let name = name.clone();
                let through_pointer = *through_pointer;
                let base_ty = self.check_expr(unit, base, None);
                let base_lvalue = base.lvalue;
                let (inner, via_ref) =
                    self.autoderef(base_ty, base, through_pointer, position);
                match self.pool.get(inner).clone() {
                    Type::Struct(nominal) | Type::Union(nominal) => {
                        match self.pool.field_offset(nominal, &name) {
                            Some((_, field_ty)) => (field_ty, base_lvalue || via_ref, false),
                            None => {
                                let display = self.display(inner);
                                self.error(
                                    Category::ResolveUndefined,
                                    position,
                                    format!("{} has no field {}", display, name),
                                );
                                (self.pool.error(), false, false)
                            }
                        }
                    }
                    Type::Tuple(elements) => match name.as_str().parse::<usize>().ok() {
                        Some(i) if i < elements.len() => {
                            (elements[i], base_lvalue || via_ref, false)
                        }
                        _ => {
                            self.error(
                                Category::ResolveUndefined,
                                position,
                                "no such tuple element",
                            );
                            (self.pool.error(), false, false)
                        }
                    },
                    Type::Error => (self.pool.error(), false, false),
                    _ => {
                        let display = self.display(inner);
                        self.error(
                            Category::TypeMismatch,
                            position,
                            format!("{} has no fields", display),
                        );
                        (self.pool.error(), false, false)
                    }
                }
            }
            ExprKind::Index { base, index } => {
                let base_ty = self.check_expr(unit, base, None);
                let base_lvalue = base.lvalue;
                let (inner, via_ref) = self.autoderef(base_ty, base, false, position);
                let element = match self.pool.get(inner).clone() {
                    Type::Array { element, length } => Some((element, Some(length))),
                    Type::Slice { element } => Some((element, None)),
                    Type::Error => None,
                    _ => {
                        let display = self.display(inner);
                        self.error(
                            Category::TypeMismatch,
                            position,
                            format!("{} cannot be indexed", display),
                        );
                        None
                    }
                };
                let (element, length) = match element {
                    Some(pair) => pair,
                    None => (self.pool.error(), None),
                };
                if self.pool.is_error(element) {
                    (element, false, false)
                } else if let ExprKind::Range { lo, hi } = &mut index.kind {
                    let lo_ty = self.check_expr(unit, lo, None);
                    let hi_ty = self.check_expr(unit, hi, None);
                    for (t, pos) in [(lo_ty, lo.position), (hi_ty, hi.position)] {
                        if !self.pool.is_integer(t) && !self.pool.is_error(t) {
                            self.error(
                                Category::TypeMismatch,
                                pos,
                                "slice bounds must be integers",
                            );
                        }
                    }
                    if let (Some(length), Some(hi_value)) =
                        (length, self.try_eval_int(unit, hi))
                    {
                        if hi_value < 0 || hi_value as u64 > length {
                            self.error(
                                Category::TypeBounds,
                                position,
                                format!(
                                    "slice end {} is out of bounds for length {}",
                                    hi_value, length
                                ),
                            );
                        }
                    }
                    let slice = self.pool.intern(Type::Slice { element });
                    index.ty = Some(slice);
                    (slice, false, !self.in_unsafe())
                } else {
                    let index_ty = self.check_expr(unit, index, None);
                    if !self.pool.is_integer(index_ty) && !self.pool.is_error(index_ty) {
                        self.error(
                            Category::TypeMismatch,
                            index.position,
                            "array index must be an integer",
                        );
                    }
                    match (length, self.try_eval_int(unit, index)) {
                        (Some(length), Some(value)) => {
                            if value < 0 || value as u64 >= length {
                                self.error(
                                    Category::TypeBounds,
                                    position,
                                    format!(
                                        "index {} is out of bounds for array of length {}",
                                        value, length
                                    ),
                                );
                            }
                            (element, base_lvalue || via_ref, false)
                        }
                        _ => (element, base_lvalue || via_ref, !self.in_unsafe()),
                    }
                }
            }
            ExprKind::Range { .. } => {
                self.error(
                    Category::TypeMismatch,
                    position,
                    "ranges are only valid in slices and case patterns",
                );
                (self.pool.error(), false, false)
            }
            ExprKind::Cast { ty, operand } => {
                let target = {
                    let scope = self.current_scope;
                    let ty = ty.clone();
                    self.resolve_type(unit, scope, &ty)
                };
                let source = self.check_expr(unit, operand, None);
                self.check_cast(source, target, position);
                (target, false, false)
            }
            ExprKind::Sizeof(ty) => {
                let id = {
                    let scope = self.current_scope;
                    self.resolve_type(unit, scope, ty)
                };
                if self.pool.layout_of(id).is_none() && !self.pool.is_error(id) {
                    let display = self.display(id);
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("sizeof of unsized type {}", display),
                    );
                }
                (self.pool.int(IntType::U64), false, false)
            }
            ExprKind::Alignof(ty) => {
                let id = {
                    let scope = self.current_scope;
                    self.resolve_type(unit, scope, ty)
                };
                if self.pool.layout_of(id).is_none() && !self.pool.is_error(id) {
                    let display = self.display(id);
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("alignof of unsized type {}", display),
                    );
                }
                (self.pool.int(IntType::U64), false, false)
            }
            ExprKind::Fieldcount(ty) => {
                let id = {
                    let scope = self.current_scope;
                    let ty = ty.clone();
                    self.resolve_type(unit, scope, &ty)
                };
                if !matches!(
                    self.pool.get(id),
                    Type::Struct(_) | Type::Union(_) | Type::TaggedUnion(_) | Type::Error
                ) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "fieldcount needs a struct, union, or tagged union",
                    );
                }
                (self.pool.int(IntType::U64), false, false)
            }
            ExprKind::SizeofPack(_) => {
                self.error(
                    Category::TypeMismatch,
                    position,
                    "sizeof... is only valid inside a generic function",
                );
                (self.pool.int(IntType::U64), false, false)
            }
            ExprKind::New { region, ty, init } => {
                let pointee = {
                    let scope = self.current_scope;
                    let ty = ty.clone();
                    self.resolve_type(unit, scope, &ty)
                };
                let reg = match region {
                    None => Region::Heap,
                    Some(name) => {
                        let name = name.clone();
                        match self
                            .scopes
                            .lookup(self.current_scope, &name)
                            .map(|s| self.scopes.symbol(s).kind.clone())
                        {
                            Some(SymbolKind::Region { .. }) => Region::Arena(name),
                            _ => {
                                self.error(
                                    Category::ResolveUndefined,
                                    position,
                                    format!("undefined region {}", name),
                                );
                                Region::Heap
                            }
                        }
                    }
                };
                if let Some(init) = init {
                    let init_ty = self.check_expr(unit, init, Some(pointee));
                    let init_position = init.position;
                    self.require_assignable(pointee, init_ty, Some(&*init), init_position);
                }
                let ty = self.pool.intern(Type::Reference {
                    pointee,
                    region: reg,
                    mutable: true,
                    nullable: false,
                });
                (ty, false, false)
            }
            ExprKind::Try(operand) => {
                let ty = self.check_expr(unit, operand, None);
                (self.check_try(ty, position), false, false)
            }
            ExprKind::Spawn(operand) => {
                if !matches!(operand.kind, ExprKind::Call { .. }) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "spawn needs a function call",
                    );
                }
                self.check_expr(unit, operand, None);
                if self.fun.as_ref().map_or(false, |f| f.is_pure) {
                    self.error(
                        Category::SemaPure,
                        position,
                        "pure functions may not spawn threads",
                    );
                }
                (self.pool.void(), false, false)
            }
            ExprKind::Closure { params, body } => {
                let scope = self
                    .scopes
                    .push(self.current_scope, ScopeFlags::FUNCTION_ROOT);
                let saved = self.current_scope;
                self.current_scope = scope;
                let depth = self.scopes.depth(scope);
                if let Some(fun) = self.fun_mut() {
                    fun.closure_roots.push(depth);
                }
                let mut param_tys = Vec::with_capacity(params.len());
                for param in params.iter() {
                    let ty = {
                        let scope = self.current_scope;
                        self.resolve_type(unit, scope, &param.ty)
                    };
                    self.define_param(param.name.clone(), ty, param.position);
                    param_tys.push(ty);
                }
                let ret = self.check_expr(unit, body, None);
                if let Some(fun) = self.fun_mut() {
                    fun.closure_roots.pop();
                }
                self.current_scope = saved;
                let ty = self.pool.intern(Type::Function(FnSig {
                    params: param_tys,
                    ret,
                    variadic: false,
                    convention: Default::default(),
                    pure_fn: false,
                    noreturn: false,
                }));
                (ty, false, false)
            }
            ExprKind::VolatileLoad(pointer) => {
                let ty = self.check_expr(unit, pointer, None);
                if !self.in_unsafe() {
                    self.error(
                        Category::UnsafeRawPointer,
                        position,
                        "volatile_load requires an unsafe block",
                    );
                }
                match self.pool.get(ty).clone() {
                    Type::Pointer { pointee, .. } => (pointee, false, false),
                    Type::Error => (self.pool.error(), false, false),
                    _ => {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "volatile_load needs a raw pointer",
                        );
                        (self.pool.error(), false, false)
                    }
                }
            }
            ExprKind::VolatileStore { pointer, value } => {
                let pointer_ty = self.check_expr(unit, pointer, None);
                if !self.in_unsafe() {
                    self.error(
                        Category::UnsafeRawPointer,
                        position,
                        "volatile_store requires an unsafe block",
                    );
                }
                let expected_value = match self.pool.get(pointer_ty).clone() {
                    Type::Pointer { pointee, .. } => Some(pointee),
                    Type::Error => None,
                    _ => {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "volatile_store needs a raw pointer",
                        );
                        None
                    }
                };
                let value_ty = self.check_expr(unit, value, expected_value);
                if let Some(expected_value) = expected_value {
                    let value_position = value.position;
                    self.require_assignable(
                        expected_value,
                        value_ty,
                        Some(&*value),
                        value_position,
                    );
                }
                (self.pool.void(), false, false)
            }
            ExprKind::Asm(_) => {
                if !self.in_unsafe() {
                    self.error(
                        Category::UnsafeRawPointer,
                        position,
                        "asm requires an unsafe block",
                    );
                }
                (self.pool.void(), false, false)
            }
            ExprKind::InitList(elements) => {
                let ty = match expected.map(|t| (t, self.pool.get(t).clone())) {
                    Some((t, Type::Struct(nominal))) => {
                        let field_tys: Vec<TypeId> = self
                            .pool
                            .nominal(nominal)
                            .fields
                            .iter()
                            .map(|f| f.ty)
                            .collect();
                        if elements.len() != field_tys.len() {
                            let display = self.display(t);
                            self.error(
                                Category::TypeArity,
                                position,
                                format!(
                                    "{} has {} field(s), initializer has {}",
                                    display,
                                    field_tys.len(),
                                    elements.len()
                                ),
                            );
                        }
                        for (field_ty, element) in field_tys.iter().zip(elements.iter_mut()) {
                            let element_ty = self.check_expr(unit, element, Some(*field_ty));
                            let element_position = element.position;
                            self.require_assignable(
                                *field_ty,
                                element_ty,
                                Some(&*element),
                                element_position,
                            );
                        }
                        t
                    }
                    Some((t, Type::Array { element, length })) => {
                        if elements.len() as u64 != length {
                            self.error(
                                Category::TypeArity,
                                position,
                                format!(
                                    "array of length {} initialized with {} element(s)",
                                    length,
                                    elements.len()
                                ),
                            );
                        }
                        for item in elements.iter_mut() {
                            let item_ty = self.check_expr(unit, item, Some(element));
                            let item_position = item.position;
                            self.require_assignable(
                                element,
                                item_ty,
                                Some(&*item),
                                item_position,
                            );
                        }
                        t
                    }
                    Some((t, Type::Tuple(ids))) => {
                        if elements.len() != ids.len() {
                            self.error(
                                Category::TypeArity,
                                position,
                                "tuple initializer has the wrong number of elements",
                            );
                        }
                        for (id, element) in ids.iter().zip(elements.iter_mut()) {
                            let element_ty = self.check_expr(unit, element, Some(*id));
                            let element_position = element.position;
                            self.require_assignable(
                                *id,
                                element_ty,
                                Some(&*element),
                                element_position,
                            );
                        }
                        t
                    }
                    Some((_, Type::Error)) | None => self.pool.error(),
                    Some(_) => {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "initializer lists need a struct, array, or tuple context",
                        );
                        self.pool.error()
                    }
                };
                (ty, false, false)
            }
            ExprKind::Tuple(elements) => {
                let ids: Vec<TypeId> = elements
                    .iter_mut()
                    .map(|element| self.check_expr(unit, element, None))
                    .collect();
                (self.pool.intern(Type::Tuple(ids)), false, false)
            }
        };
        e.ty = Some(ty);
        e.lvalue = lvalue;
        if bounds_check {
            e.needs_bounds_check = true;
        }
        ty
    }

    fn check_unary(
        &mut self,
        unit: &Unit,
        position: Position,
        op: UnaryOp,
        operand: &mut Expr,
        expected: Option<TypeId>,
    ) -> (TypeId, bool, bool) {
        match op {
            UnaryOp::Neg => {
                let ty = self.check_expr(unit, operand, expected);
                if !self.pool.is_numeric(ty) && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "negation needs a numeric operand",
                    );
                }
                (ty, false, false)
            }
            UnaryOp::Not => {
                let ty = self.check_expr(unit, operand, None);
                let bool_ty = self.pool.bool_ty();
                if self.pool.common_type(ty, bool_ty).is_none() {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "logical not needs a bool operand",
                    );
                }
                (bool_ty, false, false)
            }
            UnaryOp::BitNot => {
                let ty = self.check_expr(unit, operand, expected);
                if !self.pool.is_integer(ty) && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "bitwise not needs an integer operand",
                    );
                }
                (ty, false, false)
            }
            UnaryOp::Deref => {
                let ty = self.check_expr(unit, operand, None);
                match self.pool.get(ty).clone() {
                    Type::Pointer { pointee, .. } => {
                        if !self.in_unsafe() {
                            self.error(
                                Category::UnsafeRawPointer,
                                position,
                                "dereferencing a raw pointer requires an unsafe block",
                            );
                        }
                        (pointee, true, false)
                    }
                    Type::Reference {
                        pointee, nullable, ..
                    } => {
                        if nullable && !self.proved_nonnull(operand) {
                            self.error(
                                Category::NullDeref,
                                position,
                                "dereference of a possibly-null reference without a proof",
                            );
                        }
                        (pointee, true, false)
                    }
                    Type::Error => (self.pool.error(), true, false),
                    _ => {
                        let display = self.display(ty);
                        self.error(
                            Category::TypeMismatch,
                            position,
                            format!("cannot dereference {}", display),
                        );
                        (self.pool.error(), false, false)
                    }
                }
            }
            UnaryOp::AddrOf => {
                let want_mut = matches!(
                    expected.map(|t| self.pool.get(t).clone()),
                    Some(Type::Reference { mutable: true, .. })
                );
                let operand_ty = self.check_expr(unit, operand, None);
                if !operand.lvalue && !self.pool.is_error(operand_ty) {
                    self.error(
                        Category::TypeLvalue,
                        position,
                        "cannot take the address of a non-lvalue",
                    );
                }
                let root = self.lvalue_root(operand);
                let root_info = root.and_then(|r| match &self.scopes.symbol(r).kind {
                    SymbolKind::Variable {
                        storage, mutable, ..
                    } => Some((*storage, *mutable)),
                    _ => None,
                });
                let mut region = Region::Stack;
                if let Some((storage, mutable)) = root_info {
                    if matches!(storage, Storage::Static | Storage::Const) {
                        region = Region::Static;
                    }
                    if want_mut && !mutable {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "cannot take a mutable reference to an immutable location",
                        );
                    }
                    if matches!(storage, Storage::Local | Storage::Param) {
                        let kind = if want_mut {
                            BorrowKind::Exclusive
                        } else {
                            BorrowKind::Shared
                        };
                        let target = root.unwrap();
                        if let Some(fun) = self.fun_mut() {
                            let point = fun.point;
                            let index = fun.borrows.record_borrow(Borrow {
                                target,
                                holder: None,
                                kind,
                                position,
                                start: point,
                            });
                            fun.last_borrow = Some(index);
                        }
                    }
                }
                let ty = self.pool.intern(Type::Reference {
                    pointee: operand_ty,
                    region,
                    mutable: want_mut,
                    nullable: false,
                });
                (ty, false, false)
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let ty = self.check_expr(unit, operand, None);
                if !self.pool.is_integer(ty) && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "increment and decrement need integer operands",
                    );
                }
                if !operand.lvalue && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeLvalue,
                        position,
                        "increment and decrement need an assignable operand",
                    );
                }
                self.check_path_mutability(operand);
                (ty, false, false)
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinaryOp,
        lhs_ty: TypeId,
        rhs_ty: TypeId,
        null_involved: bool,
        position: Position,
    ) -> TypeId {
        if self.pool.is_error(lhs_ty) || self.pool.is_error(rhs_ty) {
            return self.pool.error();
        }
        let bool_ty = self.pool.bool_ty();
        if op.is_logical() {
            if lhs_ty != bool_ty || rhs_ty != bool_ty {
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("operator {} needs bool operands", op.symbol()),
                );
            }
            return bool_ty;
        }
        if op.is_comparison() {
            if null_involved {
                let nullable_side = [lhs_ty, rhs_ty].into_iter().any(|t| {
                    matches!(
                        self.pool.get(t),
                        Type::Reference { nullable: true, .. } | Type::Pointer { .. }
                    )
                });
                if !nullable_side || !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "null can only be compared with == or != against a nullable reference",
                    );
                }
                return bool_ty;
            }
            if let Type::Struct(nominal) = self.pool.get(lhs_ty).clone() {
                return match self.operator_method(nominal, op) {
                    Some((_, sig)) => {
                        self.check_operator_signature(&sig, lhs_ty, rhs_ty, op, position);
                        sig.ret
                    }
                    None => {
                        let display = self.display(lhs_ty);
                        self.error(
                            Category::TypeMismatch,
                            position,
                            format!("{} defines no operator{}", display, op.symbol()),
                        );
                        self.pool.error()
                    }
                };
            }
            if self.pool.common_type(lhs_ty, rhs_ty).is_none() {
                let (got, want) = (self.display(rhs_ty), self.display(lhs_ty));
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("cannot compare {} with {}", want, got),
                );
            }
            return bool_ty;
        }

        // Arithmetic, bitwise, and shift operators.
        match self.pool.get(lhs_ty).clone() {
            Type::Int(_) => {
                if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
                    if !self.pool.is_integer(rhs_ty) {
                        self.error(
                            Category::TypeMismatch,
                            position,
                            "shift amounts must be integers",
                        );
                    }
                    return lhs_ty;
                }
                if self.pool.common_type(lhs_ty, rhs_ty).is_none() {
                    let (want, got) = (self.display(lhs_ty), self.display(rhs_ty));
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!(
                            "mismatched operands {} and {}; an explicit cast is required",
                            want, got
                        ),
                    );
                }
                lhs_ty
            }
            Type::Float(_) => {
                let ok_op = matches!(
                    op,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
                );
                if !ok_op {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("operator {} is not defined for floats", op.symbol()),
                    );
                }
                if self.pool.common_type(lhs_ty, rhs_ty).is_none() {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "mismatched float operands; an explicit cast is required",
                    );
                }
                lhs_ty
            }
            Type::Struct(nominal) => match self.operator_method(nominal, op) {
                Some((_, sig)) => {
                    self.check_operator_signature(&sig, lhs_ty, rhs_ty, op, position);
                    sig.ret
                }
                None => {
                    let display = self.display(lhs_ty);
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("{} defines no operator{}", display, op.symbol()),
                    );
                    self.pool.error()
                }
            },
            _ => {
                let display = self.display(lhs_ty);
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("operator {} is not defined for {}", op.symbol(), display),
                );
                self.pool.error()
            }
        }
    }

    /// Both operands must match the operator method's single-parameter
    /// signature.
    fn check_operator_signature(
        &mut self,
        sig: &FnSig,
        lhs_ty: TypeId,
        rhs_ty: TypeId,
        op: BinaryOp,
        position: Position,
    ) {
        if sig.params.len() != 1 {
            self.error(
                Category::TypeArity,
                position,
                format!("operator{} must take exactly one parameter", op.symbol()),
            );
            return;
        }
        if sig.params[0] != rhs_ty || sig.params[0] != lhs_ty {
            let display = self.display(sig.params[0]);
            self.error(
                Category::TypeMismatch,
                position,
                format!(
                    "both operands of operator{} must be {}",
                    op.symbol(),
                    display
                ),
            );
        }
    }

    fn operator_method(
        &self,
        nominal: NominalId,
        op: BinaryOp,
    ) -> Option<(SymbolId, FnSig)> {
        let slot = self
            .methods
            .get(&(nominal, Name::from(format!("operator{}", op.symbol()))))?;
        match &self.scopes.symbol(slot.symbol).kind {
            SymbolKind::Function { ty, .. } => match self.pool.get(*ty) {
                Type::Function(sig) => Some((slot.symbol, sig.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    fn proved_nonnull(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::Ident { symbol: Some(s), .. } => self
                .fun
                .as_ref()
                .map_or(false, |f| f.flow.nonnull.contains(*s)),
            _ => false,
        }
    }

    fn autoderef(
        &mut self,
        ty: TypeId,
        base: &Expr,
        through_pointer: bool,
        position: Position,
    ) -> (TypeId, bool) {
        match self.pool.get(ty).clone() {
            Type::Reference {
                pointee, nullable, ..
            } => {
                if nullable && !self.proved_nonnull(base) {
                    self.error(
                        Category::NullDeref,
                        position,
                        "access through a possibly-null reference without a proof",
                    );
                }
                (pointee, true)
            }
            Type::Pointer { pointee, .. } => {
                if !through_pointer {
                    self.error(
                        Category::UnsafeRawPointer,
                        position,
                        "raw pointer members are accessed with ->",
                    );
                }
                if !self.in_unsafe() {
                    self.error(
                        Category::UnsafeRawPointer,
                        position,
                        "raw pointer access requires an unsafe block",
                    );
                }
                (pointee, true)
            }
            _ => {
                if through_pointer && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        "-> needs a pointer or reference",
                    );
                }
                (ty, false)
            }
        }
    }

    fn check_cast(&mut self, source: TypeId, target: TypeId, position: Position) {
        if source == target || self.pool.is_error(source) || self.pool.is_error(target) {
            return;
        }
        let numericish = |pool: &TypePool, t: TypeId| {
            matches!(
                pool.get(t),
                Type::Int(_) | Type::Float(_) | Type::Char | Type::Bool | Type::Enum(_)
            )
        };
        let newtype_pair = match (self.pool.get(source), self.pool.get(target)) {
            (Type::Newtype(n), _) => self.pool.nominal(*n).underlying == Some(target),
            (_, Type::Newtype(n)) => self.pool.nominal(*n).underlying == Some(source),
            _ => false,
        };
        if (numericish(self.pool, source) && numericish(self.pool, target)) || newtype_pair {
            return;
        }
        let unsafe_cast = matches!(
            (self.pool.get(source), self.pool.get(target)),
            (Type::Pointer { .. }, Type::Pointer { .. })
                | (Type::Pointer { .. }, Type::Int(_))
                | (Type::Int(_), Type::Pointer { .. })
                | (Type::Pointer { .. }, Type::Reference { .. })
                | (Type::Reference { .. }, Type::Pointer { .. })
                | (Type::Reference { .. }, Type::Reference { .. })
        );
        if unsafe_cast {
            if !self.in_unsafe() {
                let (got, want) = (self.display(source), self.display(target));
                self.error(
                    Category::TypeCast,
                    position,
                    format!(
                        "casting {} to {} retags memory and requires an unsafe block",
                        got, want
                    ),
                );
            }
            return;
        }
        let (got, want) = (self.display(source), self.display(target));
        self.error(
            Category::TypeCast,
            position,
            format!("cannot cast {} to {}", got, want),
        );
    }

    fn check_try(&mut self, ty: TypeId, position: Position) -> TypeId {
        let nominal = match self.pool.get(ty) {
            Type::TaggedUnion(nominal) => *nominal,
            Type::Error => return self.pool.error(),
            _ => {
                let display = self.display(ty);
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("try needs a tagged union, found {}", display),
                );
                return self.pool.error();
            }
        };
        let variants = self.pool.nominal(nominal).variants.clone();
        let empties: Vec<_> = variants.iter().filter(|v| v.payload.is_none()).collect();
        let payloads: Vec<_> = variants.iter().filter(|v| v.payload.is_some()).collect();
        if empties.len() != 1 || payloads.len() != 1 {
            let display = self.display(ty);
            self.error(
                Category::TypeMismatch,
                position,
                format!(
                    "try needs one empty and one payload variant; {} has {} and {}",
                    display,
                    empties.len(),
                    payloads.len()
                ),
            );
            return self.pool.error();
        }
        // The propagated empty variant must be admissible in the enclosing
        // return type.
        if let Some(return_type) = self.fun.as_ref().map(|f| f.return_type) {
            if return_type != ty {
                let (got, want) = (self.display(ty), self.display(return_type));
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!(
                        "try propagates {} but the enclosing function returns {}",
                        got, want
                    ),
                );
            }
        }
        payloads[0].payload.unwrap_or_else(|| self.pool.void())
    }

    // ---- assignment ----

    fn check_assign(
        &mut self,
        unit: &Unit,
        position: Position,
        op: Option<BinaryOp>,
        lhs: &mut Expr,
        rhs: &mut Expr,
    ) -> TypeId {
        let lhs_ty = self.check_lvalue(unit, lhs);
        if let Some(op) = op {
            self.check_compound_target(lhs, lhs_ty, op, position);
        }
        if let Some(fun) = self.fun_mut() {
            fun.last_borrow = None;
        }
        let rhs_ty = self.check_expr(unit, rhs, Some(lhs_ty));
        self.require_assignable(lhs_ty, rhs_ty, Some(&*rhs), position);

        if self.fun.as_ref().map_or(false, |f| f.is_pure) {
            let non_local = match self.lvalue_root(lhs) {
                Some(root) => !matches!(
                    self.scopes.symbol(root).kind,
                    SymbolKind::Variable {
                        storage: Storage::Local | Storage::Param,
                        ..
                    }
                ),
                None => true,
            };
            if non_local {
                self.error(
                    Category::SemaPure,
                    position,
                    "pure functions may not mutate non-local state",
                );
            }
        }

        if let ExprKind::Ident {
            symbol: Some(symbol),
            ..
        } = &lhs.kind
        {
            let symbol = *symbol;
            self.track_reference_flow(symbol, lhs_ty, rhs);
            if let Some(fun) = self.fun_mut() {
                fun.flow.init.insert(symbol);
                fun.ever_init.insert(symbol);
            }
            self.check_region_store(unit, symbol, lhs_ty, rhs_ty, position);
        } else {
            self.check_store_through_path(lhs, rhs_ty, position);
        }
        lhs_ty
    }

    fn check_lvalue(&mut self, unit: &Unit, e: &mut Expr) -> TypeId {
        self.tick();
        let position = e.position;
        let resolved = match &mut e.kind {
            ExprKind::Ident { name, symbol } => {
                let name = name.clone();
                match self.scopes.lookup(self.current_scope, &name) {
                    Some(id) => {
                        *symbol = Some(id);
                        Some((name, id))
                    }
                    None => {
                        self.error(
                            Category::ResolveUndefined,
                            position,
                            format!("undefined name {}", name),
                        );
                        None
                    }
                }
            }
            _ => {
                let ty = self.check_expr(unit, e, None);
                if !e.lvalue && !self.pool.is_error(ty) {
                    self.error(
                        Category::TypeLvalue,
                        position,
                        "expression is not assignable",
                    );
                }
                self.check_path_mutability(e);
                return ty;
            }
        };
        let Some((name, id)) = resolved else {
            let error = self.pool.error();
            e.ty = Some(error);
            return error;
        };
        let ty = match self.scopes.symbol(id).kind.clone() {
            SymbolKind::Variable { ty, mutable, .. } => {
                if !mutable {
                    self.error(
                        Category::TypeLvalue,
                        position,
                        format!("assignment to immutable {}", name),
                    );
                }
                ty
            }
            _ => {
                self.error(
                    Category::TypeLvalue,
                    position,
                    format!("{} is not assignable", name),
                );
                self.pool.error()
            }
        };
        e.ty = Some(ty);
        e.lvalue = true;
        ty
    }

    fn check_compound_target(
        &mut self,
        lhs: &Expr,
        lhs_ty: TypeId,
        op: BinaryOp,
        position: Position,
    ) {
        if let ExprKind::Ident {
            symbol: Some(symbol),
            ..
        } = &lhs.kind
        {
            let symbol = *symbol;
            let initialized = self.fun.as_ref().map_or(true, |f| {
                f.flow.init.contains(symbol) || !f.flow.reachable
            });
            let is_local = matches!(
                self.scopes.symbol(symbol).kind,
                SymbolKind::Variable {
                    storage: Storage::Local,
                    ..
                }
            );
            if is_local && !initialized {
                let name = self.scopes.symbol(symbol).name.clone();
                self.error(
                    Category::InitUseBeforeInit,
                    position,
                    format!("{} is read before initialization", name),
                );
            }
        }
        let ok = match self.pool.get(lhs_ty) {
            Type::Int(_) | Type::Error => true,
            Type::Float(_) => matches!(
                op,
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
            ),
            _ => false,
        };
        if !ok {
            self.error(
                Category::TypeMismatch,
                position,
                "compound assignment needs a numeric target",
            );
        }
    }

    fn check_path_mutability(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                if let Some(ty) = operand.ty {
                    if matches!(
                        self.pool.get(ty),
                        Type::Reference { mutable: false, .. }
                            | Type::Pointer { mutable: false, .. }
                    ) {
                        self.error(
                            Category::TypeLvalue,
                            e.position,
                            "assignment through a non-mut reference",
                        );
                    }
                }
            }
            ExprKind::Field { base, .. } | ExprKind::Index { base, .. } => {
                if let Some(ty) = base.ty {
                    if matches!(
                        self.pool.get(ty),
                        Type::Reference { mutable: false, .. }
                            | Type::Pointer { mutable: false, .. }
                    ) {
                        self.error(
                            Category::TypeLvalue,
                            e.position,
                            "assignment through a non-mut reference",
                        );
                        return;
                    }
                }
                self.check_path_mutability(base);
            }
            ExprKind::Ident { symbol: Some(s), .. } => {
                if let SymbolKind::Variable { mutable: false, .. } = self.scopes.symbol(*s).kind
                {
                    let name = self.scopes.symbol(*s).name.clone();
                    self.error(
                        Category::TypeLvalue,
                        e.position,
                        format!("assignment to immutable {}", name),
                    );
                }
            }
            _ => {}
        }
    }

    /// Rule (b) through paths: storing a stack or arena reference behind a
    /// heap reference, raw pointer, or static root makes it outlive its
    /// region.
    fn check_store_through_path(&mut self, lhs: &Expr, rhs_ty: TypeId, position: Position) {
        let value_region = match self.pool.get(rhs_ty) {
            Type::Reference { region, .. } => region.clone(),
            _ => return,
        };
        if !self.path_is_long_lived(lhs) {
            return;
        }
        if self.scopes.in_escape(self.current_scope) {
            if let Some(root) = self.lvalue_root(lhs) {
                if let SymbolKind::Variable { demoted_region, .. } =
                    &mut self.scopes.symbol_mut(root).kind
                {
                    *demoted_region = Some(value_region);
                }
            }
            return;
        }
        match value_region {
            Region::Stack => {
                self.error(
                    Category::RegionEscape,
                    position,
                    "storing a &stack reference in longer-lived storage",
                );
            }
            Region::Arena(name) => {
                self.error(
                    Category::RegionOutlives,
                    position,
                    format!(
                        "storing an &arena<{}> reference where it outlives its region",
                        name
                    ),
                );
            }
            _ => {}
        }
    }

    fn path_is_long_lived(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::Ident { symbol: Some(s), .. } => matches!(
                self.scopes.symbol(*s).kind,
                SymbolKind::Variable {
                    storage: Storage::Static | Storage::Const,
                    ..
                }
            ),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.expr_points_long_lived(operand),
            ExprKind::Field {
                base,
                through_pointer: true,
                ..
            } => self.expr_points_long_lived(base),
            ExprKind::Field { base, .. } | ExprKind::Index { base, .. } => {
                self.expr_points_long_lived(base) || self.path_is_long_lived(base)
            }
            _ => false,
        }
    }

    fn expr_points_long_lived(&self, e: &Expr) -> bool {
        e.ty.map_or(false, |t| {
            matches!(
                self.pool.get(t),
                Type::Reference {
                    region: Region::Heap | Region::Static,
                    ..
                } | Type::Pointer { .. }
            )
        })
    }

    // ---- calls ----

    fn check_call(
        &mut self,
        unit: &Unit,
        position: Position,
        callee: &mut Expr,
        generic_args: &mut [GenericArg],
        args: &mut [Expr],
    ) -> TypeId {
        let direct = match &callee.kind {
            ExprKind::Ident { name, .. } => {
                let name = name.clone();
                self.scopes
                    .lookup(self.current_scope, &name)
                    .map(|s| (name, s))
            }
            _ => None,
        };
        if let Some((name, symbol)) = direct {
            if let SymbolKind::Function { decl, ty, generic } =
                self.scopes.symbol(symbol).kind.clone()
            {
                self.scopes.symbol_mut(symbol).used = true;
                if generic {
                    return self.check_generic_call(
                        unit,
                        decl,
                        callee,
                        generic_args,
                        args,
                        position,
                    );
                }
                if !generic_args.is_empty() {
                    self.error(
                        Category::TypeArity,
                        position,
                        format!("{} is not generic", name),
                    );
                }
                if let ExprKind::Ident { symbol: slot, .. } = &mut callee.kind {
                    *slot = Some(symbol);
                }
                callee.ty = Some(ty);
                if decl != usize::MAX {
                    if let Decl::Function(f) = &unit.decls[decl] {
                        let attrs = f.attrs;
                        if attrs.contains(FnAttrs::CONSTEVAL) && !self.in_const_context() {
                            self.error(
                                Category::ConstContext,
                                position,
                                format!(
                                    "consteval function {} called in a runtime context",
                                    name
                                ),
                            );
                        }
                        let callee_pure = attrs
                            .intersects(FnAttrs::PURE | FnAttrs::CONST | FnAttrs::CONSTEVAL);
                        if self.fun.as_ref().map_or(false, |fun| fun.is_pure) && !callee_pure {
                            self.error(
                                Category::SemaPure,
                                position,
                                format!("pure function calls non-pure {}", name),
                            );
                        }
                    }
                }
                let sig = match self.pool.get(ty).clone() {
                    Type::Function(sig) => sig,
                    _ => return self.pool.error(),
                };
                return self.check_args_against(unit, &sig, args, &name, position);
            }
        }
        let callee_ty = self.check_expr(unit, callee, None);
        match self.pool.get(callee_ty).clone() {
            Type::Function(sig) => {
                let name = Name::from("callee");
                self.check_args_against(unit, &sig, args, &name, position)
            }
            Type::Error => self.pool.error(),
            _ => {
                let display = self.display(callee_ty);
                self.error(
                    Category::TypeMismatch,
                    position,
                    format!("{} is not callable", display),
                );
                self.pool.error()
            }
        }
    }

    fn check_args_against(
        &mut self,
        unit: &Unit,
        sig: &FnSig,
        args: &mut [Expr],
        name: &Name,
        position: Position,
    ) -> TypeId {
        let ok_arity = if sig.variadic {
            args.len() >= sig.params.len()
        } else {
            args.len() == sig.params.len()
        };
        if !ok_arity {
            self.error(
                Category::TypeArity,
                position,
                format!(
                    "{} expects {} argument(s), got {}",
                    name,
                    sig.params.len(),
                    args.len()
                ),
            );
        }
        for (index, arg) in args.iter_mut().enumerate() {
            let expected = sig.params.get(index).copied();
            if let Some(fun) = self.fun_mut() {
                fun.last_borrow = None;
            }
            let arg_ty = self.check_expr(unit, arg, expected);
            if let Some(expected) = expected {
                let arg_position = arg.position;
                self.require_assignable(expected, arg_ty, Some(&*arg), arg_position);
            }
        }
        sig.ret
    }

    fn check_method_call(
        &mut self,
        unit: &Unit,
        position: Position,
        receiver: &mut Expr,
        method: &Name,
        args: &mut [Expr],
        symbol_slot: &mut Option<SymbolId>,
    ) -> TypeId {
        let receiver_ty = self.check_expr(unit, receiver, None);
        let (inner, _) = self.autoderef(receiver_ty, receiver, false, position);
        let nominal = match self.pool.get(inner) {
            Type::Struct(n) | Type::Union(n) => Some(*n),
            Type::Error => return self.pool.error(),
            _ => None,
        };
        let Some(nominal) = nominal else {
            let display = self.display(inner);
            self.error(
                Category::TypeMismatch,
                position,
                format!("{} has no methods", display),
            );
            return self.pool.error();
        };
        let slot = match self.methods.get(&(nominal, method.clone())) {
            Some(slot) => slot.clone(),
            None => {
                let display = self.display(inner);
                self.error(
                    Category::ResolveUndefined,
                    position,
                    format!("{} has no method {}", display, method),
                );
                return self.pool.error();
            }
        };
        *symbol_slot = Some(slot.symbol);
        let sig = match &self.scopes.symbol(slot.symbol).kind {
            SymbolKind::Function { ty, .. } => match self.pool.get(*ty).clone() {
                Type::Function(sig) => sig,
                _ => return self.pool.error(),
            },
            _ => return self.pool.error(),
        };
        let name = method.clone();
        let ret = self.check_args_against(unit, &sig, args, &name, position);

        // The receiver is taken exclusively for the duration of the call.
        if let Some(root) = self.lvalue_root(receiver) {
            if matches!(
                self.scopes.symbol(root).kind,
                SymbolKind::Variable {
                    storage: Storage::Local | Storage::Param,
                    ..
                }
            ) {
                if let Some(fun) = self.fun_mut() {
                    let point = fun.point;
                    fun.borrows.record_borrow(Borrow {
                        target: root,
                        holder: None,
                        kind: BorrowKind::Exclusive,
                        position,
                        start: point,
                    });
                }
            }
        }
        ret
    }

    // ---- generic instantiation ----

    fn check_generic_call(
        &mut self,
        unit: &Unit,
        decl: usize,
        callee: &mut Expr,
        generic_args: &mut [GenericArg],
        args: &mut [Expr],
        position: Position,
    ) -> TypeId {
        let f = match &unit.decls[decl] {
            Decl::Function(f) => f.clone(),
            _ => return self.pool.error(),
        };
        if self.mono_depth + 1 > crate::consteval::MAX_RECURSION_DEPTH {
            self.error(
                Category::MonoDepth,
                position,
                format!(
                    "monomorphization of {} exceeds the recursion limit",
                    f.name
                ),
            );
            return self.pool.error();
        }

        let mut type_bindings: HashMap<Name, TypeId> = HashMap::new();
        let mut value_bindings: Vec<(Name, i128)> = Vec::new();
        let mut pack_binding: Option<(Name, Vec<TypeId>)> = None;

        if generic_args.len() > f.generics.len() {
            self.error(
                Category::TypeArity,
                position,
                format!("{} takes {} generic argument(s)", f.name, f.generics.len()),
            );
        }
        for (param, arg) in f.generics.iter().zip(generic_args.iter_mut()) {
            match (&param.value_type, arg) {
                (Some(value_ty), GenericArg::Value(expr)) => {
                    let expected = {
                        let scope = self.current_scope;
                        self.resolve_type(unit, scope, value_ty)
                    };
                    self.check_expr(unit, expr, Some(expected));
                    match self.try_eval_int(unit, expr) {
                        Some(value) => value_bindings.push((param.name.clone(), value)),
                        None => {
                            self.error(
                                Category::ConstContext,
                                expr.position,
                                "generic value arguments must be compile-time constants",
                            );
                            value_bindings.push((param.name.clone(), 0));
                        }
                    }
                }
                (None, GenericArg::Type(texpr)) => {
                    let ty = {
                        let scope = self.current_scope;
                        self.resolve_type(unit, scope, texpr)
                    };
                    type_bindings.insert(param.name.clone(), ty);
                }
                _ => {
                    self.error(
                        Category::TypeMismatch,
                        position,
                        format!("generic argument kind mismatch for {}", param.name),
                    );
                }
            }
        }

        let arg_tys: Vec<TypeId> = args
            .iter_mut()
            .map(|arg| self.check_expr(unit, arg, None))
            .collect();

        let generic_names: Vec<Name> = f
            .generics
            .iter()
            .filter(|g| g.value_type.is_none())
            .map(|g| g.name.clone())
            .collect();
        let pack_param_name = f
            .generics
            .iter()
            .find(|g| g.pack)
            .map(|g| g.name.clone());

        let fixed: Vec<&Param> = f.params.iter().filter(|p| !p.pack).collect();
        let has_pack_param = f.params.iter().any(|p| p.pack);
        let ok_arity = if has_pack_param {
            args.len() >= fixed.len()
        } else {
            args.len() == fixed.len()
        };
        if !ok_arity {
            self.error(
                Category::TypeArity,
                position,
                format!(
                    "{} expects {} argument(s), got {}",
                    f.name,
                    fixed.len(),
                    args.len()
                ),
            );
            return self.pool.error();
        }
        for (param, &arg_ty) in fixed.iter().zip(&arg_tys) {
            self.unify(&param.ty, arg_ty, &generic_names, &mut type_bindings);
        }
        if has_pack_param {
            let rest: Vec<TypeId> = arg_tys[fixed.len().min(arg_tys.len())..].to_vec();
            if let Some(name) = &pack_param_name {
                pack_binding = Some((name.clone(), rest));
            }
        }

        for g in &f.generics {
            if g.pack {
                continue;
            }
            if g.value_type.is_some() {
                // Value parameters are never inferred.
                if !value_bindings.iter().any(|(name, _)| name == &g.name) {
                    self.error(
                        Category::MonoConstraint,
                        position,
                        format!(
                            "generic value {} must be given explicitly in the call to {}",
                            g.name, f.name
                        ),
                    );
                    return self.pool.error();
                }
                continue;
            }
            if !type_bindings.contains_key(&g.name) {
                self.error(
                    Category::MonoConstraint,
                    position,
                    format!("cannot infer {} for the call to {}", g.name, f.name),
                );
                return self.pool.error();
            }
        }
        for g in &f.generics {
            if let (Some(constraint), Some(&bound)) =
                (g.constraint.as_ref(), type_bindings.get(&g.name))
            {
                if let Some(constraint) = Constraint::from_name(constraint.as_str()) {
                    self.check_constraint(constraint, bound, &f.name, position);
                }
            }
        }

        // Resolve the concrete signature with the parameters bound, then
        // hold the arguments to it.
        let scope = self.scopes.push(self.scopes.root(), ScopeFlags::empty());
        for (name, &ty) in &type_bindings {
            let depth = self.scopes.depth(scope);
            let _ = self.scopes.define(
                scope,
                Symbol {
                    name: name.clone(),
                    kind: SymbolKind::Type { ty },
                    position,
                    depth,
                    used: false,
                },
            );
        }
        let mut param_tys: Vec<TypeId> = Vec::new();
        for param in &f.params {
            if param.pack {
                if let Some((_, types)) = &pack_binding {
                    param_tys.extend(types.iter().copied());
                }
            } else {
                param_tys.push(self.resolve_type(unit, scope, &param.ty));
            }
        }
        let ret = self.resolve_type(unit, scope, &f.return_type);
        for ((&param_ty, arg), &arg_ty) in param_tys.iter().zip(args.iter()).zip(&arg_tys) {
            let arg_position = arg.position;
            self.require_assignable(param_ty, arg_ty, Some(arg), arg_position);
        }

        // One cached instantiation per (symbol, type args, value args).
        let type_args: Vec<TypeId> = f
            .generics
            .iter()
            .filter_map(|g| type_bindings.get(&g.name).copied())
            .collect();
        let value_args: Vec<i128> = value_bindings.iter().map(|(_, v)| *v).collect();
        let pack_args: Vec<TypeId> = pack_binding
            .as_ref()
            .map(|(_, types)| types.clone())
            .unwrap_or_default();
        let mut key_types = type_args.clone();
        key_types.extend(pack_args.iter().copied());
        let key = (decl, key_types.clone(), value_args.clone());
        let symbol = match self.inst_cache.get(&key) {
            Some(&symbol) => symbol,
            None => {
                let rendered = key_types
                    .iter()
                    .map(|&t| self.display(t))
                    .chain(value_args.iter().map(|v| v.to_string()))
                    .join(", ");
                let mangled = Name::from(format!("{}<{}>", f.name, rendered));
                let fn_ty = self.pool.intern(Type::Function(FnSig {
                    params: param_tys.clone(),
                    ret,
                    variadic: false,
                    convention: f.convention,
                    pure_fn: f.attrs.contains(FnAttrs::PURE),
                    noreturn: f.attrs.contains(FnAttrs::NORETURN),
                }));
                let symbol = self.scopes.add_detached(Symbol {
                    name: mangled.clone(),
                    kind: SymbolKind::Function {
                        decl: usize::MAX,
                        ty: fn_ty,
                        generic: false,
                    },
                    position: f.position,
                    depth: 0,
                    used: true,
                });
                self.inst_cache.insert(key, symbol);
                self.instantiation_order.push(mangled);
                self.pending.push(PendingInst {
                    decl,
                    type_args,
                    value_args,
                    pack_args,
                    mangled: self.scopes.symbol(symbol).name.clone(),
                    symbol,
                    position,
                    depth: self.mono_depth + 1,
                });
                symbol
            }
        };
        let mangled_name = self.scopes.symbol(symbol).name.clone();
        let fn_ty = match &self.scopes.symbol(symbol).kind {
            SymbolKind::Function { ty, .. } => *ty,
            _ => self.pool.error(),
        };
        if let ExprKind::Ident { name, symbol: slot } = &mut callee.kind {
            *name = mangled_name;
            *slot = Some(symbol);
        }
        callee.ty = Some(fn_ty);
        ret
    }

    fn unify(
        &mut self,
        param: &TypeExpr,
        arg: TypeId,
        generics: &[Name],
        bindings: &mut HashMap<Name, TypeId>,
    ) {
        match param {
            TypeExpr::Named(name) if generics.contains(name) => {
                bindings.entry(name.clone()).or_insert(arg);
            }
            TypeExpr::Reference { pointee, .. } => {
                if let Type::Reference { pointee: p, .. } = self.pool.get(arg).clone() {
                    self.unify(pointee, p, generics, bindings);
                }
            }
            TypeExpr::Pointer { pointee, .. } => {
                if let Type::Pointer { pointee: p, .. } = self.pool.get(arg).clone() {
                    self.unify(pointee, p, generics, bindings);
                }
            }
            TypeExpr::Array { element, .. } => match self.pool.get(arg).clone() {
                Type::Array { element: e, .. } => self.unify(element, e, generics, bindings),
                _ => {}
            },
            TypeExpr::Slice { element } => {
                if let Type::Slice { element: e } = self.pool.get(arg).clone() {
                    self.unify(element, e, generics, bindings);
                }
            }
            _ => {}
        }
    }

    /// Trait-like constraints are structural: the required operators must be
    /// defined for the concrete type, either as primitive operators or as
    /// struct operator methods.
    fn check_constraint(
        &mut self,
        constraint: Constraint,
        ty: TypeId,
        fn_name: &Name,
        position: Position,
    ) {
        let ok = match constraint {
            Constraint::Integer => self.pool.is_integer(ty),
            Constraint::Numeric => {
                self.pool.is_numeric(ty)
                    || (self.has_operator(ty, "+")
                        && self.has_operator(ty, "-")
                        && self.has_operator(ty, "*"))
            }
            Constraint::Add => self.pool.is_numeric(ty) || self.has_operator(ty, "+"),
            Constraint::Sub => self.pool.is_numeric(ty) || self.has_operator(ty, "-"),
            Constraint::Mul => self.pool.is_numeric(ty) || self.has_operator(ty, "*"),
            Constraint::Ord => {
                self.pool.is_numeric(ty)
                    || matches!(self.pool.get(ty), Type::Char)
                    || self.has_operator(ty, "<")
            }
            Constraint::Eq => {
                self.pool.is_numeric(ty)
                    || matches!(
                        self.pool.get(ty),
                        Type::Char | Type::Bool | Type::Enum(_)
                    )
                    || self.has_operator(ty, "==")
            }
        };
        if !ok {
            let display = self.display(ty);
            self.error(
                Category::MonoConstraint,
                position,
                format!(
                    "{} does not satisfy the {} constraint required by {}",
                    display,
                    constraint.name(),
                    fn_name
                ),
            );
        }
    }

    fn has_operator(&self, ty: TypeId, symbol: &str) -> bool {
        match self.pool.get(ty) {
            Type::Struct(nominal) => self
                .methods
                .contains_key(&(*nominal, Name::from(format!("operator{}", symbol)))),
            _ => false,
        }
    }

    // ---- top-level const passes ----

    /// Type-check global initializers; globals can only hold `&static`
    /// references.
    pub fn check_globals(&mut self, unit: &mut Unit) {
        for index in 0..unit.decls.len() {
            let symbol = match &unit.decls[index] {
                Decl::Global(g) => g.symbol,
                _ => continue,
            };
            let Some(symbol) = symbol else { continue };
            let ty = match &self.scopes.symbol(symbol).kind {
                SymbolKind::Variable { ty, .. } => *ty,
                _ => continue,
            };
            if let Type::Reference { region, .. } = self.pool.get(ty).clone() {
                if region != Region::Static {
                    let position = self.scopes.symbol(symbol).position;
                    let display = self.display(ty);
                    self.error(
                        Category::RegionGlobal,
                        position,
                        format!("global storage cannot hold {}; only &static references", display),
                    );
                }
            }
            let is_const = matches!(
                &self.scopes.symbol(symbol).kind,
                SymbolKind::Variable {
                    storage: Storage::Const,
                    ..
                }
            );
            let mut init = match &mut unit.decls[index] {
                Decl::Global(g) => match g.init.take() {
                    Some(init) => init,
                    None => continue,
                },
                _ => continue,
            };
            // A const global's initializer is a const-eval context.
            let saved = self.current_scope;
            if is_const {
                self.current_scope = self
                    .scopes
                    .push(saved, ScopeFlags::CONST_CONTEXT);
            }
            let init_ty = self.check_expr(&*unit, &mut init, Some(ty));
            self.current_scope = saved;
            let position = init.position;
            self.require_assignable(ty, init_ty, Some(&init), position);
            if let Decl::Global(g) = &mut unit.decls[index] {
                g.init = Some(init);
            }
        }
    }

    /// Evaluate top-level `static_assert` conditions.
    pub fn check_static_asserts(&mut self, unit: &mut Unit) {
        let bool_ty = self.pool.bool_ty();
        for index in 0..unit.decls.len() {
            let (mut cond, message, position) = match &unit.decls[index] {
                Decl::StaticAssert {
                    cond,
                    message,
                    position,
                } => (cond.clone(), message.clone(), *position),
                _ => continue,
            };
            let saved = self.current_scope;
            self.current_scope = self.scopes.push(saved, ScopeFlags::CONST_CONTEXT);
            self.check_expr(&*unit, &mut cond, Some(bool_ty));
            self.current_scope = saved;
            if let Some(value) = self.eval_const(&*unit, &cond) {
                if value.truthy() == Some(false) {
                    let text = message
                        .as_ref()
                        .map(|m| format!(": {}", m))
                        .unwrap_or_default();
                    self.error(
                        Category::SemaStaticAssert,
                        position,
                        format!("static assertion failed{}", text),
                    );
                }
            }
            if let Decl::StaticAssert { cond: slot, .. } = &mut unit.decls[index] {
                *slot = cond;
            }
        }
    }

    /// Force every const global so the lowered unit and the tests see the
    /// evaluated values.
    pub fn eval_const_globals(&mut self, unit: &Unit) {
        for decl in &unit.decls {
            let Decl::Global(g) = decl else { continue };
            if !g.is_const {
                continue;
            }
            let (Some(symbol), Some(init)) = (g.symbol, &g.init) else {
                continue;
            };
            if self.consts.contains_key(&symbol) {
                continue;
            }
            let init = init.clone();
            if let Some(value) = self.eval_const(unit, &init) {
                self.consts.insert(symbol, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;
    use crate::lexing::Tokens;
    use crate::parsing::Parser;
    use crate::source::{FileId, Source};

    fn analyze(text: &str) -> (Diagnostics, Analysis) {
        let mut diagnostics = Diagnostics::new();
        let tokens = Tokens::lex(Source::from_text(FileId(0), text), &mut diagnostics);
        let mut unit = Parser::new(tokens, &mut diagnostics).parse_unit();
        let mut pool = TypePool::new();
        let analysis = {
            let mut analyzer = Analyzer::new(&mut pool, &mut diagnostics);
            analyzer.collect(&mut unit);
            analyzer.check_globals(&mut unit);
            analyzer.check_bodies(&mut unit);
            crate::mono::run(&mut unit, &mut analyzer);
            analyzer.eval_const_globals(&unit);
            analyzer.check_static_asserts(&mut unit);
            analyzer.finish()
        };
        (diagnostics, analysis)
    }

    fn error_categories(diagnostics: &Diagnostics) -> Vec<Category> {
        diagnostics
            .iter()
            .filter(|d| d.severity >= Severity::Error)
            .map(|d| d.category)
            .collect()
    }

    fn assert_clean(diagnostics: &Diagnostics) {
        assert!(
            !diagnostics.has_errors(),
            "unexpected errors: {:?}",
            error_categories(diagnostics)
        );
    }

    #[test]
    fn use_before_init_and_conditional_init_are_distinguished() {
        let (diagnostics, _) = analyze("int f() { int x; return x; }");
        assert_eq!(error_categories(&diagnostics), vec![Category::InitUseBeforeInit]);

        let (diagnostics, _) =
            analyze("int g(bool c) { int x; if (c) { x = 1; } return x; }");
        assert_eq!(error_categories(&diagnostics), vec![Category::InitConditional]);

        let (diagnostics, _) = analyze(
            "int h(bool c) { int x; if (c) { x = 1; } else { x = 2; } return x; }",
        );
        assert_clean(&diagnostics);
    }

    #[test]
    fn nullable_dereference_needs_a_flow_proof() {
        let (diagnostics, _) = analyze("int f(?&int p) { return *p; }");
        assert_eq!(error_categories(&diagnostics), vec![Category::NullDeref]);

        let (diagnostics, _) =
            analyze("int g(?&int p) { if (p != null) { return *p; } return 0; }");
        assert_clean(&diagnostics);

        // The refinement flips for == in the else branch.
        let (diagnostics, _) =
            analyze("int h(?&int p) { if (p == null) { return 0; } else { return *p; } }");
        assert_clean(&diagnostics);
    }

    #[test]
    fn narrowing_nullable_into_nonnull_needs_a_proof() {
        let (diagnostics, _) = analyze("void f(?&int p) { &int q = p; *q = 0; }");
        assert!(error_categories(&diagnostics).contains(&Category::NullNarrow));

        let (diagnostics, _) =
            analyze("void g(?&int p) { if (p != null) { &int q = p; } }");
        assert_clean(&diagnostics);
    }

    #[test]
    fn exclusive_references_are_affine() {
        let (diagnostics, _) = analyze(
            "void f() {\n\
               int x = 0;\n\
               &mut int a = &x;\n\
               &mut int b = a;\n\
               *b = 1;\n\
               *a = 2;\n\
             }",
        );
        assert_eq!(error_categories(&diagnostics), vec![Category::AliasMoved]);
    }

    #[test]
    fn consteval_functions_are_context_checked() {
        let (diagnostics, _) =
            analyze("consteval int five() { return 5; }\nint f() { return five(); }");
        assert_eq!(error_categories(&diagnostics), vec![Category::ConstContext]);

        let (diagnostics, analysis) =
            analyze("consteval int five() { return 5; }\nconst int F = five();");
        assert_clean(&diagnostics);
        assert!(matches!(
            analysis.const_value("F"),
            Some(Value::Int { value: 5, .. })
        ));
    }

    #[test]
    fn pure_functions_may_not_touch_non_local_state() {
        let (diagnostics, _) = analyze(
            "static int counter = 0;\n\
             pure int bump(int x) { counter = x; return x; }",
        );
        assert_eq!(error_categories(&diagnostics), vec![Category::SemaPure]);

        let (diagnostics, _) = analyze(
            "int tick();\n\
             pure int wrap(int x) { return tick(); }",
        );
        assert_eq!(error_categories(&diagnostics), vec![Category::SemaPure]);
    }

    #[test]
    fn must_use_results_warn_when_discarded() {
        let (diagnostics, _) = analyze(
            "must_use int answer() { return 42; }\n\
             void f() { answer(); }",
        );
        assert!(!diagnostics.has_errors());
        assert!(diagnostics
            .iter()
            .any(|d| d.category == Category::SemaMustUse));
    }

    #[test]
    fn raw_pointers_are_gated_on_unsafe() {
        let (diagnostics, _) = analyze("int f(int* p) { return *p; }");
        assert_eq!(error_categories(&diagnostics), vec![Category::UnsafeRawPointer]);

        let (diagnostics, _) = analyze("int g(int* p) { unsafe { return *p; } }");
        assert_clean(&diagnostics);
    }

    #[test]
    fn unsafe_mode_is_lexical_and_does_not_leak() {
        let (diagnostics, _) = analyze(
            "int f(int* p) {\n\
               unsafe { }\n\
               return *p;\n\
             }",
        );
        assert_eq!(error_categories(&diagnostics), vec![Category::UnsafeRawPointer]);
    }

    #[test]
    fn static_reference_passes_as_const_pointer_without_unsafe() {
        let (diagnostics, _) = analyze(
            "extern int puts(const char* s);\n\
             int f(&static char message) { return puts(message); }",
        );
        assert_clean(&diagnostics);

        let (diagnostics, _) = analyze(
            "extern int puts(const char* s);\n\
             int f(&stack char message) { return puts(message); }",
        );
        assert_eq!(error_categories(&diagnostics), vec![Category::RegionFfi]);
    }

    #[test]
    fn method_stitching_rejects_mismatched_signatures() {
        let (diagnostics, _) = analyze(
            "struct Vec2 { double x; double y; double dot(Vec2 other); }\n\
             double Vec2::dot(Vec2 other) { return other.x; }",
        );
        assert_clean(&diagnostics);

        let (diagnostics, _) = analyze(
            "struct Vec2 { double x; double y; double dot(Vec2 other); }\n\
             int Vec2::dot(Vec2 other) { return 1; }",
        );
        assert!(error_categories(&diagnostics).contains(&Category::TypeMismatch));
    }

    #[test]
    fn storing_stack_references_in_globals_is_rejected() {
        let (diagnostics, _) = analyze(
            "static ?&stack int escape_hole = null;\n\
             void f() { int x = 0; }",
        );
        assert!(error_categories(&diagnostics).contains(&Category::RegionGlobal));
    }
}
