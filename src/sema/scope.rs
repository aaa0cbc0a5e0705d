//! Scopes and symbols. Scopes form a tree rooted at the translation-unit
//! scope; blocks, function bodies, unsafe blocks, match arms, and loop
//! initializers all open nested scopes. The tree owns its symbols; parent
//! links are plain handles that never own, per the arena-with-handles shape
//! the cyclic back-references demand.

use std::collections::HashMap;

use crate::common::interning::Name;
use crate::source::Position;
use crate::types::{Region, TypeId};

use bitflags::bitflags;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SymbolId(pub u32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ScopeId(pub u32);

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ScopeFlags: u8 {
        /// Lexically inside `unsafe { ... }`.
        const UNSAFE = 1 << 0;
        /// Lexically inside `unsafe escape { ... }`.
        const ESCAPE = 1 << 1;
        /// A syntactic const-eval context.
        const CONST_CONTEXT = 1 << 2;
        /// The body scope of a function; lexical flags never propagate past
        /// it.
        const FUNCTION_ROOT = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Storage {
    Local,
    Param,
    /// Mutable global storage (`static`).
    Static,
    /// Const-evaluated global.
    Const,
}

#[derive(Clone, Debug)]
pub enum SymbolKind {
    Variable {
        ty: TypeId,
        mutable: bool,
        storage: Storage,
        /// Declaration index for const globals, so their initializers can be
        /// forced on demand.
        decl: Option<usize>,
        /// Set by `unsafe escape` when a store legally broke region
        /// tracking for this storage.
        demoted_region: Option<Region>,
    },
    Function {
        decl: usize,
        ty: TypeId,
        generic: bool,
    },
    Type {
        ty: TypeId,
    },
    /// A generic type template, instantiated by the monomorphizer.
    GenericType {
        decl: usize,
    },
    Region {
        capacity: u64,
        depth: u32,
    },
    Enumerator {
        value: i128,
        ty: TypeId,
    },
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: Name,
    pub kind: SymbolKind,
    pub position: Position,
    /// Depth of the declaring scope.
    pub depth: u32,
    pub used: bool,
}

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub flags: ScopeFlags,
    pub depth: u32,
    symbols: HashMap<Name, SymbolId>,
}

/// The scope tree and symbol arena for one translation unit.
pub struct ScopeTree {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                parent: None,
                flags: ScopeFlags::empty(),
                depth: 0,
                symbols: HashMap::new(),
            }],
            symbols: Vec::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn push(&mut self, parent: ScopeId, flags: ScopeFlags) -> ScopeId {
        let depth = self.scope(parent).depth + 1;
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent: Some(parent),
            flags,
            depth,
            symbols: HashMap::new(),
        });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Install a symbol into `scope`. Returns the existing symbol when the
    /// name is already bound in that same scope (shadowing an outer scope is
    /// fine).
    pub fn define(&mut self, scope: ScopeId, symbol: Symbol) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) = self.scopes[scope.0 as usize].symbols.get(&symbol.name) {
            return Err(existing);
        }
        let id = self.add_detached(symbol);
        let name = self.symbols[id.0 as usize].name.clone();
        self.scopes[scope.0 as usize].symbols.insert(name, id);
        Ok(id)
    }

    /// Allocate a symbol that is not reachable by name lookup; methods live
    /// here, keyed separately by their owning nominal type.
    pub fn add_detached(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        id
    }

    /// Resolve a name from the innermost enclosing scope outward.
    pub fn lookup(&self, from: ScopeId, name: &Name) -> Option<SymbolId> {
        let mut scope = Some(from);
        while let Some(id) = scope {
            let s = self.scope(id);
            if let Some(&symbol) = s.symbols.get(name) {
                return Some(symbol);
            }
            scope = s.parent;
        }
        None
    }

    /// Whether `from` is lexically inside an unsafe block. The flag never
    /// propagates past the enclosing function root.
    pub fn in_unsafe(&self, from: ScopeId) -> bool {
        self.walk_flags(from, ScopeFlags::UNSAFE)
    }

    pub fn in_escape(&self, from: ScopeId) -> bool {
        self.walk_flags(from, ScopeFlags::ESCAPE)
    }

    pub fn in_const_context(&self, from: ScopeId) -> bool {
        self.walk_flags(from, ScopeFlags::CONST_CONTEXT)
    }

    fn walk_flags(&self, from: ScopeId, wanted: ScopeFlags) -> bool {
        let mut scope = Some(from);
        while let Some(id) = scope {
            let s = self.scope(id);
            if s.flags.contains(wanted) {
                return true;
            }
            if s.flags.contains(ScopeFlags::FUNCTION_ROOT) {
                return false;
            }
            scope = s.parent;
        }
        false
    }

    pub fn depth(&self, scope: ScopeId) -> u32 {
        self.scope(scope).depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(name: &str, depth: u32) -> Symbol {
        Symbol {
            name: Name::from(name),
            kind: SymbolKind::Variable {
                ty: TypeId(0),
                mutable: true,
                storage: Storage::Local,
                decl: None,
                demoted_region: None,
            },
            position: Position::default(),
            depth,
            used: false,
        }
    }

    #[test]
    fn inner_scopes_shadow_and_outer_lookup_walks_parents() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let outer = tree.define(root, variable("x", 0)).unwrap();
        let inner_scope = tree.push(root, ScopeFlags::empty());
        assert_eq!(tree.lookup(inner_scope, &Name::from("x")), Some(outer));

        let shadow = tree.define(inner_scope, variable("x", 1)).unwrap();
        assert_eq!(tree.lookup(inner_scope, &Name::from("x")), Some(shadow));
        assert_eq!(tree.lookup(root, &Name::from("x")), Some(outer));
    }

    #[test]
    fn duplicate_definition_in_one_scope_is_rejected() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let first = tree.define(root, variable("x", 0)).unwrap();
        assert_eq!(tree.define(root, variable("x", 0)), Err(first));
    }

    #[test]
    fn unsafe_mode_is_lexical_and_stops_at_function_roots() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let function = tree.push(root, ScopeFlags::FUNCTION_ROOT);
        let unsafe_block = tree.push(function, ScopeFlags::UNSAFE);
        let nested = tree.push(unsafe_block, ScopeFlags::empty());
        assert!(tree.in_unsafe(nested));
        assert!(!tree.in_unsafe(function));

        // A closure body inside the unsafe block is its own function.
        let closure = tree.push(unsafe_block, ScopeFlags::FUNCTION_ROOT);
        assert!(!tree.in_unsafe(closure));
    }
}
