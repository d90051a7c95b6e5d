//! Symbol tables with lexical scopes and free-variable promotion.
//!
//! Each function body gets its own [`SymbolTable`] chained to the enclosing
//! one; block statements push lightweight name maps inside the current
//! table. A name resolved through an enclosing non-global table is promoted
//! into this table's free list so `Closure` emission knows what to capture,
//! and the reference is rewritten to a free-slot access.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::types::Type;
use crate::{Box, Vec};

/// Where a resolved name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Local,
    Free,
    Builtin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: EcoString,
    pub scope: ScopeKind,
    pub index: u16,
    pub mutable: bool,
    pub ty: Type,
}

/// One function's scope: a stack of block-level name maps plus the chain to
/// the enclosing function.
#[derive(Debug, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    /// Innermost block last; `blocks[0]` is the function body itself.
    blocks: Vec<HashMap<EcoString, Symbol>>,
    /// Slots handed out in this function (or globals at top level). Never
    /// reused when a block closes; the frame is sized to the high-water
    /// mark.
    pub num_definitions: u16,
    /// Symbols captured from the enclosing function, in capture order. The
    /// entries are the *enclosing* scope's view of each symbol, which is
    /// exactly what `Closure` emission must load.
    pub free_symbols: Vec<Symbol>,
    is_global: bool,
}

impl SymbolTable {
    /// The top-level table: definitions become globals.
    pub fn global() -> Self {
        SymbolTable {
            outer: None,
            blocks: crate::vec![HashMap::new()],
            num_definitions: 0,
            free_symbols: Vec::new(),
            is_global: true,
        }
    }

    /// A function-body table chained to `outer`.
    pub fn enclosed(outer: SymbolTable) -> Self {
        SymbolTable {
            outer: Some(Box::new(outer)),
            blocks: crate::vec![HashMap::new()],
            num_definitions: 0,
            free_symbols: Vec::new(),
            is_global: false,
        }
    }

    /// Tear down a function scope, returning the enclosing table.
    pub fn into_outer(self) -> Option<SymbolTable> {
        self.outer.map(|boxed| *boxed)
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn push_block(&mut self) {
        self.blocks.push(HashMap::new());
    }

    pub fn pop_block(&mut self) {
        debug_assert!(self.blocks.len() > 1, "cannot pop the function body block");
        self.blocks.pop();
    }

    /// Define a name in the innermost block with the next slot index.
    /// Returns `None` when the name already exists in that block.
    pub fn define(&mut self, name: EcoString, ty: Type, mutable: bool) -> Option<Symbol> {
        let index = self.num_definitions;
        self.define_at(name, index, ty, mutable).map(|symbol| {
            self.num_definitions += 1;
            symbol
        })
    }

    /// Define a name with a caller-chosen index (the register backend maps
    /// locals to registers).
    pub fn define_at(
        &mut self,
        name: EcoString,
        index: u16,
        ty: Type,
        mutable: bool,
    ) -> Option<Symbol> {
        let scope = if self.is_global {
            ScopeKind::Global
        } else {
            ScopeKind::Local
        };
        let block = self.blocks.last_mut().expect("no block scope");
        if block.contains_key(&name) {
            return None;
        }
        let symbol = Symbol {
            name: name.clone(),
            scope,
            index,
            mutable,
            ty,
        };
        block.insert(name, symbol.clone());
        Some(symbol)
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        // Reuse an existing capture of the same name.
        if let Some(position) = self
            .free_symbols
            .iter()
            .position(|s| s.name == original.name)
        {
            let mut symbol = original;
            symbol.scope = ScopeKind::Free;
            symbol.index = position as u16;
            return symbol;
        }
        self.free_symbols.push(original.clone());
        let mut symbol = original;
        symbol.scope = ScopeKind::Free;
        symbol.index = (self.free_symbols.len() - 1) as u16;
        symbol
    }

    /// Resolve a name, searching blocks innermost-first, then the enclosing
    /// function chain. An enclosing non-global local is promoted into this
    /// table's free list.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        for block in self.blocks.iter().rev() {
            if let Some(symbol) = block.get(name) {
                return Some(symbol.clone());
            }
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        match symbol.scope {
            ScopeKind::Global | ScopeKind::Builtin => Some(symbol),
            ScopeKind::Local | ScopeKind::Free => Some(self.define_free(symbol)),
        }
    }

    /// Overwrite the type recorded for an already-defined name (used when a
    /// declaration's initializer refines `any`).
    pub fn set_type(&mut self, name: &str, ty: Type) {
        for block in self.blocks.iter_mut().rev() {
            if let Some(symbol) = block.get_mut(name) {
                symbol.ty = ty;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn global_definitions_get_sequential_slots() {
        let mut table = SymbolTable::global();
        let a = table.define("a".into(), Type::Int, true).unwrap();
        let b = table.define("b".into(), Type::Float, false).unwrap();
        assert_eq!(a.scope, ScopeKind::Global);
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert!(!b.mutable);
    }

    #[test]
    fn duplicate_definition_in_one_block_is_rejected() {
        let mut table = SymbolTable::global();
        assert!(table.define("a".into(), Type::Int, true).is_some());
        assert!(table.define("a".into(), Type::Int, true).is_none());
    }

    #[test]
    fn blocks_shadow_and_unshadow() {
        let mut table = SymbolTable::global();
        table.define("x".into(), Type::Int, true).unwrap();
        table.push_block();
        table.define("x".into(), Type::Str, true).unwrap();
        assert_eq!(table.resolve("x").unwrap().ty, Type::Str);
        table.pop_block();
        assert_eq!(table.resolve("x").unwrap().ty, Type::Int);
    }

    #[test]
    fn locals_in_functions() {
        let global = SymbolTable::global();
        let mut table = SymbolTable::enclosed(global);
        let n = table.define("n".into(), Type::Int, true).unwrap();
        assert_eq!(n.scope, ScopeKind::Local);
        assert_eq!(n.index, 0);
    }

    #[test]
    fn globals_resolve_without_capture() {
        let mut global = SymbolTable::global();
        global.define("g".into(), Type::Int, true).unwrap();
        let mut inner = SymbolTable::enclosed(global);
        let g = inner.resolve("g").unwrap();
        assert_eq!(g.scope, ScopeKind::Global);
        assert!(inner.free_symbols.is_empty());
    }

    #[test]
    fn enclosing_locals_are_promoted_to_free() {
        let global = SymbolTable::global();
        let mut middle = SymbolTable::enclosed(global);
        middle.define("c".into(), Type::Int, true).unwrap();

        let mut inner = SymbolTable::enclosed(middle);
        let c = inner.resolve("c").unwrap();
        assert_eq!(c.scope, ScopeKind::Free);
        assert_eq!(c.index, 0);
        assert_eq!(inner.free_symbols.len(), 1);
        assert_eq!(inner.free_symbols[0].scope, ScopeKind::Local);

        // Resolving again reuses the same capture slot.
        let again = inner.resolve("c").unwrap();
        assert_eq!(again.index, 0);
        assert_eq!(inner.free_symbols.len(), 1);
    }

    #[test]
    fn transitive_capture_through_two_levels() {
        let global = SymbolTable::global();
        let mut outer = SymbolTable::enclosed(global);
        outer.define("x".into(), Type::Int, true).unwrap();
        let middle = SymbolTable::enclosed(outer);
        let mut inner = SymbolTable::enclosed(middle);

        let x = inner.resolve("x").unwrap();
        assert_eq!(x.scope, ScopeKind::Free);

        // The middle table captured it from the outer function, and the
        // inner table captured the middle's free slot.
        let middle = inner.into_outer().unwrap();
        assert_eq!(middle.free_symbols.len(), 1);
        assert_eq!(middle.free_symbols[0].scope, ScopeKind::Local);
    }

    #[test]
    fn num_definitions_is_a_high_water_mark() {
        let global = SymbolTable::global();
        let mut table = SymbolTable::enclosed(global);
        table.define("a".into(), Type::Int, true).unwrap();
        table.push_block();
        table.define("b".into(), Type::Int, true).unwrap();
        table.pop_block();
        table.push_block();
        table.define("c".into(), Type::Int, true).unwrap();
        table.pop_block();
        // Slots are not reused across sibling blocks.
        assert_eq!(table.num_definitions, 3);
    }
}
