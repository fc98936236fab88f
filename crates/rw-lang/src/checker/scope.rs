use std::cell::Cell;
use std::collections::HashMap;

use crate::types::Type;

// ---------------------------------------------------------------------------
// Scope — name → type bindings during checking
// ---------------------------------------------------------------------------

/// What a workflow-scope name is bound to.
#[derive(Debug, Clone)]
pub(crate) enum ScopeBinding {
    /// A declaration, scatter variable, or section exposure (lifted).
    Value(Type),
    /// A call: its outputs, addressed as `call.output`. When the binding is
    /// a section exposure the output types are already lifted.
    Call(Vec<(String, Type)>),
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeEntry {
    /// Index of the defining node within its scope level; compared against
    /// the level's cursor to detect forward references.
    pub order: usize,
    pub binding: ScopeBinding,
    /// A section exposure: the same name re-bound at the enclosing level
    /// with a lifted type. The defining node inside the section may shadow
    /// it without a collision.
    pub exposure: bool,
}

/// One lexical level of bindings, chained to its parent. Section exposures
/// are re-bound in the enclosing level with lifted types, so each level
/// sees inner names unlifted and outer levels see them lifted.
#[derive(Debug, Default)]
pub(crate) struct Scope<'p> {
    entries: HashMap<String, ScopeEntry>,
    /// Advanced during the checking pass; entries with `order` beyond the
    /// cursor are forward references.
    cursor: Cell<usize>,
    parent: Option<&'p Scope<'p>>,
}

/// Successful lookup: the entry plus whether the reference is forward
/// relative to the level that defines it.
pub(crate) struct Resolved<'a> {
    pub entry: &'a ScopeEntry,
    pub forward: bool,
}

impl<'p> Scope<'p> {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn child(&'p self) -> Scope<'p> {
        Scope {
            entries: HashMap::new(),
            cursor: Cell::new(0),
            parent: Some(self),
        }
    }

    /// Bind a name at this level; returns false (keeping the first binding)
    /// when the name is already bound here or in an enclosing level. An
    /// existing *exposure* entry does not conflict — the defining node
    /// inside the section legitimately shadows its own lifted re-binding.
    pub fn bind(&mut self, name: &str, order: usize, binding: ScopeBinding, exposure: bool) -> bool {
        if let Some(existing) = self.resolve(name) {
            // Shadowing is only legitimate across levels: the defining node
            // one level down from its own exposure.
            let same_level = self.entries.contains_key(name);
            if !existing.entry.exposure || exposure || same_level {
                return false;
            }
        }
        self.entries.insert(
            name.to_string(),
            ScopeEntry {
                order,
                binding,
                exposure,
            },
        );
        true
    }

    /// Move this level's cursor to the node currently being checked.
    pub fn advance(&self, order: usize) {
        self.cursor.set(order);
    }

    pub fn resolve(&self, name: &str) -> Option<Resolved<'_>> {
        if let Some(entry) = self.entries.get(name) {
            return Some(Resolved {
                entry,
                forward: entry.order > self.cursor.get(),
            });
        }
        self.parent.and_then(|p| p.resolve(name))
    }

    /// Call output lookup: `call_name.output_name`.
    pub fn call_output(&self, call_name: &str, output: &str) -> Option<(Type, bool)> {
        let resolved = self.resolve(call_name)?;
        match &resolved.entry.binding {
            ScopeBinding::Call(outputs) => outputs
                .iter()
                .find(|(n, _)| n == output)
                .map(|(_, t)| (t.clone(), resolved.forward)),
            ScopeBinding::Value(_) => None,
        }
    }
}
