//! The option scope stack.
//!
//! Options are hierarchical: invoking an option maps in its child
//! options, and those children have a limited lifetime — they last until
//! a sibling option is invoked or the parse commits to a new top-level
//! positional argument. Each scope gets an opaque [`ScopeToken`]; a
//! successful lookup reports the token of the scope it matched in, so
//! dispatch can pop every scope above it before pushing the fresh child
//! scope.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use appeal_compiler::{CharmProgram, GroupId};
use appeal_core::{InternalError, OptionKey};

use crate::converter::ConverterIx;

/// What an option resolves to: the program to call, the argument group
/// the mapping belongs to (for laden marking), and the converter whose
/// keyword slot it fills (for sibling expiry).
#[derive(Debug, Clone)]
pub struct MappedOption {
    pub program: Arc<CharmProgram>,
    pub group: GroupId,
    pub owner: ConverterIx,
}

/// Identifies one option scope for targeted popping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeToken(u64);

#[derive(Debug, Default)]
struct Scope {
    options: FxHashMap<OptionKey, MappedOption>,
    token: ScopeToken,
}

impl Default for ScopeToken {
    fn default() -> Self {
        ScopeToken(0)
    }
}

/// The scope stack. The bottom scope holds the permanently-mapped
/// options; everything above it is child scopes.
#[derive(Debug)]
pub struct OptionScopes {
    /// All scopes, bottom first. Never empty.
    stack: Vec<Scope>,
    next_token: u64,
}

impl Default for OptionScopes {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionScopes {
    pub fn new() -> Self {
        Self {
            stack: vec![Scope {
                options: FxHashMap::default(),
                token: ScopeToken(1),
            }],
            next_token: 2,
        }
    }

    /// The token of the current (top) scope.
    pub fn token(&self) -> ScopeToken {
        self.stack.last().map(|s| s.token).unwrap_or_default()
    }

    /// Map an option in the current scope.
    pub fn insert(&mut self, option: OptionKey, mapped: MappedOption) {
        if let Some(top) = self.stack.last_mut() {
            top.options.insert(option, mapped);
        }
    }

    /// Push a fresh child scope.
    pub fn push(&mut self) {
        let token = ScopeToken(self.next_token);
        self.next_token += 1;
        self.stack.push(Scope {
            options: FxHashMap::default(),
            token,
        });
    }

    /// Resolve an option, walking from the top scope toward the bottom.
    /// Reports the token of the scope the option was found in.
    pub fn lookup(&self, option: &OptionKey) -> Option<(MappedOption, ScopeToken)> {
        self.stack
            .iter()
            .rev()
            .find_map(|scope| scope.options.get(option).map(|m| (m.clone(), scope.token)))
    }

    /// Pop scopes until the scope holding `token` is on top.
    pub fn pop_until(&mut self, token: ScopeToken) -> Result<(), InternalError> {
        if !self.stack.iter().any(|s| s.token == token) {
            return Err(InternalError::new(format!(
                "option scope token {token:?} does not exist"
            )));
        }
        while self
            .stack
            .last()
            .is_some_and(|scope| scope.token != token)
        {
            self.stack.pop();
        }
        Ok(())
    }

    /// Drop every child scope, leaving only the bottom scope with the
    /// permanently-mapped options.
    pub fn unmap_all_children(&mut self) {
        self.stack.truncate(1);
    }

    /// Keep only the mappings `keep` approves of, in every scope.
    ///
    /// Used for sibling expiry: once a positional argument lands in one
    /// converter subtree, options belonging to disjoint sibling subtrees
    /// are no longer accepted.
    pub fn retain(&mut self, mut keep: impl FnMut(&MappedOption) -> bool) {
        for scope in &mut self.stack {
            scope.options.retain(|_, mapped| keep(mapped));
        }
    }

    /// How many scopes are live.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appeal_compiler::Assembler;

    fn mapped(group: u32) -> MappedOption {
        let program = Assembler::new("test").assemble().unwrap();
        MappedOption {
            program: Arc::new(program),
            group: GroupId(group),
            owner: ConverterIx(0),
        }
    }

    #[test]
    fn lookup_walks_top_down() {
        let mut scopes = OptionScopes::new();
        let v = OptionKey::Short('v');
        scopes.insert(v.clone(), mapped(1));
        scopes.push();
        scopes.insert(v.clone(), mapped(2));

        let (found, token) = scopes.lookup(&v).unwrap();
        assert_eq!(found.group, GroupId(2));
        assert_eq!(token, scopes.token());
    }

    #[test]
    fn pop_until_targets_a_scope() {
        let mut scopes = OptionScopes::new();
        let base = scopes.token();
        scopes.insert(OptionKey::Short('a'), mapped(1));
        scopes.push();
        scopes.push();
        assert_eq!(scopes.depth(), 3);

        scopes.pop_until(base).unwrap();
        assert_eq!(scopes.depth(), 1);
        assert!(scopes.lookup(&OptionKey::Short('a')).is_some());
    }

    #[test]
    fn pop_until_unknown_token_is_internal_error() {
        let mut scopes = OptionScopes::new();
        assert!(scopes.pop_until(ScopeToken(99)).is_err());
    }

    #[test]
    fn unmap_all_children_keeps_the_base() {
        let mut scopes = OptionScopes::new();
        scopes.insert(OptionKey::Short('a'), mapped(1));
        scopes.push();
        scopes.insert(OptionKey::Short('b'), mapped(2));
        scopes.unmap_all_children();
        assert!(scopes.lookup(&OptionKey::Short('a')).is_some());
        assert!(scopes.lookup(&OptionKey::Short('b')).is_none());
    }
}
