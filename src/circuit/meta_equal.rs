//! When two gates' metadata make them interchangeable
//!
//! Value numbering only merges gates whose metadata is "value-equal". That is
//! looser than structural equality for some opcode families, and the rules are
//! kept in one table so they can be audited and overridden in one place:
//!
//! | Family                  | Rule                                          |
//! |-------------------------|-----------------------------------------------|
//! | constants               | same raw 64-bit pattern                       |
//! | call-target checks      | same check kind; call site pc and hint ignored|
//! | everything else         | structural equality                           |
//!
//! Constants carry no machine width in their metadata, so an `i32 5` and an
//! `i64 5` have equal metadata; whether they are interchangeable as gates is
//! decided by the machine-type comparison value numbering performs on top.

use super::meta::GateMeta;
use super::opcode::{OpCode, OpFamily};
use rustc_hash::{FxHashMap as HashMap, FxHasher};
use std::hash::{Hash, Hasher};

/// Equality predicate for two metadata values of the same opcode family
pub type MetaEqFn = fn(&GateMeta, &GateMeta) -> bool;

/// Hash consistent with the matching [`MetaEqFn`]
pub type MetaHashFn = fn(&GateMeta, &mut FxHasher);

#[derive(Clone, Copy)]
pub struct MetaRule {
    pub equal: MetaEqFn,
    pub hash: MetaHashFn,
}

fn structural_equal(a: &GateMeta, b: &GateMeta) -> bool {
    a == b
}

fn structural_hash(meta: &GateMeta, state: &mut FxHasher) {
    meta.hash(state);
}

fn constant_equal(a: &GateMeta, b: &GateMeta) -> bool {
    match (a.constant_bits(), b.constant_bits()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn constant_hash(meta: &GateMeta, state: &mut FxHasher) {
    meta.constant_bits().unwrap_or(0).hash(state);
}

fn call_target_equal(a: &GateMeta, b: &GateMeta) -> bool {
    match (a, b) {
        (GateMeta::CallTarget { kind: ka, .. }, GateMeta::CallTarget { kind: kb, .. }) => ka == kb,
        _ => a == b,
    }
}

fn call_target_hash(meta: &GateMeta, state: &mut FxHasher) {
    if let GateMeta::CallTarget { kind, .. } = meta {
        kind.hash(state);
    }
}

/// Per-family metadata equality rules
#[derive(Clone)]
pub struct MetaEqualityTable {
    rules: HashMap<OpFamily, MetaRule>,
    fallback: MetaRule,
}

impl MetaEqualityTable {
    pub fn new() -> Self {
        let mut table = Self {
            rules: HashMap::default(),
            fallback: MetaRule {
                equal: structural_equal,
                hash: structural_hash,
            },
        };
        table.register(
            OpFamily::Constant,
            MetaRule {
                equal: constant_equal,
                hash: constant_hash,
            },
        );
        table.register(
            OpFamily::CallTargetCheck,
            MetaRule {
                equal: call_target_equal,
                hash: call_target_hash,
            },
        );
        table
    }

    /// Install or replace the rule for a family
    pub fn register(&mut self, family: OpFamily, rule: MetaRule) {
        self.rules.insert(family, rule);
    }

    fn rule(&self, op: OpCode) -> &MetaRule {
        self.rules.get(&op.family()).unwrap_or(&self.fallback)
    }

    pub fn equal(&self, op: OpCode, a: &GateMeta, b: &GateMeta) -> bool {
        (self.rule(op).equal)(a, b)
    }

    /// Feed the part of `meta` that the equality rule looks at into `state`
    pub fn hash_into(&self, op: OpCode, meta: &GateMeta, state: &mut FxHasher) {
        (self.rule(op).hash)(meta, state)
    }

    pub fn hash(&self, op: OpCode, meta: &GateMeta) -> u64 {
        let mut state = FxHasher::default();
        self.hash_into(op, meta, &mut state);
        state.finish()
    }
}

impl Default for MetaEqualityTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::meta::CallTargetKind;
    use crate::pgo::MethodId;

    #[test]
    fn test_constants_compare_bits() {
        let table = MetaEqualityTable::new();
        assert!(table.equal(OpCode::Constant, &GateMeta::Constant(5), &GateMeta::Constant(5)));
        assert!(!table.equal(OpCode::Constant, &GateMeta::Constant(5), &GateMeta::Constant(6)));
    }

    #[test]
    fn test_call_target_ignores_site() {
        let table = MetaEqualityTable::new();
        let a = GateMeta::CallTarget { kind: CallTargetKind::Method, pc: 3, hint: MethodId(1) };
        let b = GateMeta::CallTarget { kind: CallTargetKind::Method, pc: 9, hint: MethodId(2) };
        let c = GateMeta::CallTarget { kind: CallTargetKind::Builtin, pc: 3, hint: MethodId(1) };
        assert!(table.equal(OpCode::TypedCallTargetCheck, &a, &b));
        assert_eq!(table.hash(OpCode::TypedCallTargetCheck, &a), table.hash(OpCode::TypedCallTargetCheck, &b));
        assert!(!table.equal(OpCode::TypedCallTargetCheck, &a, &c));
    }

    #[test]
    fn test_register_overrides_family() {
        fn always(_: &GateMeta, _: &GateMeta) -> bool {
            true
        }
        fn nothing(_: &GateMeta, _: &mut FxHasher) {}
        let mut table = MetaEqualityTable::new();
        assert!(!table.equal(OpCode::Arg, &GateMeta::Arg(0), &GateMeta::Arg(1)));
        table.register(OpFamily::Arg, MetaRule { equal: always, hash: nothing });
        assert!(table.equal(OpCode::Arg, &GateMeta::Arg(0), &GateMeta::Arg(1)));
    }
}
