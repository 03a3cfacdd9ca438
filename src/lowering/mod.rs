//! Profile-guided lowering
//!
//! Three stages turn generic bytecode gates into machine-level gates:
//!
//! 1. [`SpeculativeInliner`] splices small monomorphic callees into the caller
//! 2. [`TypedBytecodeLowering`] replaces generic bytecodes by guarded typed
//!    gates using the profile samples
//! 3. [`TypedHcrLowering`] expands the typed gates into loads, stores,
//!    arithmetic and deoptimization checks
//!
//! Every stage is optional: a bytecode whose profile is missing or unusable
//! is left in its generic form.

pub mod inline;
pub mod typed_bytecode;
pub mod typed_hcr;

pub use inline::{InlineRefusal, MethodRegistry, SpeculativeInliner};
pub use typed_bytecode::{HitCount, TypedBytecodeLowering};
pub use typed_hcr::TypedHcrLowering;

use crate::circuit::{Circuit, GateRef};
use crate::pass::{replace_with, rewire_effects};

/// Splice a lowered sequence in place of `gate`: its state and depend users
/// continue after `(state, depend)`, its value users read `value`.
pub(crate) fn splice(circuit: &mut Circuit, gate: GateRef, state: GateRef, depend: GateRef, value: GateRef) {
    rewire_effects(circuit, gate, state, depend);
    replace_with(circuit, gate, value);
}
