//! Constant folding
//!
//! Machine operations fold with the target's fixed-width semantics: integer
//! results wrap at the gate's width (`ArchWord` is the target pointer width),
//! shift counts are masked, and floats follow IEEE 754. Typed JS operations
//! on tagged constants fold with JS numeric semantics.
//!
//! Operations whose result is target-defined are left alone: integer
//! division or remainder by zero, `MIN / -1`, and float-to-int conversions of
//! out-of-range values.

use super::{PassStats, PassVisitor, VisitResult};
use crate::circuit::layout;
use crate::circuit::{
    Circuit, FcmpCond, GateMeta, GateRef, GateType, IcmpCond, MachineType, OpCode, TypedBinOp, TypedUnOp,
};
use crate::config::CompilerOptions;
use num_traits::ToPrimitive;

pub struct ConstantFolding {
    pointer_bits: u32,
    folded: u64,
    trace: bool,
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Sign-extend the low `width` bits of `value`
fn sext(value: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return value as i64;
    }
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

fn float_of(bits: u64, mt: MachineType) -> f64 {
    match mt {
        MachineType::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits),
    }
}

fn float_bits(value: f64, mt: MachineType) -> u64 {
    match mt {
        MachineType::F32 => (value as f32).to_bits() as u64,
        _ => value.to_bits(),
    }
}

/// JS ToInt32
fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let truncated = value.trunc();
    let modulo = truncated.rem_euclid(4294967296.0);
    modulo as u64 as u32 as i32
}

fn to_uint32(value: f64) -> u32 {
    to_int32(value) as u32
}

impl ConstantFolding {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            pointer_bits: options.pointer_bits(),
            folded: 0,
            trace: options.trace_enabled("constant-folding"),
        }
    }

    pub fn folded(&self) -> u64 {
        self.folded
    }

    fn width(&self, mt: MachineType) -> u32 {
        mt.bit_width(self.pointer_bits)
    }

    fn fold_int_binary(&self, op: OpCode, mt: MachineType, a: u64, b: u64) -> Option<u64> {
        let width = self.width(mt);
        if width == 0 {
            return None;
        }
        let m = mask(width);
        let (a, b) = (a & m, b & m);
        let (sa, sb) = (sext(a, width), sext(b, width));
        let shift = (b & (width.max(1) as u64 - 1)) as u32;
        let min = sext(1u64 << (width - 1), width);
        let value = match op {
            OpCode::Add => a.wrapping_add(b),
            OpCode::Sub => a.wrapping_sub(b),
            OpCode::Mul => a.wrapping_mul(b),
            OpCode::And => a & b,
            OpCode::Or => a | b,
            OpCode::Xor => a ^ b,
            OpCode::Shl => a.checked_shl(shift).unwrap_or(0),
            OpCode::Lsr => a.checked_shr(shift).unwrap_or(0),
            OpCode::Asr => sa.checked_shr(shift).unwrap_or(if sa < 0 { -1 } else { 0 }) as u64,
            OpCode::Sdiv | OpCode::Smod => {
                if sb == 0 || (sa == min && sb == -1) {
                    return None;
                }
                let r = if op == OpCode::Sdiv { sa.checked_div(sb)? } else { sa.checked_rem(sb)? };
                r as u64
            }
            OpCode::Udiv => a.checked_div(b)?,
            OpCode::Umod => a.checked_rem(b)?,
            _ => return None,
        };
        Some(value & m)
    }

    fn fold_icmp(&self, cond: IcmpCond, mt: MachineType, a: u64, b: u64) -> bool {
        let width = self.width(mt);
        let m = mask(width);
        let (a, b) = (a & m, b & m);
        let (sa, sb) = (sext(a, width), sext(b, width));
        match cond {
            IcmpCond::Eq => a == b,
            IcmpCond::Ne => a != b,
            IcmpCond::Slt => sa < sb,
            IcmpCond::Sle => sa <= sb,
            IcmpCond::Sgt => sa > sb,
            IcmpCond::Sge => sa >= sb,
            IcmpCond::Ult => a < b,
            IcmpCond::Ule => a <= b,
            IcmpCond::Ugt => a > b,
            IcmpCond::Uge => a >= b,
        }
    }

    fn fold_fcmp(cond: FcmpCond, a: f64, b: f64) -> bool {
        match cond {
            FcmpCond::Oeq => a == b,
            FcmpCond::Une => a != b,
            FcmpCond::Olt => a < b,
            FcmpCond::Ole => a <= b,
            FcmpCond::Ogt => a > b,
            FcmpCond::Oge => a >= b,
        }
    }

    fn fold_conversion(&self, op: OpCode, from: MachineType, to: MachineType, bits: u64) -> Option<u64> {
        let in_width = self.width(from);
        let out_mask = mask(self.width(to));
        let value = match op {
            OpCode::Sext => sext(bits, in_width) as u64 & out_mask,
            OpCode::Zext => bits & mask(in_width),
            OpCode::Trunc => bits & out_mask,
            OpCode::Bitcast => bits & out_mask,
            OpCode::Fext => float_bits(float_of(bits, from), to),
            OpCode::Ftrunc => float_bits(float_of(bits, from), MachineType::F32),
            OpCode::SignedIntToFloat => float_bits(sext(bits, in_width) as f64, to),
            OpCode::FloatToSignedInt => {
                let value = float_of(bits, from).trunc();
                let converted = match self.width(to) {
                    8 => value.to_i8().map(|v| v as i64),
                    16 => value.to_i16().map(|v| v as i64),
                    32 => value.to_i32().map(|v| v as i64),
                    _ => value.to_i64(),
                }?;
                converted as u64 & out_mask
            }
            OpCode::Fsqrt => float_bits(float_of(bits, from).sqrt(), to),
            OpCode::Fabs => float_bits(float_of(bits, from).abs(), to),
            OpCode::Ffloor => float_bits(float_of(bits, from).floor(), to),
            _ => return None,
        };
        Some(value)
    }

    fn fold_typed_binary(op: TypedBinOp, a: f64, b: f64) -> (u64, GateType) {
        let number = |v: f64| {
            let bits = layout::tagged_number(v);
            let gt = if layout::is_tagged_int(bits) { GateType::IntType } else { GateType::DoubleType };
            (bits, gt)
        };
        let boolean = |v: bool| (layout::tagged_bool(v), GateType::BooleanType);
        let int = |v: i32| (layout::tagged_int(v), GateType::IntType);
        match op {
            TypedBinOp::Add => number(a + b),
            TypedBinOp::Sub => number(a - b),
            TypedBinOp::Mul => number(a * b),
            TypedBinOp::Div => number(a / b),
            TypedBinOp::Mod => number(a % b),
            TypedBinOp::Less => boolean(a < b),
            TypedBinOp::LessEq => boolean(a <= b),
            TypedBinOp::Greater => boolean(a > b),
            TypedBinOp::GreaterEq => boolean(a >= b),
            TypedBinOp::Eq => boolean(a == b),
            TypedBinOp::NotEq => boolean(a != b),
            TypedBinOp::And => int(to_int32(a) & to_int32(b)),
            TypedBinOp::Or => int(to_int32(a) | to_int32(b)),
            TypedBinOp::Xor => int(to_int32(a) ^ to_int32(b)),
            TypedBinOp::Shl => int(to_int32(a).wrapping_shl(to_uint32(b) & 31)),
            TypedBinOp::Ashr => int(to_int32(a) >> (to_uint32(b) & 31)),
            TypedBinOp::Shr => number((to_uint32(a) >> (to_uint32(b) & 31)) as f64),
        }
    }

    fn fold_typed_unary(op: TypedUnOp, a: f64) -> (u64, GateType) {
        let bits = match op {
            TypedUnOp::Inc => layout::tagged_number(a + 1.0),
            TypedUnOp::Dec => layout::tagged_number(a - 1.0),
            TypedUnOp::Neg => layout::tagged_number(-a),
            TypedUnOp::Not => layout::tagged_int(!to_int32(a)),
        };
        let gt = if layout::is_tagged_int(bits) { GateType::IntType } else { GateType::DoubleType };
        (bits, gt)
    }

    /// Folded `(machine type, bits, gate type)` for `gate`, if any
    fn fold(&self, circuit: &Circuit, gate: GateRef) -> Option<(MachineType, u64, GateType)> {
        let acc = circuit.acc();
        let op = acc.opcode(gate);
        let mt = acc.machine_type(gate);
        let machine = |bits: u64| Some((mt, bits, GateType::NJSValue));
        let constant = |index: usize| acc.constant_value(acc.value_in(gate, index));
        let input_mt = |index: usize| acc.machine_type(acc.value_in(gate, index));

        match op {
            _ if op.is_int_binary() => {
                let (a, b) = (constant(0)?, constant(1)?);
                machine(self.fold_int_binary(op, mt, a, b)?)
            }
            _ if op.is_float_binary() => {
                let (a, b) = (float_of(constant(0)?, mt), float_of(constant(1)?, mt));
                let value = match op {
                    OpCode::Fadd => a + b,
                    OpCode::Fsub => a - b,
                    OpCode::Fmul => a * b,
                    OpCode::Fdiv => a / b,
                    _ => a % b,
                };
                machine(float_bits(value, mt))
            }
            OpCode::Icmp => {
                let (a, b) = (constant(0)?, constant(1)?);
                let GateMeta::Icmp(cond) = acc.meta(gate) else { return None };
                machine(self.fold_icmp(*cond, input_mt(0), a, b) as u64)
            }
            OpCode::Fcmp => {
                let a = float_of(constant(0)?, input_mt(0));
                let b = float_of(constant(1)?, input_mt(1));
                let GateMeta::Fcmp(cond) = acc.meta(gate) else { return None };
                machine(Self::fold_fcmp(*cond, a, b) as u64)
            }
            _ if op.is_conversion() || matches!(op, OpCode::Fsqrt | OpCode::Fabs | OpCode::Ffloor) => {
                let bits = constant(0)?;
                machine(self.fold_conversion(op, input_mt(0), mt, bits)?)
            }
            OpCode::TypedBinaryOp => {
                let a = layout::untag_number(constant(0)?)?;
                let b = layout::untag_number(constant(1)?)?;
                let GateMeta::TypedBinary { op, .. } = acc.meta(gate) else { return None };
                let (bits, gt) = Self::fold_typed_binary(*op, a, b);
                Some((MachineType::I64, bits, gt))
            }
            OpCode::TypedUnaryOp => {
                let a = layout::untag_number(constant(0)?)?;
                let GateMeta::TypedUnary { op, .. } = acc.meta(gate) else { return None };
                let (bits, gt) = Self::fold_typed_unary(*op, a);
                Some((MachineType::I64, bits, gt))
            }
            _ => None,
        }
    }
}

impl PassVisitor for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult {
        let acc = circuit.acc();
        // Select on a constant condition picks its arm
        if acc.opcode(gate) == OpCode::Select {
            if let Some(cond) = acc.constant_value(acc.value_in(gate, 0)) {
                self.folded += 1;
                let arm = if cond & 1 == 1 { 1 } else { 2 };
                return VisitResult::Replace(acc.value_in(gate, arm));
            }
            return VisitResult::NoChange;
        }
        let Some((mt, bits, gt)) = self.fold(circuit, gate) else {
            return VisitResult::NoChange;
        };
        let folded = circuit.constant(mt, bits, gt);
        self.folded += 1;
        if self.trace {
            tracing::debug!("constant-folding: {} => {}", circuit.dump_gate(gate), circuit.dump_gate(folded));
        }
        VisitResult::Replace(folded)
    }

    fn finish(&mut self, stats: &mut PassStats) {
        stats.bump("constant-folding.folded", self.folded);
        self.folded = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuilder, CircuitInfo};
    use crate::pass::GraphVisitor;
    use crate::pgo::MethodId;

    fn fold_one(build: impl FnOnce(&mut CircuitBuilder) -> GateRef) -> (Circuit, GateRef, GateRef) {
        let mut circuit = Circuit::new(CircuitInfo::new("fold", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let op = build(&mut builder);
        let ret = builder.ret(op);
        let mut folding = ConstantFolding::new(&CompilerOptions::default());
        GraphVisitor::new().run(&mut circuit, &mut [&mut folding]).unwrap();
        let result = circuit.acc().value_in(ret, 0);
        (circuit, op, result)
    }

    #[test]
    fn test_add_folds_to_constant() {
        let (circuit, op, result) = fold_one(|b| {
            let x = b.int32(14);
            let y = b.int32(7);
            b.int_add(MachineType::I32, x, y)
        });
        assert_eq!(circuit.acc().constant_value(result), Some(21));
        assert_eq!(circuit.gate(op).op(), OpCode::Nop);
    }

    #[test]
    fn test_i32_wraps() {
        let (circuit, _, result) = fold_one(|b| {
            let x = b.int32(i32::MAX);
            let y = b.int32(1);
            b.int_add(MachineType::I32, x, y)
        });
        assert_eq!(circuit.acc().constant_value(result), Some(i32::MIN as u32 as u64));
    }

    #[test]
    fn test_division_by_zero_is_kept() {
        let (circuit, op, result) = fold_one(|b| {
            let x = b.int32(1);
            let y = b.int32(0);
            b.binary(OpCode::Sdiv, MachineType::I32, x, y)
        });
        assert_eq!(result, op);
        assert_eq!(circuit.gate(op).op(), OpCode::Sdiv);
    }

    #[test]
    fn test_signed_compare_uses_width() {
        let (circuit, _, result) = fold_one(|b| {
            let x = b.int32(-1);
            let y = b.int32(1);
            b.icmp(IcmpCond::Slt, x, y)
        });
        assert_eq!(circuit.acc().constant_value(result), Some(1));
    }

    #[test]
    fn test_arch_word_follows_target() {
        let options = CompilerOptions {
            target: crate::config::TargetConfig {
                arch: crate::config::TargetArch::Arm32,
                little_endian: true,
            },
            ..CompilerOptions::default()
        };
        let folding = ConstantFolding::new(&options);
        assert_eq!(folding.fold_int_binary(OpCode::Add, MachineType::ArchWord, 0xFFFF_FFFF, 1), Some(0));
        let wide = ConstantFolding::new(&CompilerOptions::default());
        assert_eq!(wide.fold_int_binary(OpCode::Add, MachineType::ArchWord, 0xFFFF_FFFF, 1), Some(1 << 32));
    }

    #[test]
    fn test_float_to_int_out_of_range_is_kept() {
        let folding = ConstantFolding::new(&CompilerOptions::default());
        let big = 1e20f64.to_bits();
        assert_eq!(folding.fold_conversion(OpCode::FloatToSignedInt, MachineType::F64, MachineType::I32, big), None);
        let ok = (-7.9f64).to_bits();
        assert_eq!(
            folding.fold_conversion(OpCode::FloatToSignedInt, MachineType::F64, MachineType::I32, ok),
            Some(-7i32 as u32 as u64)
        );
    }

    #[test]
    fn test_js_semantics() {
        let (bits, gt) = ConstantFolding::fold_typed_binary(TypedBinOp::Div, 1.0, 2.0);
        assert_eq!(gt, GateType::DoubleType);
        assert_eq!(layout::untag_double(bits), 0.5);
        let (bits, gt) = ConstantFolding::fold_typed_binary(TypedBinOp::Mul, 6.0, 7.0);
        assert_eq!((layout::untag_int(bits), gt), (42, GateType::IntType));
        let (bits, _) = ConstantFolding::fold_typed_binary(TypedBinOp::Shr, -1.0, 0.0);
        assert_eq!(layout::untag_double(bits), 4294967295.0);
        let (bits, gt) = ConstantFolding::fold_typed_binary(TypedBinOp::Less, f64::NAN, 1.0);
        assert_eq!((bits, gt), (layout::VALUE_FALSE, GateType::BooleanType));
        let (bits, _) = ConstantFolding::fold_typed_unary(TypedUnOp::Neg, 0.0);
        assert!(layout::is_tagged_double(bits));
        assert_eq!(to_int32(4294967297.0), 1);
    }
}
