//! End-to-end tests: emit real functions, finalize, and call them.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::ffi::c_void;

use lumojit::{
    AbiParam, CallTarget, Cond, Emitter, F0, F1, Intrinsic, IntrinsicTable, JitError, Operand, R0,
    R1, R2, V0,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn and_immediate_masks_across_the_word() {
    init_logging();
    let build = |mask: u64| {
        let mut e = Emitter::new();
        e.load_args(&[Operand::AbiWord(R0)]);
        e.andi(R0, R0, mask);
        e.retr(R0);
        e.finalize().unwrap()
    };

    let low = build(1);
    let f: extern "C" fn(i64) -> i64 = unsafe { low.entry_fn() };
    assert_eq!(f(0x7FFF_FFFF), 1);
    assert_eq!(f(0x8000_0000), 0);

    let wide = build(0x7FFF_FFFF);
    let f: extern "C" fn(i64) -> i64 = unsafe { wide.entry_fn() };
    assert_eq!(f(0x7FFF_FFFF), 0x7FFF_FFFF);
    assert_eq!(f(0x8000_0000), 0);
    assert_eq!(f(-1), 0x7FFF_FFFF);

    let hi = build(0xFFFF_FFFF_0000_0000);
    let f: extern "C" fn(u64) -> u64 = unsafe { hi.entry_fn() };
    assert_eq!(f(0x1234_5678_9ABC_DEF0), 0x1234_5678_0000_0000);
}

#[test]
fn single_float_multiply_is_exact() {
    init_logging();
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiFloat(F0), Operand::AbiFloat(F1)]);
    e.mulr_f(F0, F0, F1);
    e.retr_f(F0);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(f32, f32) -> f32 = unsafe { code.entry_fn() };
    assert_eq!(f(-0.5, 0.5), -0.25);
    assert_eq!(f(0.25, 0.75), 0.1875);
}

#[test]
fn borrow_propagates_from_subtract() {
    init_logging();
    // Returns all-ones iff a - b borrowed (unsigned a < b).
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiWord(R0), Operand::AbiWord(R1)]);
    e.movi(R2, 0);
    e.subcr(R0, R0, R1);
    e.subxi(R2, R2, 0);
    e.retr(R2);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(u64, u64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(0, 1), -1);
    assert_eq!(f(1, 1), 0);
    assert_eq!(f(1, 0), 0);
    assert_eq!(f(0x8000_0000_0000_0000, 1), 0);
    assert_eq!(f(0x7FFF_FFFF, 0x8000_0000), -1);
}

#[test]
fn float_store_writes_only_its_slot() {
    init_logging();
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiWord(R0), Operand::AbiFloat(F0)]);
    e.str_f(R0, 0, F0);
    e.ret();
    let code = e.finalize().unwrap();
    let f: extern "C" fn(*mut f32, f32) = unsafe { code.entry_fn() };

    let mut arr = [1.0f32, 2.0, 3.0];
    f(&mut arr[1], 42.5);
    assert_eq!(arr, [1.0, 42.5, 3.0]);
}

#[test]
fn backward_and_forward_branches_resolve() {
    init_logging();
    // Sums 1..=n with a backward loop branch and a forward exit branch.
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiWord(R0)]);
    e.movi(R1, 0);
    let head = e.new_label();
    let done = e.new_label();
    e.bind(head);
    e.brcmpi(Cond::Eq, R0, 0, done);
    e.addr(R1, R1, R0);
    e.subi(R0, R0, 1);
    e.jmp(head);
    e.bind(done);
    e.retr(R1);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(0), 0);
    assert_eq!(f(5), 15);
    assert_eq!(f(100), 5050);
}

#[test]
fn signed_and_unsigned_compares_differ() {
    init_logging();
    let build = |cond: Cond| {
        let mut e = Emitter::new();
        e.load_args(&[Operand::AbiWord(R0), Operand::AbiWord(R1)]);
        let t = e.new_label();
        e.brcmp(cond, R0, R1, t);
        e.movi(R0, 0);
        e.ret();
        e.bind(t);
        e.movi(R0, 1);
        e.retr(R0);
        e.finalize().unwrap()
    };
    // The code objects must outlive the calls; dropping them unmaps the
    // region the function pointers point into.
    let ult_code = build(Cond::Ult);
    let slt_code = build(Cond::Lt);
    let ult: extern "C" fn(i64, i64) -> i64 = unsafe { ult_code.entry_fn() };
    let slt: extern "C" fn(i64, i64) -> i64 = unsafe { slt_code.entry_fn() };
    // -1 is unsigned max
    assert_eq!(ult(-1, 1), 0);
    assert_eq!(slt(-1, 1), 1);
    assert_eq!(ult(1, -1), 1);
    assert_eq!(slt(1, -1), 0);
}

#[test]
fn reinvocation_is_idempotent() {
    init_logging();
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiWord(R0)]);
    e.addi(R0, R0, 7);
    e.retr(R0);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { code.entry_fn() };
    for i in 0..10 {
        assert_eq!(f(i), i + 7);
    }
}

#[test]
fn unbound_label_fails_finalize() {
    let mut e = Emitter::new();
    let never = e.new_label();
    e.jmp(never);
    assert!(matches!(e.finalize(), Err(JitError::UnboundLabel(_))));
}

#[test]
fn empty_buffer_fails_finalize() {
    let e = Emitter::new();
    assert!(matches!(e.finalize(), Err(JitError::EmptyBuffer)));
}

extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
    a + b + c
}

#[test]
fn native_call_marshals_register_arguments() {
    init_logging();
    // f(x) = add3(x, 2, 30)
    let mut e = Emitter::new();
    let adj = e.enter_abi_frame(&[V0], &[], 0);
    e.load_args(&[Operand::AbiWord(V0)]);
    e.call_native(
        CallTarget::Addr(add3 as usize),
        &[
            (AbiParam::Word, Operand::Gpr(V0)),
            (AbiParam::Word, Operand::Imm(2)),
            (AbiParam::Word, Operand::Imm(30)),
        ],
    );
    e.retval(R0);
    e.leave_abi_frame(&[V0], &[], adj);
    e.retr(R0);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(10), 42);
    assert_eq!(f(-32), 0);
}

#[allow(clippy::too_many_arguments)]
extern "C" fn sum9(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
    i: i64,
) -> i64 {
    a + b + c + d + e + f + g + h + i
}

#[test]
fn native_call_spills_excess_arguments_to_the_stack() {
    init_logging();
    // f(x) = sum9(x, 2, .., 9); the tail arguments overflow the argument
    // registers on both supported targets.
    let mut e = Emitter::new();
    let adj = e.enter_abi_frame(&[V0], &[], 0);
    e.load_args(&[Operand::AbiWord(V0)]);
    let mut args = vec![(AbiParam::Word, Operand::Gpr(V0))];
    for v in 2..=9 {
        args.push((AbiParam::Word, Operand::Imm(v)));
    }
    e.call_native(CallTarget::Addr(sum9 as usize), &args);
    e.retval(R0);
    e.leave_abi_frame(&[V0], &[], adj);
    e.retr(R0);
    let code = e.finalize().unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(1), 45);
    assert_eq!(f(10), 54);
}

extern "C" fn scale_by_ten(x: i64) -> i64 {
    x * 10
}

#[test]
fn intrinsic_call_through_table() {
    init_logging();
    let mut table = IntrinsicTable::new();
    table.install(Intrinsic::Mul, scale_by_ten as *const c_void);

    // The incoming argument is already in the first ABI register, so the
    // trampoline forwards it untouched.
    let mut e = Emitter::new();
    let adj = e.enter_abi_frame(&[], &[], 0);
    e.call_intrinsic(&table, Intrinsic::Mul);
    e.leave_abi_frame(&[], &[], adj);
    e.ret();
    let code = e.finalize().unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(4), 40);
}

#[test]
fn internal_call_and_return() {
    init_logging();
    let mut e = Emitter::new();
    let helper = e.new_label();
    let adj = e.enter_abi_frame(&[], &[], 0);
    e.call(helper);
    e.retval(R0);
    e.leave_abi_frame(&[], &[], adj);
    e.retr(R0);
    e.bind(helper);
    e.movi(R0, 7);
    e.retr(R0);
    let code = e.finalize().unwrap();
    let f: extern "C" fn() -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(), 7);
}

#[test]
fn division_and_remainder() {
    init_logging();
    let mut e = Emitter::new();
    e.load_args(&[Operand::AbiWord(R0), Operand::AbiWord(R1)]);
    e.divr(R2, R0, R1);
    e.remr(R0, R0, R1);
    e.muli(R2, R2, 1000);
    e.addr(R0, R2, R0);
    e.retr(R0);
    let code = e.finalize().unwrap();
    // returns quotient * 1000 + remainder
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { code.entry_fn() };
    assert_eq!(f(17, 5), 3002);
    assert_eq!(f(-17, 5), -3002); // truncated: -3 * 1000 + -2
    assert_eq!(f(100, 10), 10_000);
}
