//! End-to-end scenarios driven entirely through the `Vm` facade, the
//! way `cranelift/jit/tests/basic.rs` exercises `JITModule` without
//! reaching into its internals.

use vmcore::error::VmError;
use vmcore::value::Value;
use vmcore::Vm;

fn init() {
    let _ = pretty_env_logger::try_init();
}

#[test]
fn push_add_quit_returns_sum() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("push.i 3\npush.i 4\nadd.i\nquit").unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(7));
}

#[test]
fn float_division_round_trips() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("push.f 7.0\npush.f 2.0\ndiv.f\nquit").unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Float(3.5));
}

#[test]
fn integer_division_by_zero_is_reported() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("push.i 1\npush.i 0\ndiv.i\nquit").unwrap();
    assert!(matches!(
        vm.run_interpreted(),
        Err(VmError::OutOfBounds { .. })
    ));
}

#[test]
fn stack_underflow_on_pop_from_empty_stack() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("pop.i\nquit").unwrap();
    assert!(matches!(
        vm.run_interpreted(),
        Err(VmError::OutOfBounds { .. })
    ));
}

#[test]
fn dup_then_add_doubles_the_top() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("push.i 5\ndup.i\nadd.i\nquit").unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(10));
}

#[test]
fn cmp_then_je_takes_the_branch_on_equality() {
    init();
    let text = "\
        push.i 2\n\
        push.i 2\n\
        cmp.i\n\
        je equal\n\
        push.i 0\n\
        jmp end\n\
        equal: push.i 1\n\
        end: quit\n";
    let mut vm = Vm::new();
    vm.load_asm(text).unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(1));
}

#[test]
fn call_and_ret_cross_a_context_boundary() {
    init();
    let text = "\
        jmp main\n\
        adder: push.i 10\n\
        add.i\n\
        ret\n\
        main: push.i 5\n\
        call adder\n\
        quit\n";
    let mut vm = Vm::new();
    vm.load_asm(text).unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(15));
}

#[test]
fn bytecode_round_trip_through_a_temp_file() {
    init();
    let mut vm = Vm::new();
    vm.load_asm("push.i 3\npush.i 4\nmul.i\nquit").unwrap();
    let bytes = vm.dump_bytecode().unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &bytes).unwrap();
    let read_back = std::fs::read(file.path()).unwrap();

    let mut vm2 = Vm::new();
    vm2.load_bytecode(&read_back).unwrap();
    assert_eq!(vm2.run_interpreted().unwrap(), Value::Integer(12));
}

#[test]
fn malformed_bytecode_signature_is_a_format_error() {
    init();
    let mut vm = Vm::new();
    let garbage = vec![0u8; 16];
    assert!(matches!(
        vm.load_bytecode(&garbage),
        Err(VmError::FormatError(_))
    ));
}

#[test]
fn nfc_suppresses_flag_capture_across_an_add() {
    init();
    // With NFC set, the add's own flags are not re-derived, so the
    // earlier `cmp`'s je still sees the comparison's flags rather than
    // the add's result.
    let text = "\
        push.i 1\n\
        push.i 1\n\
        cmp.i\n\
        snfc\n\
        push.i 100\n\
        push.i 1\n\
        add.i\n\
        cnfc\n\
        je was_equal\n\
        push.i 0\n\
        jmp end\n\
        was_equal: push.i 1\n\
        end: quit\n";
    let mut vm = Vm::new();
    vm.load_asm(text).unwrap();
    assert_eq!(vm.run_interpreted().unwrap(), Value::Integer(1));
}
