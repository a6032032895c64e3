//! In-process integration tests.
//!
//! These tests drive the library API directly (listing → program → VM)
//! instead of spawning the CLI.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use tiervm::compiler::{ProgramBuilder, assemble};
use tiervm::config::{JitMode, RuntimeConfig};
use tiervm::vm::{ErrorKind, Opcode, Tag, Value, Vm, VmError, VmResult, bytecode};

/// Output sink shared between the test and the VM.
#[derive(Clone, Default)]
struct Captured(Rc<RefCell<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

fn interp() -> RuntimeConfig {
    RuntimeConfig {
        jit_mode: JitMode::Off,
        ..RuntimeConfig::default()
    }
}

fn run_with(source: &str, config: &RuntimeConfig) -> (VmResult<Value>, String) {
    let out = Captured::default();
    let mut vm = Vm::with_output(assemble(source).unwrap(), config, Box::new(out.clone()));
    let result = vm.run();
    (result, out.text())
}

fn run(source: &str) -> VmResult<Value> {
    run_with(source, &interp()).0
}

const FIB: &str = "
.func fib 1
    LOADINT r1, 2
    LT r2, r0, r1
    JMPF r2, recurse
    RETURN r0
recurse:
    MOVE r4, r0
    LOADINT r1, 1
    SUB r7, r4, r1
    CALL r7, fib, 1
    MOVE r5, r0
    LOADINT r1, 2
    SUB r7, r4, r1
    CALL r7, fib, 1
    ADD r0, r0, r5
    RETURN r0
.end

.func main 0
    LOADINT r1, 20
    CALL r1, fib, 1
    RETURN r0
.end
";

#[test]
fn test_add_scenario() {
    let source = "
.func main 0
    LOADINT r0, 2
    LOADINT r1, 3
    ADD r2, r0, r1
    RETURN r2
.end";
    assert_eq!(run(source), Ok(Value::int(5)));
}

#[test]
fn test_recursive_fib() {
    assert_eq!(run(FIB), Ok(Value::int(6765)));
}

#[test]
fn test_nested_calls_return_to_register_zero() {
    let source = "
.func h 0
    LOADINT r0, 7
    RETURN r0
.end
.func g 0
    CALL r1, h, 0
    RETURN r0
.end
.func f 0
    CALL r2, g, 0
    RETURN r0
.end
.func main 0
    CALL r1, f, 0
    RETURN r0
.end";
    assert_eq!(run(source), Ok(Value::int(7)));
}

#[test]
fn test_division_by_zero_scenarios() {
    let ints = "
.func main 0
    LOADINT r0, 9
    LOADINT r1, 0
    DIV r2, r0, r1
    RETURN r2
.end";
    let err = run(ints).unwrap_err();
    assert_eq!(err, VmError::DivisionByZero);
    assert_eq!(err.kind(), ErrorKind::Arithmetic);

    let floats = "
.func main 0
    LOADFLOAT r0, 9.0
    LOADFLOAT r1, 0.0
    DIV r2, r0, r1
    RETURN r2
.end";
    assert_eq!(run(floats), Ok(Value::float(f32::INFINITY)));
}

#[test]
fn test_print_and_conversions() {
    let source = "
.func main 0
    LOADINT r1, 7
    NATIVE_CALL r1, to_float, 1
    MOVE r1, r0
    LOADINT r2, 3
    NATIVE_CALL r1, print, 2
    LOADFLOAT r1, -2.75
    NATIVE_CALL r1, to_int, 1
    RETURN r0
.end";
    let (result, out) = run_with(source, &interp());
    assert_eq!(result, Ok(Value::int(-2)));
    assert_eq!(out, "7.0 3\n");
}

#[test]
fn test_print_array() {
    let source = "
.func main 0
    LOADINT r0, 2
    NEWARRAY r1, r0
    LOADINT r2, 0
    LOADINT r3, 5
    SETELEM r1, r2, r3
    NATIVE_CALL r1, print, 1
    RETURNNIL
.end";
    let (result, out) = run_with(source, &interp());
    assert_eq!(result, Ok(Value::NIL));
    assert_eq!(out, "[5, nil]\n");
}

#[test]
fn test_huge_array_is_a_resource_error() {
    let source = "
.func main 0
    LOADINT r0, 2147483647
    NEWARRAY r1, r0
    RETURN r1
.end";
    let mut vm = Vm::with_config(assemble(source).unwrap(), &interp());
    let err = vm.run().unwrap_err();
    assert_eq!(
        err,
        VmError::ArrayTooLarge {
            len: i32::MAX as usize
        }
    );
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(vm.heap().live_blocks(), 0);
}

#[test]
fn test_type_errors_are_fatal() {
    let source = "
.func main 0
    LOADINT r0, 1
    LOADNIL r1
    LT r2, r0, r1
    RETURN r2
.end";
    let err = run(source).unwrap_err();
    assert!(matches!(err, VmError::TypeMismatch { op: "LT", .. }));
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn test_arity_mismatch() {
    let source = "
.func main 0
    LOADFUNC r2, f
    INVOKEDYNAMIC r1, r2, 0
    RETURN r0
.end
.func f 1
    RETURN r0
.end";
    assert!(matches!(run(source), Err(VmError::ArityMismatch { expected: 1, got: 0, .. })));
}

#[test]
fn test_unreachable_array_is_reclaimed() {
    let source = "
.func main 0
    LOADINT r0, 3
    NEWARRAY r1, r0
    LOADNIL r1
    RETURNNIL
.end";
    let mut vm = Vm::with_config(assemble(source).unwrap(), &interp());
    assert_eq!(vm.run(), Ok(Value::NIL));
    assert_eq!(vm.heap().live_blocks(), 1);

    let weak = Rc::downgrade(&vm.heap().share(0).unwrap());
    assert_eq!(vm.collect_garbage(), 1);
    assert!(weak.upgrade().is_none());
    assert_eq!(vm.heap().live_blocks(), 0);
}

#[test]
fn test_returned_array_survives_collection() {
    let source = "
.func main 0
    LOADINT r0, 2
    NEWARRAY r1, r0
    LOADINT r2, 0
    LOADINT r3, 7
    SETELEM r1, r2, r3
    RETURN r1
.end";
    let mut vm = Vm::with_config(assemble(source).unwrap(), &interp());
    let result = vm.run().unwrap();
    assert_eq!(result.tag(), Tag::Object);
    let index = result.as_object().unwrap();

    assert_eq!(vm.collect_garbage(), 0);
    assert_eq!(vm.heap().get(index, 0), Ok(Value::int(7)));
    assert_eq!(vm.heap().get(index, 1), Ok(Value::NIL));
}

#[test]
fn test_caller_arrays_survive_collections_in_callees() {
    let source = "
.func main 0
    LOADINT r0, 1
    NEWARRAY r1, r0
    LOADINT r2, 0
    LOADINT r3, 42
    SETELEM r1, r2, r3
    LOADINT r4, 50
    LOADINT r5, 1
loop:
    JMPF r4, done
    CALL r6, churn, 0
    SUB r4, r4, r5
    JMP loop
done:
    GETELEM r0, r1, r2
    RETURN r0
.end

.func churn 0
    LOADINT r0, 3
    NEWARRAY r1, r0
    NEWARRAY r1, r0
    RETURNNIL
.end";
    let config = RuntimeConfig {
        gc_threshold: 2,
        ..interp()
    };
    let mut vm = Vm::with_config(assemble(source).unwrap(), &config);
    assert_eq!(vm.run(), Ok(Value::int(42)));
    assert!(vm.gc_stats().cycles > 0);
    assert!(vm.heap().live_blocks() < 10);
}

#[test]
fn test_gc_disabled_keeps_everything() {
    let source = "
.func main 0
    LOADINT r0, 100
    LOADINT r1, 1
    LOADINT r2, 4
loop:
    JMPF r0, done
    NEWARRAY r3, r2
    SUB r0, r0, r1
    JMP loop
done:
    RETURNNIL
.end";
    let config = RuntimeConfig {
        gc_enabled: false,
        gc_threshold: 1,
        ..interp()
    };
    let mut vm = Vm::with_config(assemble(source).unwrap(), &config);
    vm.run().unwrap();
    assert_eq!(vm.heap().live_blocks(), 100);
    assert_eq!(vm.gc_stats().cycles, 0);
}

#[test]
fn test_invoke_function_directly() {
    let mut vm = Vm::with_config(assemble(FIB).unwrap(), &interp());
    let fib = vm.program().function_index("fib").unwrap();
    assert_eq!(vm.invoke(fib, &[Value::int(10)]), Ok(Value::int(55)));
    assert_eq!(vm.invoke(fib, &[Value::int(1)]), Ok(Value::int(1)));
}

#[test]
fn test_custom_native() {
    fn answer(_: &mut tiervm::vm::NativeContext<'_>, _: &[Value]) -> VmResult<Option<Value>> {
        Ok(Some(Value::int(42)))
    }

    let source = "
.func main 0
    NATIVE_CALL r1, 9, 0
    RETURN r0
.end";
    let mut vm = Vm::with_config(assemble(source).unwrap(), &interp());
    assert_eq!(vm.run(), Err(VmError::InvalidNative { index: 9 }));
    vm.register_native(9, "answer", answer);
    assert_eq!(vm.run(), Ok(Value::int(42)));
}

#[test]
fn test_image_roundtrip_runs() {
    let program = assemble(FIB).unwrap();
    let image = bytecode::serialize(&program);
    let loaded = tiervm::load_bytes(&image).unwrap();
    assert_eq!(loaded, program);
    assert_eq!(
        Vm::with_config(loaded, &interp()).run(),
        Ok(Value::int(6765))
    );
}

#[test]
fn test_load_file_detects_format() {
    let dir = tempfile::tempdir().unwrap();
    let listing = dir.path().join("prog.tasm");
    let image = dir.path().join("prog.tvm");
    std::fs::write(&listing, FIB).unwrap();
    let program = tiervm::load_file(&listing).unwrap();
    std::fs::write(&image, bytecode::serialize(&program)).unwrap();
    assert_eq!(tiervm::load_file(&image).unwrap(), program);

    assert!(matches!(
        tiervm::load_file(dir.path().join("missing")),
        Err(tiervm::LoadError::Io { .. })
    ));
}

#[test]
fn test_builder_program_runs() {
    // main: r1 = 6; r2 = 7; r0 = r1 * r2
    let mut b = ProgramBuilder::new();
    b.begin_function("main", 0).unwrap();
    b.emit_load_int(1, 6).unwrap();
    b.emit_load_int(2, 7).unwrap();
    b.emit_abc(Opcode::Mul, 0, 1, 2).unwrap();
    b.emit_abc(Opcode::Return, 0, 0, 0).unwrap();
    b.end_function().unwrap();
    let program = b.finish().unwrap();
    assert_eq!(Vm::with_config(program, &interp()).run(), Ok(Value::int(42)));
}

#[test]
fn test_config_file_drives_vm() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiervm.toml");
    std::fs::write(&path, "jit_mode = \"off\"\nmax_call_depth = 8\n").unwrap();
    let config = RuntimeConfig::load(&path).unwrap();

    let source = "
.func down 0
    CALL r0, down, 0
    RETURNNIL
.end
.func main 0
    CALL r0, down, 0
    RETURNNIL
.end";
    let err = Vm::with_config(assemble(source).unwrap(), &config)
        .run()
        .unwrap_err();
    assert_eq!(err, VmError::StackOverflow { depth: 8 });
    assert_eq!(err.kind(), ErrorKind::Resource);
}
