mod common;

use cinder::{
    Compile, CompileError, CompileErrorKind, ErrorKind, Handle, Heap, InterpretResult, OpCode, Value,
    VmConfig,
};
use common::{string_value, vm, vm_with, Asm};

#[test]
fn test_one_plus_two() {
    let (mut vm, _, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .number(1.0)
        .number(2.0)
        .op(OpCode::Add)
        .op(OpCode::Return)
        .script();

    let result = vm.run(script).expect("Execution failed");
    assert_eq!(result, Value::Number(3.0));
    assert!(vm.stack().is_empty());
}

#[test]
fn test_packed_literals() {
    let (mut vm, out, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .op(OpCode::MinusOne)
        .op(OpCode::Print)
        .op(OpCode::Zero)
        .op(OpCode::Print)
        .op(OpCode::Integer)
        .byte(200)
        .op(OpCode::Print)
        .op(OpCode::Integer16)
        .byte(0x01)
        .byte(0x00)
        .op(OpCode::Print)
        .op(OpCode::True)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::Ok);
    assert_eq!(out.text(), "-1\n0\n200\n256\ntrue\nnil\n");
}

#[test]
fn test_division_matches_ieee() {
    let (mut vm, _, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .number(7.0)
        .number(2.0)
        .op(OpCode::Divide)
        .number(0.1)
        .number(0.2)
        .op(OpCode::Add)
        .op(OpCode::Multiply)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.run(script), Ok(Value::Number(3.5 * (0.1 + 0.2))));
}

#[test]
fn test_division_by_zero_leaves_stack_balanced() {
    let (mut vm, _, err) = vm();
    let script = Asm::new(&mut vm.heap)
        .number(5.0)
        .number(1.0)
        .line(3)
        .number(0.0)
        .op(OpCode::Divide)
        .op(OpCode::Return)
        .script();

    let error = vm.run(script).unwrap_err();
    assert_eq!(error.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.text(), "Division by zero.\n[line 3] in script\n");
    assert!(vm.stack().is_empty());
    assert_eq!(vm.frame_depth(), 0);

    // The VM is usable again after the reset
    let script = Asm::new(&mut vm.heap)
        .number(1.0)
        .number(4.0)
        .op(OpCode::Divide)
        .op(OpCode::Return)
        .script();
    assert_eq!(vm.run(script), Ok(Value::Number(0.25)));
}

#[test]
fn test_globals() {
    let (mut vm, _, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .number(1.0)
        .named(OpCode::DefineGlobal, "x")
        .number(41.0)
        .named(OpCode::SetGlobal, "x")
        .op(OpCode::Pop)
        .named(OpCode::GetGlobal, "x")
        .op(OpCode::One)
        .op(OpCode::Add)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.run(script), Ok(Value::Number(42.0)));
    assert_eq!(vm.global("x"), Some(Value::Number(41.0)));
}

#[test]
fn test_set_undefined_global_rolls_back() {
    let (mut vm, _, err) = vm();
    let script = Asm::new(&mut vm.heap)
        .op(OpCode::One)
        .named(OpCode::SetGlobal, "ghost")
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::RuntimeError);
    assert!(err.text().starts_with("Undefined variable 'ghost'."));
    assert_eq!(vm.global("ghost"), None);

    let script = Asm::new(&mut vm.heap)
        .named(OpCode::GetGlobal, "ghost")
        .op(OpCode::Return)
        .script();
    let error = vm.run(script).unwrap_err();
    assert_eq!(error.kind, ErrorKind::UndefinedVariable("ghost".to_string()));
}

#[test]
fn test_comparison_and_logic() {
    let (mut vm, out, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .number(1.0)
        .number(2.0)
        .op(OpCode::Less)
        .op(OpCode::Print)
        .number(1.0)
        .number(2.0)
        .op(OpCode::Greater)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Not)
        .op(OpCode::Print)
        .op(OpCode::Zero)
        .op(OpCode::Not)
        .op(OpCode::Print)
        .number(3.0)
        .op(OpCode::Negate)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Nil)
        .op(OpCode::Equal)
        .op(OpCode::Print)
        .op(OpCode::One)
        .op(OpCode::True)
        .op(OpCode::Equal)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::Ok);
    assert_eq!(out.text(), "true\nfalse\ntrue\nfalse\n-3\ntrue\nfalse\n");
}

#[test]
fn test_type_errors() {
    let cases = [
        (OpCode::Negate, "Operand must be a number."),
        (OpCode::Subtract, "Operands must be numbers."),
        (OpCode::Less, "Operands must be numbers."),
        (OpCode::Add, "Operands must be two numbers or two strings."),
    ];

    for (op, message) in cases {
        let (mut vm, _, err) = vm();
        let script = Asm::new(&mut vm.heap)
            .op(OpCode::One)
            .op(OpCode::True)
            .op(op)
            .op(OpCode::Return)
            .script();
        assert_eq!(vm.execute(script), InterpretResult::RuntimeError);
        assert_eq!(err.text().lines().next(), Some(message), "{:?}", op);
    }
}

#[test]
fn test_if_else_jumps() {
    let (mut vm, out, _) = vm();
    let mut asm = Asm::new(&mut vm.heap);
    asm.op(OpCode::False);
    let else_jump = asm.jump(OpCode::JumpIfFalse);
    asm.op(OpCode::Pop).string("then").op(OpCode::Print);
    let end_jump = asm.jump(OpCode::Jump);
    asm.patch(else_jump);
    asm.op(OpCode::Pop).string("else").op(OpCode::Print);
    asm.patch(end_jump);
    asm.op(OpCode::Nil).op(OpCode::Return);
    let script = asm.script();

    assert_eq!(vm.execute(script), InterpretResult::Ok);
    assert_eq!(out.text(), "else\n");
}

#[test]
fn test_while_loop_sums() {
    let (mut vm, _, _) = vm();
    let mut asm = Asm::new(&mut vm.heap);
    // slot 1: i, slot 2: sum
    asm.op(OpCode::Zero).op(OpCode::Zero);
    let start = asm.here();
    asm.slot(OpCode::GetLocal, 1).number(5.0).op(OpCode::Greater).op(OpCode::Not);
    let exit = asm.jump(OpCode::JumpIfFalse);
    asm.op(OpCode::Pop)
        .slot(OpCode::GetLocal, 2)
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::Add)
        .slot(OpCode::SetLocal, 2)
        .op(OpCode::Pop)
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::One)
        .op(OpCode::Add)
        .slot(OpCode::SetLocal, 1)
        .op(OpCode::Pop)
        .loop_to(start);
    asm.patch(exit);
    asm.op(OpCode::Pop).slot(OpCode::GetLocal, 2).op(OpCode::Return);
    let script = asm.script();

    assert_eq!(vm.run(script), Ok(Value::Number(15.0)));
}

#[test]
fn test_string_concatenation() {
    let (mut vm, _, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .string("a")
        .number(1.5)
        .op(OpCode::Add)
        .op(OpCode::Nil)
        .op(OpCode::Add)
        .op(OpCode::True)
        .string("!")
        .op(OpCode::Add)
        .op(OpCode::Add)
        .op(OpCode::Return)
        .script();

    let result = vm.run(script).unwrap();
    assert_eq!(string_value(&vm, result), "a1.5niltrue!");

    // Concatenation results are interned
    let a = vm.heap.find_string("a1.5niltrue!");
    assert_eq!(a, result.as_obj());
}

#[test]
fn test_container_stringification() {
    let (mut vm, out, _) = vm();
    let script = Asm::new(&mut vm.heap)
        .named(OpCode::GetGlobal, "list")
        .call(0)
        .named(OpCode::GetGlobal, "append")
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::One)
        .call(2)
        .op(OpCode::Pop)
        .named(OpCode::GetGlobal, "append")
        .slot(OpCode::GetLocal, 1)
        .string("two")
        .call(2)
        .op(OpCode::Pop)
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::Print)
        .string("list: ")
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::Add)
        .op(OpCode::Print)
        .named(OpCode::GetGlobal, "clock")
        .op(OpCode::Print)
        .named(OpCode::GetGlobal, "dict")
        .call(0)
        .op(OpCode::Print)
        .op(OpCode::Nil)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::Ok);
    assert_eq!(out.text(), "[1, two]\nlist: [list]\n<native fn>\n{}\n");
}

#[test]
fn test_function_call_and_trace() {
    let (mut vm, _, err) = vm();
    let fail = Asm::new(&mut vm.heap)
        .line(2)
        .slot(OpCode::GetLocal, 1)
        .op(OpCode::Zero)
        .op(OpCode::Divide)
        .op(OpCode::Return)
        .finish(Some("fail"), 1, 0);
    let script = Asm::new(&mut vm.heap)
        .closure(fail, &[])
        .line(5)
        .op(OpCode::One)
        .call(1)
        .op(OpCode::Return)
        .script();

    let error = vm.run(script).unwrap_err();
    assert_eq!(error.trace.len(), 2);
    assert_eq!(err.text(), "Division by zero.\n[line 2] in fail()\n[line 5] in script\n");
}

#[test]
fn test_wrong_arity() {
    let (mut vm, _, err) = vm();
    let f = Asm::new(&mut vm.heap).op(OpCode::Nil).op(OpCode::Return).finish(Some("f"), 2, 0);
    let script = Asm::new(&mut vm.heap)
        .closure(f, &[])
        .op(OpCode::One)
        .call(1)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::RuntimeError);
    assert!(err.text().starts_with("Expected 2 arguments but got 1.\n"));
}

#[test]
fn test_calling_non_callable() {
    let (mut vm, _, _) = vm();
    let script = Asm::new(&mut vm.heap).op(OpCode::One).call(0).op(OpCode::Return).script();
    assert_eq!(vm.run(script).unwrap_err().kind, ErrorKind::NotCallable);
}

#[test]
fn test_unbounded_recursion_overflows() {
    let (mut vm, _, err) = vm();
    let f = Asm::new(&mut vm.heap)
        .named(OpCode::GetGlobal, "f")
        .call(0)
        .op(OpCode::Return)
        .finish(Some("f"), 0, 0);
    let script = Asm::new(&mut vm.heap)
        .closure(f, &[])
        .named(OpCode::DefineGlobal, "f")
        .named(OpCode::GetGlobal, "f")
        .call(0)
        .op(OpCode::Return)
        .script();

    let error = vm.run(script).unwrap_err();
    assert_eq!(error.kind, ErrorKind::StackOverflow);
    assert_eq!(error.trace.len(), cinder::FRAMES_MAX);
    assert!(err.text().starts_with("Stack overflow.\n[line 1] in f()\n"));
    assert!(err.text().ends_with("[line 1] in script\n"));
    assert!(vm.stack().is_empty());
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn test_configured_frame_limit() {
    let (mut vm, _, _) = vm_with(VmConfig::default().with_frames_max(8));
    let f = Asm::new(&mut vm.heap)
        .named(OpCode::GetGlobal, "f")
        .call(0)
        .op(OpCode::Return)
        .finish(Some("f"), 0, 0);
    let script = Asm::new(&mut vm.heap)
        .closure(f, &[])
        .named(OpCode::DefineGlobal, "f")
        .named(OpCode::GetGlobal, "f")
        .call(0)
        .op(OpCode::Return)
        .script();

    let error = vm.run(script).unwrap_err();
    assert_eq!(error.kind, ErrorKind::StackOverflow);
    assert_eq!(error.trace.len(), 8);
}

#[test]
fn test_unknown_opcode_is_an_error() {
    let (mut vm, _, err) = vm();
    let script = Asm::new(&mut vm.heap).byte(250).script();
    assert_eq!(vm.execute(script), InterpretResult::RuntimeError);
    assert_eq!(err.text(), "Unknown opcode 250.\n[line 1] in script\n");
}

/// Front end for programs consisting of one number literal
struct NumberFrontEnd;

impl Compile for NumberFrontEnd {
    fn compile(&mut self, source: &str, heap: &mut Heap) -> Result<Handle, CompileError> {
        let n: f64 = source.trim().parse().map_err(|_| {
            CompileError::new(CompileErrorKind::Syntax, 1, "Expect number.").at(source.trim())
        })?;
        Ok(Asm::new(heap).number(n).op(OpCode::Print).op(OpCode::Nil).op(OpCode::Return).script())
    }
}

#[test]
fn test_interpret_through_front_end() {
    let (mut vm, out, err) = vm();
    assert_eq!(vm.interpret(&mut NumberFrontEnd, " 2.5 "), InterpretResult::Ok);
    assert_eq!(out.text(), "2.5\n");

    assert_eq!(vm.interpret(&mut NumberFrontEnd, "two"), InterpretResult::CompileError);
    assert_eq!(err.text(), "[line 1] Syntax Error at 'two': Expect number.\n");
}

#[test]
fn test_colored_diagnostics_keep_message() {
    let (mut vm, _, err) = vm_with(VmConfig::default().with_color(true));
    let script = Asm::new(&mut vm.heap)
        .op(OpCode::One)
        .op(OpCode::Zero)
        .op(OpCode::Divide)
        .op(OpCode::Return)
        .script();

    assert_eq!(vm.execute(script), InterpretResult::RuntimeError);
    assert!(err.text().contains("Division by zero."));
    assert!(err.text().ends_with("[line 1] in script\n"));
}
