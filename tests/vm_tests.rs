// Integration tests for the Tmbdl bytecode pipeline.
//
// Each test runs a complete program through lex -> parse -> compile -> VM
// with a captured output sink, and asserts on the printed output or the
// resulting error. Covers closures and upvalue sharing, control flow,
// short-circuit evaluation, collections, modules, and the serialized
// bytecode round trip.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tmbdl::builtins;
use tmbdl::compiler::Compiler;
use tmbdl::errors::{ErrorKind, TmbdlError};
use tmbdl::lexer::tokenize;
use tmbdl::module::FileModuleLoader;
use tmbdl::parser::Parser;
use tmbdl::serializer::{deserialize, serialize};
use tmbdl::value::Value;
use tmbdl::vm::Vm;

/// Shared in-memory sink for capturing VM output
#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        SharedBuf(Arc::new(Mutex::new(Vec::new())))
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn compile_program(source: &str) -> tmbdl::bytecode::Chunk {
    let tokens = tokenize(source).expect("program tokenizes");
    let ast = Parser::new(tokens).parse().expect("program parses");
    Compiler::new().compile(&ast).expect("program compiles")
}

/// Run a program and return (result, stdout, debug output)
fn run_program(source: &str) -> (Result<Value, TmbdlError>, String, String) {
    let chunk = compile_program(source);
    let out = SharedBuf::new();
    let debug = SharedBuf::new();
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    vm.set_stdout(Box::new(out.clone()));
    vm.set_debug_out(Box::new(debug.clone()));
    let result = vm.run(chunk);
    (result, out.contents(), debug.contents())
}

fn run_expect(source: &str) -> String {
    let (result, out, _) = run_program(source);
    result.expect("program runs");
    out
}

fn unique_test_key(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("{}_{}", prefix, COUNTER.fetch_add(1, Ordering::Relaxed))
}

// === Closures and upvalues ===

#[test]
fn closure_counter_survives_its_creator() {
    let out = run_expect(
        "song makeCounter() {\n\
         ring c = 0\n\
         song inc() { c = c + 1 answer c }\n\
         answer inc\n\
         }\n\
         ring f = makeCounter()\n\
         sing f()\n\
         sing f()\n\
         sing f()",
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn two_closures_share_one_captured_variable() {
    let out = run_expect(
        "song pair() {\n\
         ring x = 10\n\
         song getX() { answer x }\n\
         song setX(v) { x = v }\n\
         answer [getX, setX]\n\
         }\n\
         ring p = pair()\n\
         sing p[0]()\n\
         p[1](42)\n\
         sing p[0]()",
    );
    assert_eq!(out, "10\n42\n");
}

#[test]
fn independent_counters_do_not_interfere() {
    let out = run_expect(
        "song makeCounter() {\n\
         ring c = 0\n\
         song inc() { c = c + 1 answer c }\n\
         answer inc\n\
         }\n\
         ring a = makeCounter()\n\
         ring b = makeCounter()\n\
         sing a()\n\
         sing a()\n\
         sing b()",
    );
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn capture_chains_through_intermediate_songs() {
    let out = run_expect(
        "song outer() {\n\
         ring x = 5\n\
         song middle() {\n\
         song inner() { answer x * 2 }\n\
         answer inner\n\
         }\n\
         answer middle\n\
         }\n\
         sing outer()()()",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn block_scope_closes_captured_locals() {
    let out = run_expect(
        "ring get = nothing\n\
         {\n\
         ring x = 7\n\
         song f() { answer x }\n\
         get = f\n\
         }\n\
         sing get()",
    );
    assert_eq!(out, "7\n");
}

// === Control flow ===

#[test]
fn while_with_break_and_continue() {
    let out = run_expect(
        "ring i = 0\n\
         ring s = 0\n\
         wander (i < 10) {\n\
         i = i + 1\n\
         perhaps (i == 5) { onwards }\n\
         perhaps (i == 8) { flee }\n\
         s = s + i\n\
         }\n\
         sing s",
    );
    assert_eq!(out, "22\n");
}

#[test]
fn for_in_over_an_array() {
    let out = run_expect(
        "ring xs = [2, 3, 5, 7]\n\
         ring t = 0\n\
         journey (x in xs) { t = t + x }\n\
         sing t",
    );
    assert_eq!(out, "17\n");
}

#[test]
fn for_in_over_a_string_yields_characters() {
    let out = run_expect(
        "ring s = \"abc\"\n\
         ring joined = \"\"\n\
         journey (ch in s) { joined = joined + ch + \".\" }\n\
         sing joined",
    );
    assert_eq!(out, "a.b.c.\n");
}

#[test]
fn break_inside_for_in() {
    let out = run_expect(
        "ring t = 0\n\
         journey (x in [1, 2, 3, 4, 5]) {\n\
         perhaps (x == 4) { flee }\n\
         t = t + x\n\
         }\n\
         sing t",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn if_otherwise_chains() {
    let out = run_expect(
        "song describe(n) {\n\
         perhaps (n < 0) { answer \"low\" }\n\
         otherwise perhaps (n == 0) { answer \"zero\" }\n\
         otherwise { answer \"high\" }\n\
         }\n\
         sing describe(0 - 1)\n\
         sing describe(0)\n\
         sing describe(3)",
    );
    assert_eq!(out, "low\nzero\nhigh\n");
}

// === Short-circuit logic ===

#[test]
fn with_short_circuits_and_keeps_the_left_value() {
    let out = run_expect(
        "ring a = sauron\n\
         ring b = goldberry\n\
         ring r = a with b\n\
         sing r",
    );
    assert_eq!(out, "sauron\n");
}

#[test]
fn with_skips_right_hand_side_effects() {
    let out = run_expect(
        "ring calls = 0\n\
         song bump() { calls = calls + 1 answer goldberry }\n\
         ring r = sauron with bump()\n\
         sing calls\n\
         sing r",
    );
    assert_eq!(out, "0\nsauron\n");
}

#[test]
fn either_takes_the_first_truthy_value() {
    let out = run_expect(
        "sing nothing either \"fallback\"\n\
         sing \"first\" either \"second\"",
    );
    assert_eq!(out, "fallback\nfirst\n");
}

// === Expressions and values ===

#[test]
fn arithmetic_and_number_formatting() {
    let out = run_expect("sing 1 + 2 * 3 sing 7 / 2 sing 7 % 3 sing -(2 + 3)");
    assert_eq!(out, "7\n3.5\n1\n-5\n");
}

#[test]
fn string_concatenation_stringifies_either_side() {
    let out = run_expect("sing \"n=\" + 3 sing 3 + \"=n\" sing \"a\" + \"b\"");
    assert_eq!(out, "n=3\n3=n\nab\n");
}

#[test]
fn template_strings_interpolate() {
    let out = run_expect(
        "ring name = \"frodo\"\n\
         ring age = 50\n\
         sing `hello ${name}, ${age + 1} soon`\n\
         sing ``\n\
         sing `${1 + 2}`",
    );
    assert_eq!(out, "hello frodo, 51 soon\n\n3\n");
}

#[test]
fn equality_is_strict_across_types() {
    let out = run_expect(
        "sing 1 == \"1\"\n\
         sing 1 == 1\n\
         sing \"a\" != \"a\"\n\
         sing nothing == sauron",
    );
    assert_eq!(out, "sauron\ngoldberry\nsauron\nsauron\n");
}

#[test]
fn arrays_are_identity_equal() {
    let out = run_expect(
        "ring a = [1]\n\
         ring b = [1]\n\
         ring c = a\n\
         sing a == b\n\
         sing a == c",
    );
    assert_eq!(out, "sauron\ngoldberry\n");
}

#[test]
fn compound_assignment_and_updates() {
    let out = run_expect(
        "ring x = 10\n\
         x += 5 sing x\n\
         x -= 3 sing x\n\
         x *= 2 sing x\n\
         sing x++\n\
         sing x\n\
         sing ++x",
    );
    assert_eq!(out, "15\n12\n24\n24\n25\n26\n");
}

#[test]
fn assignment_is_an_expression() {
    let out = run_expect(
        "ring a = 0\n\
         ring b = 0\n\
         a = b = 9\n\
         sing a\n\
         sing b",
    );
    assert_eq!(out, "9\n9\n");
}

#[test]
fn maps_keep_insertion_order_and_support_props() {
    let out = run_expect(
        "ring m = { name: \"bilbo\", age: 111 }\n\
         sing m.name\n\
         m.age = 112\n\
         sing m[\"age\"]\n\
         m[\"ring\"] = goldberry\n\
         sing m\n\
         sing m.missing",
    );
    assert_eq!(out, "bilbo\n112\n{name: bilbo, age: 112, ring: goldberry}\nnothing\n");
}

#[test]
fn length_property_covers_arrays_and_strings() {
    let out = run_expect(
        "sing [1, 2, 3].length\n\
         sing \"wander\".length\n\
         sing \"\".length",
    );
    assert_eq!(out, "3\n6\n0\n");
}

#[test]
fn string_indexing_yields_single_characters() {
    let out = run_expect(
        "ring s = \"ring\"\n\
         sing s[0]\n\
         sing s[3]\n\
         sing s[9] == \"\"",
    );
    assert_eq!(out, "r\ng\ngoldberry\n");
}

#[test]
fn lambdas_are_first_class() {
    let out = run_expect(
        "ring twice = song (f, x) { answer f(f(x)) }\n\
         ring add3 = song (n) { answer n + 3 }\n\
         sing twice(add3, 10)",
    );
    assert_eq!(out, "16\n");
}

#[test]
fn eyeof_writes_to_the_debug_sink() {
    let (result, out, debug) = run_program("eyeof(\"x\", 41 + 1) sing \"done\"");
    result.unwrap();
    assert_eq!(out, "done\n");
    assert_eq!(debug, "x:42\n");
}

#[test]
fn globals_write_in_source_order() {
    let out = run_expect(
        "ring log = []\n\
         song note(v) { push(log, v) answer v }\n\
         ring a = note(1)\n\
         ring b = note(2) + note(3)\n\
         sing log",
    );
    assert_eq!(out, "[1, 2, 3]\n");
}

// === Builtins ===

#[test]
fn higher_order_builtins_reenter_the_vm() {
    let out = run_expect(
        "ring xs = range(1, 6)\n\
         ring doubled = map(xs, song (x) { answer x * 2 })\n\
         ring evens = filter(doubled, song (x) { answer x % 4 == 0 })\n\
         ring total = reduce(doubled, song (acc, x) { answer acc + x }, 0)\n\
         sing doubled\n\
         sing evens\n\
         sing total",
    );
    assert_eq!(out, "[2, 4, 6, 8, 10]\n[4, 8]\n30\n");
}

#[test]
fn string_builtins() {
    let out = run_expect(
        "sing upper(\"shire\")\n\
         sing join(split(\"a,b,c\", \",\"), \"-\")\n\
         sing contains(\"mordor\", \"ord\")\n\
         sing slice(\"palantir\", 0, 3)",
    );
    assert_eq!(out, "SHIRE\na-b-c\ngoldberry\npal\n");
}

#[test]
fn json_builtins_round_trip() {
    let out = run_expect(
        "ring m = { name: \"sam\", tools: [\"rope\", \"pan\"] }\n\
         ring encoded = to_json(m)\n\
         ring back = from_json(encoded)\n\
         sing back.name\n\
         sing back.tools[1]",
    );
    assert_eq!(out, "sam\npan\n");
}

// === Errors ===

#[test]
fn division_by_zero_is_a_typed_error() {
    let (result, _, _) = run_program("sing 1 / 0");
    assert_eq!(result.unwrap_err().kind, ErrorKind::DivisionByZero);
}

#[test]
fn undefined_variable_reports_its_name_and_line() {
    let (result, _, _) = run_program("ring a = 1\nsing missing");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UndefinedVariable);
    assert!(err.message.contains("missing"));
    assert_eq!(err.location.line, 2);
}

#[test]
fn arity_mismatch_is_reported() {
    let (result, _, _) = run_program("song f(a, b) { answer a + b } f(1)");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArityMismatch);
    assert!(err.message.contains('f'));
}

#[test]
fn out_of_bounds_array_access_raises() {
    let (result, _, _) = run_program("ring xs = [1, 2] sing xs[5]");
    assert_eq!(result.unwrap_err().kind, ErrorKind::IndexOutOfRange);
}

#[test]
fn calling_a_number_is_a_type_mismatch() {
    let (result, _, _) = run_program("ring n = 3 n()");
    assert_eq!(result.unwrap_err().kind, ErrorKind::TypeMismatch);
}

#[test]
fn adding_incompatible_types_fails() {
    let (result, _, _) = run_program("sing [1] + 2");
    assert_eq!(result.unwrap_err().kind, ErrorKind::TypeMismatch);
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let (result, _, _) = run_program("song f(n) { answer f(n + 1) } f(0)");
    assert_eq!(result.unwrap_err().kind, ErrorKind::StackOverflow);
}

#[test]
fn attempt_runs_only_its_try_body() {
    // the rescue block is not lowered in the bytecode path
    let out = run_expect("attempt { sing \"tried\" } rescue (e) { sing \"rescued\" }");
    assert_eq!(out, "tried\n");
}

#[test]
fn realm_declarations_are_accepted_and_ignored() {
    let out = run_expect("realm Tower { song height() { answer 10 } } sing \"after\"");
    assert_eq!(out, "after\n");
}

// === Serialization ===

#[test]
fn serialized_bytecode_runs_identically() {
    let source = "song makeCounter() {\n\
                  ring c = 0\n\
                  song inc() { c = c + 1 answer c }\n\
                  answer inc\n\
                  }\n\
                  ring f = makeCounter()\n\
                  sing f()\n\
                  sing f()\n\
                  journey (x in [1, 2, 3]) { sing x * f() }";

    let direct = run_expect(source);

    let chunk = compile_program(source);
    let bytes = serialize(&chunk);
    let restored = deserialize(&bytes).expect("container deserializes");

    let out = SharedBuf::new();
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    vm.set_stdout(Box::new(out.clone()));
    vm.run(restored).expect("restored chunk runs");

    assert_eq!(out.contents(), direct);
}

// === Modules ===

fn write_module(dir: &std::path::Path, name: &str, source: &str) {
    std::fs::write(dir.join(name), source).expect("module fixture writes");
}

fn run_with_modules(dir: &std::path::Path, source: &str) -> String {
    let chunk = compile_program(source);
    let out = SharedBuf::new();
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    vm.set_stdout(Box::new(out.clone()));
    vm.set_module_loader(Arc::new(FileModuleLoader::new(dir.to_path_buf())));
    vm.run(chunk).expect("program with modules runs");
    out.contents()
}

#[test]
fn summon_loads_exports_from_a_module() {
    let dir = std::env::temp_dir().join(unique_test_key("tmbdl_modules"));
    std::fs::create_dir_all(&dir).unwrap();
    write_module(
        &dir,
        "math.tmbdl",
        "share double = song (x) { answer x * 2 }\n\
         share base = 21",
    );

    let out = run_with_modules(
        &dir,
        "ring math = summon \"math\"\n\
         sing math.double(math.base)",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn modules_are_cached_and_run_once() {
    let dir = std::env::temp_dir().join(unique_test_key("tmbdl_modules"));
    std::fs::create_dir_all(&dir).unwrap();
    write_module(
        &dir,
        "loud.tmbdl",
        "sing \"loading\"\n\
         share n = 1",
    );

    let out = run_with_modules(
        &dir,
        "ring a = summon \"loud\"\n\
         ring b = summon \"loud\"\n\
         sing a.n + b.n",
    );
    // the module body printed exactly once, into its own stdout
    assert_eq!(out, "2\n");
}

#[test]
fn cyclic_imports_terminate() {
    let dir = std::env::temp_dir().join(unique_test_key("tmbdl_modules"));
    std::fs::create_dir_all(&dir).unwrap();
    write_module(
        &dir,
        "a.tmbdl",
        "ring b = summon \"b\"\n\
         share name = \"a\"",
    );
    write_module(
        &dir,
        "b.tmbdl",
        "ring a = summon \"a\"\n\
         share name = \"b\"",
    );

    let out = run_with_modules(
        &dir,
        "ring a = summon \"a\"\n\
         sing a.name",
    );
    assert_eq!(out, "a\n");
}

#[test]
fn missing_module_is_a_load_failure() {
    let dir = std::env::temp_dir().join(unique_test_key("tmbdl_modules"));
    std::fs::create_dir_all(&dir).unwrap();

    let chunk = compile_program("ring m = summon \"ghost\"");
    let mut vm = Vm::new();
    builtins::install(&mut vm);
    vm.set_module_loader(Arc::new(FileModuleLoader::new(dir)));
    let err = vm.run(chunk).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ModuleLoadFailure);
}

#[test]
fn summon_without_a_loader_fails_cleanly() {
    let (result, _, _) = run_program("ring m = summon \"anything\"");
    assert_eq!(result.unwrap_err().kind, ErrorKind::ModuleLoadFailure);
}
