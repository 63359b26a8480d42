use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use bramble_vm::{InterpretError, Vm};

#[derive(Clone)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(src: &str) -> String {
    let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
    let mut vm = Vm::with_writer(Box::new(buf.clone()));
    vm.interpret(src).expect("program should run without error");
    String::from_utf8(buf.0.borrow().clone()).unwrap()
}

fn run_err(src: &str) -> InterpretError {
    let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
    let mut vm = Vm::with_writer(Box::new(buf));
    vm.interpret(src).expect_err("program should fail")
}

#[test]
fn fibonacci_via_recursive_function() {
    let src = "\
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
print fib(10);
";
    assert_eq!(run(src), "55\n");
}

#[test]
fn nested_closures_each_keep_their_own_upvalue() {
    let src = "\
fun counter() {
    var i = 0;
    fun next() {
        i = i + 1;
        return i;
    }
    return next;
}
var a = counter();
var b = counter();
print a();
print a();
print b();
";
    assert_eq!(run(src), "1\n2\n1\n");
}

#[test]
fn classes_inherit_fields_and_methods_across_many_instances() {
    let src = "\
class Animal {
    init(name) {
        this.name = name;
    }
    speak() {
        print this.name + \" makes a sound.\";
    }
}
class Dog < Animal {
    speak() {
        super.speak();
        print this.name + \" barks.\";
    }
}
var d = Dog(\"Rex\");
d.speak();
";
    assert_eq!(run(src), "Rex makes a sound.\nRex barks.\n");
}

#[test]
fn while_loop_break_stops_immediately() {
    let src = "\
var i = 0;
while (true) {
    if (i == 5) break;
    i = i + 1;
}
print i;
";
    assert_eq!(run(src), "5\n");
}

#[test]
fn many_short_lived_strings_do_not_disturb_a_surviving_global() {
    // Each outer iteration builds a pad of distinct length, so every
    // intermediate concatenation interns a genuinely new string; "keep"
    // must still be the same value once they all go out of scope.
    let src = "\
var keep = \"kept\";
var i = 0;
while (i < 200) {
    var pad = \"\";
    var j = 0;
    while (j < i) {
        pad = pad + \"x\";
        j = j + 1;
    }
    i = i + 1;
}
print keep;
";
    assert_eq!(run(src), "kept\n");
}

#[test]
fn recursive_string_doubling_forces_a_real_collection_with_live_frames() {
    // Doubling a ~67-byte string 14 times crosses the 1 MiB `next_gc`
    // threshold (heap.rs) from inside a live recursive call chain, so
    // `Vm::collect_garbage`/`mark_roots` run against a real stack, a real
    // frame list, and a rooted global — not just through `Heap` directly.
    let src = "\
fun grow(pad, n) {
    if (n == 0) return pad;
    return grow(pad + pad, n - 1);
}
var keep = \"kept\";
var big = grow(\"0123456789012345678901234567890123456789012345678901234567890123\", 14);
print keep;
print big == big;
";
    assert_eq!(run(src), "kept\ntrue\n");
}

#[test]
fn runtime_error_reports_call_stack_trace() {
    let src = "\
fun level_two() {
    return 1 + \"oops\";
}
fun level_one() {
    return level_two();
}
level_one();
";
    let err = run_err(src);
    match err {
        InterpretError::Runtime(e) => {
            assert!(e.message.contains("two numbers or two strings"));
            assert_eq!(e.trace.len(), 3);
            assert_eq!(e.trace[0].name, "level_two");
            assert_eq!(e.trace[1].name, "level_one");
            assert_eq!(e.trace[2].name, "<script>");
        }
        _ => panic!("expected a runtime error"),
    }
}

#[test]
fn undefined_variable_access_is_a_runtime_error() {
    let err = run_err("print nope;");
    match err {
        InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable 'nope'")),
        _ => panic!("expected a runtime error"),
    }
}
