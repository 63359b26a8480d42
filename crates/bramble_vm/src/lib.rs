pub mod chunk;
pub mod compiler;
pub mod disassemble;
pub mod error;
pub mod heap;
pub mod native;
pub mod object;
pub mod value;
pub mod vm;

pub use error::{CompileError, InterpretError, RuntimeError};
pub use value::Value;
pub use vm::Vm;

/// Compiles and runs `source` on a fresh `Vm`, writing `print` output to
/// stdout. The one-shot entry point the CLI and embedders reach for when
/// they don't need to reuse a `Vm` across calls (REPLs do — see `bramble`).
pub fn run(source: &str) -> Result<(), InterpretError> {
    Vm::new().interpret(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_reports_compile_errors_without_executing() {
        let err = run("1 +;").unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }

    #[test]
    fn run_succeeds_on_well_formed_program() {
        assert!(run("print 1 + 1;").is_ok());
    }

    #[test]
    fn cannot_read_local_in_its_own_initializer() {
        let err = run("{ var a = a; }").unwrap_err();
        match err {
            InterpretError::Compile(errs) => {
                assert!(errs.iter().any(|e| matches!(e, CompileError::ReadLocalInOwnInitializer { .. })));
            }
            _ => panic!("expected a compile error"),
        }
    }

    #[test]
    fn cannot_return_a_value_from_an_initializer() {
        let err = run("class C { init() { return 1; } }").unwrap_err();
        match err {
            InterpretError::Compile(errs) => {
                assert!(errs.iter().any(|e| matches!(e, CompileError::ReturnValueFromInitializer { .. })));
            }
            _ => panic!("expected a compile error"),
        }
    }

    #[test]
    fn stack_empties_after_a_script_runs_to_completion() {
        let mut vm = Vm::new();
        assert!(vm.interpret("var a = 1; var b = 2; print a + b;").is_ok());
    }
}
