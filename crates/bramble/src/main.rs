use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use bramble_vm::{InterpretError, Vm};

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => run_repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: bramble [script]");
            process::exit(64);
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("bramble: cannot read '{path}': {e}");
        process::exit(74);
    });
    let mut vm = Vm::new();
    let exit_code = match vm.interpret(&source) {
        Ok(()) => 0,
        Err(InterpretError::Compile(errs)) => {
            for e in &errs {
                eprintln!("{e}");
            }
            65
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{e}");
            70
        }
    };
    process::exit(exit_code);
}

fn run_repl() {
    println!("bramble — Ctrl-D to exit");
    let mut vm = Vm::new();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().expect("error writing to stdout");
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if let Err(e) = vm.interpret(&line) {
                    eprintln!("{e}");
                }
            }
            Err(e) => {
                eprintln!("bramble: {e}");
                break;
            }
        }
    }
}
