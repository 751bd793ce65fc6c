use std::env;
use std::fs;
use std::path::Path;

use serde_json::Value as JsonValue;
use tern_syntax::Program;
use tern_vm::{compile, Bytecode, Session, Value, Vm, VmLimits};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("tern - bytecode compiler and virtual machine");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tern <file>                          Run a syntax tree (.json) or bytecode (.ternc)");
    eprintln!("  tern run <ast.json>                  Compile and run a syntax tree");
    eprintln!("  tern disasm <ast.json>               Print the compiled instructions");
    eprintln!("  tern compile <ast.json> [-o <out>]   Write bytecode to a .ternc file");
    eprintln!("  tern exec <file.ternc>               Run a bytecode file");
    eprintln!("  tern repl                            Start interactive REPL");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --stack-size <n>   Operand stack slots (default {})", tern_vm::STACK_SIZE);
    eprintln!("  --max-frames <n>   Maximum call depth (default {})", tern_vm::MAX_FRAMES);
    eprintln!("  -o, --output <f>   Output path for compile");
    eprintln!("  -h, --help         Show this help message");
    eprintln!("  -V, --version      Show version information");
    eprintln!();
    eprintln!("Set TERN_LOG (e.g. TERN_LOG=debug) to enable diagnostics on stderr.");
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    limits: VmLimits,
    output: Option<String>,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--stack-size" | "--max-frames" | "-o" | "--output" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{arg} requires a value"))?;
                match arg {
                    "--stack-size" => options.limits.stack_size = parse_count(arg, value)?,
                    "--max-frames" => options.limits.max_frames = parse_count(arg, value)?,
                    _ => options.output = Some(value.clone()),
                }
                i += 2;
            }
            _ if arg.starts_with("--") => return Err(format!("unknown option: {arg}")),
            _ => {
                options.positional.push(args[i].clone());
                i += 1;
            }
        }
    }
    Ok(options)
}

fn parse_count(flag: &str, value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(format!("{flag} expects a positive integer, got {value}")),
    }
}

/// Accepts a `Program` node, an array of statements, or a single statement.
fn parse_program(source: &str) -> Result<Program, serde_json::Error> {
    let json: JsonValue = serde_json::from_str(source)?;
    let is_program = matches!(
        &json,
        JsonValue::Object(map)
            if map.contains_key("body")
                && map.get("type").map_or(true, |kind| kind == "Program")
    );
    if is_program {
        serde_json::from_value(json)
    } else if json.is_array() {
        Ok(Program::new(serde_json::from_value(json)?))
    } else {
        Ok(Program::new(vec![serde_json::from_value(json)?]))
    }
}

fn load_program(path: &str) -> Result<Program, String> {
    let source = fs::read_to_string(path).map_err(|err| format!("failed to read {path}: {err}"))?;
    parse_program(&source).map_err(|err| format!("{path}: invalid syntax tree: {err}"))
}

fn compile_file(path: &str) -> Bytecode {
    let program = load_program(path).unwrap_or_else(|err| fail(&err));
    compile(&program).unwrap_or_else(|err| fail(&format!("compile error: {err}")))
}

fn execute(bytecode: Bytecode, limits: VmLimits) {
    let mut vm = Vm::with_limits(bytecode, limits);
    if let Err(err) = vm.run() {
        fail(&format!("runtime error: {err}"));
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn single_path<'a>(options: &'a Options, command: &str) -> &'a str {
    match options.positional.as_slice() {
        [path] => path.as_str(),
        _ => {
            eprintln!("error: {command} expects exactly one file");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TERN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    if command == "--help" || command == "-h" {
        print_usage();
        std::process::exit(0);
    }
    if command == "--version" || command == "-V" || command == "-v" {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    let is_command = matches!(command, "run" | "disasm" | "compile" | "exec" | "repl");
    let rest = if is_command { &args[2..] } else { &args[1..] };
    let options = parse_options(rest).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        print_usage();
        std::process::exit(1);
    });

    match command {
        "repl" => run_repl(options.limits),
        "run" => {
            let bytecode = compile_file(single_path(&options, command));
            execute(bytecode, options.limits);
        }
        "disasm" => {
            let bytecode = compile_file(single_path(&options, command));
            print!("{}", bytecode.disassemble());
        }
        "compile" => {
            let path = single_path(&options, command);
            let bytecode = compile_file(path);
            let output = options.output.clone().unwrap_or_else(|| {
                Path::new(path)
                    .with_extension("ternc")
                    .to_string_lossy()
                    .into_owned()
            });
            let bytes = bytecode
                .to_bytes()
                .unwrap_or_else(|err| fail(&format!("failed to encode bytecode: {err}")));
            if let Err(err) = fs::write(&output, bytes) {
                fail(&format!("failed to write {output}: {err}"));
            }
            eprintln!("wrote {output}");
        }
        "exec" => execute(read_bytecode(single_path(&options, command)), options.limits),
        _ => {
            let path = single_path(&options, "run");
            let bytecode = if path.ends_with(".ternc") {
                read_bytecode(path)
            } else {
                compile_file(path)
            };
            execute(bytecode, options.limits);
        }
    }
}

fn read_bytecode(path: &str) -> Bytecode {
    let bytes = fs::read(path).unwrap_or_else(|err| fail(&format!("failed to read {path}: {err}")));
    Bytecode::from_bytes(&bytes)
        .unwrap_or_else(|err| fail(&format!("{path}: invalid bytecode: {err}")))
}

/// A JSON value spanning several lines is complete once it parses, or once
/// it fails for a reason other than running out of input.
fn is_input_complete(input: &str) -> bool {
    match serde_json::from_str::<JsonValue>(input) {
        Ok(_) => true,
        Err(err) => !err.is_eof(),
    }
}

/// What the REPL prints for a result: nothing for `null`, else its display form.
fn render_result(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        value => Some(value.to_string()),
    }
}

fn run_repl(limits: VmLimits) {
    let mut session = Session::with_limits(limits);
    let mut buffer = String::new();
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = std::env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".tern_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == ".exit" {
            break;
        }
        if trimmed == "reset" || trimmed == ".reset" {
            buffer.clear();
            session.reset();
            println!("ok");
            continue;
        }
        let _ = rl.add_history_entry(trimmed);
        buffer.push_str(trimmed);
        buffer.push('\n');

        if !is_input_complete(&buffer) {
            continue;
        }

        match parse_program(&buffer) {
            Ok(program) => match session.eval(&program) {
                Ok(value) => {
                    if let Some(line) = render_result(&value) {
                        println!("{line}");
                    }
                }
                Err(err) => eprintln!("{err}"),
            },
            Err(err) => eprintln!("invalid syntax tree: {err}"),
        }

        buffer.clear();
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}
