//! mote lowering driver CLI.

use std::io::IsTerminal;

use mote_diagnostic::emitter::{ColorMode, DiagnosticEmitter, TerminalEmitter};
use mote_diagnostic::DiagnosticQueue;
use motec::{init_tracing, lower_packages, parse_options, write_outputs};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || matches!(args[0].as_str(), "help" | "--help" | "-h") {
        print_usage();
        return;
    }
    if matches!(args[0].as_str(), "version" | "--version" | "-V") {
        println!("motec {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_tracing();

    let mut queue = DiagnosticQueue::new();
    let (color, succeeded) = match parse_options(&args) {
        Ok(options) => {
            let succeeded = lower_packages(&options, &mut queue)
                .and_then(|lowered| write_outputs(&options, &lowered, &mut queue))
                .is_ok();
            (options.color, succeeded)
        }
        Err(err) => {
            queue.emit_error(err.to_diagnostic());
            (ColorMode::Auto, false)
        }
    };

    let errors = queue.error_count();
    let warnings = queue.warning_count();
    let diagnostics = queue.flush();
    if !diagnostics.is_empty() {
        let mut emitter =
            TerminalEmitter::<std::io::Stderr>::stderr(color, std::io::stderr().is_terminal());
        emitter.emit_all(&diagnostics);
        emitter.emit_summary(errors, warnings);
        emitter.flush();
    }
    if !succeeded {
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("mote lowering driver");
    println!();
    println!("Usage: motec <package.mir>... [options]");
    println!();
    println!("Each input holds the IR of one package. Packages are loaded in");
    println!("parallel, linked in command-line order and lowered together.");
    println!();
    println!("Options:");
    println!("  --scheduler=<name>    Concurrency lowering: tasks (default), coroutines");
    println!("  --pointer-size=<n>    Pointer width in bytes: 4 (default), 8");
    println!("  --stack-size=<n>      Stack bytes per task (default: 2048)");
    println!("  --chain-limit=<n>     Largest comparison chain before a dispatch table (default: 3)");
    println!("  --passes=<a,b,...>    Run only these passes, in pipeline order");
    println!("  -o <path>             Write the lowered IR to <path> instead of stdout");
    println!("  --emit-roots=<path>   Write the encoded GC root table to <path>");
    println!("  --color=<mode>        Diagnostics color: auto (default), always, never");
    println!();
    println!("Passes: interface, func-values, concurrency, gc-roots, dce");
    println!();
    println!("Environment:");
    println!("  RUST_LOG=<filter>     Enable logging, e.g. RUST_LOG=mote_lower=debug");
    println!("  MOTE_LOG_TREE=1       Show pass spans as an indented tree");
    println!();
    println!("Examples:");
    println!("  motec main.mir runtime.mir");
    println!("  motec main.mir --scheduler=coroutines -o main.lowered.mir");
    println!("  motec main.mir --passes=interface,dce");
}
