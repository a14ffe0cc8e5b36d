// File: src/main.rs
//
// Command-line entry point for Tmbdl. Dispatches to run (source or
// compiled bytecode), compile (emit a .tmbdlc container), or disasm.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod disasm;
mod errors;
mod lexer;
mod module;
mod parser;
mod serializer;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bytecode::Chunk;
use crate::errors::TmbdlError;
use crate::module::FileModuleLoader;

#[derive(ClapParser)]
#[command(
    name = "tmbdl",
    about = "Tmbdl: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a .tmbdl source file or a compiled .tmbdlc file
    Run {
        /// Path to the script
        file: PathBuf,

        /// Print the compiled bytecode before running
        #[arg(long = "disasm")]
        show_disasm: bool,
    },

    /// Compile a source file to a .tmbdlc bytecode container
    Compile {
        /// Path to the .tmbdl file
        file: PathBuf,

        /// Output path (defaults to the input with a .tmbdlc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the bytecode listing of a source or compiled file
    Disasm {
        /// Path to the .tmbdl or .tmbdlc file
        file: PathBuf,
    },
}

fn compile_source_file(file: &Path) -> Result<Chunk, TmbdlError> {
    let source = fs::read_to_string(file).map_err(|e| {
        TmbdlError::new(
            errors::ErrorKind::ModuleLoadFailure,
            format!("Failed to read {}: {}", file.display(), e),
            errors::SourceLocation::unknown(),
        )
    })?;
    let tokens = lexer::tokenize(&source)?;
    let ast = parser::Parser::new(tokens).parse()?;
    compiler::Compiler::new().compile(&ast)
}

fn load_chunk(file: &Path) -> Result<Chunk, TmbdlError> {
    if file.extension().and_then(|e| e.to_str()) == Some("tmbdlc") {
        let bytes = fs::read(file).map_err(|e| {
            TmbdlError::corrupt_bytecode(format!("Failed to read {}: {}", file.display(), e))
        })?;
        serializer::deserialize(&bytes)
    } else {
        compile_source_file(file)
    }
}

fn run_chunk(file: &Path, chunk: Chunk) -> Result<(), TmbdlError> {
    let root = file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut vm = vm::Vm::new();
    builtins::install(&mut vm);
    vm.set_module_loader(Arc::new(FileModuleLoader::new(root)));
    if let Ok(canonical) = file.canonicalize() {
        vm.set_current_module(canonical.to_string_lossy().to_string());
    }
    vm.run(chunk)?;
    Ok(())
}

fn fail(error: TmbdlError) -> ! {
    eprintln!("{}", error);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, show_disasm } => {
            let chunk = load_chunk(&file).unwrap_or_else(|e| fail(e));
            if show_disasm {
                eprintln!("{}", disasm::disassemble_chunk(&chunk, "<main>"));
            }
            if let Err(e) = run_chunk(&file, chunk) {
                fail(e);
            }
        }

        Commands::Compile { file, output } => {
            let chunk = compile_source_file(&file).unwrap_or_else(|e| fail(e));
            let bytes = serializer::serialize(&chunk);
            let output = output.unwrap_or_else(|| file.with_extension("tmbdlc"));
            if let Err(e) = fs::write(&output, bytes) {
                eprintln!("Failed to write {}: {}", output.display(), e);
                std::process::exit(1);
            }
            println!("Wrote {}", output.display());
        }

        Commands::Disasm { file } => {
            let chunk = load_chunk(&file).unwrap_or_else(|e| fail(e));
            println!("{}", disasm::disassemble_chunk(&chunk, "<main>"));
        }
    }
}
