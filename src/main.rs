use clap::Parser;
use skein::compile_source;
use std::path::PathBuf;
use std::process::ExitCode;

/// Compile a .skein script into a .story binary.
#[derive(Parser)]
#[command(name = "skeinc", version, about)]
struct Args {
    /// Input script file.
    input: PathBuf,

    /// Output story file (default: input with a .story extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Export translatable strings to a CSV file.
    #[arg(long = "export-strings", value_name = "PATH")]
    export_strings: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match std::fs::read_to_string(&args.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", args.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let filename = args.input.display().to_string();
    let compilation = match compile_source(&source, &filename) {
        Ok(c) => c,
        Err(errors) => {
            for err in &errors {
                eprintln!("error: {}", err);
            }
            eprintln!("\n{} error(s). Compilation aborted.", errors.len());
            return ExitCode::FAILURE;
        }
    };

    if let Some(csv_path) = &args.export_strings {
        if let Err(e) = std::fs::write(csv_path, compilation.strings_csv()) {
            eprintln!("error: cannot write {}: {}", csv_path.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("story"));
    let bytes = match compilation.story.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = std::fs::write(&output, bytes) {
        eprintln!("error: cannot write {}: {}", output.display(), e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
