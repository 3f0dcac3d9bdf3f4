//! Command-line interface for the machoveil Mach-O obfuscator.
//!
//! Flag spelling is kept compatible with the historical tool: single-dash
//! long tokens (`-strip-ext`, `-strip-indirect`) plus `--optimize <exp>`,
//! order-independent and allowed before the positionals. Every token is
//! classified in one pass into an immutable options record before any
//! mutation runs.

use machoveil::Obfuscator;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "Usage: machoveil [-strip-ext] [-strip-indirect] [--optimize <exponent>] <mach-o file> <output file>";

#[derive(Debug, PartialEq, Eq)]
struct Options {
    strip_external: bool,
    strip_indirect: bool,
    alignment: Option<u32>,
    input: PathBuf,
    output: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum ArgError {
    /// Missing/extra positionals or an unrecognized flag: print usage.
    Usage,
    /// A recognized flag with a bad argument: print the message.
    Invalid(String),
}

fn parse_args(args: &[String]) -> Result<Options, ArgError> {
    let mut strip_external = false;
    let mut strip_indirect = false;
    let mut alignment = None;
    let mut positionals = Vec::new();

    let mut tokens = args.iter();
    while let Some(token) = tokens.next() {
        match token.as_str() {
            "-strip-ext" => strip_external = true,
            "-strip-indirect" => strip_indirect = true,
            "--optimize" => {
                let value = tokens
                    .next()
                    .ok_or_else(|| ArgError::Invalid("--optimize requires an exponent".into()))?;
                let exponent = value.parse::<u32>().map_err(|_| {
                    ArgError::Invalid(format!("invalid alignment exponent '{value}'"))
                })?;
                alignment = Some(exponent);
            }
            flag if flag.starts_with('-') => return Err(ArgError::Usage),
            positional => positionals.push(PathBuf::from(positional)),
        }
    }

    if positionals.len() != 2 {
        return Err(ArgError::Usage);
    }
    let output = positionals.pop().expect("two positionals");
    let input = positionals.pop().expect("two positionals");

    Ok(Options {
        strip_external,
        strip_indirect,
        alignment,
        input,
        output,
    })
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(ArgError::Usage) => {
            println!("{USAGE}");
            return ExitCode::FAILURE;
        }
        Err(ArgError::Invalid(message)) => {
            eprintln!("Error: {message}");
            return ExitCode::FAILURE;
        }
    };

    let mut obfuscator = Obfuscator::new()
        .strip_external(options.strip_external)
        .strip_indirect(options.strip_indirect);
    if let Some(exponent) = options.alignment {
        obfuscator = obfuscator.section_alignment(exponent);
    }

    match obfuscator.run(&options.input, &options.output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
