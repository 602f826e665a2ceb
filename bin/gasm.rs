use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_print::cprintln;
use thiserror::Error;

use gasm::arch::Arch;
use gasm::format::{builder_for, Builder, Format};

#[derive(Parser, Debug)]
#[command(
    name = "gasm",
    version,
    about = "Assemble NASM-dialect source into a runnable executable"
)]
struct AppArgs {
    /// Input assembly file.
    input: PathBuf,

    /// Output file. Defaults to the input file name without its extension.
    output: Option<PathBuf>,

    /// Target architecture: x86, x86_64, arm, arm64.
    #[arg(long, default_value = "x86_64")]
    arch: String,

    /// Output format: elf, pe.
    #[arg(long, default_value = "elf")]
    format: String,

    /// Output file (takes precedence over the positional form).
    #[arg(short = 'o', value_name = "FILE")]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown architecture: {0}")]
    UnknownArch(String),

    #[error("unknown format: {0}")]
    UnknownFormat(String),

    #[error(transparent)]
    Assemble(#[from] gasm::Error),

    #[error("{0}: {1}")]
    Io(PathBuf, std::io::Error),
}

fn main() -> ExitCode {
    let args = AppArgs::parse();

    match run(&args) {
        Ok(path) => {
            cprintln!(
                "<green,bold>assembled</> {} -> {} ({}, {})",
                args.input.display(),
                path.display(),
                args.arch,
                args.format
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            cprintln!("<red,bold>error</>: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &AppArgs) -> Result<PathBuf, CliError> {
    let arch = Arch::parse(&args.arch).ok_or_else(|| CliError::UnknownArch(args.arch.clone()))?;
    let format =
        Format::parse(&args.format).ok_or_else(|| CliError::UnknownFormat(args.format.clone()))?;

    let source = fs::read_to_string(&args.input)
        .map_err(|e| CliError::Io(args.input.clone(), e))?;

    let binary = gasm::assemble(&source, arch, format)?;

    let mut path = args
        .out
        .clone()
        .or_else(|| args.output.clone())
        .unwrap_or_else(|| default_output(&args.input));

    let ext = builder_for(format).extension();
    if !ext.is_empty() && !path.to_string_lossy().ends_with(ext) {
        let mut s = path.into_os_string();
        s.push(ext);
        path = PathBuf::from(s);
    }

    fs::write(&path, &binary).map_err(|e| CliError::Io(path.clone(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|e| CliError::Io(path.clone(), e))?;
    }

    Ok(path)
}

/// The input's base name with its extension stripped.
fn default_output(input: &std::path::Path) -> PathBuf {
    match input.file_stem() {
        Some(stem) => PathBuf::from(stem),
        None => PathBuf::from("a.out"),
    }
}
