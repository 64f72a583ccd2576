mod assemble;
mod parser;

use classasm::jvm::{Compute, Version};
use clap::{value_parser, Arg, Command};
use std::path::{Path, PathBuf};
use std::{fs, io, process};

#[derive(Debug, thiserror::Error)]
enum JasmError {
    #[error("cannot read '{}': {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot write '{}': {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("{}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: parser::ParseError,
    },

    #[error(transparent)]
    Assemble(#[from] assemble::AssembleError),
}

fn main() {
    env_logger::init();

    let matches = Command::new("JVM class assembler")
        .version(clap::crate_version!())
        .about("Assemble textual class listings into JVM class files")
        .arg(
            Arg::new("output")
                .long("output-directory")
                .short('d')
                .value_name("DIRECTORY")
                .default_value(".")
                .help("Directory class files are written under (packages become sub-directories)"),
        )
        .arg(
            Arg::new("compute")
                .long("compute")
                .value_name("WHAT")
                .value_parser(["as-given", "maxs", "frames"])
                .default_value("frames")
                .help("What to compute: nothing, max stack/locals, or frames and max stack/locals"),
        )
        .arg(
            Arg::new("version")
                .long("class-version")
                .value_name("MAJOR")
                .value_parser(value_parser!(u16).range(45..))
                .default_value("52")
                .help("Major class file version (52 is Java 8)"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Listing to assemble")
                .required(true)
                .index(1),
        )
        .get_matches();

    let compute = match matches.get_one::<String>("compute").map(String::as_str) {
        Some("as-given") => Compute::AsGiven,
        Some("maxs") => Compute::MaxStackAndLocals,
        _ => Compute::Frames,
    };
    let version = Version::major(matches.get_one::<u16>("version").copied().unwrap_or(52));
    let output = PathBuf::from(
        matches
            .get_one::<String>("output")
            .map(String::as_str)
            .unwrap_or("."),
    );
    let input = match matches.get_one::<String>("INPUT") {
        Some(input) => PathBuf::from(input),
        None => process::exit(2),
    };

    if let Err(err) = run(&input, &output, compute, version) {
        log::error!("{}", err);
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn run(input: &Path, output: &Path, compute: Compute, version: Version) -> Result<(), JasmError> {
    log::info!("Reading '{}'", input.display());
    let source = fs::read_to_string(input).map_err(|source| JasmError::Read {
        path: input.to_owned(),
        source,
    })?;
    let listing = parser::parse(&source).map_err(|source| JasmError::Parse {
        path: input.to_owned(),
        source,
    })?;
    if listing.classes.is_empty() {
        log::warn!("'{}' does not declare any classes", input.display());
    }

    let hierarchy = assemble::hierarchy(&listing);
    for class in &listing.classes {
        let class_file = assemble::assemble(class, &hierarchy, compute, version)?;
        let path = output.join(format!("{}.class", class.name));
        log::info!("Writing '{}'", path.display());
        class_file
            .save_to_path(&path)
            .map_err(|source| JasmError::Write { path, source })?;
    }
    Ok(())
}
