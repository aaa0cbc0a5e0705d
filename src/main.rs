//! The `safec` driver: a thin layer over the library pipeline. Parses the
//! command line, loads the source, runs preprocess/lex/parse/analyze/lower,
//! renders diagnostics to stderr, and exits 0 on success, 1 on user errors,
//! and 2 when a compiler invariant failed.

use std::env;
use std::fs;
use std::panic;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use safec::lower::DebugInfo;
use safec::pp::FileLoader;
use safec::{Compilation, Options};

struct FsLoader;

impl FileLoader for FsLoader {
    fn load(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }
}

fn usage() -> ! {
    eprintln!(
        "usage: safec <source> [-o <file>] [--emit-llvm] [--dump-ast] [--dump-pp]\n\
         \u{20}            [--no-sema] [--no-consteval] [--compat-preprocessor]\n\
         \u{20}            [-I <dir>] [-D NAME[=VALUE]] [--freestanding]\n\
         \u{20}            [--g lines|full] [--no-import-c-headers]\n\
         \u{20}            [--no-incremental] [--cache-dir <dir>] [--clear-cache]"
    );
    std::process::exit(1)
}

fn parse_arguments(args: Vec<String>) -> (PathBuf, Options) {
    let mut options = Options::default();
    let mut source = None;
    let mut iter = args.into_iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" => options.output = Some(PathBuf::from(iter.next().unwrap_or_else(|| usage()))),
            "--emit-llvm" => options.emit_llvm = true,
            "--dump-ast" => options.dump_ast = true,
            "--dump-pp" => options.dump_pp = true,
            "--no-sema" => options.no_sema = true,
            "--no-consteval" => options.no_consteval = true,
            "--compat-preprocessor" => options.compat_preprocessor = true,
            "-I" => options
                .include_paths
                .push(PathBuf::from(iter.next().unwrap_or_else(|| usage()))),
            "-D" => {
                let define = iter.next().unwrap_or_else(|| usage());
                match define.split_once('=') {
                    Some((name, value)) => options
                        .defines
                        .push((name.to_owned(), Some(value.to_owned()))),
                    None => options.defines.push((define, None)),
                }
            }
            "--freestanding" => options.freestanding = true,
            "--g" => {
                options.debug_info = match iter.next().as_deref() {
                    Some("lines") => DebugInfo::Lines,
                    Some("full") => DebugInfo::Full,
                    _ => usage(),
                }
            }
            "--no-import-c-headers" => options.import_c_headers = false,
            "--no-incremental" => options.incremental = false,
            "--cache-dir" => {
                options.cache_dir = Some(PathBuf::from(iter.next().unwrap_or_else(|| usage())))
            }
            "--clear-cache" => options.clear_cache = true,
            other if other.starts_with('-') => usage(),
            other => {
                if source.replace(PathBuf::from(other)).is_some() {
                    usage();
                }
            }
        }
    }

    // Environment augmentation: include paths and the cache directory are
    // the only recognized variables.
    if let Ok(paths) = env::var("SAFEC_INCLUDE_PATH") {
        for path in paths.split(':').filter(|p| !p.is_empty()) {
            options.include_paths.push(PathBuf::from(path));
        }
    }
    if options.cache_dir.is_none() {
        if let Ok(dir) = env::var("SAFEC_CACHE_DIR") {
            options.cache_dir = Some(PathBuf::from(dir));
        }
    }

    match source {
        Some(source) => (source, options),
        None => usage(),
    }
}

fn run(source_path: PathBuf, options: Options) -> ExitCode {
    let text = match fs::read_to_string(&source_path) {
        Ok(text) => text,
        Err(error) => {
            eprintln!("safec: cannot read {}: {}", source_path.display(), error);
            return ExitCode::from(1);
        }
    };
    let name = source_path.display().to_string();
    let dump_pp = options.dump_pp;
    let dump_ast = options.dump_ast;
    let mut compilation = Compilation::new(options);

    if dump_pp {
        let source = compilation.preprocess(&name, &text, &FsLoader);
        print!("{}", source.remaining_text());
        eprint!("{}", compilation.diagnostics.render(&compilation.map));
        return exit_for(&compilation);
    }

    let (unit, _, _) = compilation.compile(&name, &text, &FsLoader);
    if dump_ast {
        println!("{:#?}", unit);
    }
    eprint!("{}", compilation.diagnostics.render(&compilation.map));
    exit_for(&compilation)
}

fn exit_for(compilation: &Compilation) -> ExitCode {
    if compilation.diagnostics.has_errors() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    let (source_path, options) = parse_arguments(env::args().collect());
    // Exit code 2 is reserved for compiler invariant failures, which should
    // be impossible on well-formed input.
    match panic::catch_unwind(move || run(source_path, options)) {
        Ok(code) => code,
        Err(_) => ExitCode::from(2),
    }
}
