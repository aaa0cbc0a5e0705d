//!
//! # The SafeC Compiler Front-End
//!
//! ## Modules
//!
//! `lib.rs` stitches the whole core together by building a dependency and
//! execution order chain between the modules:
//!
//! ```text
//! pp -> lexing -> parsing -> sema -> mono -> consteval -> lower
//!                                \________________/
//!                        (const contexts evaluate on demand)
//! ```
//!
//! One `Compilation` processes one translation unit at a time; within it the
//! phases run strictly sequentially. The only state the phases share is the
//! type interning pool, the diagnostic sink, and the source map, all owned
//! here and living exactly as long as the compilation.
//!
//! ## Outputs
//!
//! Errors never produce partial output: if any error was recorded, lowering
//! is skipped and `compile` yields no lowered unit. Warnings never block.
//! The lowered tree goes to the external backend through `lower::Backend`;
//! code generation, linking, and caching live outside this crate.

pub mod common;
pub mod consteval;
pub mod diagnostics;
pub mod lexing;
pub mod lower;
pub mod mono;
pub mod parsing;
pub mod pp;
pub mod sema;
pub mod source;
pub mod types;

use std::path::PathBuf;

use crate::diagnostics::Diagnostics;
use crate::lexing::Tokens;
use crate::lower::{BackendOptions, DebugInfo, LoweredUnit};
use crate::parsing::nodes::Unit;
use crate::parsing::Parser;
use crate::pp::{FileLoader, PpOptions, Preprocessor};
use crate::sema::{Analysis, Analyzer};
use crate::source::{Source, SourceMap};
use crate::types::TypePool;

/// Everything the driver can ask for. The cache knobs ride along for the
/// external build driver and are inert in the core.
#[derive(Clone, Debug)]
pub struct Options {
    pub output: Option<PathBuf>,
    pub emit_llvm: bool,
    pub dump_ast: bool,
    pub dump_pp: bool,
    pub no_sema: bool,
    pub no_consteval: bool,
    pub compat_preprocessor: bool,
    pub strict_preprocessor: bool,
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<(String, Option<String>)>,
    pub freestanding: bool,
    pub debug_info: DebugInfo,
    pub import_c_headers: bool,
    pub incremental: bool,
    pub cache_dir: Option<PathBuf>,
    pub clear_cache: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output: None,
            emit_llvm: false,
            dump_ast: false,
            dump_pp: false,
            no_sema: false,
            no_consteval: false,
            compat_preprocessor: false,
            strict_preprocessor: false,
            include_paths: Vec::new(),
            defines: Vec::new(),
            freestanding: false,
            debug_info: DebugInfo::None,
            import_c_headers: true,
            incremental: true,
            cache_dir: None,
            clear_cache: false,
        }
    }
}

impl Options {
    fn backend(&self) -> BackendOptions {
        BackendOptions {
            output: self.output.clone(),
            emit_llvm: self.emit_llvm,
            debug_info: self.debug_info,
            freestanding: self.freestanding,
        }
    }

    fn pp(&self) -> PpOptions {
        PpOptions {
            compat: self.compat_preprocessor,
            strict: self.strict_preprocessor,
            freestanding: self.freestanding,
            include_paths: self.include_paths.clone(),
            defines: self.defines.clone(),
        }
    }
}

/// One translation unit's worth of compiler state.
pub struct Compilation {
    pub options: Options,
    pub map: SourceMap,
    pub diagnostics: Diagnostics,
    pub pool: TypePool,
}

impl Compilation {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            map: SourceMap::new(),
            diagnostics: Diagnostics::new(),
            pool: TypePool::new(),
        }
    }

    pub fn preprocess(&mut self, name: &str, text: &str, loader: &dyn FileLoader) -> Source {
        Preprocessor::new(&mut self.diagnostics, &mut self.map, loader, self.options.pp())
            .run(name, text)
    }

    pub fn parse(&mut self, source: Source) -> Unit {
        let tokens = Tokens::lex(source, &mut self.diagnostics);
        Parser::new(tokens, &mut self.diagnostics).parse_unit()
    }

    /// Semantic analysis, monomorphization, and the const-eval passes, in
    /// the order the pipeline fixes: declarations, global initializers,
    /// bodies, instantiations, const globals, top-level assertions.
    pub fn analyze(&mut self, unit: &mut Unit) -> Analysis {
        let mut analyzer = Analyzer::new(&mut self.pool, &mut self.diagnostics);
        analyzer.collect(unit);
        analyzer.check_globals(unit);
        analyzer.check_bodies(unit);
        mono::run(unit, &mut analyzer);
        if !self.options.no_consteval {
            analyzer.eval_const_globals(&*unit);
            analyzer.check_static_asserts(unit);
        }
        analyzer.finish()
    }

    /// The gateway: errors never produce partial output.
    pub fn lower(&mut self, unit: &Unit, analysis: &Analysis) -> Option<LoweredUnit> {
        if self.diagnostics.has_errors() {
            return None;
        }
        Some(lower::lower(
            unit,
            &mut self.pool,
            analysis,
            self.options.backend(),
        ))
    }

    /// The whole pipeline for one source text. Returns the (annotated) AST,
    /// the analysis results unless `--no-sema` was given, and the lowered
    /// unit unless errors were reported.
    pub fn compile(
        &mut self,
        name: &str,
        text: &str,
        loader: &dyn FileLoader,
    ) -> (Unit, Option<Analysis>, Option<LoweredUnit>) {
        let source = self.preprocess(name, text, loader);
        let mut unit = self.parse(source);
        if self.options.no_sema {
            return (unit, None, None);
        }
        let analysis = self.analyze(&mut unit);
        let lowered = self.lower(&unit, &analysis);
        (unit, Some(analysis), lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pp::NoIncludes;

    #[test]
    fn a_trivial_unit_compiles_clean() {
        let mut compilation = Compilation::new(Options::default());
        let (_, analysis, lowered) = compilation.compile(
            "main.sc",
            "int add(int a, int b) { return a + b; }\n",
            &NoIncludes,
        );
        assert!(!compilation.diagnostics.has_errors());
        assert!(analysis.is_some());
        let lowered = lowered.unwrap();
        assert_eq!(lowered.functions.len(), 1);
        assert_eq!(lowered.functions[0].name.as_str(), "add");
    }

    #[test]
    fn errors_suppress_lowering_entirely() {
        let mut compilation = Compilation::new(Options::default());
        let (_, _, lowered) =
            compilation.compile("main.sc", "int f() { return missing; }\n", &NoIncludes);
        assert!(compilation.diagnostics.has_errors());
        assert!(lowered.is_none());
    }

    #[test]
    fn warnings_do_not_block_lowering() {
        let mut compilation = Compilation::new(Options::default());
        let (_, _, lowered) = compilation.compile(
            "main.sc",
            "int f() { int unused_local = 1; return 2; }\n",
            &NoIncludes,
        );
        assert!(!compilation.diagnostics.has_errors());
        assert!(compilation.diagnostics.len() > 0);
        assert!(lowered.is_some());
    }

    #[test]
    fn no_sema_stops_after_parsing() {
        let mut compilation = Compilation::new(Options {
            no_sema: true,
            ..Options::default()
        });
        let (unit, analysis, lowered) = compilation.compile(
            "main.sc",
            "int f() { return undeclared_name; }\n",
            &NoIncludes,
        );
        assert!(!compilation.diagnostics.has_errors());
        assert_eq!(unit.decls.len(), 1);
        assert!(analysis.is_none());
        assert!(lowered.is_none());
    }
}
