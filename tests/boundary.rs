//! The boundary scenarios: literal inputs with fixed expected outcomes,
//! exercised through the library pipeline end to end.

use safec::consteval::Value;
use safec::diagnostics::Category;
use safec::lower::LoweredUnit;
use safec::pp::NoIncludes;
use safec::sema::Analysis;
use safec::types::IntType;
use safec::{Compilation, Options};

fn compile(text: &str) -> (Compilation, Option<Analysis>, Option<LoweredUnit>) {
    let mut compilation = Compilation::new(Options::default());
    let (_, analysis, lowered) = compilation.compile("main.sc", text, &NoIncludes);
    (compilation, analysis, lowered)
}

fn errors_of(compilation: &Compilation) -> Vec<Category> {
    compilation
        .diagnostics
        .iter()
        .filter(|d| d.severity >= safec::diagnostics::Severity::Error)
        .map(|d| d.category)
        .collect()
}

#[test]
fn stack_escape_is_one_region_error_and_no_lowering() {
    let (compilation, _, lowered) = compile(
        "&stack int escape() {\n\
           int x = 42;\n\
           return &x;\n\
         }\n",
    );
    assert_eq!(errors_of(&compilation), vec![Category::RegionEscape]);
    assert!(lowered.is_none());
    // The error points at the return statement.
    let diagnostic = compilation
        .diagnostics
        .iter()
        .find(|d| d.category == Category::RegionEscape)
        .unwrap();
    assert_eq!(diagnostic.position.line, 3);
}

#[test]
fn arena_escape_across_region_boundary() {
    let (compilation, _, lowered) = compile(
        "&heap int leak() {\n\
           region P { capacity: 1024 }\n\
           {\n\
             &arena<P> int p = new<P> int;\n\
             return p;\n\
           }\n\
         }\n",
    );
    assert_eq!(errors_of(&compilation), vec![Category::RegionEscape]);
    assert!(lowered.is_none());
}

#[test]
fn conflicting_exclusive_borrows_name_both() {
    let (compilation, _, lowered) = compile(
        "void conflict() {\n\
           int x = 0;\n\
           &mut int a = &x;\n\
           &mut int b = &x;\n\
           *a = 1;\n\
         }\n",
    );
    let errors = errors_of(&compilation);
    assert_eq!(errors, vec![Category::AliasExclusive]);
    assert!(lowered.is_none());
    let diagnostic = compilation
        .diagnostics
        .iter()
        .find(|d| d.category == Category::AliasExclusive)
        .unwrap();
    // Both borrow sites appear in the message.
    assert!(diagnostic.message.contains("3:"));
    assert!(diagnostic.message.contains("4:"));
    assert!(diagnostic.message.contains("x"));
}

#[test]
fn compile_time_factorial_is_3628800() {
    let (compilation, analysis, lowered) = compile(
        "const int factorial(int n) {\n\
           if (n <= 1) { return 1; }\n\
           return n * factorial(n - 1);\n\
         }\n\
         const int F = factorial(10);\n\
         static_assert(F == 3628800);\n",
    );
    assert!(
        !compilation.diagnostics.has_errors(),
        "{}",
        compilation.diagnostics.render(&compilation.map)
    );
    assert!(lowered.is_some());
    let analysis = analysis.unwrap();
    assert_eq!(
        analysis.const_value("F"),
        Some(&Value::Int {
            value: 3_628_800,
            ty: IntType::I32
        })
    );
}

#[test]
fn failed_static_assert_is_reported() {
    let (compilation, _, lowered) = compile(
        "const int N = 6;\n\
         static_assert(N == 7, \"N must be seven\");\n",
    );
    assert_eq!(errors_of(&compilation), vec![Category::SemaStaticAssert]);
    assert!(lowered.is_none());
}

#[test]
fn if_const_discards_the_dead_branch_unchecked() {
    let (compilation, _, lowered) = compile(
        "const int W = 8;\n\
         int pick() {\n\
           if const (W == 8) {\n\
             return 1;\n\
           } else {\n\
             return undefined_symbol_b;\n\
           }\n\
         }\n",
    );
    assert!(
        !compilation.diagnostics.has_errors(),
        "{}",
        compilation.diagnostics.render(&compilation.map)
    );
    assert!(lowered.is_some());
}

#[test]
fn generic_min_monomorphizes_exactly_twice() {
    let (compilation, analysis, lowered) = compile(
        "generic<T: Numeric> T min(T a, T b) {\n\
           if (a < b) { return a; }\n\
           return b;\n\
         }\n\
         int ints() { return min(3, 7); }\n\
         double doubles() { return min(1.5, 2.5); }\n\
         double doubles_again() { return min(2.5, 3.5); }\n",
    );
    assert!(
        !compilation.diagnostics.has_errors(),
        "{}",
        compilation.diagnostics.render(&compilation.map)
    );
    let analysis = analysis.unwrap();
    assert_eq!(analysis.instantiations.len(), 2);

    let lowered = lowered.unwrap();
    let instantiated: Vec<&str> = lowered
        .functions
        .iter()
        .map(|f| f.name.as_str())
        .filter(|name| name.starts_with("min<"))
        .collect();
    assert_eq!(instantiated.len(), 2);
    assert!(instantiated.contains(&"min<i32>"));
    assert!(instantiated.contains(&"min<double>"));
}
