//! The universal properties: determinism, ordering, borrow soundness on
//! well-typed input, region erasure, and scope teardown, each driven through
//! the library pipeline.

use safec::lower::{LExpr, LStmt, LTy, LoweredUnit};
use safec::pp::NoIncludes;
use safec::{Compilation, Options};

fn compile(text: &str) -> (Compilation, Option<LoweredUnit>) {
    let mut compilation = Compilation::new(Options::default());
    let (_, _, lowered) = compilation.compile("main.sc", text, &NoIncludes);
    (compilation, lowered)
}

fn compile_clean(text: &str) -> (Compilation, LoweredUnit) {
    let (compilation, lowered) = compile(text);
    assert!(
        !compilation.diagnostics.has_errors(),
        "{}",
        compilation.diagnostics.render(&compilation.map)
    );
    (compilation, lowered.expect("lowering was skipped"))
}

#[test]
fn preprocessing_and_diagnostics_are_deterministic() {
    let text = "#define LIMIT 16\n\
                #if LIMIT > 8\n\
                const int N = LIMIT * 2;\n\
                #endif\n\
                static_assert(N == 32);\n\
                int f() { return N; }\n";
    let (first, _) = compile(text);
    let (second, _) = compile(text);
    assert_eq!(
        first.diagnostics.render(&first.map),
        second.diagnostics.render(&second.map)
    );

    let mut a = Compilation::new(Options::default());
    let mut b = Compilation::new(Options::default());
    let pp_a = a.preprocess("main.sc", text, &NoIncludes).remaining_text();
    let pp_b = b.preprocess("main.sc", text, &NoIncludes).remaining_text();
    assert_eq!(pp_a, pp_b);
}

#[test]
fn const_eval_is_deterministic_across_compilations() {
    let text = "const int mix(int n) {\n\
                  int acc = 1;\n\
                  for (int i = 1; i < n; i = i + 1) {\n\
                    acc = acc *| 31 +| i;\n\
                  }\n\
                  return acc;\n\
                }\n\
                const int HASH = mix(1000);\n";
    let mut first = Compilation::new(Options::default());
    let (_, first_analysis, _) = first.compile("main.sc", text, &NoIncludes);
    let mut second = Compilation::new(Options::default());
    let (_, second_analysis, _) = second.compile("main.sc", text, &NoIncludes);
    let first_value = first_analysis.unwrap().const_value("HASH").cloned();
    let second_value = second_analysis.unwrap().const_value("HASH").cloned();
    assert!(first_value.is_some());
    assert_eq!(first_value, second_value);
}

#[test]
fn diagnostics_render_in_source_order_regardless_of_traversal_order() {
    // Const function bodies are analyzed before the others, so the error in
    // `late` is discovered first; rendering still orders by position.
    let (compilation, _) = compile(
        "int early() { return first_missing; }\n\
         const int late() { return second_missing; }\n",
    );
    assert_eq!(compilation.diagnostics.error_count(), 2);
    let rendered = compilation.diagnostics.render(&compilation.map);
    let first = rendered.find("first_missing").unwrap();
    let second = rendered.find("second_missing").unwrap();
    assert!(first < second);
}

#[test]
fn shared_borrows_coexist_in_well_typed_code() {
    let (compilation, lowered) = compile(
        "int sum() {\n\
           int x = 3;\n\
           &int a = &x;\n\
           &int b = &x;\n\
           return *a + *b;\n\
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
fn nonlexical_borrows_end_at_last_use() {
    // `a` is never used after `b` is created, so the exclusive borrows do
    // not overlap.
    let (compilation, lowered) = compile(
        "void rotate() {\n\
           int x = 0;\n\
           &mut int a = &x;\n\
           *a = 1;\n\
           &mut int b = &x;\n\
           *b = 2;\n\
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
fn regions_erase_to_attributed_raw_pointers() {
    let (_, lowered) = compile_clean(
        "int deref(&stack mut int p, ?&heap int q) {\n\
           if (q != null) {\n\
             return *p + *q;\n\
           }\n\
           return *p;\n\
         }\n",
    );
    let function = &lowered.functions[0];
    match &function.params[0].1 {
        LTy::Ptr { attrs, .. } => {
            assert!(attrs.nonnull);
            assert!(attrs.noalias);
            assert_eq!(attrs.dereferenceable, Some(4));
            assert_eq!(attrs.align, 4);
        }
        other => panic!("expected an erased pointer, got {:?}", other),
    }
    match &function.params[1].1 {
        LTy::Ptr { attrs, .. } => {
            assert!(!attrs.nonnull);
            assert!(!attrs.noalias);
        }
        other => panic!("expected an erased pointer, got {:?}", other),
    }
}

fn call_names(stmts: &[LStmt]) -> Vec<String> {
    let mut names = Vec::new();
    for stmt in stmts {
        if let LStmt::Expr(LExpr::Call { callee, .. }) = stmt {
            if let LExpr::FunctionRef(name) = &**callee {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[test]
fn defers_unwind_in_reverse_on_every_exit_path() {
    let (_, lowered) = compile_clean(
        "extern void first();\n\
         extern void second();\n\
         int guarded(int x) {\n\
           defer first();\n\
           defer second();\n\
           if (x == 0) {\n\
             return 1;\n\
           }\n\
           return 2;\n\
         }\n",
    );
    let function = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "guarded")
        .unwrap();

    // Early exit: inside the `if`, the defers run second-then-first before
    // the return.
    let then_branch = function
        .body
        .iter()
        .find_map(|stmt| match stmt {
            LStmt::If { then, .. } => Some(then),
            _ => None,
        })
        .expect("lowered if");
    assert_eq!(call_names(then_branch), vec!["second", "first"]);
    assert!(matches!(then_branch.last(), Some(LStmt::Return(_))));

    // Normal exit: same order before the trailing return.
    let trailing: Vec<&LStmt> = function
        .body
        .iter()
        .skip_while(|stmt| !matches!(stmt, LStmt::If { .. }))
        .skip(1)
        .collect();
    let trailing_calls: Vec<String> = trailing
        .iter()
        .filter_map(|stmt| match stmt {
            LStmt::Expr(LExpr::Call { callee, .. }) => match &**callee {
                LExpr::FunctionRef(name) => Some(name.to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(trailing_calls, vec!["second", "first"]);
}

#[test]
fn defers_unwind_on_labeled_break() {
    let (_, lowered) = compile_clean(
        "extern void first();\n\
         extern void second();\n\
         void drain(int n) {\n\
           outer: while (true) {\n\
             defer first();\n\
             defer second();\n\
             if (n == 0) {\n\
               break outer;\n\
             }\n\
           }\n\
         }\n",
    );
    let function = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "drain")
        .unwrap();
    let while_body = function
        .body
        .iter()
        .find_map(|stmt| match stmt {
            LStmt::While { body, .. } => Some(body),
            _ => None,
        })
        .expect("lowered while");
    let break_branch = while_body
        .iter()
        .find_map(|stmt| match stmt {
            LStmt::If { then, .. } => Some(then),
            _ => None,
        })
        .expect("lowered if around break");
    assert_eq!(call_names(break_branch), vec!["second", "first"]);
    assert!(matches!(break_branch.last(), Some(LStmt::Break(Some(_)))));
}

#[test]
fn dense_integer_match_lowers_to_a_jump_table() {
    let (_, lowered) = compile_clean(
        "int dense(int x) {\n\
           match (x) {\n\
             case 0: return 10;\n\
             case 1: return 11;\n\
             case 2: return 12;\n\
             case 3: return 13;\n\
             default: return 0;\n\
           }\n\
         }\n\
         int sparse(int x) {\n\
           match (x) {\n\
             case 0: return 1;\n\
             case 1000: return 2;\n\
             default: return 0;\n\
           }\n\
         }\n",
    );
    let dense = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "dense")
        .unwrap();
    assert!(dense
        .body
        .iter()
        .any(|stmt| matches!(stmt, LStmt::Switch { jump_table: true, .. })));

    let sparse = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "sparse")
        .unwrap();
    assert!(!sparse
        .body
        .iter()
        .any(|stmt| matches!(stmt, LStmt::Switch { .. })));
    assert!(sparse
        .body
        .iter()
        .any(|stmt| matches!(stmt, LStmt::If { .. })));
}

#[test]
fn tagged_union_match_decodes_the_discriminant_first() {
    let (_, lowered) = compile_clean(
        "enum union Shape {\n\
           Circle(double),\n\
           Point,\n\
         }\n\
         int classify(Shape s) {\n\
           match (s) {\n\
             case .Circle(r): return 1;\n\
             case .Point: return 2;\n\
           }\n\
           return 0;\n\
         }\n",
    );
    let function = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "classify")
        .unwrap();
    let switch = function
        .body
        .iter()
        .find_map(|stmt| match stmt {
            LStmt::Switch { value, cases, .. } => Some((value, cases)),
            _ => None,
        })
        .expect("tagged match lowers to a switch");
    assert!(matches!(switch.0, LExpr::TagOf(_)));
    assert_eq!(switch.1.len(), 2);
}

#[test]
fn bounds_checks_become_conditional_traps_outside_unsafe() {
    let (_, lowered) = compile_clean(
        "int read(int i) {\n\
           int table[4] = { 1, 2, 3, 4 };\n\
           return table[i];\n\
         }\n\
         int read_unsafe(int i) {\n\
           int table[4] = { 1, 2, 3, 4 };\n\
           unsafe {\n\
             return table[i];\n\
           }\n\
         }\n",
    );
    let checked = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "read")
        .unwrap();
    fn has_trap(stmts: &[LStmt]) -> bool {
        stmts.iter().any(|stmt| match stmt {
            LStmt::Trap { .. } => true,
            LStmt::Block(inner) => has_trap(inner),
            LStmt::If { then, otherwise, .. } => has_trap(then) || has_trap(otherwise),
            _ => false,
        })
    }
    assert!(has_trap(&checked.body));

    let unchecked = lowered
        .functions
        .iter()
        .find(|f| f.name.as_str() == "read_unsafe")
        .unwrap();
    assert!(!has_trap(&unchecked.body));
}

#[test]
fn constant_out_of_bounds_index_is_a_static_error() {
    let (compilation, lowered) = compile(
        "int bad() {\n\
           int table[4] = { 1, 2, 3, 4 };\n\
           return table[7];\n\
         }\n",
    );
    assert!(compilation
        .diagnostics
        .iter()
        .any(|d| d.category == safec::diagnostics::Category::TypeBounds));
    assert!(lowered.is_none());
}

#[test]
fn zero_capture_closures_lift_to_anonymous_functions() {
    let (compilation, lowered) = compile(
        "int apply() {\n\
           int doubled = 0;\n\
           return doubled;\n\
         }\n\
         int with_closure(int x) {\n\
           return (|int a| a + 1)(x);\n\
         }\n",
    );
    assert!(
        !compilation.diagnostics.has_errors(),
        "{}",
        compilation.diagnostics.render(&compilation.map)
    );
    let lowered = lowered.unwrap();
    assert!(lowered
        .functions
        .iter()
        .any(|f| f.name.as_str().starts_with("__closure")));
}

#[test]
fn capturing_closures_are_rejected() {
    let (compilation, _) = compile(
        "int captures(int x) {\n\
           return (|int a| a + x)(1);\n\
         }\n",
    );
    assert!(compilation.diagnostics.has_errors());
}
