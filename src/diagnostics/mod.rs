//! # SafeC Diagnostics
//!
//! One sink per translation unit. Every phase reports through it; once a
//! fatal error is recorded downstream phases are free to stop, and lowering
//! is skipped whenever any error (fatal or not) was recorded. Warnings never
//! block anything.
//!
//! Each diagnostic carries a severity, a position, a stable machine-readable
//! category tag for tooling filters, and a rendered human message. Rendering
//! sorts by primary source position (stably, so equal positions keep emission
//! order) and is deterministic for the same input.

use crate::source::{Position, SourceMap};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    Note,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        })
    }
}

/// Stable category tags. The short names are a compatibility surface: tools
/// filter on them, so renaming one is a breaking change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    LexUnterminated,
    LexEscape,
    LexChar,
    ParseUnexpected,
    ParseUnterminated,
    ParseDecl,
    ResolveUndefined,
    ResolveDuplicate,
    ResolveCycle,
    TypeMismatch,
    TypeCast,
    TypeLvalue,
    TypeArity,
    TypeBounds,
    RegionEscape,
    RegionOutlives,
    RegionGlobal,
    RegionFfi,
    AliasExclusive,
    AliasMoved,
    NullDeref,
    NullNarrow,
    InitUseBeforeInit,
    InitConditional,
    ConstLimit,
    ConstDivZero,
    ConstOverflow,
    ConstShift,
    ConstCall,
    ConstIo,
    ConstContext,
    UnsafeRawPointer,
    UnsafeEscape,
    PpConditional,
    PpMacro,
    PpInclude,
    PpUndefined,
    PpReserved,
    SemaMustUse,
    SemaPure,
    SemaUnused,
    SemaStaticAssert,
    MonoConstraint,
    MonoDepth,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::LexUnterminated => "lex/unterminated",
            Category::LexEscape => "lex/escape",
            Category::LexChar => "lex/char",
            Category::ParseUnexpected => "parse/unexpected",
            Category::ParseUnterminated => "parse/unterminated",
            Category::ParseDecl => "parse/decl",
            Category::ResolveUndefined => "resolve/undefined",
            Category::ResolveDuplicate => "resolve/duplicate",
            Category::ResolveCycle => "resolve/cycle",
            Category::TypeMismatch => "type/mismatch",
            Category::TypeCast => "type/cast",
            Category::TypeLvalue => "type/lvalue",
            Category::TypeArity => "type/arity",
            Category::TypeBounds => "type/bounds",
            Category::RegionEscape => "region/escape",
            Category::RegionOutlives => "region/outlives",
            Category::RegionGlobal => "region/global",
            Category::RegionFfi => "region/ffi",
            Category::AliasExclusive => "alias/exclusive",
            Category::AliasMoved => "alias/moved",
            Category::NullDeref => "null/deref",
            Category::NullNarrow => "null/narrow",
            Category::InitUseBeforeInit => "init/use-before-init",
            Category::InitConditional => "init/conditional",
            Category::ConstLimit => "const/limit",
            Category::ConstDivZero => "const/div-zero",
            Category::ConstOverflow => "const/overflow",
            Category::ConstShift => "const/shift",
            Category::ConstCall => "const/call",
            Category::ConstIo => "const/io",
            Category::ConstContext => "const/context",
            Category::UnsafeRawPointer => "unsafe/raw-pointer",
            Category::UnsafeEscape => "unsafe/escape",
            Category::PpConditional => "pp/conditional",
            Category::PpMacro => "pp/macro",
            Category::PpInclude => "pp/include",
            Category::PpUndefined => "pp/undefined",
            Category::PpReserved => "pp/reserved",
            Category::SemaMustUse => "sema/must-use",
            Category::SemaPure => "sema/pure",
            Category::SemaUnused => "sema/unused",
            Category::SemaStaticAssert => "sema/static-assert",
            Category::MonoConstraint => "mono/constraint",
            Category::MonoDepth => "mono/depth",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Category,
    pub position: Position,
    pub message: String,
}

/// The per-translation-unit diagnostic sink. Emission order is preserved;
/// `sorted` re-orders by primary position for rendering.
#[derive(Default)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
    errors: usize,
    fatal: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &mut self,
        severity: Severity,
        category: Category,
        position: Position,
        message: impl Into<String>,
    ) {
        if severity >= Severity::Error {
            self.errors += 1;
        }
        if severity == Severity::Fatal {
            self.fatal = true;
        }
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            position,
            message: message.into(),
        });
    }

    pub fn note(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.emit(Severity::Note, category, position, message);
    }

    pub fn warning(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.emit(Severity::Warning, category, position, message);
    }

    pub fn error(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.emit(Severity::Error, category, position, message);
    }

    pub fn fatal(&mut self, category: Category, position: Position, message: impl Into<String>) {
        self.emit(Severity::Fatal, category, position, message);
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Diagnostics in rendering order: by (file, offset), stable so that
    /// equal positions keep their emission order.
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut sorted: Vec<&Diagnostic> = self.diagnostics.iter().collect();
        sorted.sort_by_key(|d| d.position);
        sorted
    }

    /// Render every diagnostic as `file:line:col: severity: category: message`
    /// followed by an indented excerpt with a caret under the column.
    pub fn render(&self, map: &SourceMap) -> String {
        let mut out = String::new();
        for diagnostic in self.sorted() {
            self.render_one(map, diagnostic, &mut out);
        }
        out
    }

    fn render_one(&self, map: &SourceMap, diagnostic: &Diagnostic, out: &mut String) {
        let p = diagnostic.position;
        out.push_str(&format!(
            "{}:{}:{}: {}: {}: {}\n",
            map.name(p.file),
            p.line,
            p.column,
            diagnostic.severity,
            diagnostic.category,
            diagnostic.message
        ));
        if let Some(line) = map.line_text(p.file, p.line) {
            let caret_pad: String = line
                .chars()
                .take(p.column.saturating_sub(1) as usize)
                .map(|c| if c == '\t' { '\t' } else { ' ' })
                .collect();
            out.push_str(&format!("  {}\n  {}^\n", line, caret_pad));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileId;

    fn at(offset: u32, column: u32) -> Position {
        Position {
            file: FileId(0),
            line: 1,
            column,
            offset,
        }
    }

    #[test]
    fn errors_are_counted_and_warnings_are_not() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warning(Category::SemaMustUse, at(0, 1), "ignored result");
        assert!(!diagnostics.has_errors());
        diagnostics.error(Category::TypeMismatch, at(4, 5), "mismatched operands");
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.error_count(), 1);
        assert!(!diagnostics.has_fatal());
    }

    #[test]
    fn rendering_sorts_by_position_stably() {
        let mut map = SourceMap::new();
        map.add("t.sc", "int x = y;\n");
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(Category::TypeMismatch, at(8, 9), "second");
        diagnostics.error(Category::ResolveUndefined, at(4, 5), "first");
        diagnostics.error(Category::TypeMismatch, at(8, 9), "third");

        let rendered = diagnostics.render(&map);
        let first = rendered.find("first").unwrap();
        let second = rendered.find("second").unwrap();
        let third = rendered.find("third").unwrap();
        assert!(first < second && second < third);
        assert!(rendered.starts_with("t.sc:1:5: error: resolve/undefined: first"));
        assert!(rendered.contains("    ^"));
    }
}
