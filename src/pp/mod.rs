//! # SafeC Preprocessor
//!
//! Stream-based text transformation ahead of the lexer. Directives:
//! `#include` (quoted and angled), object-like `#define`, `#undef`, the
//! conditional family `#if`/`#ifdef`/`#ifndef`/`#elif`/`#else`/`#endif`,
//! `#pragma once`, `#error`, and `#warning`.
//!
//! Two modes:
//!
//! * *Safe mode* (default) restricts macros to object-like definitions whose
//!   replacement expands to a constant expression. Function-like macros are
//!   rejected with a diagnostic pointing at the `(` after the macro name.
//! * *Compatibility mode* implements full C semantics: function-like macros,
//!   `#` stringification, `##` concatenation, and `__VA_ARGS__`.
//!
//! `__FILE__` and `__LINE__` are always valid. `__DATE__` and `__TIME__` are
//! explicitly undefined so that identical input produces identical output.
//!
//! Every emitted character carries the position it originated from; text that
//! came out of a macro body carries the macro's use site, which is how
//! diagnostics and `__LINE__` stay honest through expansion.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::diagnostics::{Category, Diagnostics};
use crate::source::{FileId, Position, Source, SourceMap};

/// Where `#include` text comes from. The driver backs this with the
/// filesystem; tests back it with an in-memory map.
pub trait FileLoader {
    fn load(&self, path: &Path) -> Option<String>;
}

/// A loader with no files, for translation units that include nothing.
pub struct NoIncludes;

impl FileLoader for NoIncludes {
    fn load(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// In-memory loader for tests and embedded use.
#[derive(Default)]
pub struct MemoryLoader {
    files: HashMap<PathBuf, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.files.insert(path.into(), text.into());
    }
}

impl FileLoader for MemoryLoader {
    fn load(&self, path: &Path) -> Option<String> {
        self.files.get(path).cloned()
    }
}

#[derive(Clone, Debug, Default)]
pub struct PpOptions {
    /// Full C preprocessor semantics instead of the safe subset.
    pub compat: bool,
    /// Undefined names in conditional arithmetic are errors instead of
    /// evaluating to zero with a warning.
    pub strict: bool,
    pub freestanding: bool,
    pub include_paths: Vec<PathBuf>,
    /// `-D NAME[=VALUE]` predefinitions; a missing value means `1`.
    pub defines: Vec<(String, Option<String>)>,
}

#[derive(Clone, Debug)]
struct Macro {
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    variadic: bool,
    body: String,
}

struct CondFrame {
    parent_active: bool,
    active: bool,
    taken: bool,
    seen_else: bool,
    position: Position,
}

/// One logical (continuation-spliced) line: characters with their original
/// positions, plus the physical line number it started on.
struct LogicalLine {
    chars: Vec<(char, Position)>,
}

pub struct Preprocessor<'a> {
    diagnostics: &'a mut Diagnostics,
    map: &'a mut SourceMap,
    loader: &'a dyn FileLoader,
    options: PpOptions,
    macros: HashMap<String, Macro>,
    pragma_once: HashSet<PathBuf>,
    include_stack: Vec<PathBuf>,
    conditionals: Vec<CondFrame>,
    in_comment: bool,
    out_chars: Vec<char>,
    out_positions: Vec<Position>,
    last_position: Position,
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        diagnostics: &'a mut Diagnostics,
        map: &'a mut SourceMap,
        loader: &'a dyn FileLoader,
        options: PpOptions,
    ) -> Self {
        let mut macros = HashMap::new();
        for (name, value) in &options.defines {
            macros.insert(
                name.clone(),
                Macro {
                    params: None,
                    variadic: false,
                    body: value.clone().unwrap_or_else(|| "1".to_owned()),
                },
            );
        }
        if options.freestanding {
            macros.insert(
                "__SAFEC_FREESTANDING__".to_owned(),
                Macro {
                    params: None,
                    variadic: false,
                    body: "1".to_owned(),
                },
            );
        }
        Self {
            diagnostics,
            map,
            loader,
            options,
            macros,
            pragma_once: HashSet::new(),
            include_stack: Vec::new(),
            conditionals: Vec::new(),
            in_comment: false,
            out_chars: Vec::new(),
            out_positions: Vec::new(),
            last_position: Position::default(),
        }
    }

    /// Preprocess the main translation unit and return the character stream
    /// the lexer consumes.
    pub fn run(mut self, name: &str, text: &str) -> Source {
        let file = self.map.add(name, text);
        self.include_stack.push(PathBuf::from(name));
        self.process_file(file, PathBuf::from(name), text);
        self.include_stack.pop();
        if let Some(frame) = self.conditionals.last() {
            self.diagnostics.error(
                Category::PpConditional,
                frame.position,
                "unterminated #if",
            );
        }
        Source::new(self.out_chars, self.out_positions)
    }

    fn active(&self) -> bool {
        self.conditionals.last().map_or(true, |frame| frame.active)
    }

    fn emit(&mut self, c: char, position: Position) {
        self.out_chars.push(c);
        self.out_positions.push(position);
        self.last_position = position;
    }

    fn process_file(&mut self, file: FileId, path: PathBuf, text: &str) {
        let lines = logical_lines(file, text);
        let conditional_depth_on_entry = self.conditionals.len();
        for line in &lines {
            if !self.in_comment && is_directive(&line.chars) {
                self.handle_directive(&path, line);
            } else if self.active() {
                self.emit_line(file, line);
            } else {
                // Skipped region: nothing is emitted and macros do not
                // expand, but block comments still open and close.
                self.track_comments_only(line);
            }
            let newline_position = self.last_position;
            if self.active() {
                self.emit('\n', newline_position);
            }
        }
        while self.conditionals.len() > conditional_depth_on_entry {
            let frame = self.conditionals.pop().unwrap();
            self.diagnostics
                .error(Category::PpConditional, frame.position, "unterminated #if");
        }
    }

    // ---- directives ----

    fn handle_directive(&mut self, path: &Path, line: &LogicalLine) {
        let mut cursor = LineCursor::new(&line.chars);
        cursor.skip_ws();
        cursor.bump(); // '#'
        cursor.skip_ws();
        let position = cursor.position(self.last_position);
        let name = match cursor.read_identifier() {
            Some(name) => name,
            // A lone `#` is the null directive.
            None => return,
        };

        // Conditional directives are always processed so nesting stays
        // balanced inside skipped regions; everything else only when active.
        match name.as_str() {
            "if" => {
                let parent_active = self.active();
                let value = parent_active && self.eval_condition(&mut cursor, position);
                self.conditionals.push(CondFrame {
                    parent_active,
                    active: value,
                    taken: value,
                    seen_else: false,
                    position,
                });
                return;
            }
            "ifdef" | "ifndef" => {
                let parent_active = self.active();
                let defined = cursor
                    .read_identifier_after_ws()
                    .map_or(false, |n| self.macros.contains_key(&n));
                let value = if name == "ifdef" { defined } else { !defined };
                let active = parent_active && value;
                self.conditionals.push(CondFrame {
                    parent_active,
                    active,
                    taken: value,
                    seen_else: false,
                    position,
                });
                return;
            }
            "elif" => {
                match self.conditionals.pop() {
                    Some(frame) if !frame.seen_else => {
                        let value = frame.parent_active
                            && !frame.taken
                            && self.eval_condition(&mut cursor, position);
                        self.conditionals.push(CondFrame {
                            parent_active: frame.parent_active,
                            active: value,
                            taken: frame.taken || value,
                            seen_else: false,
                            position: frame.position,
                        });
                    }
                    Some(frame) => {
                        self.conditionals.push(frame);
                        self.diagnostics.error(
                            Category::PpConditional,
                            position,
                            "#elif after #else",
                        );
                    }
                    None => self.diagnostics.error(
                        Category::PpConditional,
                        position,
                        "#elif without #if",
                    ),
                }
                return;
            }
            "else" => {
                match self.conditionals.pop() {
                    Some(frame) if !frame.seen_else => {
                        self.conditionals.push(CondFrame {
                            parent_active: frame.parent_active,
                            active: frame.parent_active && !frame.taken,
                            taken: true,
                            seen_else: true,
                            position: frame.position,
                        });
                    }
                    Some(frame) => {
                        self.conditionals.push(frame);
                        self.diagnostics.error(
                            Category::PpConditional,
                            position,
                            "duplicate #else",
                        );
                    }
                    None => self.diagnostics.error(
                        Category::PpConditional,
                        position,
                        "#else without #if",
                    ),
                }
                return;
            }
            "endif" => {
                if self.conditionals.pop().is_none() {
                    self.diagnostics.error(
                        Category::PpConditional,
                        position,
                        "#endif without #if",
                    );
                }
                return;
            }
            _ => {}
        }

        if !self.active() {
            return;
        }

        match name.as_str() {
            "include" => self.handle_include(path, &mut cursor, position),
            "define" => self.handle_define(&mut cursor, position),
            "undef" => {
                if let Some(name) = cursor.read_identifier_after_ws() {
                    self.macros.remove(&name);
                } else {
                    self.diagnostics.error(
                        Category::PpMacro,
                        position,
                        "macro name expected after #undef",
                    );
                }
            }
            "pragma" => {
                let pragma = cursor.read_identifier_after_ws();
                if pragma.as_deref() == Some("once") {
                    self.pragma_once.insert(path.to_path_buf());
                }
                // Other pragmas pass through to the driver unrecognized.
            }
            "error" => {
                let message = cursor.rest_trimmed();
                self.diagnostics
                    .error(Category::PpMacro, position, format!("#error: {}", message));
            }
            "warning" => {
                let message = cursor.rest_trimmed();
                self.diagnostics.warning(
                    Category::PpMacro,
                    position,
                    format!("#warning: {}", message),
                );
            }
            unknown => {
                self.diagnostics.error(
                    Category::PpReserved,
                    position,
                    format!("unknown preprocessing directive #{}", unknown),
                );
            }
        }
    }

    fn handle_include(&mut self, from: &Path, cursor: &mut LineCursor, position: Position) {
        cursor.skip_ws();
        let (target, angled) = match cursor.peek() {
            Some('"') => {
                cursor.bump();
                (cursor.read_until('"'), false)
            }
            Some('<') => {
                cursor.bump();
                (cursor.read_until('>'), true)
            }
            _ => {
                self.diagnostics.error(
                    Category::PpInclude,
                    position,
                    "expected \"file\" or <file> after #include",
                );
                return;
            }
        };
        let target = match target {
            Some(target) if !target.is_empty() => target,
            _ => {
                self.diagnostics
                    .error(Category::PpInclude, position, "malformed #include path");
                return;
            }
        };

        let mut candidates: Vec<PathBuf> = Vec::new();
        if !angled {
            let dir = from.parent().unwrap_or_else(|| Path::new("."));
            candidates.push(dir.join(&target));
        }
        for dir in &self.options.include_paths {
            candidates.push(dir.join(&target));
        }

        for candidate in candidates {
            if let Some(text) = self.loader.load(&candidate) {
                if self.pragma_once.contains(&candidate) {
                    return;
                }
                if self.include_stack.contains(&candidate) {
                    self.diagnostics.error(
                        Category::PpInclude,
                        position,
                        format!("include cycle through {}", candidate.display()),
                    );
                    return;
                }
                let file = self.map.add(candidate.display().to_string(), &text);
                self.include_stack.push(candidate.clone());
                self.process_file(file, candidate, &text);
                self.include_stack.pop();
                return;
            }
        }
        self.diagnostics.error(
            Category::PpInclude,
            position,
            format!("include file not found: {}", target),
        );
    }

    fn handle_define(&mut self, cursor: &mut LineCursor, position: Position) {
        cursor.skip_ws();
        let name = match cursor.read_identifier() {
            Some(name) => name,
            None => {
                self.diagnostics.error(
                    Category::PpMacro,
                    position,
                    "macro name expected after #define",
                );
                return;
            }
        };

        // A parenthesis immediately after the name (no whitespace) makes the
        // macro function-like.
        if cursor.peek() == Some('(') {
            let paren_position = cursor.position(position);
            if !self.options.compat {
                self.diagnostics.error(
                    Category::PpMacro,
                    paren_position,
                    format!(
                        "function-like macro {} is not allowed in safe mode",
                        name
                    ),
                );
                return;
            }
            cursor.bump();
            let mut params = Vec::new();
            let mut variadic = false;
            loop {
                cursor.skip_ws();
                match cursor.peek() {
                    Some(')') => {
                        cursor.bump();
                        break;
                    }
                    Some('.') => {
                        if cursor.read_ellipsis() {
                            variadic = true;
                        } else {
                            self.diagnostics.error(
                                Category::PpMacro,
                                paren_position,
                                "malformed macro parameter list",
                            );
                            return;
                        }
                    }
                    _ => match cursor.read_identifier() {
                        Some(param) => params.push(param),
                        None => {
                            self.diagnostics.error(
                                Category::PpMacro,
                                paren_position,
                                "malformed macro parameter list",
                            );
                            return;
                        }
                    },
                }
                cursor.skip_ws();
                if cursor.peek() == Some(',') {
                    cursor.bump();
                }
            }
            let body = cursor.rest_trimmed();
            self.macros.insert(
                name,
                Macro {
                    params: Some(params),
                    variadic,
                    body,
                },
            );
        } else {
            let body = cursor.rest_trimmed();
            self.macros.insert(
                name,
                Macro {
                    params: None,
                    variadic: false,
                    body,
                },
            );
        }
    }

    // ---- plain text emission with macro expansion ----

    fn track_comments_only(&mut self, line: &LogicalLine) {
        let mut i = 0;
        let chars = &line.chars;
        while i < chars.len() {
            if self.in_comment {
                if chars[i].0 == '*' && chars.get(i + 1).map(|c| c.0) == Some('/') {
                    self.in_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
            } else if chars[i].0 == '/' && chars.get(i + 1).map(|c| c.0) == Some('*') {
                self.in_comment = true;
                i += 2;
            } else if chars[i].0 == '/' && chars.get(i + 1).map(|c| c.0) == Some('/') {
                break;
            } else {
                i += 1;
            }
        }
    }

    fn emit_line(&mut self, file: FileId, line: &LogicalLine) {
        let mut cursor = LineCursor::new(&line.chars);
        while let Some(c) = cursor.peek() {
            if self.in_comment {
                let position = cursor.position(self.last_position);
                if c == '*' && cursor.peek_nth(1) == Some('/') {
                    self.in_comment = false;
                    self.emit('*', position);
                    self.emit('/', cursor.position(position));
                    cursor.bump();
                    cursor.bump();
                } else {
                    self.emit(c, position);
                    cursor.bump();
                }
                continue;
            }
            match c {
                '/' if cursor.peek_nth(1) == Some('/') => {
                    // Line comment: copy the rest verbatim.
                    while let Some(c) = cursor.peek() {
                        let position = cursor.position(self.last_position);
                        self.emit(c, position);
                        cursor.bump();
                    }
                }
                '/' if cursor.peek_nth(1) == Some('*') => {
                    self.in_comment = true;
                    let position = cursor.position(self.last_position);
                    self.emit('/', position);
                    self.emit('*', cursor.position(position));
                    cursor.bump();
                    cursor.bump();
                }
                '"' | '\'' => self.emit_literal(&mut cursor, c),
                c if c.is_alphabetic() || c == '_' => {
                    let position = cursor.position(self.last_position);
                    let word = cursor.read_identifier().unwrap();
                    self.emit_identifier(file, &word, position, &mut cursor);
                }
                c => {
                    let position = cursor.position(self.last_position);
                    self.emit(c, position);
                    cursor.bump();
                }
            }
        }
    }

    fn emit_literal(&mut self, cursor: &mut LineCursor, delimiter: char) {
        let position = cursor.position(self.last_position);
        self.emit(delimiter, position);
        cursor.bump();
        while let Some(c) = cursor.peek() {
            let position = cursor.position(self.last_position);
            self.emit(c, position);
            cursor.bump();
            if c == '\\' {
                if let Some(escaped) = cursor.peek() {
                    let position = cursor.position(position);
                    self.emit(escaped, position);
                    cursor.bump();
                }
            } else if c == delimiter {
                break;
            }
        }
    }

    fn emit_identifier(
        &mut self,
        file: FileId,
        word: &str,
        position: Position,
        cursor: &mut LineCursor,
    ) {
        match word {
            "__FILE__" => {
                let name = self.map.name(file).to_owned();
                self.emit_expansion(&format!("\"{}\"", name.replace('\\', "/")), position);
                return;
            }
            "__LINE__" => {
                self.emit_expansion(&position.line.to_string(), position);
                return;
            }
            "__DATE__" | "__TIME__" => {
                self.diagnostics.error(
                    Category::PpReserved,
                    position,
                    format!("{} is not available: builds must be reproducible", word),
                );
                return;
            }
            _ => {}
        }

        let is_function_like = matches!(
            self.macros.get(word),
            Some(Macro {
                params: Some(_),
                ..
            })
        );
        if self.macros.contains_key(word) {
            if is_function_like {
                // Compat mode only; safe mode never defines these.
                if cursor.next_non_ws() == Some('(') {
                    cursor.skip_ws();
                    let arguments = cursor.read_call_arguments();
                    let mut hide = vec![word.to_owned()];
                    let expansion =
                        self.expand_function_like(word, &arguments, &mut hide, position);
                    self.emit_expansion(&expansion, position);
                } else {
                    // Function-like macro name without arguments is left as
                    // plain text, as in C.
                    self.emit_expansion(word, position);
                }
            } else {
                let mut hide = vec![word.to_owned()];
                let body = self.macros[word].body.clone();
                let expansion = self.expand_text(&body, &mut hide, position);
                if !self.options.compat && !self.is_constant_expression(&expansion) {
                    self.diagnostics.error(
                        Category::PpMacro,
                        position,
                        format!(
                            "macro {} does not expand to a constant expression \
                             (safe mode)",
                            word
                        ),
                    );
                }
                self.emit_expansion(&expansion, position);
            }
        } else {
            self.emit_expansion(word, position);
        }
    }

    fn emit_expansion(&mut self, text: &str, position: Position) {
        for c in text.chars() {
            self.emit(c, position);
        }
    }

    /// Recursively expand object-like (and, in compat mode, function-like)
    /// macros in `text`. All output is attributed to `position`.
    fn expand_text(&mut self, text: &str, hide: &mut Vec<String>, position: Position) -> String {
        let chars: Vec<(char, Position)> = text.chars().map(|c| (c, position)).collect();
        let mut cursor = LineCursor::new(&chars);
        let mut out = String::new();
        while let Some(c) = cursor.peek() {
            match c {
                '"' | '\'' => {
                    let delimiter = c;
                    out.push(c);
                    cursor.bump();
                    while let Some(c) = cursor.peek() {
                        out.push(c);
                        cursor.bump();
                        if c == '\\' {
                            if let Some(escaped) = cursor.peek() {
                                out.push(escaped);
                                cursor.bump();
                            }
                        } else if c == delimiter {
                            break;
                        }
                    }
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = cursor.read_identifier().unwrap();
                    if hide.contains(&word) {
                        out.push_str(&word);
                        continue;
                    }
                    match self.macros.get(&word).cloned() {
                        Some(Macro { params: None, body, .. }) => {
                            hide.push(word);
                            let expanded = self.expand_text(&body, hide, position);
                            hide.pop();
                            out.push_str(&expanded);
                        }
                        Some(Macro {
                            params: Some(_), ..
                        }) if self.options.compat => {
                            if cursor.next_non_ws() == Some('(') {
                                cursor.skip_ws();
                                let arguments = cursor.read_call_arguments();
                                hide.push(word.clone());
                                let expanded = self
                                    .expand_function_like(&word, &arguments, hide, position);
                                hide.pop();
                                out.push_str(&expanded);
                            } else {
                                out.push_str(&word);
                            }
                        }
                        _ => out.push_str(&word),
                    }
                }
                c => {
                    out.push(c);
                    cursor.bump();
                }
            }
        }
        out
    }

    /// Substitute arguments into a function-like macro body, handling `#`
    /// stringification, `##` concatenation, and `__VA_ARGS__`, then rescan.
    fn expand_function_like(
        &mut self,
        name: &str,
        arguments: &[String],
        hide: &mut Vec<String>,
        position: Position,
    ) -> String {
        let mac = self.macros[name].clone();
        let params = mac.params.as_deref().unwrap_or(&[]);
        if arguments.len() < params.len() || (arguments.len() > params.len() && !mac.variadic) {
            self.diagnostics.error(
                Category::PpMacro,
                position,
                format!(
                    "macro {} expects {} argument(s), got {}",
                    name,
                    params.len(),
                    arguments.len()
                ),
            );
            return String::new();
        }

        let expanded_arguments: Vec<String> = arguments
            .iter()
            .map(|argument| self.expand_text(argument, hide, position))
            .collect();
        let va_args = if mac.variadic {
            arguments[params.len()..].join(", ")
        } else {
            String::new()
        };

        let argument_of = |word: &str| -> Option<usize> {
            params.iter().position(|param| param == word)
        };

        let chars: Vec<(char, Position)> = mac.body.chars().map(|c| (c, position)).collect();
        let mut cursor = LineCursor::new(&chars);
        let mut out = String::new();
        while let Some(c) = cursor.peek() {
            match c {
                '#' if cursor.peek_nth(1) == Some('#') => {
                    // Token paste: drop the operator and the whitespace
                    // around it.
                    cursor.bump();
                    cursor.bump();
                    while out.ends_with(' ') || out.ends_with('\t') {
                        out.pop();
                    }
                    cursor.skip_ws();
                }
                '#' => {
                    cursor.bump();
                    cursor.skip_ws();
                    match cursor.read_identifier() {
                        Some(word) => {
                            let raw = if word == "__VA_ARGS__" {
                                Some(va_args.clone())
                            } else {
                                argument_of(&word).map(|i| arguments[i].clone())
                            };
                            match raw {
                                Some(raw) => {
                                    out.push('"');
                                    out.push_str(
                                        &raw.replace('\\', "\\\\").replace('"', "\\\""),
                                    );
                                    out.push('"');
                                }
                                None => {
                                    self.diagnostics.error(
                                        Category::PpMacro,
                                        position,
                                        "# must be followed by a macro parameter",
                                    );
                                }
                            }
                        }
                        None => {
                            self.diagnostics.error(
                                Category::PpMacro,
                                position,
                                "# must be followed by a macro parameter",
                            );
                        }
                    }
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = cursor.read_identifier().unwrap();
                    if word == "__VA_ARGS__" {
                        out.push_str(&va_args);
                    } else {
                        match argument_of(&word) {
                            Some(i) => out.push_str(&expanded_arguments[i]),
                            None => out.push_str(&word),
                        }
                    }
                }
                c => {
                    out.push(c);
                    cursor.bump();
                }
            }
        }
        self.expand_text(&out, hide, position)
    }

    // ---- conditional arithmetic ----

    fn eval_condition(&mut self, cursor: &mut LineCursor, position: Position) -> bool {
        let tokens = self.cond_tokens(cursor, position);
        let mut eval = CondEval {
            tokens,
            index: 0,
            diagnostics: &mut *self.diagnostics,
            strict: self.options.strict,
            position,
        };
        let value = eval.ternary();
        value != 0
    }

    /// Whether `text` evaluates as preprocessor constant arithmetic, without
    /// emitting diagnostics. Used for safe-mode macro validation.
    fn is_constant_expression(&mut self, text: &str) -> bool {
        let chars: Vec<(char, Position)> = text
            .chars()
            .map(|c| (c, Position::default()))
            .collect();
        let mut cursor = LineCursor::new(&chars);
        let mut scratch = Diagnostics::new();
        let tokens = {
            let mut collector = CondTokenizer {
                cursor: &mut cursor,
                macros: &self.macros,
                diagnostics: &mut scratch,
                position: Position::default(),
                expand: false,
            };
            collector.collect()
        };
        if tokens.iter().any(|t| matches!(t, CondTok::Ident(_))) {
            return false;
        }
        let mut eval = CondEval {
            tokens,
            index: 0,
            diagnostics: &mut scratch,
            strict: true,
            position: Position::default(),
        };
        eval.ternary();
        !scratch.has_errors()
    }

    fn cond_tokens(&mut self, cursor: &mut LineCursor, position: Position) -> Vec<CondTok> {
        let mut collector = CondTokenizer {
            cursor,
            macros: &self.macros,
            diagnostics: &mut *self.diagnostics,
            position,
            expand: true,
        };
        collector.collect()
    }
}

fn is_directive(chars: &[(char, Position)]) -> bool {
    chars
        .iter()
        .map(|&(c, _)| c)
        .find(|c| !c.is_whitespace())
        == Some('#')
}

fn logical_lines(file: FileId, text: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    let mut position = Position::start_of(file);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        match c {
            '\n' => {
                lines.push(LogicalLine {
                    chars: std::mem::take(&mut current),
                });
            }
            '\r' => {} // consumed; '\n' follows in well-formed input
            '\\' if next == Some('\n') || next == Some('\r') => {
                // Continuation: splice the next physical line on.
                position = position.after(c);
                while let Some(&c) = chars.peek() {
                    if c == '\r' {
                        chars.next();
                        position = position.after(c);
                    } else if c == '\n' {
                        chars.next();
                        position = position.after(c);
                        break;
                    } else {
                        break;
                    }
                }
                continue;
            }
            _ => current.push((c, position)),
        }
        position = position.after(c);
    }
    if !current.is_empty() {
        lines.push(LogicalLine { chars: current });
    }
    lines
}

/// Walks one logical line.
struct LineCursor<'l> {
    chars: &'l [(char, Position)],
    index: usize,
}

impl<'l> LineCursor<'l> {
    fn new(chars: &'l [(char, Position)]) -> Self {
        Self { chars, index: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).map(|&(c, _)| c)
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.chars.get(self.index + n).map(|&(c, _)| c)
    }

    fn position(&self, fallback: Position) -> Position {
        self.chars
            .get(self.index)
            .or_else(|| self.chars.last())
            .map(|&(_, p)| p)
            .unwrap_or(fallback)
    }

    fn bump(&mut self) {
        self.index += 1;
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.bump();
        }
    }

    /// The next non-whitespace character, without consuming anything.
    fn next_non_ws(&self) -> Option<char> {
        let mut n = 0;
        while let Some(c) = self.peek_nth(n) {
            if c.is_whitespace() {
                n += 1;
            } else {
                return Some(c);
            }
        }
        None
    }

    fn read_identifier(&mut self) -> Option<String> {
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {}
            _ => return None,
        }
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Some(word)
    }

    fn read_identifier_after_ws(&mut self) -> Option<String> {
        self.skip_ws();
        self.read_identifier()
    }

    fn read_until(&mut self, terminator: char) -> Option<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.bump();
            if c == terminator {
                return Some(out);
            }
            out.push(c);
        }
        None
    }

    fn read_ellipsis(&mut self) -> bool {
        if self.peek() == Some('.') && self.peek_nth(1) == Some('.') && self.peek_nth(2) == Some('.')
        {
            self.bump();
            self.bump();
            self.bump();
            true
        } else {
            false
        }
    }

    fn rest_trimmed(&mut self) -> String {
        let rest: String = self.chars[self.index.min(self.chars.len())..]
            .iter()
            .map(|&(c, _)| c)
            .collect();
        self.index = self.chars.len();
        rest.trim().to_owned()
    }

    /// Read a parenthesized, comma-separated argument list starting at `(`.
    /// Commas inside nested parentheses or literals do not split.
    fn read_call_arguments(&mut self) -> Vec<String> {
        let mut arguments = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;
        self.bump(); // '('
        while let Some(c) = self.peek() {
            match c {
                '(' => {
                    depth += 1;
                    current.push(c);
                    self.bump();
                }
                ')' => {
                    self.bump();
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    arguments.push(current.trim().to_owned());
                    current.clear();
                    self.bump();
                }
                '"' | '\'' => {
                    let delimiter = c;
                    current.push(c);
                    self.bump();
                    while let Some(c) = self.peek() {
                        current.push(c);
                        self.bump();
                        if c == '\\' {
                            if let Some(escaped) = self.peek() {
                                current.push(escaped);
                                self.bump();
                            }
                        } else if c == delimiter {
                            break;
                        }
                    }
                }
                c => {
                    current.push(c);
                    self.bump();
                }
            }
        }
        if !current.trim().is_empty() || !arguments.is_empty() {
            arguments.push(current.trim().to_owned());
        }
        arguments
    }
}

// ---- conditional expression evaluation ----

#[derive(Clone, Debug, PartialEq)]
enum CondTok {
    Num(i64),
    Ident(String),
    Op(&'static str),
}

struct CondTokenizer<'t, 'l> {
    cursor: &'t mut LineCursor<'l>,
    macros: &'t HashMap<String, Macro>,
    diagnostics: &'t mut Diagnostics,
    position: Position,
    /// Expand object-like macros encountered in the expression.
    expand: bool,
}

impl CondTokenizer<'_, '_> {
    fn collect(&mut self) -> Vec<CondTok> {
        let mut tokens = Vec::new();
        self.collect_into(&mut tokens, &mut Vec::new());
        tokens
    }

    fn collect_into(&mut self, tokens: &mut Vec<CondTok>, hide: &mut Vec<String>) {
        loop {
            self.cursor.skip_ws();
            let c = match self.cursor.peek() {
                Some(c) => c,
                None => break,
            };
            if c.is_ascii_digit() {
                tokens.push(CondTok::Num(self.read_number()));
            } else if c.is_alphabetic() || c == '_' {
                let word = self.cursor.read_identifier().unwrap();
                if word == "defined" {
                    tokens.push(CondTok::Num(self.read_defined()));
                } else if self.expand && !hide.contains(&word) {
                    match self.macros.get(&word) {
                        Some(Macro { params: None, body, .. }) => {
                            let chars: Vec<(char, Position)> =
                                body.chars().map(|c| (c, self.position)).collect();
                            let mut inner_cursor = LineCursor::new(&chars);
                            let mut inner = CondTokenizer {
                                cursor: &mut inner_cursor,
                                macros: self.macros,
                                diagnostics: &mut *self.diagnostics,
                                position: self.position,
                                expand: true,
                            };
                            hide.push(word);
                            inner.collect_into(tokens, hide);
                            hide.pop();
                        }
                        _ => tokens.push(CondTok::Ident(word)),
                    }
                } else {
                    tokens.push(CondTok::Ident(word));
                }
            } else {
                let two: Option<&'static str> = match (c, self.cursor.peek_nth(1)) {
                    ('&', Some('&')) => Some("&&"),
                    ('|', Some('|')) => Some("||"),
                    ('=', Some('=')) => Some("=="),
                    ('!', Some('=')) => Some("!="),
                    ('<', Some('=')) => Some("<="),
                    ('>', Some('=')) => Some(">="),
                    ('<', Some('<')) => Some("<<"),
                    ('>', Some('>')) => Some(">>"),
                    _ => None,
                };
                if let Some(op) = two {
                    self.cursor.bump();
                    self.cursor.bump();
                    tokens.push(CondTok::Op(op));
                } else {
                    let one: Option<&'static str> = match c {
                        '+' => Some("+"),
                        '-' => Some("-"),
                        '*' => Some("*"),
                        '/' => Some("/"),
                        '%' => Some("%"),
                        '&' => Some("&"),
                        '|' => Some("|"),
                        '^' => Some("^"),
                        '~' => Some("~"),
                        '!' => Some("!"),
                        '<' => Some("<"),
                        '>' => Some(">"),
                        '(' => Some("("),
                        ')' => Some(")"),
                        '?' => Some("?"),
                        ':' => Some(":"),
                        _ => None,
                    };
                    self.cursor.bump();
                    match one {
                        Some(op) => tokens.push(CondTok::Op(op)),
                        None => {
                            self.diagnostics.error(
                                Category::PpConditional,
                                self.position,
                                format!("unexpected character {:?} in #if expression", c),
                            );
                        }
                    }
                }
            }
        }
    }

    fn read_number(&mut self) -> i64 {
        let mut digits = String::new();
        let mut radix = 10;
        if self.cursor.peek() == Some('0') {
            match self.cursor.peek_nth(1) {
                Some('x') | Some('X') => {
                    radix = 16;
                    self.cursor.bump();
                    self.cursor.bump();
                }
                Some('b') | Some('B') => {
                    radix = 2;
                    self.cursor.bump();
                    self.cursor.bump();
                }
                Some(c) if c.is_digit(8) => {
                    radix = 8;
                    self.cursor.bump();
                }
                _ => {}
            }
        }
        while let Some(c) = self.cursor.peek() {
            if c.is_digit(radix) {
                digits.push(c);
                self.cursor.bump();
            } else if matches!(c, 'u' | 'U' | 'l' | 'L') {
                self.cursor.bump();
            } else {
                break;
            }
        }
        i64::from_str_radix(&digits, radix).unwrap_or(0)
    }

    fn read_defined(&mut self) -> i64 {
        self.cursor.skip_ws();
        let parenthesized = self.cursor.peek() == Some('(');
        if parenthesized {
            self.cursor.bump();
        }
        let name = self.cursor.read_identifier_after_ws();
        if parenthesized {
            self.cursor.skip_ws();
            if self.cursor.peek() == Some(')') {
                self.cursor.bump();
            } else {
                self.diagnostics.error(
                    Category::PpConditional,
                    self.position,
                    "expected ) after defined(",
                );
            }
        }
        match name {
            Some(name) if self.macros.contains_key(&name) => 1,
            Some(_) => 0,
            None => {
                self.diagnostics.error(
                    Category::PpConditional,
                    self.position,
                    "macro name expected after defined",
                );
                0
            }
        }
    }
}

/// Precedence-climbing evaluator over the conditional token stream, with C
/// preprocessor arithmetic rules. Undefined names evaluate to zero with a
/// warning unless strict mode makes them errors.
struct CondEval<'d> {
    tokens: Vec<CondTok>,
    index: usize,
    diagnostics: &'d mut Diagnostics,
    strict: bool,
    position: Position,
}

impl CondEval<'_> {
    fn peek(&self) -> Option<&CondTok> {
        self.tokens.get(self.index)
    }

    fn bump(&mut self) -> Option<CondTok> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        match self.peek() {
            Some(CondTok::Op(o)) if *o == op => {
                self.index += 1;
                true
            }
            _ => false,
        }
    }

    fn ternary(&mut self) -> i64 {
        let condition = self.binary(1);
        if self.eat_op("?") {
            let then = self.ternary();
            if !self.eat_op(":") {
                self.diagnostics.error(
                    Category::PpConditional,
                    self.position,
                    "expected : in conditional expression",
                );
            }
            let otherwise = self.ternary();
            if condition != 0 {
                then
            } else {
                otherwise
            }
        } else {
            condition
        }
    }

    fn binary(&mut self, min_precedence: u8) -> i64 {
        let mut lhs = self.unary();
        loop {
            let (op, precedence) = match self.peek() {
                Some(CondTok::Op(op)) => match *op {
                    "||" => ("||", 1),
                    "&&" => ("&&", 2),
                    "|" => ("|", 3),
                    "^" => ("^", 4),
                    "&" => ("&", 5),
                    "==" => ("==", 6),
                    "!=" => ("!=", 6),
                    "<" => ("<", 7),
                    ">" => (">", 7),
                    "<=" => ("<=", 7),
                    ">=" => (">=", 7),
                    "<<" => ("<<", 8),
                    ">>" => (">>", 8),
                    "+" => ("+", 9),
                    "-" => ("-", 9),
                    "*" => ("*", 10),
                    "/" => ("/", 10),
                    "%" => ("%", 10),
                    _ => break,
                },
                _ => break,
            };
            if precedence < min_precedence {
                break;
            }
            self.index += 1;
            let rhs = self.binary(precedence + 1);
            lhs = self.apply(op, lhs, rhs);
        }
        lhs
    }

    fn apply(&mut self, op: &str, lhs: i64, rhs: i64) -> i64 {
        match op {
            "||" => i64::from(lhs != 0 || rhs != 0),
            "&&" => i64::from(lhs != 0 && rhs != 0),
            "|" => lhs | rhs,
            "^" => lhs ^ rhs,
            "&" => lhs & rhs,
            "==" => i64::from(lhs == rhs),
            "!=" => i64::from(lhs != rhs),
            "<" => i64::from(lhs < rhs),
            ">" => i64::from(lhs > rhs),
            "<=" => i64::from(lhs <= rhs),
            ">=" => i64::from(lhs >= rhs),
            "<<" => lhs.wrapping_shl(rhs as u32),
            ">>" => lhs.wrapping_shr(rhs as u32),
            "+" => lhs.wrapping_add(rhs),
            "-" => lhs.wrapping_sub(rhs),
            "*" => lhs.wrapping_mul(rhs),
            "/" | "%" => {
                if rhs == 0 {
                    self.diagnostics.error(
                        Category::PpConditional,
                        self.position,
                        "division by zero in #if expression",
                    );
                    0
                } else if op == "/" {
                    lhs.wrapping_div(rhs)
                } else {
                    lhs.wrapping_rem(rhs)
                }
            }
            _ => 0,
        }
    }

    fn unary(&mut self) -> i64 {
        match self.bump() {
            Some(CondTok::Num(value)) => value,
            Some(CondTok::Ident(name)) => {
                if self.strict {
                    self.diagnostics.error(
                        Category::PpUndefined,
                        self.position,
                        format!("{} is not defined in #if expression", name),
                    );
                } else {
                    self.diagnostics.warning(
                        Category::PpUndefined,
                        self.position,
                        format!("{} is not defined, evaluating as 0", name),
                    );
                }
                0
            }
            Some(CondTok::Op("!")) => i64::from(self.unary() == 0),
            Some(CondTok::Op("~")) => !self.unary(),
            Some(CondTok::Op("-")) => self.unary().wrapping_neg(),
            Some(CondTok::Op("+")) => self.unary(),
            Some(CondTok::Op("(")) => {
                let value = self.ternary();
                if !self.eat_op(")") {
                    self.diagnostics.error(
                        Category::PpConditional,
                        self.position,
                        "expected ) in #if expression",
                    );
                }
                value
            }
            other => {
                self.diagnostics.error(
                    Category::PpConditional,
                    self.position,
                    format!("unexpected token in #if expression: {:?}", other),
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocess(text: &str) -> (String, Diagnostics) {
        preprocess_with(text, PpOptions::default(), NoIncludes)
    }

    fn preprocess_with(
        text: &str,
        options: PpOptions,
        loader: impl FileLoader,
    ) -> (String, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let mut map = SourceMap::new();
        let source = Preprocessor::new(&mut diagnostics, &mut map, &loader, options)
            .run("main.sc", text);
        (source.remaining_text(), diagnostics)
    }

    fn squeeze(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn object_macros_expand_recursively() {
        let (out, diagnostics) = preprocess("#define A 2\n#define B (A + 1)\nint x = B;\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(squeeze(&out), "int x = (2 + 1);");
    }

    #[test]
    fn function_like_macro_is_rejected_in_safe_mode() {
        let (_, diagnostics) = preprocess("#define SQR(x) ((x) * (x))\n");
        assert_eq!(diagnostics.error_count(), 1);
        let diagnostic = diagnostics.iter().next().unwrap();
        assert_eq!(diagnostic.category, Category::PpMacro);
        // The diagnostic points at the parenthesis after the macro name.
        assert_eq!(diagnostic.position.column, 12);
    }

    #[test]
    fn function_like_macro_expands_in_compat_mode() {
        let options = PpOptions {
            compat: true,
            ..PpOptions::default()
        };
        let (out, diagnostics) = preprocess_with(
            "#define SQR(x) ((x) * (x))\nint x = SQR(3 + 1);\n",
            options,
            NoIncludes,
        );
        assert!(!diagnostics.has_errors());
        assert_eq!(squeeze(&out), "int x = ((3 + 1) * (3 + 1));");
    }

    #[test]
    fn stringify_and_paste_in_compat_mode() {
        let options = PpOptions {
            compat: true,
            ..PpOptions::default()
        };
        let (out, diagnostics) = preprocess_with(
            "#define NAME(a, b) a ## b\n#define SHOW(x) #x\nint NAME(foo, bar) = 1;\nconst char *s = SHOW(2 + 2);\n",
            options,
            NoIncludes,
        );
        assert!(!diagnostics.has_errors());
        assert!(out.contains("foobar"));
        assert!(out.contains("\"2 + 2\""));
    }

    #[test]
    fn conditionals_select_branches() {
        let (out, diagnostics) = preprocess(
            "#define W 8\n#if W == 8\nint a;\n#elif W == 16\nint b;\n#else\nint c;\n#endif\n",
        );
        assert!(!diagnostics.has_errors());
        assert_eq!(squeeze(&out), "int a;");
    }

    #[test]
    fn undefined_name_in_condition_warns_and_is_zero() {
        let (out, diagnostics) = preprocess("#if MISSING\nint a;\n#endif\nint b;\n");
        assert!(!diagnostics.has_errors());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().category,
            Category::PpUndefined
        );
        assert_eq!(squeeze(&out), "int b;");
    }

    #[test]
    fn strict_mode_makes_undefined_names_errors() {
        let options = PpOptions {
            strict: true,
            ..PpOptions::default()
        };
        let (_, diagnostics) = preprocess_with("#if MISSING\n#endif\n", options, NoIncludes);
        assert_eq!(diagnostics.error_count(), 1);
    }

    #[test]
    fn unterminated_conditional_is_reported() {
        let (_, diagnostics) = preprocess("#if 1\nint a;\n");
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().category,
            Category::PpConditional
        );
    }

    #[test]
    fn includes_resolve_and_pragma_once_deduplicates() {
        let mut loader = MemoryLoader::new();
        loader.insert(
            "inc/defs.h",
            "#pragma once\nint from_header;\n",
        );
        let options = PpOptions {
            include_paths: vec![PathBuf::from("inc")],
            ..PpOptions::default()
        };
        let (out, diagnostics) = preprocess_with(
            "#include <defs.h>\n#include <defs.h>\nint main_var;\n",
            options,
            loader,
        );
        assert!(!diagnostics.has_errors());
        assert_eq!(squeeze(&out), "int from_header; int main_var;");
    }

    #[test]
    fn include_cycles_are_detected() {
        let mut loader = MemoryLoader::new();
        loader.insert("a.h", "#include \"b.h\"\n");
        loader.insert("b.h", "#include \"a.h\"\n");
        let (_, diagnostics) = preprocess_with("#include \"a.h\"\n", PpOptions::default(), loader);
        assert!(diagnostics.has_errors());
        assert!(diagnostics
            .iter()
            .any(|d| d.category == Category::PpInclude && d.message.contains("cycle")));
    }

    #[test]
    fn file_and_line_expand_and_date_is_reserved() {
        let (out, diagnostics) = preprocess("int line = __LINE__;\nconst char *f = __FILE__;\n");
        assert!(!diagnostics.has_errors());
        assert!(out.contains("int line = 1;"));
        assert!(out.contains("\"main.sc\""));

        let (_, diagnostics) = preprocess("int bad = __DATE__;\n");
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().category,
            Category::PpReserved
        );
    }

    #[test]
    fn positions_survive_macro_expansion() {
        let mut diagnostics = Diagnostics::new();
        let mut map = SourceMap::new();
        let source = Preprocessor::new(
            &mut diagnostics,
            &mut map,
            &NoIncludes,
            PpOptions::default(),
        )
        .run("main.sc", "#define N 42\nint x = N;\n");
        let text = source.remaining_text();
        let expansion_offset = text.find("42").unwrap();
        // Walk the source to the expanded characters and check they carry
        // the use site on line 2.
        let mut source = source;
        use crate::common::peekable_buffer::PeekableBuffer;
        source.discard_many(expansion_offset);
        assert_eq!(source.position().line, 2);
    }

    #[test]
    fn determinism_identical_input_identical_output() {
        let text = "#define A 1\n#if A\nint x = A;\n#endif\n";
        let (first, _) = preprocess(text);
        let (second, _) = preprocess(text);
        assert_eq!(first, second);
    }
}
