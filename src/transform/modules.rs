//! Lexical lowering of illustrative module syntax.
//!
//! Snippets use `import`/`export` only to show the syntax; there is no second
//! file to resolve against. Statement-level `import` declarations are blanked,
//! `export` keywords are peeled off declarations, and `export default <expr>`
//! binds the value to `__defaultExport`. Blanking keeps newlines so the parser
//! reports positions that still match the user's text.

/// Binding that receives the value of an anonymous `export default`
pub const DEFAULT_EXPORT_BINDING: &str = "__defaultExport";

const DEFAULT_EXPORT_PREFIX: &str = "const __defaultExport =";

/// Keywords after which a `/` starts a regular expression literal
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
];

/// Punctuators that continue an expression onto the next line
const CONTINUATION_PUNCTUATORS: &[char] = &[
    '.', ',', '=', '(', '[', '+', '-', '*', '/', '&', '|', '?', ':', '!', '<', '>', '%', '^', '~',
];

#[derive(Debug)]
pub struct Lowering {
    pub text: String,
    /// Number of module items rewritten
    pub items: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Brace,
    Paren,
    Bracket,
    TemplateExpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prev {
    Start,
    Punct(char),
    Word(String),
    Literal,
}

#[derive(Debug, Clone, Copy)]
enum Replacement {
    Blank,
    DefaultExport,
}

#[derive(Debug, Clone, Copy)]
struct Edit {
    start: usize,
    end: usize,
    replacement: Replacement,
}

pub fn lower_module_syntax(source: &str) -> Lowering {
    if !source.contains("import") && !source.contains("export") {
        return Lowering {
            text: source.to_string(),
            items: 0,
        };
    }

    let chars: Vec<char> = source.chars().collect();
    let edits = Scanner::new(&chars).scan();
    let items = edits.len();
    Lowering {
        text: apply_edits(&chars, &edits),
        items,
    }
}

fn apply_edits(chars: &[char], edits: &[Edit]) -> String {
    let mut out = String::with_capacity(chars.len());
    let mut pos = 0;
    for edit in edits {
        out.extend(&chars[pos..edit.start]);
        match edit.replacement {
            Replacement::Blank => {
                for &c in &chars[edit.start..edit.end] {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
            Replacement::DefaultExport => out.push_str(DEFAULT_EXPORT_PREFIX),
        }
        pos = edit.end;
    }
    out.extend(&chars[pos..]);
    out
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric() || c == '\u{200c}' || c == '\u{200d}'
}

fn is_quote(c: char) -> bool {
    c == '\'' || c == '"'
}

struct Scanner<'a> {
    chars: &'a [char],
    pos: usize,
    stack: Vec<Frame>,
    prev: Prev,
    newline_since_prev: bool,
    edits: Vec<Edit>,
}

impl<'a> Scanner<'a> {
    fn new(chars: &'a [char]) -> Self {
        Self {
            chars,
            pos: 0,
            stack: Vec::new(),
            prev: Prev::Start,
            newline_since_prev: false,
            edits: Vec::new(),
        }
    }

    fn peek(&self, at: usize) -> Option<char> {
        self.chars.get(at).copied()
    }

    fn set_prev(&mut self, prev: Prev) {
        self.prev = prev;
        self.newline_since_prev = false;
    }

    fn scan(mut self) -> Vec<Edit> {
        if self.chars.starts_with(&['#', '!']) {
            self.pos = self.line_end(0);
        }

        while let Some(c) = self.peek(self.pos) {
            match c {
                '\n' | '\u{2028}' | '\u{2029}' => {
                    self.newline_since_prev = true;
                    self.pos += 1;
                }
                c if c.is_whitespace() => self.pos += 1,
                '/' if self.peek(self.pos + 1) == Some('/') => {
                    self.pos = self.line_end(self.pos);
                }
                '/' if self.peek(self.pos + 1) == Some('*') => {
                    let end = self.block_comment_end(self.pos);
                    if self.chars[self.pos..end].contains(&'\n') {
                        self.newline_since_prev = true;
                    }
                    self.pos = end;
                }
                '\'' | '"' => {
                    self.pos = self.string_end(self.pos);
                    self.set_prev(Prev::Literal);
                }
                '`' => {
                    self.pos += 1;
                    self.scan_template();
                }
                '/' => {
                    if self.regex_allowed() {
                        self.pos = self.regex_end(self.pos);
                        self.set_prev(Prev::Literal);
                    } else {
                        self.pos += 1;
                        self.set_prev(Prev::Punct('/'));
                    }
                }
                '{' | '(' | '[' => {
                    self.stack.push(match c {
                        '{' => Frame::Brace,
                        '(' => Frame::Paren,
                        _ => Frame::Bracket,
                    });
                    self.pos += 1;
                    self.set_prev(Prev::Punct(c));
                }
                '}' => {
                    self.pos += 1;
                    if self.stack.pop() == Some(Frame::TemplateExpr) {
                        self.scan_template();
                    } else {
                        self.set_prev(Prev::Punct('}'));
                    }
                }
                ')' | ']' => {
                    self.stack.pop();
                    self.pos += 1;
                    self.set_prev(Prev::Punct(c));
                }
                c if c.is_ascii_digit() => {
                    while self
                        .peek(self.pos)
                        .is_some_and(|c| c.is_alphanumeric() || c == '.' || c == '_')
                    {
                        self.pos += 1;
                    }
                    self.set_prev(Prev::Literal);
                }
                c if is_ident_start(c) => self.scan_word(),
                _ => {
                    self.pos += 1;
                    self.set_prev(Prev::Punct(c));
                }
            }
        }

        self.edits
    }

    fn scan_word(&mut self) {
        let start = self.pos;
        let (word, end) = self.word_at(start).unwrap_or_default();
        let end = end.max(start + 1);

        if self.statement_position() {
            let edit = match word.as_str() {
                "import" => self.import_edit(start, end),
                "export" => self.export_edit(start, end),
                _ => None,
            };
            if let Some(edit) = edit {
                self.pos = edit.end;
                self.set_prev(match edit.replacement {
                    Replacement::Blank => Prev::Punct(';'),
                    Replacement::DefaultExport => Prev::Punct('='),
                });
                self.edits.push(edit);
                return;
            }
        }

        self.pos = end;
        self.set_prev(Prev::Word(word));
    }

    fn statement_position(&self) -> bool {
        if !self.stack.is_empty() {
            return false;
        }
        match &self.prev {
            Prev::Start | Prev::Punct(';') | Prev::Punct('}') => true,
            Prev::Punct(c) => self.newline_since_prev && !CONTINUATION_PUNCTUATORS.contains(c),
            Prev::Word(_) | Prev::Literal => self.newline_since_prev,
        }
    }

    fn regex_allowed(&self) -> bool {
        match &self.prev {
            Prev::Start => true,
            Prev::Punct(c) => !matches!(c, ')' | ']' | '}'),
            Prev::Word(word) => EXPRESSION_KEYWORDS.contains(&word.as_str()),
            Prev::Literal => false,
        }
    }

    /// Scans template characters until the closing backtick or a `${`.
    fn scan_template(&mut self) {
        while let Some(c) = self.peek(self.pos) {
            match c {
                '\\' => self.pos += 2,
                '`' => {
                    self.pos += 1;
                    self.set_prev(Prev::Literal);
                    return;
                }
                '$' if self.peek(self.pos + 1) == Some('{') => {
                    self.pos += 2;
                    self.stack.push(Frame::TemplateExpr);
                    self.set_prev(Prev::Punct('{'));
                    return;
                }
                _ => self.pos += 1,
            }
        }
        self.pos = self.chars.len();
    }

    fn word_at(&self, at: usize) -> Option<(String, usize)> {
        if !self.peek(at).is_some_and(is_ident_start) {
            return None;
        }
        let mut end = at;
        while self.peek(end).is_some_and(is_ident_part) {
            end += 1;
        }
        Some((self.chars[at..end].iter().collect(), end))
    }

    fn keyword_at(&self, at: usize, keyword: &str) -> Option<usize> {
        match self.word_at(at) {
            Some((word, end)) if word == keyword => Some(end),
            _ => None,
        }
    }

    fn line_end(&self, from: usize) -> usize {
        self.chars[from..]
            .iter()
            .position(|&c| c == '\n')
            .map_or(self.chars.len(), |offset| from + offset)
    }

    fn block_comment_end(&self, from: usize) -> usize {
        let mut i = from + 2;
        while i + 1 < self.chars.len() {
            if self.chars[i] == '*' && self.chars[i + 1] == '/' {
                return i + 2;
            }
            i += 1;
        }
        self.chars.len()
    }

    fn string_end(&self, from: usize) -> usize {
        let quote = self.chars[from];
        let mut i = from + 1;
        while let Some(c) = self.peek(i) {
            match c {
                '\\' => i += 2,
                '\n' => return i,
                c if c == quote => return i + 1,
                _ => i += 1,
            }
        }
        self.chars.len()
    }

    fn regex_end(&self, from: usize) -> usize {
        let mut i = from + 1;
        let mut in_class = false;
        while let Some(c) = self.peek(i) {
            match c {
                '\\' => i += 2,
                '[' => {
                    in_class = true;
                    i += 1;
                }
                ']' => {
                    in_class = false;
                    i += 1;
                }
                '/' if !in_class => {
                    i += 1;
                    while self.peek(i).is_some_and(is_ident_part) {
                        i += 1;
                    }
                    return i;
                }
                '\n' => return i,
                _ => i += 1,
            }
        }
        self.chars.len()
    }

    /// Skips whitespace and comments.
    fn skip_trivia(&self, from: usize) -> usize {
        let mut i = from;
        loop {
            match (self.peek(i), self.peek(i + 1)) {
                (Some(c), _) if c.is_whitespace() => i += 1,
                (Some('/'), Some('/')) => i = self.line_end(i),
                (Some('/'), Some('*')) => i = self.block_comment_end(i),
                _ => return i,
            }
        }
    }

    /// Extends a statement over an optional semicolon on the same line.
    fn statement_tail(&self, from: usize) -> usize {
        let mut i = from;
        while self.peek(i).is_some_and(|c| c == ' ' || c == '\t') {
            i += 1;
        }
        if self.peek(i) == Some(';') {
            i + 1
        } else {
            from
        }
    }

    fn import_edit(&self, start: usize, keyword_end: usize) -> Option<Edit> {
        let mut i = self.skip_trivia(keyword_end);
        if matches!(self.peek(i), Some('(') | Some('.')) {
            return None;
        }

        // The module specifier is the first string literal of the statement.
        while let Some(c) = self.peek(i) {
            if is_quote(c) {
                let end = self.string_end(i);
                return Some(Edit {
                    start,
                    end: self.statement_tail(end),
                    replacement: Replacement::Blank,
                });
            }
            if c == ';' {
                return None;
            }
            i += 1;
        }
        None
    }

    fn export_edit(&self, start: usize, keyword_end: usize) -> Option<Edit> {
        let i = self.skip_trivia(keyword_end);
        let blank = |end| {
            Some(Edit {
                start,
                end,
                replacement: Replacement::Blank,
            })
        };

        match self.peek(i)? {
            '{' => {
                let close = self.chars[i..].iter().position(|&c| c == '}')? + i + 1;
                let end = self.from_clause_end(close).unwrap_or(close);
                blank(self.statement_tail(end))
            }
            '*' => {
                let mut j = self.skip_trivia(i + 1);
                if let Some(after_as) = self.keyword_at(j, "as") {
                    let name = self.skip_trivia(after_as);
                    j = self.word_at(name).map_or(name, |(_, end)| end);
                }
                let end = self.from_clause_end(j)?;
                blank(self.statement_tail(end))
            }
            _ => {
                let (word, word_end) = self.word_at(i)?;
                match word.as_str() {
                    "default" => {
                        if self.is_named_declaration(self.skip_trivia(word_end)) {
                            blank(word_end)
                        } else {
                            Some(Edit {
                                start,
                                end: word_end,
                                replacement: Replacement::DefaultExport,
                            })
                        }
                    }
                    "const" | "let" | "var" | "function" | "class" | "async" => blank(keyword_end),
                    _ => None,
                }
            }
        }
    }

    /// `from '<specifier>'` starting at or after `from`; returns the end of the string.
    fn from_clause_end(&self, from: usize) -> Option<usize> {
        let after_from = self.keyword_at(self.skip_trivia(from), "from")?;
        let quote = self.skip_trivia(after_from);
        if self.peek(quote).is_some_and(is_quote) {
            Some(self.string_end(quote))
        } else {
            None
        }
    }

    /// `function name`, `function* name`, `async function name` or `class Name`
    fn is_named_declaration(&self, at: usize) -> bool {
        let Some((word, end)) = self.word_at(at) else {
            return false;
        };
        let name_follows = |from: usize| {
            self.word_at(self.skip_trivia(from))
                .is_some_and(|(name, _)| name != "extends")
        };
        match word.as_str() {
            "class" => name_follows(end),
            "function" => {
                let mut j = self.skip_trivia(end);
                if self.peek(j) == Some('*') {
                    j += 1;
                }
                name_follows(j)
            }
            "async" => {
                let next = self.skip_trivia(end);
                self.keyword_at(next, "function")
                    .is_some_and(|_| self.is_named_declaration(next))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower(source: &str) -> String {
        lower_module_syntax(source).text
    }

    #[test]
    fn test_plain_script_untouched() {
        let source = "const important = 1;\nconsole.log(important);";
        let lowered = lower_module_syntax(source);
        assert_eq!(lowered.text, source);
        assert_eq!(lowered.items, 0);
    }

    #[test]
    fn test_import_statements_blanked_keeping_lines() {
        let source = "import { a,\n  b } from './math.js';\nimport './side.js'\nconsole.log(1);";
        let lowered = lower_module_syntax(source);
        assert_eq!(lowered.items, 2);
        assert_eq!(lowered.text.lines().count(), source.lines().count());
        assert!(!lowered.text.contains("import"));
        assert!(lowered.text.ends_with("console.log(1);"));
        assert_eq!(lowered.text.chars().count(), source.chars().count());
    }

    #[test]
    fn test_dynamic_import_and_meta_untouched() {
        let source = "import('./lazy.js').then(m => m);\nconst u = import.meta;";
        assert_eq!(lower(source), source);
    }

    #[test]
    fn test_export_declarations_keep_bodies() {
        let source = "export const PI = 3.14159;\nexport function add(a, b) { return a + b; }\nexport class Point {}\nexport async function load() {}";
        let text = lower(source);
        assert!(!text.contains("export"));
        assert!(text.contains("const PI = 3.14159;"));
        assert!(text.contains("function add(a, b)"));
        assert!(text.contains("class Point {}"));
        assert!(text.contains("async function load() {}"));
    }

    #[test]
    fn test_export_default_expression_binds_value() {
        assert_eq!(
            lower("export default 42;").trim_start(),
            "const __defaultExport = 42;"
        );
        assert_eq!(
            lower("export default function () {}"),
            "const __defaultExport = function () {}"
        );
        assert_eq!(
            lower("export default class extends Base {}"),
            "const __defaultExport = class extends Base {}"
        );
    }

    #[test]
    fn test_export_default_named_declaration_is_peeled() {
        assert_eq!(
            lower("export default function multiply(a, b) {}").trim_start(),
            "function multiply(a, b) {}"
        );
        assert_eq!(
            lower("export default class Calculator {}").trim_start(),
            "class Calculator {}"
        );
    }

    #[test]
    fn test_export_lists_blanked() {
        let source = "const a = 1, b = 2;\nexport { a, b as bee };\nexport { c } from './c.js';\nexport * from './all.js';\nexport * as ns from './ns.js'";
        let text = lower(source);
        assert_eq!(text.trim_end(), "const a = 1, b = 2;");
    }

    #[test]
    fn test_keywords_inside_literals_and_comments_ignored() {
        let source = "const s = 'import x from \"y\"';\n// export default 1\n/* import z from 'z' */\nconst t = `export ${'{'} import`;\nconst r = /import/g;";
        assert_eq!(lower(source), source);
    }

    #[test]
    fn test_nested_keywords_ignored() {
        let source = "const o = {\n  import: 1,\n  export: 2,\n};\nobj.export();\nfunction f() {\n  return o.import;\n}";
        assert_eq!(lower(source), source);
    }

    #[test]
    fn test_export_after_template_with_nested_braces() {
        let source = "const msg = `a ${ {x: 1}.x } b`;\nexport const y = 2;";
        let text = lower(source);
        assert!(text.starts_with("const msg = `a ${ {x: 1}.x } b`;"));
        assert!(text.ends_with("const y = 2;"));
        assert!(!text.contains("export"));
    }

    #[test]
    fn test_division_not_mistaken_for_regex() {
        let source = "const half = total / 2; const q = (a) / b\nexport const z = half / q;";
        let text = lower(source);
        assert!(text.ends_with("const z = half / q;"));
    }
}
