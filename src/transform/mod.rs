//! Transformer
//!
//! Turns user source text into [`ExecutableText`] the execution context can
//! evaluate, or a [`TransformError`] before anything runs. The engine speaks
//! the modern dialect natively, so the work here is normalisation, lowering of
//! illustrative module syntax ([`modules`]), the strict-mode directive and a
//! full syntax check with the engine's own parser. Transformation is a pure
//! function of its input.

pub mod modules;

use boa_interner::Interner;
use boa_parser::{Parser, Source};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use modules::DEFAULT_EXPORT_BINDING;

/// Prepended on line 1 so every snippet runs as strict code without moving lines
pub const STRICT_DIRECTIVE: &str = "'use strict'; ";

/// Syntax failure reported before execution
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransformError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl TransformError {
    /// Line 1 columns are reported against the user's text, not the directive.
    fn without_directive_offset(mut self) -> Self {
        if self.line == Some(1) {
            let offset = STRICT_DIRECTIVE.len() as u32;
            self.column = self.column.map(|column| column.saturating_sub(offset).max(1));
        }
        self
    }

    fn from_parse_error(err: boa_parser::Error) -> Self {
        let position = match &err {
            boa_parser::Error::Expected { span, .. } | boa_parser::Error::Unexpected { span, .. } => {
                Some((span.start().line_number(), span.start().column_number()))
            }
            boa_parser::Error::General { position, .. } => {
                Some((position.line_number(), position.column_number()))
            }
            boa_parser::Error::Lex {
                err: boa_parser::lexer::error::Error::Syntax(_, position),
            } => Some((position.line_number(), position.column_number())),
            _ => None,
        };

        Self {
            message: err.to_string(),
            line: position.map(|(line, _)| line),
            column: position.map(|(_, column)| column),
        }
    }
}

/// Source that passed transformation; the only input an execution context accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutableText(String);

impl ExecutableText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ExecutableText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Rewrite `import`/`export` statements into plain script
    pub lower_module_syntax: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            lower_module_syntax: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transformer {
    options: TransformOptions,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: TransformOptions) -> Self {
        Self { options }
    }

    pub fn transform(&self, source: &str) -> Result<ExecutableText, TransformError> {
        let normalized = normalize(source);

        let text = if self.options.lower_module_syntax {
            let lowered = modules::lower_module_syntax(&normalized);
            if lowered.items > 0 {
                log::debug!("lowered {} module item(s)", lowered.items);
            }
            lowered.text
        } else {
            normalized
        };

        let text = format!("{STRICT_DIRECTIVE}{}", strip_hashbang(&text));
        validate_script(&text)?;
        Ok(ExecutableText(text))
    }
}

/// A hashbang is only legal at offset 0; drop its text and keep the line.
fn strip_hashbang(text: &str) -> &str {
    if text.starts_with("#!") {
        text.find('\n').map_or("", |newline| &text[newline..])
    } else {
        text
    }
}

/// Strips a byte-order mark and converts CRLF / CR line endings to LF.
fn normalize(source: &str) -> String {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    if !source.contains('\r') {
        return source.to_string();
    }
    source.replace("\r\n", "\n").replace('\r', "\n")
}

fn validate_script(text: &str) -> Result<(), TransformError> {
    let mut interner = Interner::default();
    Parser::new(Source::from_bytes(text))
        .parse_script(&mut interner)
        .map(|_| ())
        .map_err(|err| TransformError::from_parse_error(err).without_directive_offset())
}
