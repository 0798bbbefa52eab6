/// Host-side display log
/// Append-only between clears, bounded by line count and line size.
/// Only the host thread touches it; contexts reach it through events.
use crate::config::types::{OutputIntegrity, OutputLimits, Severity};
use crate::core::types::OutputEvent;

const ELLIPSIS: char = '…';

/// Output log with bounded collection
#[derive(Debug, Clone)]
pub struct OutputLog {
    limits: OutputLimits,
    lines: Vec<OutputEvent>,
    dropped: usize,
    integrity: OutputIntegrity,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(OutputLimits::default())
    }
}

impl OutputLog {
    pub fn new(limits: OutputLimits) -> Self {
        Self {
            limits,
            lines: Vec::new(),
            dropped: 0,
            integrity: OutputIntegrity::Complete,
        }
    }

    /// Appends one event. Returns false when the event was dropped by the line limit.
    pub fn push(&mut self, event: &OutputEvent) -> bool {
        if self.lines.len() >= self.limits.max_lines {
            if self.dropped == 0 {
                self.integrity = OutputIntegrity::Truncated;
                self.lines.push(OutputEvent::warn(format!(
                    "⚠️ Output truncated after {} lines",
                    self.limits.max_lines
                )));
            }
            self.dropped += 1;
            return false;
        }

        let text = truncate_line(&event.text, self.limits.max_line_bytes);
        if text.len() != event.text.len() {
            self.integrity = OutputIntegrity::Truncated;
        }
        self.lines.push(OutputEvent::new(event.severity, text));
        true
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.dropped = 0;
        self.integrity = OutputIntegrity::Complete;
    }

    pub fn lines(&self) -> &[OutputEvent] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines dropped since the last clear
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn integrity(&self) -> OutputIntegrity {
        self.integrity
    }

    pub fn display_lines(&self) -> Vec<String> {
        self.lines.iter().map(OutputEvent::display_line).collect()
    }

    /// Text placed on the clipboard by the copy action
    pub fn to_clipboard_text(&self) -> String {
        self.display_lines().join("\n")
    }

    /// Raw texts without severity markers
    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|line| line.text.as_str()).collect()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.lines
            .iter()
            .filter(|line| line.severity == severity)
            .count()
    }

    /// Compares the raw texts, newline-joined, to an expected transcript.
    pub fn matches_expected(&self, expected: &str) -> bool {
        self.texts().join("\n").trim_end() == expected.trim_end()
    }
}

/// Cuts a line to at most `max_bytes` on a char boundary, marking the cut.
fn truncate_line(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let budget = max_bytes.saturating_sub(ELLIPSIS.len_utf8());
    let mut cut = budget.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + ELLIPSIS.len_utf8());
    out.push_str(&text[..cut]);
    out.push(ELLIPSIS);
    out
}
