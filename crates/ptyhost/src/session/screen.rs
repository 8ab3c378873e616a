//! Headless terminal screen fed by raw pty output.
//!
//! Escape-sequence interpretation is delegated to `vt100`. The rest of the
//! crate only sees the [`Screen`] trait, so any conforming emulator can be
//! swapped in.

use vt100::Parser;

/// Default number of lines kept above the visible screen.
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// A terminal emulator that can be fed output and rendered to text.
pub trait Screen: Send {
    /// Interprets a chunk of raw output.
    fn feed(&mut self, bytes: &[u8]);

    /// Renders scrollback plus visible screen as plain text.
    ///
    /// Control sequences are interpreted, never echoed. Rows are separated
    /// by `\n` (soft-wrapped rows are joined), trailing blanks are trimmed,
    /// and the output runs through the cursor row so a completed line ends
    /// with a newline.
    fn render_plain_text(&mut self) -> String;

    /// Renders the visible screen with formatting escapes.
    fn render_formatted(&self) -> Vec<u8>;

    /// Changes the geometry.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Returns `(cols, rows)`.
    fn size(&self) -> (u16, u16);
}

/// [`Screen`] backed by a `vt100` parser.
pub struct Vt100Screen {
    parser: Parser,
}

impl Vt100Screen {
    /// Creates a screen with the given geometry and scrollback capacity.
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize) -> Self {
        Self {
            parser: Parser::new(rows, cols, scrollback_lines),
        }
    }
}

impl Screen for Vt100Screen {
    fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    fn render_plain_text(&mut self) -> String {
        let (_, cols) = self.parser.screen().size();

        // Walk the scrollback one line at a time: at offset k, the top
        // visible row is the k-th line from the end of the history.
        self.parser.screen_mut().set_scrollback(usize::MAX);
        let history = self.parser.screen().scrollback();
        let mut lines: Vec<(String, bool)> = Vec::with_capacity(history);
        for offset in (1..=history).rev() {
            self.parser.screen_mut().set_scrollback(offset);
            let screen = self.parser.screen();
            let text = screen.rows(0, cols).next().unwrap_or_default();
            lines.push((text, screen.row_wrapped(0)));
        }
        self.parser.screen_mut().set_scrollback(0);

        let screen = self.parser.screen();
        for (row, text) in screen.rows(0, cols).enumerate() {
            lines.push((text, screen.row_wrapped(row as u16)));
        }

        let cursor_line = history + screen.cursor_position().0 as usize;
        let last_content = lines
            .iter()
            .rposition(|(text, _)| !text.trim_end().is_empty())
            .unwrap_or(0);
        let last = cursor_line.max(last_content).min(lines.len().saturating_sub(1));

        let mut out = String::new();
        for (index, (text, wrapped)) in lines.iter().take(last + 1).enumerate() {
            if *wrapped && index < last {
                out.push_str(text);
            } else {
                out.push_str(text.trim_end());
            }
            if index < last && !wrapped {
                out.push('\n');
            }
        }
        out
    }

    fn render_formatted(&self) -> Vec<u8> {
        self.parser.screen().contents_formatted()
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }
}
