//! Where shell lines come from.

use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor};

pub enum Line {
    Text(String),
    /// Ctrl-C: drop the chunk being typed.
    Interrupted,
    Eof,
}

pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> io::Result<Line>;

    /// Record a completed chunk.
    fn remember(&mut self, _chunk: &str) {}
}

/// Lines fed from memory or a non-interactive reader. Prompts are not shown.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let lines = reader.lines().collect::<io::Result<VecDeque<_>>>()?;
        Ok(Self { lines })
    }
}

impl LineSource for ScriptedInput {
    fn read_line(&mut self, _prompt: &str) -> io::Result<Line> {
        Ok(match self.lines.pop_front() {
            Some(line) => Line::Text(line),
            None => Line::Eof,
        })
    }
}

/// Line editing on a terminal, with persistent history.
pub struct EditorInput {
    editor: DefaultEditor,
    history: Option<PathBuf>,
}

impl EditorInput {
    pub fn new(history: Option<PathBuf>, history_size: usize) -> io::Result<Self> {
        let config = Config::builder()
            .max_history_size(history_size)
            .map_err(io::Error::other)?
            .auto_add_history(false)
            .build();
        let mut editor = DefaultEditor::with_config(config).map_err(io::Error::other)?;
        if let Some(path) = &history
            && let Err(e) = editor.load_history(path)
        {
            tracing::debug!(path = %path.display(), "no shell history loaded: {e}");
        }
        Ok(Self { editor, history })
    }

    pub fn save_history(&mut self) {
        let Some(path) = &self.history else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = self.editor.save_history(path) {
            tracing::warn!(path = %path.display(), "failed to save shell history: {e}");
        }
    }
}

impl LineSource for EditorInput {
    fn read_line(&mut self, prompt: &str) -> io::Result<Line> {
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Line::Text(line)),
            Err(ReadlineError::Interrupted) => Ok(Line::Interrupted),
            Err(ReadlineError::Eof) => Ok(Line::Eof),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn remember(&mut self, chunk: &str) {
        let _ = self.editor.add_history_entry(chunk.trim_end());
    }
}

impl Drop for EditorInput {
    fn drop(&mut self) {
        self.save_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_input_ends_with_eof() {
        let mut input = ScriptedInput::from_reader(io::Cursor::new("a\nb\n")).unwrap();
        assert!(matches!(input.read_line(">>> ").unwrap(), Line::Text(l) if l == "a"));
        assert!(matches!(input.read_line(">>> ").unwrap(), Line::Text(l) if l == "b"));
        assert!(matches!(input.read_line(">>> ").unwrap(), Line::Eof));
    }
}
