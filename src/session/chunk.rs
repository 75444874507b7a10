//! Grouping interactive lines into executable chunks.

/// Accumulates shell lines until they form a complete chunk.
#[derive(Debug, Default)]
pub struct Chunker {
    lines: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct OpenState {
    brackets: usize,
    in_triple: bool,
}

/// Bracket depth and unterminated triple-quoted strings across `text`.
/// Comments and string contents are skipped.
fn scan(text: &str) -> OpenState {
    let chars: Vec<char> = text.chars().collect();
    let mut state = OpenState::default();
    let mut quote: Option<(char, bool)> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some((q, triple)) => {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if triple && c == q && chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
                    quote = None;
                    i += 3;
                    continue;
                }
                if !triple && (c == q || c == '\n') {
                    quote = None;
                }
            }
            None => match c {
                '#' => {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                '\'' | '"' => {
                    let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                    quote = Some((c, triple));
                    if triple {
                        i += 3;
                        continue;
                    }
                }
                '(' | '[' | '{' => state.brackets += 1,
                ')' | ']' | '}' => state.brackets = state.brackets.saturating_sub(1),
                _ => {}
            },
        }
        i += 1;
    }
    state.in_triple = matches!(quote, Some((_, true)));
    state
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) if !line[..i].contains(['\'', '"']) => &line[..i],
        _ => line,
    }
}

/// Whether `line` opens an indented block.
fn opens_block(line: &str) -> bool {
    let code = strip_comment(line).trim_end();
    code.ends_with(':') || code.trim_start().starts_with('@')
}

impl Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing buffered; the shell shows the primary prompt.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Feed one line. Returns the chunk once it is complete.
    pub fn push(&mut self, line: &str) -> Option<String> {
        let blank = line.trim().is_empty();
        if self.lines.is_empty() && blank {
            return None;
        }

        let state = scan(&self.lines.join("\n"));
        let continued = state.brackets > 0
            || state.in_triple
            || self.lines.last().is_some_and(|l| l.trim_end().ends_with('\\'));
        if blank && !continued {
            // A blank line ends a compound chunk.
            return self.take();
        }
        self.lines.push(line.to_string());

        let state = scan(&self.lines.join("\n"));
        if state.brackets > 0 || state.in_triple || line.trim_end().ends_with('\\') {
            return None;
        }
        if self.lines.iter().any(|l| opens_block(l)) {
            return None;
        }
        self.take()
    }

    /// Flush whatever is buffered, as at end of input.
    pub fn finish(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let mut chunk = std::mem::take(&mut self.lines).join("\n");
        chunk.push('\n');
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &[&str]) -> Vec<String> {
        let mut chunker = Chunker::new();
        let mut out: Vec<String> = lines.iter().filter_map(|l| chunker.push(l)).collect();
        out.extend(chunker.finish());
        out
    }

    #[test]
    fn test_simple_statements_complete_immediately() {
        assert_eq!(feed(&["x = 1", "", "print(x)"]), vec!["x = 1\n", "print(x)\n"]);
    }

    #[test]
    fn test_block_runs_until_blank_line() {
        let chunks = feed(&["def f():", "    return 1", "", "f()"]);
        assert_eq!(chunks, vec!["def f():\n    return 1\n", "f()\n"]);
    }

    #[test]
    fn test_open_brackets_and_backslash_continue() {
        let chunks = feed(&["x = [1,", "", "2]", "y = 1 + \\", "2"]);
        assert_eq!(chunks, vec!["x = [1,\n\n2]\n", "y = 1 + \\\n2\n"]);
    }

    #[test]
    fn test_decorators_and_comments() {
        let chunks = feed(&["@dec", "def f(): pass", "", "s = '#(' # (", "t = 1"]);
        assert_eq!(chunks, vec!["@dec\ndef f(): pass\n", "s = '#(' # (\n", "t = 1\n"]);
    }

    #[test]
    fn test_triple_quoted_strings_continue() {
        let chunks = feed(&["s = '''a", "", "b'''", "z = 2"]);
        assert_eq!(chunks, vec!["s = '''a\n\nb'''\n", "z = 2\n"]);
    }
}
