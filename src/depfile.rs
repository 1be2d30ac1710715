//! Parsing of compiler-emitted dependency output, a restricted subset of
//! Makefile syntax: one target, a colon, whitespace-separated prerequisites,
//! with backslash-newline continuations, `#` comments, and backslash
//! escapes.  Clients feed `.d` files through this before reporting
//! discovered dependencies to the engine.
//!
//! The parser is callback-driven and recovers from errors by skipping to
//! the end of the line, so one bad rule does not lose the rest of the file.

/// Receives parse events.  `rule_dependency` is only called between paired
/// `rule_start` and `rule_end` calls.  Words are passed as raw input
/// slices; escape sequences are not rewritten.
pub trait ParseActions {
    /// An error at the given byte offset.  Parsing continues on the next
    /// line.
    fn error(&mut self, message: &str, position: usize);
    fn rule_start(&mut self, name: &[u8]);
    fn rule_dependency(&mut self, dependency: &[u8]);
    fn rule_end(&mut self);
}

fn is_word_char(c: u8) -> bool {
    !matches!(c, b'\0' | b'\t' | b'\n' | b' ' | b'$' | b':' | b';' | b'=' | b'|' | b'%')
}

/// Byte cursor over the input.
struct Cursor<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.ofs).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.buf.get(self.ofs + n).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b'#' => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.ofs += 1;
                    }
                }
                b' ' | b'\t' | b'\n' => self.ofs += 1,
                _ => break,
            }
        }
    }

    /// Skip spaces, tabs, and escaped newlines, but not bare newlines.
    fn skip_non_newline_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' => self.ofs += 1,
                b'\\' if self.peek_at(1) == Some(b'\n') => self.ofs += 2,
                _ => break,
            }
        }
    }

    fn skip_to_end_of_line(&mut self) {
        while let Some(c) = self.peek() {
            self.ofs += 1;
            if c == b'\n' {
                break;
            }
        }
    }

    /// Consume one word, returning its raw slice (escapes included).
    fn lex_word(&mut self) -> &'a [u8] {
        let start = self.ofs;
        while let Some(c) = self.peek() {
            if c == b'\\' {
                // A line continuation ends the word; any other escaped
                // character is taken verbatim.
                if self.peek_at(1) == Some(b'\n') {
                    break;
                }
                self.ofs += 2.min(self.buf.len() - self.ofs);
                continue;
            }
            if !is_word_char(c) {
                break;
            }
            self.ofs += 1;
        }
        &self.buf[start..self.ofs]
    }
}

/// Parse `data`, reporting rules and errors through `actions`.
pub fn parse(data: &[u8], actions: &mut dyn ParseActions) {
    let mut cur = Cursor { buf: data, ofs: 0 };

    loop {
        cur.skip_whitespace_and_comments();
        if cur.peek().is_none() {
            break;
        }

        // The target.
        let word = cur.lex_word();
        if word.is_empty() {
            actions.error("unexpected character in file", cur.ofs);
            cur.skip_to_end_of_line();
            continue;
        }
        actions.rule_start(word);

        cur.skip_non_newline_whitespace();
        if cur.peek() != Some(b':') {
            actions.error("missing ':' following rule", cur.ofs);
            actions.rule_end();
            cur.skip_to_end_of_line();
            continue;
        }
        cur.ofs += 1;

        // Prerequisites up to the end of the (possibly continued) line.
        loop {
            cur.skip_non_newline_whitespace();
            if matches!(cur.peek(), None | Some(b'\n')) {
                break;
            }
            let word = cur.lex_word();
            if word.is_empty() {
                actions.error("unexpected character in prerequisites", cur.ofs);
                cur.skip_to_end_of_line();
                continue;
            }
            actions.rule_dependency(word);
        }
        actions.rule_end();
    }
}

/// Collecting front-end over `parse` for clients that do not need
/// streaming: returns each rule's target and prerequisites, or the first
/// error with its byte offset.
pub fn parse_into(data: &[u8]) -> anyhow::Result<Vec<(String, Vec<String>)>> {
    #[derive(Default)]
    struct Collector {
        rules: Vec<(String, Vec<String>)>,
        error: Option<(String, usize)>,
    }
    impl ParseActions for Collector {
        fn error(&mut self, message: &str, position: usize) {
            if self.error.is_none() {
                self.error = Some((message.to_string(), position));
            }
        }
        fn rule_start(&mut self, name: &[u8]) {
            self.rules
                .push((String::from_utf8_lossy(name).into_owned(), Vec::new()));
        }
        fn rule_dependency(&mut self, dependency: &[u8]) {
            self.rules
                .last_mut()
                .unwrap()
                .1
                .push(String::from_utf8_lossy(dependency).into_owned());
        }
        fn rule_end(&mut self) {}
    }

    let mut collector = Collector::default();
    parse(data, &mut collector);
    if let Some((message, position)) = collector.error {
        anyhow::bail!("parse error at offset {}: {}", position, message);
    }
    Ok(collector.rules)
}
