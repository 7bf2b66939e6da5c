use crate::exec::{self, ExecOutcome};
use crate::lexer::{LineSource, Scanner};
use crate::parser::{ParseOutcome, Parser};
use anyhow::Context;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{BufRead, Write};
use tracing::debug;

/// Prompt shown by the interactive loop unless overridden.
pub const DEFAULT_PROMPT: &str = "\x1B[1;34mje \x1B[1;37msuis \x1B[1;31mcharlie \x1B[1;37m$ \x1B[0m";

/// Uncoloured variant of [`DEFAULT_PROMPT`].
pub const PLAIN_PROMPT: &str = "je suis charlie $ ";

/// The read-eval loop: parse a line, run it, reset, repeat.
///
/// Parse errors and failing stages are reported and the loop moves on to the
/// next line; only `exit` or the end of input stops it.
///
/// Example
/// ```
/// use pipesh::{Interpreter, ReaderLines};
/// let script = "true | true\nexit\n";
/// let mut sh = Interpreter::new();
/// sh.run(ReaderLines::new(script.as_bytes()), &mut std::io::stderr()).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Interpreter {
    parser: Parser,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every line from `lines`, writing diagnostics to `diagnostics`.
    ///
    /// Returns an error only when the line source itself fails.
    pub fn run<L: LineSource>(&mut self, lines: L, diagnostics: &mut dyn Write) -> anyhow::Result<()> {
        let mut scanner = Scanner::new(lines);

        loop {
            let outcome = self.parser.parse(&mut scanner);
            for e in scanner.drain_rejected() {
                writeln!(diagnostics, "lex error: {e}")?;
            }
            match outcome {
                ParseOutcome::Empty => continue,
                ParseOutcome::Exit => break,
                ParseOutcome::Error(e) => {
                    writeln!(diagnostics, "{}: {e}", e.category())?;
                }
                ParseOutcome::Ok(pipeline) => {
                    let outcome = exec::execute_with(&pipeline, diagnostics);
                    debug!(?outcome, "pipeline finished");
                    debug_assert_ne!(outcome, ExecOutcome::FatalExit);
                    self.parser.recycle(pipeline);
                }
            }
        }

        match scanner.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Interactive loop on the terminal, with line editing and history.
    pub fn repl(&mut self, prompt: &str) -> anyhow::Result<()> {
        let editor = Prompted::new(prompt)?;
        self.run(editor, &mut std::io::stderr())
    }
}

/// Line source reading from the terminal through rustyline.
pub struct Prompted {
    editor: DefaultEditor,
    prompt: String,
}

impl Prompted {
    pub fn new(prompt: impl Into<String>) -> anyhow::Result<Self> {
        let editor = DefaultEditor::new().context("unable to set up the line editor")?;
        Ok(Self {
            editor,
            prompt: prompt.into(),
        })
    }
}

impl LineSource for Prompted {
    fn read_line(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        match self.editor.readline(&self.prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    self.editor.add_history_entry(line.as_str())?;
                }
                Ok(Some(line.into_bytes()))
            }
            // Ctrl-C abandons the current line only.
            Err(ReadlineError::Interrupted) => Ok(Some(Vec::new())),
            Err(ReadlineError::Eof) => {
                println!();
                Ok(None)
            }
            Err(e) => Err(e).context("unable to read from the terminal"),
        }
    }
}

/// Line source over any buffered reader: a script file or piped stdin.
pub struct ReaderLines<R> {
    reader: R,
}

impl<R: BufRead> ReaderLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for ReaderLines<R> {
    fn read_line(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = self
            .reader
            .read_until(b'\n', &mut line)
            .context("unable to read input line")?;
        if read == 0 {
            return Ok(None);
        }
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}
