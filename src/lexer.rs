//! A module implementing lexical analysis (tokenization) for the shell's line grammar.
//!
//! The parser never sees raw characters. It pulls [`Token`]s one at a time from a
//! [`TokenSource`]; the [`Scanner`] provided here is the usual source, reading
//! whole lines from a [`LineSource`] and handing out their tokens followed by a
//! [`Token::Newline`].

use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word: a program name, an argument or a redirection target.
    Word(String),
    /// The pipe operator, `|`.
    PipeOp,
    /// Input redirection symbol, `<`.
    RedirectIn,
    /// Output redirection symbol, `>`.
    RedirectOut,
    /// End of the current line.
    Newline,
    /// The input stream is exhausted. Returned forever once reached.
    EndOfInput,
}

/// Errors that can occur during the lexical analysis process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexingError {
    /// A closing quote (single or double) was not found.
    #[error("unfinished quote")]
    UnfinishedQuote,
    /// The raw line could not be decoded as UTF-8.
    #[error("input line is not valid UTF-8")]
    InvalidUtf8,
}

/// Call-for-next-token interface consumed by the parser.
pub trait TokenSource {
    /// Produce the next token. Must keep returning [`Token::EndOfInput`] once the
    /// input is exhausted.
    fn next_token(&mut self) -> Token;
}

impl TokenSource for VecDeque<Token> {
    fn next_token(&mut self) -> Token {
        self.pop_front().unwrap_or(Token::EndOfInput)
    }
}

/// Something that yields raw input lines, without their line terminator.
///
/// Lines are handed over as bytes; decoding them is the scanner's job, so a
/// badly encoded line only costs that line. `Ok(None)` signals the end of input.
pub trait LineSource {
    fn read_line(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingSingleQuote,
    ReadingDoubleQuote,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    buffer: String,
}

impl LexingFSM {
    /// Creates a new lexer positioned at the start of `line`.
    ///
    /// # Arguments
    /// * `line` - One input line, without its terminator.
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            buffer: String::new(),
        }
    }

    /// Run the machine over the whole line.
    ///
    /// Adjacent quoted and unquoted pieces glue into a single word, so `a'b c'd`
    /// is the one word `ab cd`, and `''` is an empty word rather than nothing.
    ///
    /// # Returns
    /// The tokens of the line in order, or `LexingError::UnfinishedQuote` if the
    /// line ends inside a quote.
    fn make_tokens(&mut self) -> Result<Vec<Token>, LexingError> {
        let mut out = Vec::new();

        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start => self.handle_start(ch, &mut out),
                LexingState::ReadingWord => self.handle_word(ch, &mut out),
                LexingState::ReadingSingleQuote => self.handle_quoted(ch, '\''),
                LexingState::ReadingDoubleQuote => self.handle_quoted(ch, '"'),
            }
        }

        match self.state {
            LexingState::ReadingSingleQuote | LexingState::ReadingDoubleQuote => {
                Err(LexingError::UnfinishedQuote)
            }
            LexingState::ReadingWord => {
                self.finish_word(&mut out);
                Ok(out)
            }
            LexingState::Start => Ok(out),
        }
    }

    /// Reads the next character and advances the position.
    ///
    /// # Returns
    /// `None` once the line is exhausted.
    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    /// Handles a character seen between tokens.
    ///
    /// # Arguments
    /// * `ch` - The character just read.
    /// * `out` - Tokens produced so far; operators are pushed here directly.
    fn handle_start(&mut self, ch: char, out: &mut Vec<Token>) {
        match ch {
            ' ' | '\t' | '\r' | '\n' => {}
            '|' => out.push(Token::PipeOp),
            '<' => out.push(Token::RedirectIn),
            '>' => out.push(Token::RedirectOut),
            '\'' => self.state = LexingState::ReadingSingleQuote,
            '"' => self.state = LexingState::ReadingDoubleQuote,
            c => {
                self.buffer.push(c);
                self.state = LexingState::ReadingWord;
            }
        }
    }

    fn handle_word(&mut self, ch: char, out: &mut Vec<Token>) {
        match ch {
            ' ' | '\t' | '\r' | '\n' => self.finish_word(out),
            '|' | '<' | '>' => {
                self.finish_word(out);
                self.handle_start(ch, out);
            }
            '\'' => self.state = LexingState::ReadingSingleQuote,
            '"' => self.state = LexingState::ReadingDoubleQuote,
            c => self.buffer.push(c),
        }
    }

    /// Inside quotes everything but the closing quote is literal.
    fn handle_quoted(&mut self, ch: char, closing: char) {
        if ch == closing {
            self.state = LexingState::ReadingWord;
        } else {
            self.buffer.push(ch);
        }
    }

    fn finish_word(&mut self, out: &mut Vec<Token>) {
        out.push(Token::Word(std::mem::take(&mut self.buffer)));
        self.state = LexingState::Start;
    }
}

/// Tokenize one line.
///
/// # Arguments
/// * `line` - The line to split, without its terminator.
///
/// # Returns
/// The line's tokens, not including the trailing [`Token::Newline`], or a
/// `LexingError` if a quote is left open.
pub fn split_into_tokens(line: &str) -> Result<Vec<Token>, LexingError> {
    LexingFSM::new(line).make_tokens()
}

/// Token source that lexes one line at a time from a [`LineSource`].
///
/// A line that fails to decode or lex is replaced by a bare [`Token::Newline`],
/// so the parser sees an empty line; its error is kept until collected with
/// [`Scanner::drain_rejected`]. An error from the line source ends the input;
/// it can be retrieved with [`Scanner::take_error`].
pub struct Scanner<L> {
    lines: L,
    pending: VecDeque<Token>,
    rejected: Vec<LexingError>,
    finished: bool,
    error: Option<anyhow::Error>,
}

impl<L: LineSource> Scanner<L> {
    pub fn new(lines: L) -> Self {
        Self {
            lines,
            pending: VecDeque::new(),
            rejected: Vec::new(),
            finished: false,
            error: None,
        }
    }

    /// The error that ended the input early, if any.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    /// Errors of the lines dropped since the last call, oldest first.
    pub fn drain_rejected(&mut self) -> std::vec::Drain<'_, LexingError> {
        self.rejected.drain(..)
    }

    fn load_line(&mut self, line: Vec<u8>) {
        let lexed = String::from_utf8(line)
            .map_err(|_| LexingError::InvalidUtf8)
            .and_then(|line| split_into_tokens(&line));
        match lexed {
            Ok(tokens) => {
                trace!(?tokens, "lexed line");
                self.pending.extend(tokens);
            }
            Err(e) => {
                debug!(error = %e, "dropping line");
                self.rejected.push(e);
            }
        }
        self.pending.push_back(Token::Newline);
    }
}

impl<L: LineSource> TokenSource for Scanner<L> {
    fn next_token(&mut self) -> Token {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return token;
            }
            if self.finished {
                return Token::EndOfInput;
            }
            match self.lines.read_line() {
                Ok(Some(line)) => self.load_line(line),
                Ok(None) => self.finished = true,
                Err(e) => {
                    warn!(error = %e, "line source failed");
                    self.error = Some(e);
                    self.finished = true;
                }
            }
        }
    }
}
