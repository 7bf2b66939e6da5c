//! Line parser: turns the token stream of one line into a [`Pipeline`].
//!
//! The first token of a line is classified on its own (blank line, end of input,
//! the `exit` and `cd` built-ins). Everything else goes through the pipeline
//! grammar, a small state machine that decides where `<`, `>` and `|` are legal.

use crate::array::GrowableArray;
use crate::lexer::{Token, TokenSource};
use std::io;
use thiserror::Error;
use tracing::debug;

/// One program and its argument vector. The first argument is the program name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    args: GrowableArray<String>,
}

impl Stage {
    fn new(program: String) -> Self {
        let mut args = GrowableArray::new();
        args.push(program);
        Self { args }
    }

    fn push(&mut self, arg: String) {
        self.args.push(arg);
    }

    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Full argument vector, program name included.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// A validated chain of stages with optional redirection at both ends.
///
/// There is always at least one stage. The input path feeds the first stage and
/// the output path receives the last stage's standard output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pipeline {
    stages: GrowableArray<Stage>,
    input: Option<String>,
    output: Option<String>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn input_path(&self) -> Option<&str> {
        self.input.as_deref()
    }

    pub fn output_path(&self) -> Option<&str> {
        self.output.as_deref()
    }
}

/// Result of parsing one line.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A pipeline ready to execute.
    Ok(Pipeline),
    /// Nothing to run: a blank line or a successful `cd`.
    Empty,
    /// `exit`, or the end of the input stream.
    Exit,
    /// The line was rejected and discarded up to its end.
    Error(ParseError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cd only takes one argument.")]
    CdArity,
    #[error("unable to cd to '{dir}': {source}")]
    ChangeDirectory {
        dir: String,
        #[source]
        source: io::Error,
    },
    #[error("no initial program to run.")]
    NoInitialProgram,
    #[error("no valid filename provided to >")]
    MissingOutputFile,
    #[error("no valid filename provided to <")]
    MissingInputFile,
    #[error("inappropriate redirection to a file.")]
    MisplacedOutputRedirect,
    #[error("inappropriate redirection from a file.")]
    MisplacedInputRedirect,
    #[error("inappropriate pipe.")]
    MisplacedPipe,
    #[error("no program following pipe.")]
    NoProgramAfterPipe,
    /// The token source ended in the middle of a line.
    #[error("unreachable code executed")]
    UnexpectedEndOfInput,
}

impl ParseError {
    /// Prefix used when reporting the error to the user.
    pub fn category(&self) -> &'static str {
        match self {
            ParseError::ChangeDirectory { .. } => "exec error",
            _ => "parse error",
        }
    }
}

/// Token source wrapper with one token of lookahead.
struct Cursor<'s, S: ?Sized> {
    source: &'s mut S,
    peeked: Option<Token>,
    // Whether the last consumed token ended the line.
    at_line_end: bool,
}

impl<'s, S: TokenSource + ?Sized> Cursor<'s, S> {
    fn new(source: &'s mut S) -> Self {
        Self {
            source,
            peeked: None,
            at_line_end: false,
        }
    }

    fn next(&mut self) -> Token {
        let token = match self.peeked.take() {
            Some(token) => token,
            None => self.source.next_token(),
        };
        self.at_line_end = matches!(token, Token::Newline | Token::EndOfInput);
        token
    }

    fn peek(&mut self) -> &Token {
        let source = &mut *self.source;
        self.peeked.get_or_insert_with(|| source.next_token())
    }

    /// Discard the rest of the current line.
    fn finish_line(&mut self) {
        while !self.at_line_end {
            self.next();
        }
    }
}

/// Legality flags for the pipeline grammar, local to one parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParseState {
    expecting_new_stage: bool,
    input_redirect_allowed: bool,
    output_redirect_allowed: bool,
    pipe_allowed: bool,
}

impl ParseState {
    fn new() -> Self {
        Self {
            expecting_new_stage: false,
            input_redirect_allowed: true,
            output_redirect_allowed: true,
            pipe_allowed: true,
        }
    }

    fn begin_stage(&mut self) {
        self.expecting_new_stage = false;
        self.output_redirect_allowed = true;
        self.pipe_allowed = true;
    }
}

/// What the first token of a line turned out to be.
enum FirstToken {
    Done(ParseOutcome),
    Program(String),
}

/// Reusable line parser.
///
/// The parser owns the stage buffer between lines: a successful parse hands it
/// out inside the [`Pipeline`], and [`Parser::recycle`] takes it back so its
/// allocation serves the next line.
#[derive(Debug, Default)]
pub struct Parser {
    stages: GrowableArray<Stage>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line worth of tokens.
    ///
    /// On error every token up to the end of the offending line has been
    /// consumed, so the next call starts on a fresh line.
    pub fn parse<S: TokenSource + ?Sized>(&mut self, tokens: &mut S) -> ParseOutcome {
        self.stages.clear();
        let mut cursor = Cursor::new(tokens);

        let outcome = match Self::parse_first(&mut cursor) {
            FirstToken::Done(outcome) => outcome,
            FirstToken::Program(program) => match self.parse_pipeline(&mut cursor, program) {
                Ok(pipeline) => ParseOutcome::Ok(pipeline),
                Err(e) => ParseOutcome::Error(e),
            },
        };

        if let ParseOutcome::Error(e) = &outcome {
            debug!(error = %e, "discarding line");
            cursor.finish_line();
            self.stages.clear();
        }
        outcome
    }

    /// Return a pipeline's stage buffer to the parser, dropping its contents.
    pub fn recycle(&mut self, pipeline: Pipeline) {
        let mut stages = pipeline.stages;
        stages.clear();
        if stages.capacity() > self.stages.capacity() {
            self.stages = stages;
        }
    }

    fn parse_first<S: TokenSource + ?Sized>(cursor: &mut Cursor<'_, S>) -> FirstToken {
        let program = match cursor.next() {
            Token::Newline => return FirstToken::Done(ParseOutcome::Empty),
            Token::EndOfInput => return FirstToken::Done(ParseOutcome::Exit),
            Token::Word(word) => word,
            _ => return FirstToken::Done(ParseOutcome::Error(ParseError::NoInitialProgram)),
        };

        if program == "exit" && *cursor.peek() == Token::Newline {
            cursor.next();
            return FirstToken::Done(ParseOutcome::Exit);
        }
        if program == "cd" {
            return FirstToken::Done(match Self::parse_cd(cursor) {
                Ok(()) => ParseOutcome::Empty,
                Err(e) => ParseOutcome::Error(e),
            });
        }
        FirstToken::Program(program)
    }

    fn parse_cd<S: TokenSource + ?Sized>(cursor: &mut Cursor<'_, S>) -> Result<(), ParseError> {
        let Token::Word(dir) = cursor.next() else {
            return Err(ParseError::CdArity);
        };
        if cursor.next() != Token::Newline {
            return Err(ParseError::CdArity);
        }

        debug!(%dir, "changing directory");
        std::env::set_current_dir(&dir).map_err(|source| ParseError::ChangeDirectory { dir, source })
    }

    fn parse_pipeline<S: TokenSource + ?Sized>(
        &mut self,
        cursor: &mut Cursor<'_, S>,
        program: String,
    ) -> Result<Pipeline, ParseError> {
        let mut state = ParseState::new();
        let mut current = Stage::new(program);
        let mut input = None;
        let mut output = None;

        loop {
            match cursor.next() {
                Token::Word(word) => {
                    if state.expecting_new_stage {
                        let finished = std::mem::replace(&mut current, Stage::new(word));
                        self.stages.push(finished);
                        state.begin_stage();
                    } else {
                        current.push(word);
                    }
                }
                Token::RedirectOut => {
                    if !state.output_redirect_allowed {
                        return Err(ParseError::MisplacedOutputRedirect);
                    }
                    let Token::Word(path) = cursor.next() else {
                        return Err(ParseError::MissingOutputFile);
                    };
                    output = Some(path);
                    state.output_redirect_allowed = false;
                    state.pipe_allowed = false;
                }
                Token::RedirectIn => {
                    if !state.input_redirect_allowed {
                        return Err(ParseError::MisplacedInputRedirect);
                    }
                    let Token::Word(path) = cursor.next() else {
                        return Err(ParseError::MissingInputFile);
                    };
                    input = Some(path);
                    state.input_redirect_allowed = false;
                }
                Token::PipeOp => {
                    if !state.pipe_allowed {
                        return Err(ParseError::MisplacedPipe);
                    }
                    state.expecting_new_stage = true;
                    state.input_redirect_allowed = false;
                }
                Token::Newline => {
                    if state.expecting_new_stage {
                        return Err(ParseError::NoProgramAfterPipe);
                    }
                    self.stages.push(current);
                    debug!(stages = self.stages.len(), ?input, ?output, "parsed pipeline");
                    return Ok(Pipeline {
                        stages: std::mem::take(&mut self.stages),
                        input,
                        output,
                    });
                }
                Token::EndOfInput => return Err(ParseError::UnexpectedEndOfInput),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::split_into_tokens;
    use std::collections::VecDeque;

    fn tokens(lines: &[&str]) -> VecDeque<Token> {
        let mut out = VecDeque::new();
        for line in lines {
            out.extend(split_into_tokens(line).unwrap());
            out.push_back(Token::Newline);
        }
        out
    }

    fn parse_line(line: &str) -> ParseOutcome {
        Parser::new().parse(&mut tokens(&[line]))
    }

    fn expect_pipeline(line: &str) -> Pipeline {
        match parse_line(line) {
            ParseOutcome::Ok(pipeline) => pipeline,
            other => panic!("expected a pipeline for {line:?}, got {other:?}"),
        }
    }

    fn expect_error(line: &str) -> String {
        match parse_line(line) {
            ParseOutcome::Error(e) => e.to_string(),
            other => panic!("expected an error for {line:?}, got {other:?}"),
        }
    }

    fn argv(stage: &Stage) -> Vec<&str> {
        stage.args().iter().map(String::as_str).collect()
    }

    #[test]
    fn blank_line_and_end_of_input() {
        assert!(matches!(parse_line(""), ParseOutcome::Empty));
        assert!(matches!(
            Parser::new().parse(&mut VecDeque::new()),
            ParseOutcome::Exit
        ));
    }

    #[test]
    fn exit_alone_requests_exit() {
        assert!(matches!(parse_line("exit"), ParseOutcome::Exit));
    }

    #[test]
    fn exit_with_arguments_is_an_ordinary_program() {
        let pipeline = expect_pipeline("exit now");
        assert_eq!(argv(&pipeline.stages()[0]), vec!["exit", "now"]);
    }

    #[test]
    fn single_stage_with_arguments() {
        let pipeline = expect_pipeline("ls -l /tmp");
        assert_eq!(pipeline.stages().len(), 1);
        assert_eq!(pipeline.stages()[0].program(), "ls");
        assert_eq!(argv(&pipeline.stages()[0]), vec!["ls", "-l", "/tmp"]);
        assert_eq!(pipeline.input_path(), None);
        assert_eq!(pipeline.output_path(), None);
    }

    #[test]
    fn stage_count_is_pipe_count_plus_one() {
        for line in ["a", "a | b", "a x | b y | c z", "a|b|c|d|e"] {
            let pipeline = expect_pipeline(line);
            let pipes = line.matches('|').count();
            assert_eq!(pipeline.stages().len(), pipes + 1, "{line}");
            assert!(pipeline.stages().iter().all(|s| !s.args().is_empty()));
        }
    }

    #[test]
    fn redirections_at_both_ends() {
        let pipeline = expect_pipeline("sort < in.txt | uniq -c > out.txt");
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(argv(&pipeline.stages()[1]), vec!["uniq", "-c"]);
        assert_eq!(pipeline.input_path(), Some("in.txt"));
        assert_eq!(pipeline.output_path(), Some("out.txt"));
    }

    #[test]
    fn arguments_may_follow_redirections() {
        let pipeline = expect_pipeline("grep < in.txt -v foo");
        assert_eq!(argv(&pipeline.stages()[0]), vec!["grep", "-v", "foo"]);
        assert_eq!(pipeline.input_path(), Some("in.txt"));
    }

    #[test]
    fn input_redirection_only_on_first_stage_and_once() {
        assert_eq!(
            expect_error("a < f1 < f2"),
            "inappropriate redirection from a file."
        );
        assert_eq!(
            expect_error("a | b < f"),
            "inappropriate redirection from a file."
        );
    }

    #[test]
    fn output_redirection_closes_the_stage_for_pipes() {
        assert_eq!(expect_error("a > f1 | b > f2"), "inappropriate pipe.");
        assert_eq!(
            expect_error("a > f1 > f2"),
            "inappropriate redirection to a file."
        );
    }

    #[test]
    fn missing_filenames() {
        assert_eq!(expect_error("a >"), "no valid filename provided to >");
        assert_eq!(expect_error("a > | b"), "no valid filename provided to >");
        assert_eq!(expect_error("a <"), "no valid filename provided to <");
    }

    #[test]
    fn trailing_pipe_needs_a_program() {
        assert_eq!(expect_error("a |"), "no program following pipe.");
        assert_eq!(expect_error("a | b |"), "no program following pipe.");
    }

    #[test]
    fn repeated_pipe_collapses_into_one() {
        let pipeline = expect_pipeline("a | | b");
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(pipeline.stages()[1].program(), "b");
    }

    #[test]
    fn line_must_start_with_a_program() {
        assert_eq!(expect_error("| a"), "no initial program to run.");
        assert_eq!(expect_error("> f"), "no initial program to run.");
    }

    #[test]
    fn errors_drain_only_the_offending_line() {
        let mut parser = Parser::new();
        let mut source = tokens(&["a > f | b c d", "a >", "next line"]);

        assert!(matches!(
            parser.parse(&mut source),
            ParseOutcome::Error(ParseError::MisplacedPipe)
        ));
        assert!(matches!(
            parser.parse(&mut source),
            ParseOutcome::Error(ParseError::MissingOutputFile)
        ));
        match parser.parse(&mut source) {
            ParseOutcome::Ok(pipeline) => {
                assert_eq!(argv(&pipeline.stages()[0]), vec!["next", "line"])
            }
            other => panic!("expected the third line to parse, got {other:?}"),
        }
        assert!(matches!(parser.parse(&mut source), ParseOutcome::Exit));
    }

    #[test]
    fn end_of_input_mid_line_is_internal_error() {
        let mut source: VecDeque<Token> = split_into_tokens("a | b").unwrap().into();
        assert!(matches!(
            Parser::new().parse(&mut source),
            ParseOutcome::Error(ParseError::UnexpectedEndOfInput)
        ));
    }

    #[test]
    fn cd_arity() {
        assert_eq!(expect_error("cd a b"), "cd only takes one argument.");
        assert_eq!(expect_error("cd"), "cd only takes one argument.");
        assert_eq!(expect_error("cd | x"), "cd only takes one argument.");
    }

    #[test]
    fn cd_arity_errors_keep_the_next_line() {
        let mut parser = Parser::new();
        let mut source = tokens(&["cd", "cd a b c", "pwd"]);
        assert!(matches!(parser.parse(&mut source), ParseOutcome::Error(ParseError::CdArity)));
        assert!(matches!(parser.parse(&mut source), ParseOutcome::Error(ParseError::CdArity)));
        assert!(matches!(parser.parse(&mut source), ParseOutcome::Ok(_)));
    }

    #[test]
    fn cd_into_existing_directory_is_empty() {
        let here = std::env::current_dir().unwrap();
        let line = format!("cd '{}'", here.display());
        assert!(matches!(parse_line(&line), ParseOutcome::Empty));
        assert_eq!(std::env::current_dir().unwrap(), here);
    }

    #[test]
    fn cd_into_missing_directory_reports_exec_error() {
        let missing = std::env::temp_dir().join(format!("parser_tests_{}_missing", std::process::id()));
        let line = format!("cd '{}'", missing.display());
        match parse_line(&line) {
            ParseOutcome::Error(e @ ParseError::ChangeDirectory { .. }) => {
                assert_eq!(e.category(), "exec error");
                assert!(e.to_string().starts_with("unable to cd to"));
            }
            other => panic!("expected a cd failure, got {other:?}"),
        }
    }

    #[test]
    fn recycled_buffer_keeps_its_capacity() {
        let mut parser = Parser::new();
        let mut source = tokens(&["a | b | c | d | e", "f"]);
        let ParseOutcome::Ok(pipeline) = parser.parse(&mut source) else {
            panic!("first line should parse");
        };
        assert_eq!(pipeline.stages().len(), 5);
        parser.recycle(pipeline);
        assert_eq!(parser.stages.capacity(), 8);
        assert!(parser.stages.is_empty());

        let ParseOutcome::Ok(pipeline) = parser.parse(&mut source) else {
            panic!("second line should parse");
        };
        assert_eq!(pipeline.stages().len(), 1);
        assert_eq!(pipeline.stages.capacity(), 8);
    }
}
