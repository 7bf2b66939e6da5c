//! A small line-oriented command interpreter.
//!
//! Each input line is a pipeline of programs joined by `|`, with optional
//! `< file` on the first stage and `> file` on the last. The crate is split
//! along the path a line takes:
//!
//! - [`lexer`] turns raw lines into [`Token`]s,
//! - [`parser`] validates the token stream and builds a [`Pipeline`],
//! - [`exec`] forks one process per stage, connects them with pipes and
//!   collects their exit statuses in order,
//! - [`Interpreter`] ties them together into a read-eval loop.
//!
//! `cd` and `exit` are handled by the parser itself and never reach the
//! executor.

pub mod array;
pub mod exec;
mod interpreter;
pub mod lexer;
pub mod parser;

pub use exec::{ExecOutcome, execute};
pub use interpreter::{DEFAULT_PROMPT, Interpreter, PLAIN_PROMPT, Prompted, ReaderLines};
pub use lexer::{LexingError, LineSource, Scanner, Token, TokenSource};
pub use parser::{ParseOutcome, Parser, Pipeline, Stage};
