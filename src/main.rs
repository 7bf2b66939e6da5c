use anyhow::Context;
use argh::FromArgs;
use pipesh::{DEFAULT_PROMPT, Interpreter, PLAIN_PROMPT, ReaderLines};
use std::fs::File;
use std::io::{self, BufReader, IsTerminal};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Run pipelines of programs, one line at a time.
struct Args {
    #[argh(positional)]
    /// file to read lines from instead of the terminal.
    script: Option<PathBuf>,

    #[argh(option)]
    /// prompt to show before each interactive line.
    prompt: Option<String>,

    #[argh(switch)]
    /// use a prompt without colours.
    no_color: bool,

    #[argh(option, default = "String::from(\"warn\")")]
    /// log filter used when RUST_LOG is not set (e.g. "debug").
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut shell = Interpreter::new();
    match &args.script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("unable to open script {}", path.display()))?;
            shell.run(ReaderLines::new(BufReader::new(file)), &mut io::stderr())
        }
        None if !io::stdin().is_terminal() => {
            shell.run(ReaderLines::new(io::stdin().lock()), &mut io::stderr())
        }
        None => {
            let prompt = match args.prompt {
                Some(prompt) => prompt,
                None if args.no_color => PLAIN_PROMPT.to_string(),
                None => DEFAULT_PROMPT.to_string(),
            };
            shell.repl(&prompt)
        }
    }
}
