//! Pipeline executor: one forked process per stage, wired together with pipes.
//!
//! Descriptors are carried as [`OwnedFd`]s so the parent's copies close as soon
//! as they are dropped, right after the fork that hands them to a child. Every
//! spawned child is waited for, in pipeline order, before returning.

use crate::parser::{Pipeline, Stage};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::{CString, NulError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Exit status of a child whose program could not be started.
const FATAL_EXIT_STATUS: i32 = 127;

/// Aggregate result of running a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Every stage ran and exited with status 0.
    Ok,
    /// A stage failed to start, exited nonzero or died abnormally.
    Error,
    /// Exec failed inside a forked child. Only ever seen by that child, which
    /// terminates immediately; the interpreter process never observes it.
    FatalExit,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unable to open '{path}' for {operation}: {source}")]
    Open {
        path: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unable to pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("unable to fork: {0}")]
    Fork(#[source] nix::Error),
    #[error("argument contains a nul byte: {0}")]
    Nul(#[from] NulError),
}

/// Where a stage's standard input or output comes from.
#[derive(Debug)]
pub enum Endpoint {
    /// Keep the stream inherited from the interpreter.
    Inherit,
    Fd(OwnedFd),
}

impl Endpoint {
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Endpoint::Inherit => None,
            Endpoint::Fd(fd) => Some(fd.as_raw_fd()),
        }
    }
}

/// Descriptors prepared for one stage.
#[derive(Debug)]
pub struct StageIo {
    pub input: Endpoint,
    pub output: Endpoint,
    /// Read end of the pipe this stage writes into. The parent keeps it for the
    /// next stage; the child must close its inherited copy.
    pub stray: Option<RawFd>,
}

/// Hands out the [`StageIo`] of each stage in order.
///
/// Redirection files are opened and pipes created lazily, when the stage that
/// needs them is requested, so nothing is allocated for stages that never get
/// spawned.
pub struct Wiring<'p> {
    input_path: Option<&'p str>,
    output_path: Option<&'p str>,
    stages: usize,
    index: usize,
    next_input: Option<OwnedFd>,
}

impl<'p> Wiring<'p> {
    pub fn new(pipeline: &'p Pipeline) -> Self {
        Self {
            input_path: pipeline.input_path(),
            output_path: pipeline.output_path(),
            stages: pipeline.stages().len(),
            index: 0,
            next_input: None,
        }
    }

    pub fn next_stage(&mut self) -> Result<Option<StageIo>, ExecError> {
        if self.index == self.stages {
            return Ok(None);
        }

        let input = match self.next_input.take() {
            Some(fd) => Endpoint::Fd(fd),
            None => match self.input_path {
                Some(path) => Endpoint::Fd(open_input(path)?),
                None => Endpoint::Inherit,
            },
        };

        let (output, stray) = if self.index + 1 == self.stages {
            let output = match self.output_path {
                Some(path) => Endpoint::Fd(open_output(path)?),
                None => Endpoint::Inherit,
            };
            (output, None)
        } else {
            // Close-on-exec keeps the pipe out of unrelated children; the copies
            // dup2'd onto stdin/stdout do not inherit the flag.
            let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(ExecError::Pipe)?;
            trace!(read = read.as_raw_fd(), write = write.as_raw_fd(), "created pipe");
            let stray = read.as_raw_fd();
            self.next_input = Some(read);
            (Endpoint::Fd(write), Some(stray))
        };

        self.index += 1;
        Ok(Some(StageIo {
            input,
            output,
            stray,
        }))
    }
}

fn open_input(path: &str) -> Result<OwnedFd, ExecError> {
    File::open(path)
        .map(OwnedFd::from)
        .map_err(|source| ExecError::Open {
            path: path.to_string(),
            operation: "reading",
            source,
        })
}

fn open_output(path: &str) -> Result<OwnedFd, ExecError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map(OwnedFd::from)
        .map_err(|source| ExecError::Open {
            path: path.to_string(),
            operation: "writing",
            source,
        })
}

/// Run a pipeline, reporting failures on stderr.
pub fn execute(pipeline: &Pipeline) -> ExecOutcome {
    execute_with(pipeline, &mut io::stderr())
}

/// Run a pipeline, reporting failures to `diagnostics`.
///
/// Output of the children themselves is not captured; they write wherever
/// the pipeline's redirections or the inherited streams point.
pub fn execute_with(pipeline: &Pipeline, diagnostics: &mut dyn Write) -> ExecOutcome {
    let mut children = Vec::with_capacity(pipeline.stages().len());

    match spawn_all(pipeline, &mut children) {
        Ok(()) => collect(pipeline.stages(), &children, diagnostics),
        Err(e) => abandon(&e, &children, diagnostics),
    }
}

/// Argument vector of one stage, ready for `execvp`.
///
/// `pointers` is the null-terminated array referring into `strings`; both are
/// built before forking so the child has nothing left to allocate.
struct ExecArgs {
    strings: Vec<CString>,
    pointers: Vec<*const libc::c_char>,
}

impl ExecArgs {
    fn new(stage: &Stage) -> Result<Self, NulError> {
        let strings = stage
            .args()
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let pointers = strings
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self { strings, pointers })
    }

    /// Replace the process image. Returns only on failure.
    fn exec(&self) -> Errno {
        // SAFETY: both arrays are NUL terminated and `self` outlives the call.
        unsafe { libc::execvp(self.strings[0].as_ptr(), self.pointers.as_ptr()) };
        Errno::last()
    }
}

/// Spawn every stage in order, recording pids as they appear.
///
/// All parent-side descriptors are closed by the time this returns, whether it
/// succeeds or not.
fn spawn_all(pipeline: &Pipeline, children: &mut Vec<Pid>) -> Result<(), ExecError> {
    // Everything the child needs is allocated before forking.
    let args = pipeline
        .stages()
        .iter()
        .map(ExecArgs::new)
        .collect::<Result<Vec<_>, _>>()?;

    let mut wiring = Wiring::new(pipeline);
    for (stage, args) in pipeline.stages().iter().zip(&args) {
        let Some(io) = wiring.next_stage()? else {
            break;
        };
        children.push(spawn_stage(stage, args, io)?);
    }
    Ok(())
}

fn spawn_stage(stage: &Stage, args: &ExecArgs, io: StageIo) -> Result<Pid, ExecError> {
    let failure = format!("exec error: unable to run '{}': ", stage.program());

    // SAFETY: the child never returns into interpreter code and allocates
    // nothing. It only rewires descriptors, resets SIGPIPE, execs, and on
    // failure writes a prepared message and leaves through `_exit`.
    match unsafe { unistd::fork() }.map_err(ExecError::Fork)? {
        ForkResult::Child => {
            let outcome = replace_image(args, &io, failure.as_bytes());
            debug_assert_eq!(outcome, ExecOutcome::FatalExit);
            terminate_child(FATAL_EXIT_STATUS)
        }
        ForkResult::Parent { child } => {
            debug!(
                pid = child.as_raw(),
                program = stage.program(),
                input = ?io.input.raw_fd(),
                output = ?io.output.raw_fd(),
                "spawned stage"
            );
            // Dropping `io` closes the parent's copies of the stage's descriptors.
            drop(io);
            Ok(child)
        }
    }
}

/// Child side of the fork. Returns only if the program could not be started,
/// and then always with [`ExecOutcome::FatalExit`].
fn replace_image(args: &ExecArgs, io: &StageIo, failure: &[u8]) -> ExecOutcome {
    if let Err(errno) = redirect(&io.input, libc::STDIN_FILENO)
        .and_then(|()| redirect(&io.output, libc::STDOUT_FILENO))
    {
        report_in_child(b"exec error: unable to set up standard streams in child: ", errno);
        return ExecOutcome::FatalExit;
    }
    if let Some(fd) = io.stray {
        let _ = unistd::close(fd);
    }

    // The interpreter ignores SIGPIPE and that disposition survives exec.
    // SAFETY: restoring the default handler installs no Rust code.
    if let Err(errno) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        report_in_child(b"exec error: unable to restore SIGPIPE in child: ", errno);
        return ExecOutcome::FatalExit;
    }

    let errno = args.exec();
    report_in_child(failure, errno);
    ExecOutcome::FatalExit
}

fn redirect(endpoint: &Endpoint, slot: RawFd) -> nix::Result<()> {
    let Some(fd) = endpoint.raw_fd() else {
        return Ok(());
    };
    if fd != slot {
        unistd::dup2(fd, slot)?;
        unistd::close(fd)?;
    }
    Ok(())
}

fn report_in_child(prefix: &[u8], errno: Errno) {
    let stderr = io::stderr();
    let _ = unistd::write(&stderr, prefix);
    let _ = unistd::write(&stderr, errno.desc().as_bytes());
    let _ = unistd::write(&stderr, b".\n");
}

fn terminate_child(status: i32) -> ! {
    // SAFETY: `_exit` skips destructors and atexit handlers, none of which may
    // run in a forked copy of the interpreter.
    unsafe { libc::_exit(status) }
}

/// Retry a system call interrupted by a signal.
fn syscall<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => (),
            result => return result,
        }
    }
}

/// Wait for each child in pipeline order and report the failures.
fn collect(stages: &[Stage], children: &[Pid], diagnostics: &mut dyn Write) -> ExecOutcome {
    let mut outcome = ExecOutcome::Ok;

    for (index, (stage, &pid)) in stages.iter().zip(children).enumerate() {
        let program = stage.program();
        match syscall(|| waitpid(pid, None)) {
            Ok(WaitStatus::Exited(_, 0)) => {
                trace!(pid = pid.as_raw(), index, "stage succeeded");
            }
            Ok(WaitStatus::Exited(_, code)) => {
                debug!(pid = pid.as_raw(), index, code, "stage failed");
                let _ = writeln!(diagnostics, "{program} [{index}] exited with code {code}.");
                outcome = ExecOutcome::Error;
            }
            Ok(status) => {
                debug!(pid = pid.as_raw(), index, ?status, "stage terminated abnormally");
                let _ = writeln!(diagnostics, "{program} [{index}] exited abnormally.");
                outcome = ExecOutcome::Error;
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), index, error = %e, "waitpid failed");
                let _ = writeln!(diagnostics, "exec error: unable to wait for {program} [{index}]: {e}");
                outcome = ExecOutcome::Error;
            }
        }
    }
    outcome
}

/// Report a spawn failure and wait for the stages that did start.
fn abandon(error: &ExecError, children: &[Pid], diagnostics: &mut dyn Write) -> ExecOutcome {
    let _ = writeln!(diagnostics, "exec error: {error}");
    reap(children);
    ExecOutcome::Error
}

/// Wait for children of an aborted pipeline without reporting on them.
fn reap(children: &[Pid]) {
    for &pid in children {
        match syscall(|| waitpid(pid, None)) {
            Ok(status) => debug!(pid = pid.as_raw(), ?status, "reaped child of aborted pipeline"),
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "unable to reap child"),
        }
    }
}
