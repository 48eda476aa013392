//! The command-line driver: flag parsing and the console delegate.

use crate::queue::{ExecutionQueue, LaneQueue};
use crate::scanner;
use crate::signal;
use crate::system::{BuildSystem, Delegate, Token};
use crate::trace;
use anyhow::anyhow;
use std::cell::{Cell, RefCell};
use std::path::Path;

/// Delegate for interactive use: diagnostics to stderr, SIGINT as
/// cancellation, a lane queue sized to the machine.
pub struct ConsoleDelegate {
    parallelism: usize,
    failures: Cell<usize>,
    /// Build file contents, kept for caret diagnostics.
    contents: RefCell<Option<Vec<u8>>>,
}

impl ConsoleDelegate {
    pub fn new(parallelism: usize) -> ConsoleDelegate {
        ConsoleDelegate {
            parallelism,
            failures: Cell::new(0),
            contents: RefCell::new(None),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.get()
    }
}

impl Delegate for ConsoleDelegate {
    fn name(&self) -> &str {
        "basic"
    }

    fn version(&self) -> u32 {
        0
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        Box::new(LaneQueue::new(self.parallelism))
    }

    fn error(&self, filename: &str, at: Token, message: &str) {
        if at.length > 0 {
            if let Some(buf) = self.contents.borrow().as_ref() {
                eprint!(
                    "{}",
                    scanner::format_error_context(
                        buf,
                        filename,
                        at.offset as usize,
                        &format!("error: {}", message),
                    )
                );
                return;
            }
        }
        eprintln!("error: {}", message);
    }

    fn had_command_failure(&self) {
        self.failures.set(self.failures.get() + 1);
    }

    fn is_cancelled(&self) -> bool {
        signal::was_interrupted()
    }

    fn set_file_contents_being_parsed(&self, buffer: &[u8]) {
        *self.contents.borrow_mut() = Some(buffer.to_vec());
    }
}

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// grist, an incremental build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.grist]
    #[argh(option, short = 'f', default = "(\"build.grist\".into())")]
    build_file: String,

    /// result database path [default=.grist_db]
    #[argh(option, default = "(\".grist_db\".into())")]
    db: String,

    /// write a chrome trace of the build to this path
    #[argh(option)]
    trace: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> anyhow::Result<usize> {
    Ok(usize::from(std::thread::available_parallelism()?))
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if let Some(dir) = &opts.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    if opts.targets.is_empty() {
        anyhow::bail!("no targets specified");
    }

    signal::register_sigint();

    let parallelism = match opts.parallelism {
        Some(parallelism) => parallelism,
        None => default_parallelism()?,
    };
    let delegate = ConsoleDelegate::new(parallelism);
    let mut system = BuildSystem::new(&delegate, opts.build_file.as_str());
    system.attach_db(&opts.db)?;
    if let Some(path) = &opts.trace {
        system.enable_tracing(path)?;
    }

    let mut completed = true;
    for target in &opts.targets {
        completed &= system.build(target);
    }

    Ok(if completed && delegate.failures() == 0 {
        0
    } else {
        1
    })
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}
