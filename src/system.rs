//! The public build system surface: the host delegate contract and the
//! `BuildSystem` entry point tying together loading, the result database,
//! and the engine.

use crate::db::Db;
use crate::engine::Engine;
use crate::graph::BuildDescription;
use crate::key::BuildKey;
use crate::load;
use crate::queue::ExecutionQueue;
use crate::tools::Tool;
use crate::trace;
use std::sync::Arc;

/// A source range for diagnostics; `{0, 0}` means "no location".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Token {
    pub offset: u32,
    pub length: u32,
}

impl Token {
    pub fn none() -> Token {
        Token::default()
    }
}

/// The host side of the build system: identity, tool extension, execution,
/// diagnostics, and cancellation.
pub trait Delegate {
    /// The client name a build file must declare to be accepted.
    fn name(&self) -> &str;

    /// The client schema version; doubles as the result database schema
    /// version, so bumping it starts builds cold.
    fn version(&self) -> u32;

    /// Offer the host a chance to supply a tool before the built-ins are
    /// consulted.
    fn lookup_tool(&self, name: &str) -> Option<Box<dyn Tool>> {
        let _ = name;
        None
    }

    /// Construct the execution queue; called once per build system.
    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue>;

    fn error(&self, filename: &str, at: Token, message: &str);

    /// Called each time a command fails or is skipped due to a missing
    /// input.
    fn had_command_failure(&self);

    fn is_cancelled(&self) -> bool {
        false
    }

    /// The raw build file contents, forwarded before parsing so the host
    /// can render caret diagnostics.
    fn set_file_contents_being_parsed(&self, buffer: &[u8]) {
        let _ = buffer;
    }

    /// Choose among several producers of `node` (by index into
    /// `candidates`).  Returning None keeps the default behavior: multiple
    /// producers are a hard failure.
    fn select_producer(&self, node: &str, candidates: &[&str]) -> Option<usize> {
        let _ = (node, candidates);
        None
    }
}

/// A build system instance over one build file.
pub struct BuildSystem<'a> {
    delegate: &'a dyn Delegate,
    main_filename: String,
    queue: Arc<dyn ExecutionQueue>,
    /// Loaded at most once; a failed load is latched so repeated build
    /// calls do not re-parse.
    description: Option<BuildDescription>,
    load_failed: bool,
    db: Option<Db>,
}

impl<'a> BuildSystem<'a> {
    pub fn new(delegate: &'a dyn Delegate, main_filename: impl Into<String>) -> BuildSystem<'a> {
        BuildSystem {
            delegate,
            main_filename: main_filename.into(),
            queue: Arc::from(delegate.create_execution_queue()),
            description: None,
            load_failed: false,
            db: None,
        }
    }

    /// Attach the result database.  Must be called before `build`.
    pub fn attach_db(&mut self, path: &str) -> anyhow::Result<()> {
        self.db = Some(Db::open(path, self.delegate.version())?);
        Ok(())
    }

    /// Write a chrome trace of the build to `path`.  Must be called before
    /// `build`.
    pub fn enable_tracing(&mut self, path: &str) -> anyhow::Result<()> {
        trace::open(path)?;
        Ok(())
    }

    /// Bring `target` up to date.  Returns whether the build ran to
    /// completion, not whether it succeeded; command failures are reported
    /// through the delegate.
    pub fn build(&mut self, target: &str) -> bool {
        if self.description.is_none() {
            if self.load_failed {
                return false;
            }
            match trace::scope("load", || load::load(&self.main_filename, self.delegate)) {
                Ok(description) => self.description = Some(description),
                Err(_) => {
                    // Specific problems were already reported during the
                    // load attempt.
                    self.load_failed = true;
                    self.delegate.error(
                        &self.main_filename,
                        Token::none(),
                        "unable to load build file",
                    );
                    return false;
                }
            }
        }
        let description = self.description.as_mut().unwrap();

        if description.lookup_target(target).is_none() {
            self.delegate.error(
                &self.main_filename,
                Token::none(),
                &format!("unknown target '{}'", target),
            );
            return false;
        }

        let mut engine = Engine::new(
            self.delegate,
            description,
            self.db.as_mut(),
            self.queue.clone(),
            &self.main_filename,
        );
        match trace::scope("build", || engine.build(BuildKey::target(target))) {
            Ok(()) => true,
            Err(err) => {
                self.delegate
                    .error(&self.main_filename, Token::none(), &err.to_string());
                false
            }
        }
    }
}
