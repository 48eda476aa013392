//! End-to-end tests driving builds through the public API, with a
//! recording delegate and a synchronous execution queue.

use grist::db::Db;
use grist::key::BuildKey;
use grist::queue::{ExecutionQueue, QueueJob};
use grist::system::{BuildSystem, Delegate, Token};
use grist::value::BuildValue;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Mutex};

/// Manages a temporary directory for invoking builds.  Node names in test
/// build files are absolute paths into it, since tests share one process
/// working directory.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<TestSpace> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    /// Absolute path of a file in the working space.
    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_str().unwrap().to_string()
    }

    fn write(&self, name: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(name), content)
    }

    fn exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Open the space's result database for inspection.
    fn db(&self) -> Db {
        Db::open(&self.path(".grist_db"), 0).unwrap()
    }
}

/// Runs jobs inline on the engine thread, recording what was executed.
struct InlineQueue {
    jobs: Arc<Mutex<usize>>,
    shell: Arc<Mutex<Vec<String>>>,
}

impl ExecutionQueue for InlineQueue {
    fn add_job(&self, job: QueueJob) {
        *self.jobs.lock().unwrap() += 1;
        job();
    }

    fn execute_shell_command(&self, args: &str) -> bool {
        self.shell.lock().unwrap().push(args.to_string());
        grist::process::run_shell_command(args)
    }
}

#[derive(Default)]
struct TestDelegate {
    errors: RefCell<Vec<String>>,
    failures: Cell<usize>,
    cancelled: Cell<bool>,
    jobs: Arc<Mutex<usize>>,
    shell: Arc<Mutex<Vec<String>>>,
}

impl TestDelegate {
    fn jobs(&self) -> usize {
        *self.jobs.lock().unwrap()
    }

    fn shell_commands(&self) -> Vec<String> {
        self.shell.lock().unwrap().clone()
    }

    fn has_error(&self, text: &str) -> bool {
        self.errors.borrow().iter().any(|e| e.contains(text))
    }
}

impl Delegate for TestDelegate {
    fn name(&self) -> &str {
        "basic"
    }

    fn version(&self) -> u32 {
        0
    }

    fn create_execution_queue(&self) -> Box<dyn ExecutionQueue> {
        Box::new(InlineQueue {
            jobs: self.jobs.clone(),
            shell: self.shell.clone(),
        })
    }

    fn error(&self, _filename: &str, _at: Token, message: &str) {
        self.errors.borrow_mut().push(message.to_string());
    }

    fn had_command_failure(&self) {
        self.failures.set(self.failures.get() + 1);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// One full build of `target` against the space's build file and database,
/// with a fresh delegate.
fn build(space: &TestSpace, delegate: &TestDelegate, target: &str) -> bool {
    let mut system = BuildSystem::new(delegate, space.path("build.grist"));
    system.attach_db(&space.path(".grist_db")).unwrap();
    system.build(target)
}

#[test]
fn phony_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

command group
  tool = phony
  outputs = <all>

target all: <all>
",
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.failures.get(), 0);
    assert!(delegate.errors.borrow().is_empty());
    assert_eq!(delegate.jobs(), 1);

    let stored = space.db();
    assert!(matches!(
        stored.lookup(&BuildKey::command("group")).unwrap().value,
        BuildValue::SuccessfulCommand { .. }
    ));

    // Unchanged rebuild: nothing executes, not even the phony job.
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.jobs(), 0);
    assert_eq!(delegate.failures.get(), 0);
    Ok(())
}

#[cfg(unix)]
#[test]
fn shell_command_up_to_date_skip() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (inp, outp) = (space.path("a.in"), space.path("a.out"));
    space.write("a.in", "contents\n")?;
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

command copy
  tool = shell
  inputs = {inp}
  outputs = {outp}
  args = cp {inp} {outp}

target all: {outp}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 1);
    assert!(space.exists("a.out"));

    // No filesystem change: zero shell executions on the second run.
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 0);
    assert_eq!(delegate.jobs(), 0);

    // Touching the input re-runs the command.
    space.write("a.in", "new contents\n")?;
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn signature_change_forces_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (inp, outp) = (space.path("a.in"), space.path("a.out"));
    space.write("a.in", "contents\n")?;
    let build_file = |args: &str| {
        format!(
            "client
  name = basic

command copy
  tool = shell
  inputs = {inp}
  outputs = {outp}
  args = {args}

target all: {outp}
"
        )
    };
    space.write("build.grist", &build_file(&format!("cp {inp} {outp}")))?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 1);

    // Same declaration: no work.
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 0);

    // Changed args: the stored signature no longer matches, so the command
    // runs exactly once even though all files are unchanged.
    space.write("build.grist", &build_file(&format!("cp -p {inp} {outp}")))?;
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands(), vec![format!("cp -p {inp} {outp}")]);
    Ok(())
}

#[test]
fn missing_input_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let missing = space.path("b.in");
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

target all: {missing}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    // Completion, not success.
    assert!(build(&space, &delegate, "all"));
    assert!(delegate.has_error(&format!(
        "missing input '{}' and no rule to build it",
        missing
    )));
    assert!(delegate.has_error("cannot build target 'all' due to missing input"));
    assert!(delegate.failures.get() >= 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn missing_command_input_skips_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (missing, outp) = (space.path("b.in"), space.path("b.out"));
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

command copy
  tool = shell
  inputs = {missing}
  outputs = {outp}
  args = cp {missing} {outp}

target all: {outp}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 0);
    assert!(delegate.has_error(&format!(
        "missing input '{}' and no rule to build it",
        missing
    )));
    assert!(delegate.has_error(&format!("cannot build '{}' due to missing input", outp)));
    assert!(delegate.failures.get() >= 1);
    assert!(matches!(
        space.db().lookup(&BuildKey::command("copy")).unwrap().value,
        BuildValue::SkippedCommand
    ));
    Ok(())
}

#[cfg(unix)]
#[test]
fn discovered_dependencies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (x_o, x_c, x_h, x_d) = (
        space.path("x.o"),
        space.path("x.c"),
        space.path("x.h"),
        space.path("x.d"),
    );
    space.write("x.c", "int main() {}\n")?;
    space.write("x.h", "/* header */\n")?;
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

command compile
  tool = clang
  inputs = {x_c}
  outputs = {x_o}
  args = touch {x_o} && printf '%s: %s %s' {x_o} {x_c} {x_h} > {x_d}
  deps = {x_d}

target all: {x_o}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 1);
    assert_eq!(delegate.failures.get(), 0);

    // The discovered edge is recorded alongside the declared input.
    let stored = space.db();
    let deps = &stored.lookup(&BuildKey::command("compile")).unwrap().deps;
    assert!(deps.contains(&BuildKey::node(x_h.clone())));

    // Unchanged: no recompile.
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 0);

    // Changing the header re-runs the command even though it was never
    // declared as an input.
    space.write("x.h", "/* a longer header */\n")?;
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands().len(), 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn unreadable_deps_file_fails_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (x_o, x_d) = (space.path("x.o"), space.path("x.d"));
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

command compile
  tool = clang
  outputs = {x_o}
  args = touch {x_o}
  deps = {x_d}

target all: {x_o}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert!(delegate.has_error("unable to open dependencies file"));
    assert_eq!(delegate.failures.get(), 1);
    assert!(matches!(
        space.db().lookup(&BuildKey::command("compile")).unwrap().value,
        BuildValue::FailedCommand
    ));
    Ok(())
}

#[test]
fn cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

command cu
  tool = phony
  inputs = v
  outputs = u

command cv
  tool = phony
  inputs = u
  outputs = v

target all: u
",
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(
        delegate
            .errors
            .borrow()
            .iter()
            .filter(|e| e.contains("cycle detected while building"))
            .count(),
        1
    );
    Ok(())
}

#[cfg(unix)]
#[test]
fn failed_command_skips_dependents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (out_a, out_b) = (space.path("a.out"), space.path("b.out"));
    space.write(
        "build.grist",
        &format!(
            "client
  name = basic

command first
  tool = shell
  outputs = {out_a}
  args = false

command second
  tool = shell
  inputs = {out_a}
  outputs = {out_b}
  args = cp {out_a} {out_b}

target all: {out_b}
"
        ),
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    // Only the failing command ran; its dependent was skipped.
    assert_eq!(delegate.shell_commands(), vec!["false".to_string()]);
    assert_eq!(delegate.failures.get(), 1);

    let stored = space.db();
    assert!(matches!(
        stored.lookup(&BuildKey::command("first")).unwrap().value,
        BuildValue::FailedCommand
    ));
    assert!(matches!(
        stored.lookup(&BuildKey::command("second")).unwrap().value,
        BuildValue::SkippedCommand
    ));

    // Failures are never valid stored values: the next run re-attempts.
    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.shell_commands(), vec!["false".to_string()]);
    assert_eq!(delegate.failures.get(), 1);
    Ok(())
}

#[test]
fn cancellation_skips_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

command group
  tool = phony
  outputs = <all>

target all: <all>
",
    )?;

    let delegate = TestDelegate::default();
    delegate.cancelled.set(true);
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.jobs(), 0);
    assert!(matches!(
        space.db().lookup(&BuildKey::command("group")).unwrap().value,
        BuildValue::SkippedCommand
    ));
    Ok(())
}

#[test]
fn client_mismatch_fails_load() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic
  version = 7

target all:
",
    )?;

    let delegate = TestDelegate::default();
    assert!(!build(&space, &delegate, "all"));
    assert!(delegate.has_error("unsupported client: 'basic' (version 7)"));
    assert!(delegate.has_error("unable to load build file"));
    Ok(())
}

#[test]
fn unknown_target_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

target all:
",
    )?;

    let delegate = TestDelegate::default();
    assert!(!build(&space, &delegate, "nope"));
    assert!(delegate.has_error("unknown target 'nope'"));
    Ok(())
}

#[test]
fn unknown_attribute_rejects_declaration() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

node <x>
  color = red

command group
  tool = phony
  outputs = <x>

target all: <x>
",
    )?;

    let delegate = TestDelegate::default();
    // The bad attribute is reported but the build still completes.
    assert!(build(&space, &delegate, "all"));
    assert!(delegate.has_error("unexpected attribute: 'color'"));
    assert_eq!(delegate.failures.get(), 0);
    Ok(())
}

#[test]
fn empty_target_builds_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.grist",
        "client
  name = basic

target all:
",
    )?;

    let delegate = TestDelegate::default();
    assert!(build(&space, &delegate, "all"));
    assert_eq!(delegate.jobs(), 0);
    assert_eq!(delegate.failures.get(), 0);
    Ok(())
}
