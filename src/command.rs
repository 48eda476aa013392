//! Commands: declared actions that produce output nodes from input nodes by
//! running work outside the build system.
//!
//! The bulk of a command's behavior is shared across tools: configuration,
//! signature computation, projecting a command result onto one of its output
//! nodes, validity checking of a stored result, and the task protocol that
//! feeds it input values and hands the actual work to the execution queue.
//! What varies per tool lives behind [`CommandBehavior`].

use crate::engine::{CommandJob, TaskContext};
use crate::fs::FileInfo;
use crate::graph::{BuildDescription, NodeId};
use crate::hash::hash_string;
use crate::key::BuildKey;
use crate::queue::JobFn;
use crate::value::BuildValue;

/// The tool-specific part of a command: extra attributes, extra signature
/// state, and the work performed when the command executes.
pub trait CommandBehavior {
    /// Configure a tool-specific attribute.  The base command recognizes no
    /// attributes at all, so unknown names are an error.
    fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        let _ = value;
        Err(format!("unexpected attribute: '{}'", name))
    }

    /// Mix tool-specific state into the command signature.
    fn extend_signature(&self, signature: &mut u64) {
        let _ = signature;
    }

    /// Build the work to run on the execution queue.  The returned closure
    /// owns copies of whatever it needs; it runs on a worker thread and
    /// returns whether the command succeeded.
    fn prepare_job(&self, description: &str) -> JobFn;
}

/// Per-build execution state of one command, reset each time its task
/// starts.
#[derive(Default)]
pub struct CommandState {
    /// The command should not run (an input is missing or failed).
    pub should_skip: bool,
    /// An input was missing outright; implies `should_skip`.
    pub has_missing_input: bool,
}

/// A declared command.
pub struct Command {
    pub name: String,
    description: String,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    behavior: Box<dyn CommandBehavior>,
}

impl Command {
    pub fn new(name: impl Into<String>, behavior: Box<dyn CommandBehavior>) -> Command {
        Command {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            behavior,
        }
    }

    pub fn configure_description(&mut self, value: &str) {
        self.description = value.to_string();
    }

    pub fn configure_inputs(&mut self, nodes: Vec<NodeId>) {
        self.inputs = nodes;
    }

    pub fn configure_outputs(&mut self, nodes: Vec<NodeId>) {
        self.outputs = nodes;
    }

    pub fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        self.behavior.configure_attribute(name, value)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The signature of the command's declarative content.  Stored alongside
    /// successful results; a mismatch on a later build forces a re-run.
    pub fn signature(&self, desc: &BuildDescription) -> u64 {
        let mut signature = 0u64;
        for &input in &self.inputs {
            signature ^= hash_string(&desc.node(input).name);
        }
        for &output in &self.outputs {
            signature ^= hash_string(&desc.node(output).name);
        }
        self.behavior.extend_signature(&mut signature);
        signature
    }

    /// Project this command's value onto one of its output nodes.
    pub fn result_for_output(
        &self,
        desc: &BuildDescription,
        node: NodeId,
        value: &BuildValue,
    ) -> BuildValue {
        // A failed or skipped command poisons all of its outputs.
        if matches!(
            value,
            BuildValue::FailedCommand | BuildValue::SkippedCommand
        ) {
            return BuildValue::FailedInput;
        }

        let BuildValue::SuccessfulCommand { outputs, .. } = value else {
            panic!("command '{}' completed with a non-command value", self.name);
        };

        if desc.node(node).is_virtual() {
            return BuildValue::VirtualInput;
        }

        let idx = self
            .outputs
            .iter()
            .position(|&out| out == node)
            .expect("projected node is an output of its producer");
        match outputs.get(idx) {
            Some(FileInfo::Missing) | None => BuildValue::MissingInput,
            Some(&info) => BuildValue::ExistingInput(info),
        }
    }

    /// Whether a stored result still stands for this command: it must be a
    /// successful run under the current signature whose non-virtual outputs
    /// are all still on disk, unchanged.
    pub fn is_result_valid(&self, desc: &BuildDescription, value: &BuildValue) -> bool {
        let BuildValue::SuccessfulCommand { signature, outputs } = value else {
            return false;
        };
        if *signature != self.signature(desc) {
            return false;
        }
        for (i, &out) in self.outputs.iter().enumerate() {
            let node = desc.node(out);
            if node.is_virtual() {
                continue;
            }
            let info = node.file_info();
            if info.is_missing() {
                return false;
            }
            if outputs.get(i) != Some(&info) {
                return false;
            }
        }
        true
    }

    pub fn start(&self, ctx: &mut TaskContext, desc: &BuildDescription, state: &mut CommandState) {
        *state = CommandState::default();
        for (id, &input) in self.inputs.iter().enumerate() {
            ctx.needs_input(BuildKey::node(desc.node(input).name.as_str()), id);
        }
    }

    pub fn provide_value(
        &self,
        ctx: &mut TaskContext,
        desc: &BuildDescription,
        state: &mut CommandState,
        input_id: usize,
        value: &BuildValue,
    ) {
        debug_assert!(value.is_node_value());
        match value {
            BuildValue::ExistingInput(_) | BuildValue::VirtualInput => {}
            BuildValue::MissingInput => {
                state.should_skip = true;
                state.has_missing_input = true;
                ctx.error(&format!(
                    "missing input '{}' and no rule to build it",
                    desc.node(self.inputs[input_id]).name
                ));
            }
            _ => state.should_skip = true,
        }
    }

    pub fn inputs_available(
        &self,
        ctx: &mut TaskContext,
        desc: &BuildDescription,
        state: &CommandState,
    ) {
        // Cancellation is polled here, before any work is enqueued; jobs
        // already running are never interrupted.
        if ctx.delegate().is_cancelled() {
            ctx.complete(BuildValue::SkippedCommand);
            return;
        }

        if state.should_skip {
            if state.has_missing_input {
                let name = self
                    .outputs
                    .first()
                    .map(|&out| desc.node(out).name.as_str())
                    .unwrap_or(self.name.as_str());
                ctx.error(&format!("cannot build '{}' due to missing input", name));
                ctx.delegate().had_command_failure();
            }
            ctx.complete(BuildValue::SkippedCommand);
            return;
        }
        debug_assert!(!state.has_missing_input);

        let signature = self.signature(desc);
        let work = self.behavior.prepare_job(&self.description);
        let outputs: Vec<(String, bool)> = self
            .outputs
            .iter()
            .map(|&out| {
                let node = desc.node(out);
                (node.name.clone(), node.is_virtual())
            })
            .collect();

        let job: CommandJob = Box::new(move |jctx| {
            if !work(jctx) {
                return (BuildValue::FailedCommand, true);
            }
            // Capture each output's identity; virtual outputs get the
            // explicit missing marker.
            let infos = outputs
                .iter()
                .map(|(name, is_virtual)| {
                    if *is_virtual {
                        FileInfo::Missing
                    } else {
                        FileInfo::for_path(name)
                    }
                })
                .collect();
            (
                BuildValue::SuccessfulCommand {
                    signature,
                    outputs: infos,
                },
                false,
            )
        });
        ctx.enqueue_command_job(job);
    }
}
