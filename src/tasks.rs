//! Rule dispatch and the task state machines driven by the engine.
//!
//! Every key maps to exactly one rule shape, and every rule runs as one of
//! four task variants:
//!
//! - a target task fans out to its member nodes;
//! - an input node task stats a leaf of the graph;
//! - a produced node task forwards to its producing command and projects
//!   the command's value onto the one node;
//! - a command task drives the command itself.

use crate::command::CommandState;
use crate::engine::TaskContext;
use crate::graph::{BuildDescription, BuildNode, CommandId, NodeId, TargetId};
use crate::key::BuildKey;
use crate::value::BuildValue;

/// What computes a key's value, and how to judge a stored value for it.
pub struct Rule {
    pub kind: RuleKind,
}

#[derive(Debug, Copy, Clone)]
pub enum RuleKind {
    Command(CommandId),
    /// A node with no producers: raw input to the build.
    InputNode(NodeId),
    /// A node some command outputs.
    ProducedNode(NodeId),
    Target(TargetId),
}

/// Map a key to its rule.  Command and target keys name declared entities;
/// node keys may name anything, fabricating a node on first sight.
pub fn lookup_rule(desc: &mut BuildDescription, key: &BuildKey) -> Rule {
    let kind = match key {
        BuildKey::Command(name) => match desc.lookup_command(name) {
            Some(id) => RuleKind::Command(id),
            // Command keys are only ever produced from declared commands.
            None => panic!("no rule for command '{}'", name),
        },
        BuildKey::Node(name) => {
            let id = desc.node_id(name);
            if desc.node(id).producers.is_empty() {
                RuleKind::InputNode(id)
            } else {
                RuleKind::ProducedNode(id)
            }
        }
        BuildKey::Target(name) => match desc.lookup_target(name) {
            Some(id) => RuleKind::Target(id),
            // The public build entry point rejects unknown targets before
            // the engine ever demands them.
            None => panic!("no rule for target '{}'", name),
        },
    };
    Rule { kind }
}

/// Whether a stored value still stands for this rule.
pub fn is_result_valid(desc: &BuildDescription, kind: &RuleKind, value: &BuildValue) -> bool {
    match kind {
        RuleKind::Command(id) => desc.command(*id).is_result_valid(desc, value),
        RuleKind::InputNode(id) => input_node_result_valid(desc.node(*id), value),
        // Freshness of a produced node is fully delegated to its command.
        RuleKind::ProducedNode(_) => true,
        // Targets re-traverse every build so missing-input reports stay
        // current; members still scan clean.
        RuleKind::Target(_) => false,
    }
}

fn input_node_result_valid(node: &BuildNode, value: &BuildValue) -> bool {
    // Virtual input nodes are always valid unless the value type is wrong.
    if node.is_virtual() {
        return matches!(value, BuildValue::VirtualInput);
    }
    let BuildValue::ExistingInput(stored) = value else {
        return false;
    };
    let info = node.file_info();
    if info.is_missing() {
        return false;
    }
    info == *stored
}

pub fn create_task(kind: &RuleKind) -> TaskVariant {
    match kind {
        RuleKind::Command(id) => TaskVariant::Command(CommandTask {
            command: *id,
            state: CommandState::default(),
        }),
        RuleKind::InputNode(id) => TaskVariant::InputNode(InputNodeTask { node: *id }),
        RuleKind::ProducedNode(id) => TaskVariant::ProducedNode(ProducedNodeTask {
            node: *id,
            producer: None,
            result: BuildValue::Invalid,
        }),
        RuleKind::Target(id) => TaskVariant::Target(TargetTask {
            target: *id,
            has_missing_input: false,
        }),
    }
}

pub enum TaskVariant {
    Target(TargetTask),
    InputNode(InputNodeTask),
    ProducedNode(ProducedNodeTask),
    Command(CommandTask),
}

impl TaskVariant {
    pub fn start(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        match self {
            TaskVariant::Target(task) => task.start(ctx, desc),
            TaskVariant::InputNode(task) => task.start(ctx, desc),
            TaskVariant::ProducedNode(task) => task.start(ctx, desc),
            TaskVariant::Command(task) => {
                desc.command(task.command).start(ctx, desc, &mut task.state)
            }
        }
    }

    pub fn provide_prior_value(
        &mut self,
        _ctx: &mut TaskContext,
        _desc: &BuildDescription,
        _value: &BuildValue,
    ) {
        // No task variant uses its prior value beyond validity checking,
        // which the engine has already done by the time a task runs.
    }

    pub fn provide_value(
        &mut self,
        ctx: &mut TaskContext,
        desc: &BuildDescription,
        input_id: usize,
        value: &BuildValue,
    ) {
        match self {
            TaskVariant::Target(task) => task.provide_value(ctx, desc, input_id, value),
            TaskVariant::InputNode(_) => {}
            TaskVariant::ProducedNode(task) => task.provide_value(ctx, desc, input_id, value),
            TaskVariant::Command(task) => {
                desc.command(task.command)
                    .provide_value(ctx, desc, &mut task.state, input_id, value)
            }
        }
    }

    pub fn inputs_available(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        match self {
            TaskVariant::Target(task) => task.inputs_available(ctx, desc),
            TaskVariant::InputNode(task) => task.inputs_available(ctx, desc),
            TaskVariant::ProducedNode(task) => task.inputs_available(ctx, desc),
            TaskVariant::Command(task) => {
                desc.command(task.command)
                    .inputs_available(ctx, desc, &task.state)
            }
        }
    }
}

/// Translates a request for a target into requests for all of its member
/// nodes.
pub struct TargetTask {
    target: TargetId,
    has_missing_input: bool,
}

impl TargetTask {
    fn start(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        for (id, &member) in desc.target(self.target).members.iter().enumerate() {
            ctx.needs_input(BuildKey::node(desc.node(member).name.as_str()), id);
        }
    }

    fn provide_value(
        &mut self,
        ctx: &mut TaskContext,
        desc: &BuildDescription,
        input_id: usize,
        value: &BuildValue,
    ) {
        if matches!(value, BuildValue::MissingInput) {
            self.has_missing_input = true;
            let member = desc.target(self.target).members[input_id];
            ctx.error(&format!(
                "missing input '{}' and no rule to build it",
                desc.node(member).name
            ));
        }
    }

    fn inputs_available(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        if self.has_missing_input {
            ctx.error(&format!(
                "cannot build target '{}' due to missing input",
                desc.target(self.target).name
            ));
            ctx.delegate().had_command_failure();
        }
        ctx.complete(BuildValue::Target);
    }
}

/// "Builds" a node that nothing produces: pure raw input to the system.
pub struct InputNodeTask {
    node: NodeId,
}

impl InputNodeTask {
    fn start(&mut self, _ctx: &mut TaskContext, desc: &BuildDescription) {
        debug_assert!(desc.node(self.node).producers.is_empty());
    }

    fn inputs_available(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        let node = desc.node(self.node);
        if node.is_virtual() {
            ctx.complete(BuildValue::VirtualInput);
            return;
        }
        let info = node.file_info();
        if info.is_missing() {
            ctx.complete(BuildValue::MissingInput);
            return;
        }
        ctx.complete(BuildValue::ExistingInput(info));
    }
}

/// Builds a node that is the product of some command: requests the
/// producing command and projects its value onto this one node.
pub struct ProducedNodeTask {
    node: NodeId,
    producer: Option<CommandId>,
    result: BuildValue,
}

impl ProducedNodeTask {
    fn start(&mut self, ctx: &mut TaskContext, desc: &BuildDescription) {
        let node = desc.node(self.node);
        let producer = match node.producers.as_slice() {
            [producer] => *producer,
            candidates => {
                // More than one producer is a reserved extension; the host
                // may pick one, otherwise it is a hard failure.
                let names: Vec<&str> = candidates
                    .iter()
                    .map(|&c| desc.command(c).name.as_str())
                    .collect();
                match ctx.delegate().select_producer(&node.name, &names) {
                    Some(choice) if choice < candidates.len() => candidates[choice],
                    _ => panic!("node '{}' has multiple producer commands", node.name),
                }
            }
        };
        self.producer = Some(producer);
        ctx.needs_input(BuildKey::command(desc.command(producer).name.as_str()), 0);
    }

    fn provide_value(
        &mut self,
        _ctx: &mut TaskContext,
        desc: &BuildDescription,
        _input_id: usize,
        value: &BuildValue,
    ) {
        let producer = self.producer.expect("producer requested in start");
        self.result = desc
            .command(producer)
            .result_for_output(desc, self.node, value);
    }

    fn inputs_available(&mut self, ctx: &mut TaskContext, _desc: &BuildDescription) {
        debug_assert!(!self.result.is_invalid());
        ctx.complete(std::mem::replace(&mut self.result, BuildValue::Invalid));
    }
}

/// Drives the actual execution of a command.
pub struct CommandTask {
    command: CommandId,
    state: CommandState,
}
