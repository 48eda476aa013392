//! The loaded build graph: nodes, targets, and the tables binding them to
//! commands by name.

use crate::command::Command;
use crate::densemap::{self, DenseMap};
use crate::fs::FileInfo;
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandId(u32);
impl densemap::Index for CommandId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for CommandId {
    fn from(u: usize) -> CommandId {
        CommandId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(u32);
impl densemap::Index for TargetId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for TargetId {
    fn from(u: usize) -> TargetId {
        TargetId(u as u32)
    }
}

/// Whether a node name denotes a virtual node by convention.
pub fn is_virtual_name(name: &str) -> bool {
    name.starts_with('<') && name.ends_with('>')
}

/// A build graph node: either a filesystem path or a virtual grouping
/// handle with no filesystem identity.
pub struct BuildNode {
    pub name: String,
    virtual_node: bool,
    /// Commands that produce this node as an output.
    pub producers: Vec<CommandId>,
}

impl BuildNode {
    pub fn new(name: impl Into<String>, is_virtual: bool) -> BuildNode {
        BuildNode {
            name: name.into(),
            virtual_node: is_virtual,
            producers: Vec::new(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_node
    }

    /// Apply a declaration attribute.  Only `is-virtual` is recognized.
    pub fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        if name == "is-virtual" {
            match value {
                "true" => self.virtual_node = true,
                "false" => self.virtual_node = false,
                _ => {
                    return Err(format!(
                        "invalid value: '{}' for attribute '{}'",
                        value, name
                    ))
                }
            }
            return Ok(());
        }
        Err(format!("unexpected attribute: '{}'", name))
    }

    /// The node's current filesystem identity.  Only meaningful for
    /// non-virtual nodes.
    pub fn file_info(&self) -> FileInfo {
        debug_assert!(!self.is_virtual(), "file info of virtual node {}", self.name);
        FileInfo::for_path(&self.name)
    }
}

/// A named set of top-level nodes to bring up to date.
pub struct Target {
    pub name: String,
    pub members: Vec<NodeId>,
}

/// All entities declared by a build file, plus any nodes fabricated on the
/// fly for names the engine encountered only through keys.
#[derive(Default)]
pub struct BuildDescription {
    pub nodes: DenseMap<NodeId, BuildNode>,
    node_names: HashMap<String, NodeId>,
    pub commands: DenseMap<CommandId, Command>,
    command_names: HashMap<String, CommandId>,
    pub targets: DenseMap<TargetId, Target>,
    target_names: HashMap<String, TargetId>,
}

impl BuildDescription {
    pub fn new() -> BuildDescription {
        BuildDescription::default()
    }

    /// Intern a node name, creating the node on first sight.  Nodes created
    /// here follow the `<...>` virtual naming convention; a later `node`
    /// declaration may override with the `is-virtual` attribute.
    pub fn node_id(&mut self, name: &str) -> NodeId {
        match self.node_names.get(name) {
            Some(&id) => id,
            None => {
                let id = self
                    .nodes
                    .push(BuildNode::new(name, is_virtual_name(name)));
                self.node_names.insert(name.to_string(), id);
                id
            }
        }
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BuildNode {
        self.nodes.get_mut(id)
    }

    pub fn command(&self, id: CommandId) -> &Command {
        self.commands.get(id)
    }

    pub fn target(&self, id: TargetId) -> &Target {
        self.targets.get(id)
    }

    pub fn lookup_command(&self, name: &str) -> Option<CommandId> {
        self.command_names.get(name).copied()
    }

    pub fn lookup_target(&self, name: &str) -> Option<TargetId> {
        self.target_names.get(name).copied()
    }

    /// Add a command, registering it as the producer of each of its outputs.
    /// Fails on duplicate command names.
    pub fn add_command(&mut self, command: Command) -> Result<CommandId, String> {
        if self.command_names.contains_key(&command.name) {
            return Err(format!("duplicate command: '{}'", command.name));
        }
        let outputs = command.outputs.clone();
        let name = command.name.clone();
        let id = self.commands.push(command);
        self.command_names.insert(name, id);
        for out in outputs {
            self.nodes.get_mut(out).producers.push(id);
        }
        Ok(id)
    }

    pub fn add_target(&mut self, target: Target) -> Result<TargetId, String> {
        if self.target_names.contains_key(&target.name) {
            return Err(format!("duplicate target: '{}'", target.name));
        }
        let name = target.name.clone();
        let id = self.targets.push(target);
        self.target_names.insert(name, id);
        Ok(id)
    }
}
