//! Keys naming units of work.
//!
//! A key's encoded form is used verbatim as the result database key, so the
//! encoding must stay stable across runs: one tag byte followed by the
//! UTF-8 name.

use anyhow::bail;

/// Identifies a unit of work: executing a command, producing a node's value,
/// or traversing a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
    Command(String),
    Node(String),
    Target(String),
}

const TAG_COMMAND: u8 = b'C';
const TAG_NODE: u8 = b'N';
const TAG_TARGET: u8 = b'T';

impl BuildKey {
    pub fn command(name: impl Into<String>) -> BuildKey {
        BuildKey::Command(name.into())
    }
    pub fn node(name: impl Into<String>) -> BuildKey {
        BuildKey::Node(name.into())
    }
    pub fn target(name: impl Into<String>) -> BuildKey {
        BuildKey::Target(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            BuildKey::Command(name) | BuildKey::Node(name) | BuildKey::Target(name) => name,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (tag, name) = match self {
            BuildKey::Command(name) => (TAG_COMMAND, name),
            BuildKey::Node(name) => (TAG_NODE, name),
            BuildKey::Target(name) => (TAG_TARGET, name),
        };
        let mut bytes = Vec::with_capacity(1 + name.len());
        bytes.push(tag);
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<BuildKey> {
        let Some((&tag, name)) = bytes.split_first() else {
            bail!("empty build key");
        };
        let name = std::str::from_utf8(name)?.to_string();
        Ok(match tag {
            TAG_COMMAND => BuildKey::Command(name),
            TAG_NODE => BuildKey::Node(name),
            TAG_TARGET => BuildKey::Target(name),
            _ => bail!("unknown build key tag {:#x}", tag),
        })
    }
}
