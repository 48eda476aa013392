//! Loads a build file into a `BuildDescription`.
//!
//! Parsing is separate (see `parse.rs`); this module drives the parser,
//! validates the client stanza against the host delegate, resolves tools,
//! and assembles the declaration tables.  Configuration errors reject the
//! offending declaration but do not abort the load; parse errors and a
//! client mismatch do.

use crate::graph::{BuildDescription, Target};
use crate::parse::{Parser, PropList, Statement};
use crate::system::{Delegate, Token};
use crate::tools::{self, Tool};
use anyhow::bail;
use std::collections::HashMap;

struct Loader<'a> {
    main_filename: &'a str,
    delegate: &'a dyn Delegate,
    desc: BuildDescription,
    /// Tools already looked up or configured, by name.
    tools: HashMap<String, Box<dyn Tool>>,
    client_ok: bool,
}

pub fn load(main_filename: &str, delegate: &dyn Delegate) -> anyhow::Result<BuildDescription> {
    let mut bytes = match std::fs::read(main_filename) {
        Ok(bytes) => bytes,
        Err(err) => bail!("read {}: {}", main_filename, err),
    };
    bytes.push(0);
    delegate.set_file_contents_being_parsed(&bytes);

    let mut loader = Loader {
        main_filename,
        delegate,
        desc: BuildDescription::new(),
        tools: HashMap::new(),
        client_ok: false,
    };

    let mut parser = Parser::new(&bytes);
    loop {
        match parser.read() {
            Ok(None) => break,
            Ok(Some(statement)) => loader.statement(statement)?,
            Err(err) => {
                let at = Token {
                    offset: err.ofs as u32,
                    length: 1,
                };
                loader
                    .delegate
                    .error(main_filename, at, &format!("parse error: {}", err.msg));
                bail!("unable to parse {}", main_filename);
            }
        }
    }

    if !loader.client_ok {
        delegate.error(main_filename, Token::none(), "missing 'client' declaration");
        bail!("no client declared in {}", main_filename);
    }
    Ok(loader.desc)
}

impl<'a> Loader<'a> {
    fn error(&self, ofs: usize, length: usize, message: &str) {
        self.delegate.error(
            self.main_filename,
            Token {
                offset: ofs as u32,
                length: length as u32,
            },
            message,
        );
    }

    fn statement(&mut self, statement: Statement<'_>) -> anyhow::Result<()> {
        match statement {
            Statement::Client { props, ofs } => self.load_client(&props, ofs)?,
            Statement::Tool { name, props, ofs } => self.load_tool(name, &props, ofs),
            Statement::Node { name, props, .. } => self.load_node(name, &props),
            Statement::Target { name, members, ofs } => self.load_target(name, &members, ofs),
            Statement::Command { name, props, ofs } => self.load_command(name, &props, ofs),
        }
        Ok(())
    }

    /// The declared client must match the host exactly; there is no
    /// auto-upgrade across versions.
    fn load_client(&mut self, props: &PropList<'_>, ofs: usize) -> anyhow::Result<()> {
        let name = props.get("name").map(|p| p.value).unwrap_or("");
        let version = match props.get("version") {
            None => 0,
            Some(prop) => match prop.value.parse::<u32>() {
                Ok(version) => version,
                Err(_) => {
                    self.error(
                        prop.ofs,
                        "version".len(),
                        &format!("invalid value: '{}' for attribute 'version'", prop.value),
                    );
                    bail!("malformed client declaration");
                }
            },
        };
        if name != self.delegate.name() || version != self.delegate.version() {
            self.error(
                ofs,
                "client".len(),
                &format!("unsupported client: '{}' (version {})", name, version),
            );
            bail!("client mismatch");
        }
        self.client_ok = true;
        Ok(())
    }

    fn load_tool(&mut self, name: &str, props: &PropList<'_>, ofs: usize) {
        let Some(mut tool) = tools::lookup_tool(self.delegate, name) else {
            self.error(ofs, "tool".len(), &format!("unknown tool: '{}'", name));
            return;
        };
        for (attr, prop) in props.iter() {
            if let Err(msg) = tool.configure_attribute(attr, prop.value) {
                self.error(prop.ofs, attr.len(), &msg);
                return;
            }
        }
        self.tools.insert(name.to_string(), tool);
    }

    fn load_node(&mut self, name: &str, props: &PropList<'_>) {
        let id = self.desc.node_id(name);
        for (attr, prop) in props.iter() {
            if let Err(msg) = self.desc.node_mut(id).configure_attribute(attr, prop.value) {
                self.error(prop.ofs, attr.len(), &msg);
            }
        }
    }

    fn load_target(&mut self, name: &str, members: &[&str], ofs: usize) {
        let members = members.iter().map(|m| self.desc.node_id(m)).collect();
        let target = Target {
            name: name.to_string(),
            members,
        };
        if let Err(msg) = self.desc.add_target(target) {
            self.error(ofs, "target".len(), &msg);
        }
    }

    fn load_command(&mut self, name: &str, props: &PropList<'_>, ofs: usize) {
        let Some(tool_name) = props.get("tool").map(|p| p.value) else {
            self.error(
                ofs,
                "command".len(),
                &format!("missing 'tool' attribute for command '{}'", name),
            );
            return;
        };

        // Tools need not be declared to be used; configure-on-demand.
        if !self.tools.contains_key(tool_name) {
            match tools::lookup_tool(self.delegate, tool_name) {
                Some(tool) => {
                    self.tools.insert(tool_name.to_string(), tool);
                }
                None => {
                    let prop = props.get("tool").unwrap();
                    self.error(prop.ofs, "tool".len(), &format!("unknown tool: '{}'", tool_name));
                    return;
                }
            }
        }
        let mut command = self.tools[tool_name].create_command(name);

        for (attr, prop) in props.iter() {
            let result = match *attr {
                "tool" => Ok(()),
                "description" => {
                    command.configure_description(prop.value);
                    Ok(())
                }
                "inputs" => {
                    let nodes = prop
                        .value
                        .split_whitespace()
                        .map(|n| self.desc.node_id(n))
                        .collect();
                    command.configure_inputs(nodes);
                    Ok(())
                }
                "outputs" => {
                    let nodes = prop
                        .value
                        .split_whitespace()
                        .map(|n| self.desc.node_id(n))
                        .collect();
                    command.configure_outputs(nodes);
                    Ok(())
                }
                attr => command.configure_attribute(attr, prop.value),
            };
            if let Err(msg) = result {
                self.error(prop.ofs, attr.len(), &msg);
                return;
            }
        }

        if let Err(msg) = self.desc.add_command(command) {
            self.error(ofs, "command".len(), &msg);
        }
    }
}
