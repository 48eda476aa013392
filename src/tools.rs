//! The tool registry and the built-in tools.
//!
//! A tool is a factory for commands.  Lookup consults the host delegate
//! first, so a host can shadow the built-ins or add its own; otherwise the
//! three built-in tools are recognized: `phony`, `shell`, and `clang`.

use crate::command::{Command, CommandBehavior};
use crate::depfile;
use crate::hash::hash_string;
use crate::queue::{JobContext, JobFn};
use crate::scanner::Scanner;
use crate::system::Delegate;

/// A named command factory, configurable from the build file.
pub trait Tool {
    /// Tools accept no attributes unless they say otherwise.
    fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        let _ = value;
        Err(format!("unexpected attribute: '{}'", name))
    }

    fn create_command(&self, name: &str) -> Command;
}

/// Look up a tool by name, consulting the host delegate before the
/// built-ins.
pub fn lookup_tool(delegate: &dyn Delegate, name: &str) -> Option<Box<dyn Tool>> {
    if let Some(tool) = delegate.lookup_tool(name) {
        return Some(tool);
    }
    match name {
        "phony" => Some(Box::new(PhonyTool)),
        "shell" => Some(Box::new(ShellTool)),
        "clang" => Some(Box::new(ClangTool)),
        _ => None,
    }
}

/// Groups nodes without doing any work.
struct PhonyTool;

impl Tool for PhonyTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(name, Box::new(PhonyBehavior))
    }
}

struct PhonyBehavior;

impl CommandBehavior for PhonyBehavior {
    fn prepare_job(&self, _description: &str) -> JobFn {
        Box::new(|_ctx| true)
    }
}

/// Runs an arbitrary shell command, given by the required `args` attribute.
struct ShellTool;

impl Tool for ShellTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(name, Box::new(ShellBehavior::default()))
    }
}

#[derive(Default)]
struct ShellBehavior {
    args: String,
}

impl CommandBehavior for ShellBehavior {
    fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        if name == "args" {
            self.args = value.to_string();
            return Ok(());
        }
        Err(format!("unexpected attribute: '{}'", name))
    }

    fn extend_signature(&self, signature: &mut u64) {
        *signature ^= hash_string(&self.args);
    }

    fn prepare_job(&self, description: &str) -> JobFn {
        let log = log_line(description, &self.args);
        let args = self.args.clone();
        Box::new(move |ctx| {
            println!("{}", log);
            ctx.execute_shell_command(&args)
        })
    }
}

/// A compiler-style shell command that also reads a makefile-syntax deps
/// file after a successful run, turning each path in it into a discovered
/// dependency of the command.
struct ClangTool;

impl Tool for ClangTool {
    fn create_command(&self, name: &str) -> Command {
        Command::new(name, Box::new(ClangBehavior::default()))
    }
}

#[derive(Default)]
struct ClangBehavior {
    args: String,
    /// Path the compiler was told to write dependency rules to.  Not part
    /// of the signature; the files it names are captured as discovered
    /// dependencies instead.
    deps_path: String,
}

impl CommandBehavior for ClangBehavior {
    fn configure_attribute(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name {
            "args" => self.args = value.to_string(),
            "deps" => self.deps_path = value.to_string(),
            _ => return Err(format!("unexpected attribute: '{}'", name)),
        }
        Ok(())
    }

    fn extend_signature(&self, signature: &mut u64) {
        *signature ^= hash_string(&self.args);
    }

    fn prepare_job(&self, description: &str) -> JobFn {
        let log = log_line(description, &self.args);
        let args = self.args.clone();
        let deps_path = self.deps_path.clone();
        Box::new(move |ctx| {
            println!("{}", log);
            if !ctx.execute_shell_command(&args) {
                // No point gathering dependencies from a failed run.
                return false;
            }
            if deps_path.is_empty() {
                return true;
            }
            process_discovered_dependencies(ctx, &deps_path)
        })
    }
}

/// Read the deps file and report every dependency it names.  Any problem
/// with the file fails the command.
fn process_discovered_dependencies(ctx: &mut JobContext, deps_path: &str) -> bool {
    let mut bytes = match std::fs::read(deps_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            ctx.error(
                deps_path,
                format!("unable to open dependencies file ({})", err),
            );
            return false;
        }
    };
    bytes.push(0);
    let mut scanner = Scanner::new(&bytes);
    let parsed = match depfile::parse(&mut scanner) {
        Ok(parsed) => parsed,
        Err(err) => {
            ctx.error(
                deps_path,
                format!("error reading dependency file: {}", err.msg),
            );
            return false;
        }
    };
    // The rule targets are ignored; every dependency in the file counts.
    for (_target, deps) in parsed.iter() {
        for dep in deps {
            ctx.discovered_dependency(dep);
        }
    }
    true
}

fn log_line(description: &str, args: &str) -> String {
    if description.is_empty() {
        args.to_string()
    } else {
        description.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BuildDescription;

    fn shell_command(desc: &mut BuildDescription, name: &str, args: &str) -> Command {
        let mut command = ShellTool.create_command(name);
        command.configure_attribute("args", args).unwrap();
        command.configure_inputs(vec![desc.node_id("a.in")]);
        command.configure_outputs(vec![desc.node_id("a.out")]);
        command
    }

    #[test]
    fn identical_commands_share_a_signature() {
        let mut desc = BuildDescription::new();
        let c1 = shell_command(&mut desc, "c1", "cp a.in a.out");
        let c2 = shell_command(&mut desc, "c2", "cp a.in a.out");
        assert_eq!(c1.signature(&desc), c2.signature(&desc));
    }

    #[test]
    fn args_change_the_signature() {
        let mut desc = BuildDescription::new();
        let c1 = shell_command(&mut desc, "c1", "cp a.in a.out");
        let c2 = shell_command(&mut desc, "c2", "cp -v a.in a.out");
        assert_ne!(c1.signature(&desc), c2.signature(&desc));
    }

    #[test]
    fn deps_path_is_not_part_of_the_signature() {
        let mut desc = BuildDescription::new();
        let mut c1 = ClangTool.create_command("c1");
        c1.configure_attribute("args", "cc -c x.c").unwrap();
        c1.configure_attribute("deps", "x.d").unwrap();
        let mut c2 = ClangTool.create_command("c2");
        c2.configure_attribute("args", "cc -c x.c").unwrap();
        c2.configure_attribute("deps", "other.d").unwrap();
        assert_eq!(c1.signature(&desc), c2.signature(&desc));
    }

    #[test]
    fn unknown_tool_attributes_error() {
        assert!(PhonyTool.configure_attribute("depth", "3").is_err());
        let mut command = ShellTool.create_command("c");
        assert!(command.configure_attribute("deps", "x.d").is_err());
    }
}
