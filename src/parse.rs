//! Parser for build files.
//!
//! The format is line oriented: a declaration keyword opens each stanza and
//! indented `key = value` lines configure it.
//!
//! ```text
//! client
//!   name = basic
//!   version = 0
//!
//! target all: <all>
//!
//! command package
//!   tool = shell
//!   inputs = <all>
//!   outputs = pkg.tar
//!   args = tar cf pkg.tar out/
//! ```
//!
//! To avoid allocations, parsing returns references into the input text,
//! marked with the lifetime `'text`.

use crate::scanner::{ParseError, ParseResult, Scanner};
use crate::smallmap::SmallMap;

/// One `key = value` property line, with the offset of its key for error
/// reporting.
#[derive(Debug, PartialEq)]
pub struct Prop<'text> {
    pub value: &'text str,
    pub ofs: usize,
}

pub type PropList<'text> = SmallMap<&'text str, Prop<'text>>;

#[derive(Debug)]
pub enum Statement<'text> {
    Client {
        props: PropList<'text>,
        ofs: usize,
    },
    Tool {
        name: &'text str,
        props: PropList<'text>,
        ofs: usize,
    },
    Node {
        name: &'text str,
        props: PropList<'text>,
        ofs: usize,
    },
    Target {
        name: &'text str,
        members: Vec<&'text str>,
        ofs: usize,
    },
    Command {
        name: &'text str,
        props: PropList<'text>,
        ofs: usize,
    },
}

pub struct Parser<'text> {
    scanner: Scanner<'text>,
}

impl<'text> Parser<'text> {
    pub fn new(buf: &'text [u8]) -> Parser<'text> {
        Parser {
            scanner: Scanner::new(buf),
        }
    }

    pub fn format_parse_error(&self, filename: &str, err: ParseError) -> String {
        self.scanner.format_parse_error(filename, err)
    }

    pub fn read(&mut self) -> ParseResult<Option<Statement<'text>>> {
        loop {
            match self.scanner.peek() {
                '\0' => return Ok(None),
                '\n' | '\r' => self.scanner.next(),
                '#' => self.skip_comment(),
                ' ' | '\t' => return self.scanner.parse_error("unexpected indent"),
                _ => {
                    let ofs = self.scanner.ofs;
                    let keyword = self.read_ident()?;
                    self.scanner.skip_spaces();
                    return Ok(Some(match keyword {
                        "client" => {
                            self.expect_eol()?;
                            Statement::Client {
                                props: self.read_props()?,
                                ofs,
                            }
                        }
                        "tool" => {
                            let name = self.read_name(false)?;
                            self.expect_eol()?;
                            Statement::Tool {
                                name,
                                props: self.read_props()?,
                                ofs,
                            }
                        }
                        "node" => {
                            let name = self.read_name(false)?;
                            self.expect_eol()?;
                            Statement::Node {
                                name,
                                props: self.read_props()?,
                                ofs,
                            }
                        }
                        "target" => {
                            let name = self.read_name(true)?;
                            self.scanner.skip_spaces();
                            self.scanner.expect(':')?;
                            let mut members = Vec::new();
                            loop {
                                self.scanner.skip_spaces();
                                if self.peek_eol() {
                                    break;
                                }
                                members.push(self.read_name(false)?);
                            }
                            self.expect_eol()?;
                            Statement::Target { name, members, ofs }
                        }
                        "command" => {
                            let name = self.read_name(false)?;
                            self.expect_eol()?;
                            Statement::Command {
                                name,
                                props: self.read_props()?,
                                ofs,
                            }
                        }
                        keyword => {
                            return Err(ParseError {
                                msg: format!("unexpected keyword {:?}", keyword),
                                ofs,
                            })
                        }
                    }));
                }
            }
        }
    }

    /// Read a collection of indented `key = value` lines.
    fn read_props(&mut self) -> ParseResult<PropList<'text>> {
        let mut props = PropList::default();
        loop {
            // Blank lines end the stanza; indented lines continue it.
            if self.scanner.peek() != ' ' {
                break;
            }
            self.scanner.skip_spaces();
            if self.peek_eol() {
                self.expect_eol()?;
                break;
            }
            let ofs = self.scanner.ofs;
            let name = self.read_ident()?;
            self.scanner.skip_spaces();
            self.scanner.expect('=')?;
            self.scanner.skip_spaces();
            let value = self.read_value()?;
            props.insert(name, Prop { value, ofs });
        }
        Ok(props)
    }

    fn read_ident(&mut self) -> ParseResult<&'text str> {
        let start = self.scanner.ofs;
        while matches!(self.scanner.read(), 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_') {}
        self.scanner.back();
        if self.scanner.ofs == start {
            return self.scanner.parse_error("expected identifier");
        }
        Ok(self.scanner.slice(start, self.scanner.ofs))
    }

    /// Read a node/target/tool name: any run of non-space characters.
    /// Target names additionally stop at the colon separating the member
    /// list.
    fn read_name(&mut self, stop_at_colon: bool) -> ParseResult<&'text str> {
        let start = self.scanner.ofs;
        loop {
            match self.scanner.read() {
                '\0' | ' ' | '\t' | '\n' | '\r' => {
                    self.scanner.back();
                    break;
                }
                ':' if stop_at_colon => {
                    self.scanner.back();
                    break;
                }
                _ => {}
            }
        }
        if self.scanner.ofs == start {
            return self.scanner.parse_error("expected name");
        }
        Ok(self.scanner.slice(start, self.scanner.ofs))
    }

    /// Read a property value: the rest of the line, verbatim.
    fn read_value(&mut self) -> ParseResult<&'text str> {
        let start = self.scanner.ofs;
        while !self.peek_eol() {
            self.scanner.next();
        }
        let value = self.scanner.slice(start, self.scanner.ofs);
        self.expect_eol()?;
        Ok(value)
    }

    fn peek_eol(&self) -> bool {
        matches!(self.scanner.peek(), '\n' | '\r' | '\0')
    }

    fn expect_eol(&mut self) -> ParseResult<()> {
        self.scanner.skip('\r');
        if self.scanner.peek() == '\0' {
            return Ok(());
        }
        self.scanner.expect('\n')
    }

    fn skip_comment(&mut self) {
        while !self.peek_eol() {
            self.scanner.next();
        }
        if self.scanner.peek() != '\0' {
            self.scanner.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parse the whole input and hand the statements to `check`; the
    /// statements borrow the nul-terminated buffer.
    fn parse_all(text: &str, check: impl FnOnce(Vec<Statement<'_>>)) {
        let mut buf = text.as_bytes().to_vec();
        buf.push(0);
        let mut parser = Parser::new(&buf);
        let mut statements = Vec::new();
        loop {
            match parser.read() {
                Ok(None) => break,
                Ok(Some(statement)) => statements.push(statement),
                Err(err) => panic!("{}", parser.format_parse_error("test", err)),
            }
        }
        check(statements);
    }

    #[test]
    fn full_file() {
        parse_all(
            "# demo build
client
  name = basic
  version = 0

tool shell

node <all>
  is-virtual = true

target all: <all> extra.out

command copy
  tool = shell
  inputs = a.in
  outputs = a.out
  args = cp a.in a.out
",
            |statements| {
                assert_eq!(statements.len(), 5);

                let Statement::Client { props, .. } = &statements[0] else {
                    panic!("expected client");
                };
                assert_eq!(props.get("name").unwrap().value, "basic");
                assert_eq!(props.get("version").unwrap().value, "0");

                let Statement::Tool { name, props, .. } = &statements[1] else {
                    panic!("expected tool");
                };
                assert_eq!(*name, "shell");
                assert!(props.is_empty());

                let Statement::Node { name, props, .. } = &statements[2] else {
                    panic!("expected node");
                };
                assert_eq!(*name, "<all>");
                assert_eq!(props.get("is-virtual").unwrap().value, "true");

                let Statement::Target { name, members, .. } = &statements[3] else {
                    panic!("expected target");
                };
                assert_eq!(*name, "all");
                assert_eq!(*members, vec!["<all>", "extra.out"]);

                let Statement::Command { name, props, .. } = &statements[4] else {
                    panic!("expected command");
                };
                assert_eq!(*name, "copy");
                assert_eq!(props.get("tool").unwrap().value, "shell");
                assert_eq!(props.get("args").unwrap().value, "cp a.in a.out");
            },
        );
    }

    #[test]
    fn values_keep_interior_spaces() {
        parse_all(
            "command c
  tool = shell
  args = echo 'a  b' > out
",
            |statements| {
                let Statement::Command { props, .. } = &statements[0] else {
                    panic!("expected command");
                };
                assert_eq!(props.get("args").unwrap().value, "echo 'a  b' > out");
            },
        );
    }

    #[test]
    fn empty_member_list() {
        parse_all("target empty:\n", |statements| {
            let Statement::Target { members, .. } = &statements[0] else {
                panic!("expected target");
            };
            assert!(members.is_empty());
        });
    }

    #[test]
    fn rejects_unknown_keyword() {
        let mut buf = b"rule cc\n".to_vec();
        buf.push(0);
        let mut parser = Parser::new(&buf);
        assert!(parser.read().is_err());
    }

    #[test]
    fn rejects_missing_equals() {
        let mut buf = b"node n\n  is-virtual true\n".to_vec();
        buf.push(0);
        let mut parser = Parser::new(&buf);
        assert!(parser.read().is_err());
    }
}
