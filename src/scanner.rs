//! Scans an input buffer (build file, deps file) character by character.

#[derive(Debug)]
pub struct ParseError {
    pub msg: String,
    pub ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

pub struct Scanner<'a> {
    buf: &'a [u8],
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        if !buf.ends_with(b"\0") {
            panic!("Scanner requires nul-terminated buf");
        }
        Scanner { buf, ofs: 0, line: 1 }
    }

    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        unsafe { std::str::from_utf8_unchecked(self.buf.get_unchecked(start..end)) }
    }
    pub fn peek(&self) -> char {
        unsafe { *self.buf.get_unchecked(self.ofs) as char }
    }
    pub fn next(&mut self) {
        if self.peek() == '\n' {
            self.line += 1;
        }
        if self.ofs == self.buf.len() {
            panic!("scanned past end")
        }
        self.ofs += 1;
    }
    pub fn back(&mut self) {
        if self.ofs == 0 {
            panic!("back at start")
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }
    pub fn read(&mut self) -> char {
        let c = self.peek();
        self.next();
        c
    }
    pub fn skip(&mut self, ch: char) -> bool {
        if self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn skip_spaces(&mut self) {
        while self.skip(' ') {}
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        let r = self.read();
        if r != ch {
            self.back();
            return self.parse_error(format!("expected {:?}, got {:?}", ch, r));
        }
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }

    pub fn format_parse_error(&self, filename: &str, err: ParseError) -> String {
        format_error_context(self.buf, filename, err.ofs, &format!("parse error: {}", err.msg))
    }
}

/// Render a message against a buffer offset, quoting the offending line with
/// a caret under the offending column.
pub fn format_error_context(buf: &[u8], filename: &str, ofs: usize, msg: &str) -> String {
    let mut line_start = 0;
    for (line_number, line) in buf.split(|&c| c == b'\n').enumerate() {
        if line_start + line.len() >= ofs {
            let mut out = String::new();
            out.push_str(msg);
            out.push('\n');

            let prefix = format!("{}:{}: ", filename, line_number + 1);
            out.push_str(&prefix);

            let mut context = String::from_utf8_lossy(line).into_owned();
            let mut col = ofs - line_start;
            if col > 40 {
                // Trim beginning of line to fit it on screen.
                context.replace_range(..col - 20, "...");
                col = 3 + 20;
            }
            if context.len() > 40 {
                context.truncate(40);
                context.push_str("...");
            }
            out.push_str(&context);
            out.push('\n');

            out.push_str(&" ".repeat(prefix.len() + col));
            out.push_str("^\n");
            return out;
        }
        line_start += line.len() + 1;
    }
    format!("{}\n{}: at offset {}\n", msg, filename, ofs)
}
