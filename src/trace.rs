//! Chrome trace output for build performance analysis.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        span: (Instant, Instant),
    ) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }},",
            tid,
            name,
            span.0.duration_since(self.start).as_micros(),
            span.1.duration_since(span.0).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let span = (self.start, Instant::now());
        self.write_complete("main", 0, span)?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap() = Some(trace);
    Ok(())
}

/// Time a phase of the build, attributing it to the engine track.
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    complete(name, 0, (start, Instant::now()));
    result
}

/// Record a completed span, e.g. one command execution on one queue lane.
pub fn complete(name: &str, tid: usize, span: (Instant, Instant)) {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.write_complete(name, tid, span).unwrap();
    }
}

pub fn close() -> std::io::Result<()> {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.close()?;
    }
    *TRACE.lock().unwrap() = None;
    Ok(())
}
