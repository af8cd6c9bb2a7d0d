//! Chrome trace-event output, enabled by `-d trace`.  View the resulting
//! file in about:tracing or https://ui.perfetto.dev.

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

    fn write_complete(&mut self, name: &str, tid: usize, start: Instant, end: Instant) {
        // Times are microseconds relative to trace start.
        let _ = writeln!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {}}},",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        );
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap() = Some(trace);
    Ok(())
}

/// Run `f`, recording its duration when tracing is enabled.
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if TRACE.lock().unwrap().is_none() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.write_complete(name, 0, start, end);
    }
    result
}

/// Record an already-measured span, e.g. a finished build task.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.write_complete(name, tid, start, end);
    }
}

pub fn close() -> std::io::Result<()> {
    if let Some(mut trace) = TRACE.lock().unwrap().take() {
        // Close the JSON array with a no-op event so the trailing comma
        // stays legal.
        writeln!(trace.w, "{{\"pid\": 0, \"ph\": \"M\", \"name\": \"done\"}}]")?;
        trace.w.flush()?;
    }
    Ok(())
}
