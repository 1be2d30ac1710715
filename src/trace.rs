//! Optional JSON log of engine events: scans, task runs, input traffic,
//! completions.  Buffered so that tracing stays off the build's critical
//! path, and purely observational; builds behave identically with it on.

use crate::engine::Key;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

pub struct Trace {
    start: Instant,
    w: BufWriter<File>,
    /// First write error, if any; reported at close.
    err: Option<std::io::Error>,
    closed: bool,
}

impl Trace {
    pub fn open(path: &str) -> std::io::Result<Trace> {
        let mut w = BufWriter::new(File::create(path)?);
        write!(w, "[\n")?;
        Ok(Trace {
            start: Instant::now(),
            w,
            err: None,
            closed: false,
        })
    }

    fn event(&mut self, iteration: u64, body: std::fmt::Arguments) {
        if self.err.is_some() || self.closed {
            return;
        }
        let t = Instant::now().duration_since(self.start).as_micros();
        if let Err(e) = write!(self.w, "{{ \"t\": {}, \"i\": {}, {} }},\n", t, iteration, body) {
            self.err = Some(e);
        }
    }

    pub fn build_started(&mut self, iteration: u64) {
        self.event(iteration, format_args!("\"ev\": \"build-started\""));
    }

    pub fn build_ended(&mut self, iteration: u64) {
        self.event(iteration, format_args!("\"ev\": \"build-ended\""));
    }

    pub fn rule_scan_start(&mut self, iteration: u64, key: &Key) {
        self.event(
            iteration,
            format_args!("\"ev\": \"scan-start\", \"key\": {:?}", key),
        );
    }

    pub fn rule_scan_end(&mut self, iteration: u64, key: &Key, outcome: &str) {
        self.event(
            iteration,
            format_args!(
                "\"ev\": \"scan-end\", \"key\": {:?}, \"outcome\": {:?}",
                key, outcome
            ),
        );
    }

    pub fn task_created(&mut self, iteration: u64, key: &Key, task: usize) {
        self.event(
            iteration,
            format_args!("\"ev\": \"task-created\", \"key\": {:?}, \"task\": {}", key, task),
        );
    }

    pub fn input_requested(&mut self, iteration: u64, key: &Key, input: &Key) {
        self.event(
            iteration,
            format_args!(
                "\"ev\": \"input-requested\", \"key\": {:?}, \"input\": {:?}",
                key, input
            ),
        );
    }

    pub fn input_supplied(&mut self, iteration: u64, task: usize, id: usize) {
        self.event(
            iteration,
            format_args!("\"ev\": \"input-supplied\", \"task\": {}, \"id\": {}", task, id),
        );
    }

    pub fn task_completed(&mut self, iteration: u64, key: &Key, changed: bool) {
        self.event(
            iteration,
            format_args!(
                "\"ev\": \"task-completed\", \"key\": {:?}, \"changed\": {}",
                key, changed
            ),
        );
    }

    pub fn cycle(&mut self, iteration: u64, len: usize) {
        self.event(iteration, format_args!("\"ev\": \"cycle\", \"rules\": {}", len));
    }

    pub fn cancelled(&mut self, iteration: u64) {
        self.event(iteration, format_args!("\"ev\": \"cancelled\""));
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(err) = self.err.take() {
            return Err(err);
        }
        // A final sentinel event absorbs the trailing comma.
        write!(self.w, "{{ \"t\": 0, \"i\": 0, \"ev\": \"end\" }}\n]\n")?;
        self.w.flush()
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
