//! Minimal client for the QEMU Machine Protocol.
//!
//! QMP is line-delimited JSON over a Unix socket: a greeting, capability
//! negotiation, then one reply per command with asynchronous events
//! interleaved.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use camino::Utf8Path;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug)]
pub(crate) struct Qmp {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Qmp {
    /// Connect and leave negotiation mode.
    pub(crate) fn connect(path: &Utf8Path, timeout: Duration) -> Result<Self> {
        let stream =
            UnixStream::connect(path).with_context(|| format!("Connecting to QMP at {path}"))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let mut qmp = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };
        let greeting = qmp.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(eyre!("Unexpected QMP greeting: {greeting}"));
        }
        qmp.execute("qmp_capabilities")?;
        Ok(qmp)
    }

    fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(eyre!("QMP connection closed"));
        }
        serde_json::from_str(&line).with_context(|| format!("Parsing QMP message {line:?}"))
    }

    /// Run `command` and return its `return` value.
    pub(crate) fn execute(&mut self, command: &str) -> Result<Value> {
        let mut req = serde_json::to_vec(&json!({ "execute": command }))?;
        req.push(b'\n');
        self.writer.write_all(&req)?;
        loop {
            let mut msg = self.read_message()?;
            if let Some(r) = msg.get_mut("return") {
                return Ok(r.take());
            }
            if let Some(e) = msg.get("error") {
                return Err(eyre!("QMP {command} failed: {e}"));
            }
            debug!("QMP event: {msg}");
        }
    }
}
