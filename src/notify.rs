//! Change-notification output.
//!
//! Notifications are the product of the whole pipeline: one JSON line on
//! stderr per detected change, level `warn`, with the category payload
//! flattened into the record. The sink is injectable so tests can
//! capture and assert on the emitted records.

use std::io::{self, Write};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Serialize)]
struct Record<'a, P: Serialize> {
    level: &'static str,
    #[serde(flatten)]
    payload: &'a P,
    #[serde(rename = "processName")]
    process_name: &'a str,
    user: &'a str,
    message: &'a str,
}

pub struct Notifier {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Notifier {
    pub fn stderr() -> Notifier {
        Notifier::with_sink(Box::new(io::stderr()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Notifier {
        Notifier {
            sink: Mutex::new(sink),
        }
    }

    /// Emit one warn-level notification record.
    pub fn warn<P: Serialize>(&self, payload: &P, process_name: &str, user: &str, message: &str) {
        let record = Record {
            level: "warn",
            payload,
            process_name,
            user,
            message,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode notification");
                return;
            }
        };
        let mut sink = self.sink.lock();
        if let Err(e) = writeln!(sink, "{line}") {
            tracing::error!(error = %e, "failed to write notification");
        }
    }
}
