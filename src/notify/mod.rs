//! Fall event fan-out.
//!
//! The core only emits the payload. Each sink decides how (and whether) it is
//! delivered; failures are logged and never retried here.

mod mqtt;

pub use mqtt::{MqttSettings, MqttSink};

use anyhow::Result;
use std::sync::Mutex;

use crate::fall::FallEvent;

/// Destination for fall events.
pub trait FallEventSink: Send {
    /// Sink identifier for logs.
    fn name(&self) -> &'static str;

    /// Hand one event to the transport. Must not block for long: it runs on
    /// the pipeline thread or an HTTP handler.
    fn deliver(&mut self, event: &FallEvent) -> Result<()>;
}

/// Writes fall events to the log at `warn` level.
#[derive(Default)]
pub struct LogSink;

impl FallEventSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&mut self, event: &FallEvent) -> Result<()> {
        log::warn!(
            "fall event: {} (angle={:?}, simulated={}, at_ms={})",
            event.message,
            event.angle_degrees,
            event.simulated,
            event.detected_at_ms
        );
        Ok(())
    }
}

/// Shared fan-out used by the pipeline and the control surface.
pub struct FallNotifier {
    sinks: Mutex<Vec<Box<dyn FallEventSink>>>,
}

impl FallNotifier {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sink<S: FallEventSink + 'static>(self, sink: S) -> Self {
        self.add_sink(Box::new(sink));
        self
    }

    pub fn add_sink(&self, sink: Box<dyn FallEventSink>) {
        match self.sinks.lock() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Deliver to every sink; returns how many accepted the event.
    pub fn emit(&self, event: &FallEvent) -> usize {
        let mut sinks = match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut delivered = 0;
        for sink in sinks.iter_mut() {
            match sink.deliver(event) {
                Ok(()) => delivered += 1,
                Err(err) => log::warn!("fall event sink '{}' failed: {:#}", sink.name(), err),
            }
        }
        delivered
    }
}

impl Default for FallNotifier {
    fn default() -> Self {
        Self::new()
    }
}
