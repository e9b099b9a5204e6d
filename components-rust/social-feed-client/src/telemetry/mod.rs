//! Structured observability handed to every store and component.
//!
//! Components describe what happened as an [`Event`]; where it ends up is
//! decided by the [`Telemetry`] implementation they were constructed with.

use crate::common::sync::lock;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

pub use log::Level;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub domain: &'static str,
    pub name: &'static str,
    pub level: Level,
    pub fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(domain: &'static str, name: &'static str) -> Self {
        Event {
            domain,
            name,
            level: Level::Debug,
            fields: Vec::new(),
        }
    }

    pub fn info(domain: &'static str, name: &'static str) -> Self {
        Event::new(domain, name).level(Level::Info)
    }

    pub fn warn(domain: &'static str, name: &'static str) -> Self {
        Event::new(domain, name).level(Level::Warn)
    }

    pub fn error(domain: &'static str, name: &'static str) -> Self {
        Event::new(domain, name).level(Level::Error)
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn field(mut self, key: &'static str, value: impl Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.domain, self.name)?;
        for (key, value) in self.fields.iter() {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

pub trait Telemetry: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn record(&self, event: Event) {
        log::log!(
            target: "social_feed_client",
            event.level,
            domain = event.domain,
            event = event.name;
            "{event}"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<Event>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn named(&self, domain: &str, name: &str) -> Vec<Event> {
        lock(&self.events)
            .iter()
            .filter(|e| e.domain == domain && e.name == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, domain: &str, name: &str) -> usize {
        self.named(domain, name).len()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_keeps_fields() {
        let telemetry = RecordingTelemetry::new();
        telemetry.record(Event::warn("posts", "like.toggled").field("post_id", "p1"));
        telemetry.record(Event::new("posts", "fetch.started"));

        let toggled = telemetry.named("posts", "like.toggled");
        assert_eq!(toggled.len(), 1);
        assert_eq!(toggled[0].get("post_id"), Some("p1"));
        assert_eq!(toggled[0].level, Level::Warn);
        assert_eq!(toggled[0].to_string(), "[posts] like.toggled post_id=p1");
        assert_eq!(telemetry.count("posts", "fetch.started"), 1);
    }
}
