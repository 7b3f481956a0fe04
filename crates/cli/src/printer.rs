//! Console handler: one line per notification, human or JSON.

use std::io::Write;

use chrono::{Local, SecondsFormat};
use clap::ValueEnum;
use podwatch_core::{DeletedObject, PodObject, ResourceEventHandler};
use serde::Serialize;
use tracing::warn;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

pub enum Event<'a> {
    Added(&'a PodObject),
    Updated(&'a PodObject),
    Deleted(&'a DeletedObject),
}

#[derive(Serialize)]
struct JsonLine<'a> {
    time: &'a str,
    event: &'static str,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    object: Option<&'a PodObject>,
}

pub fn render(output: Output, time: &str, ev: &Event<'_>) -> String {
    match output {
        Output::Human => match ev {
            Event::Added(p) => format!("{} - ADDED: {} (IP:{})", time, p.key, p.ip),
            Event::Updated(p) => format!("{} - UPDATED: {} (phase={})", time, p.key, p.phase),
            Event::Deleted(d) if d.is_tombstone() => format!("{} - DELETED (tombstone): {}", time, d.key()),
            Event::Deleted(d) => format!("{} - DELETED: {}", time, d.key()),
        },
        Output::Json => {
            let line = match ev {
                Event::Added(p) => JsonLine { time, event: "added", key: p.key.to_string(), object: Some(p) },
                Event::Updated(p) => JsonLine { time, event: "updated", key: p.key.to_string(), object: Some(p) },
                Event::Deleted(d) => JsonLine {
                    time,
                    event: if d.is_tombstone() { "deleted_tombstone" } else { "deleted" },
                    key: d.key().to_string(),
                    object: d.object(),
                },
            };
            serde_json::to_string(&line).unwrap_or_else(|e| {
                warn!(error = %e, "failed to encode event line");
                String::new()
            })
        }
    }
}

#[derive(Debug)]
pub struct PrintHandler {
    output: Output,
}

impl PrintHandler {
    pub fn new(output: Output) -> Self { Self { output } }

    fn emit(&self, ev: Event<'_>) {
        let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = render(self.output, &now, &ev);
        if line.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", line) {
            warn!(error = %e, "stdout write failed");
        }
    }
}

impl ResourceEventHandler for PrintHandler {
    fn on_add(&self, obj: &PodObject) { self.emit(Event::Added(obj)) }

    fn on_update(&self, _old: Option<&PodObject>, new: &PodObject) { self.emit(Event::Updated(new)) }

    fn on_delete(&self, obj: &DeletedObject) { self.emit(Event::Deleted(obj)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_core::{ResourceKey, ResourceVersion};

    const TS: &str = "2024-05-01T12:00:00+02:00";

    fn pod() -> PodObject {
        PodObject {
            key: ResourceKey::new("default", "web-0"),
            uid: "u1".into(),
            version: ResourceVersion(7),
            ip: "10.1.2.3".into(),
            phase: "Pending".into(),
            node: None,
        }
    }

    #[test]
    fn human_lines() {
        let p = pod();
        assert_eq!(render(Output::Human, TS, &Event::Added(&p)), format!("{TS} - ADDED: default/web-0 (IP:10.1.2.3)"));
        assert_eq!(render(Output::Human, TS, &Event::Updated(&p)), format!("{TS} - UPDATED: default/web-0 (phase=Pending)"));
        let known = DeletedObject::Known(p.clone());
        assert_eq!(render(Output::Human, TS, &Event::Deleted(&known)), format!("{TS} - DELETED: default/web-0"));
        let tomb = DeletedObject::Tombstone { key: p.key.clone(), last_known: None };
        assert_eq!(render(Output::Human, TS, &Event::Deleted(&tomb)), format!("{TS} - DELETED (tombstone): default/web-0"));
    }

    #[test]
    fn json_tombstone_without_object() {
        let tomb = DeletedObject::Tombstone { key: ResourceKey::new("kube-system", "dns"), last_known: None };
        let v: serde_json::Value = serde_json::from_str(&render(Output::Json, TS, &Event::Deleted(&tomb))).unwrap();
        assert_eq!(v["event"], "deleted_tombstone");
        assert_eq!(v["key"], "kube-system/dns");
        assert!(v.get("object").is_none());
    }

    #[test]
    fn json_added_carries_object() {
        let p = pod();
        let v: serde_json::Value = serde_json::from_str(&render(Output::Json, TS, &Event::Added(&p))).unwrap();
        assert_eq!(v["event"], "added");
        assert_eq!(v["object"]["ip"], "10.1.2.3");
        assert_eq!(v["time"], TS);
    }
}
