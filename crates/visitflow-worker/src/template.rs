use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::{Captures, Regex};

use visitflow_core::types::Job;

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok())
        .as_ref()
}

/// Placeholder substitution for one job.
///
/// Known placeholders with no value render empty. Unknown placeholders are
/// left untouched. The timestamp is fixed at construction so every field of
/// one action sees the same value.
pub struct Template<'a> {
    job: &'a Job,
    timestamp: String,
}

impl<'a> Template<'a> {
    pub fn new(job: &'a Job) -> Self {
        Self {
            job,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn render(&self, text: &str) -> String {
        let Some(re) = placeholder() else {
            return text.to_string();
        };
        re.replace_all(text, |caps: &Captures<'_>| {
            self.resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "visitorId" => return Some(self.job.visitor_id.clone()),
            "siteId" => return Some(self.job.site_id.clone()),
            "timestamp" => return Some(self.timestamp.clone()),
            _ => {}
        }
        if let Some(field) = name.strip_prefix("user.") {
            return Some(
                self.job
                    .identified_user
                    .as_ref()
                    .and_then(|u| u.field(field))
                    .unwrap_or_default(),
            );
        }
        if let Some(key) = name.strip_prefix("localStorage.") {
            return Some(self.job.local_storage.get(key).cloned().unwrap_or_default());
        }
        None
    }
}
