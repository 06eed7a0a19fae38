//! Typed node settings.
//!
//! Workflow editors store node settings as free-form JSON keyed by node
//! title. `NodeSpec::parse` turns that JSON into a typed variant once, when a
//! workflow is loaded, so malformed settings are rejected before any run
//! starts. Numeric settings are accepted either as JSON numbers or numeric
//! strings, since editors emit both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, VisitflowError};
use crate::types::NodeKind;

/// Upper bound on operations in one custom-code action.
pub const MAX_CODE_OPERATIONS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
    StartsWith,
    EndsWith,
}

impl MatchMode {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("exact") => Self::Exact,
            Some("startsWith") => Self::StartsWith,
            Some("endsWith") => Self::EndsWith,
            _ => Self::Contains,
        }
    }

    pub fn matches(&self, haystack: &str, needle: &str) -> bool {
        match self {
            Self::Exact => haystack == needle,
            Self::Contains => haystack.contains(needle),
            Self::StartsWith => haystack.starts_with(needle),
            Self::EndsWith => haystack.ends_with(needle),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFrequency {
    #[default]
    EveryTrigger,
    OncePerSession,
    OnceEver,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlMatch {
    pub url: Option<String>,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferrerMatch {
    pub referrer_url: Option<String>,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Exists,
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMatch {
    pub name: Option<String>,
    pub mode: QueryMode,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    /// Allowed weekdays, 0 = Sunday. Empty means every day.
    pub days: Vec<u32>,
}

/// Variant weights and optional custom edge labels for a Branch Split.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchWeights {
    pub weights: Vec<u32>,
    pub labels: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunnelTrigger {
    pub funnel_id: Option<String>,
    pub event_type: Option<String>,
    pub step_index: Option<u32>,
    pub time_threshold_minutes: Option<u64>,
    pub segments: Vec<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

/// Best-effort action rendered by the page; only its success is observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LocalAction {
    ShowModal {
        title: Option<String>,
        content: Option<String>,
        custom_html: Option<String>,
    },
    ShowBanner {
        content: Option<String>,
        position: String,
        custom_html: Option<String>,
    },
    InsertSection {
        selector: String,
        position: String,
    },
    RedirectUrl {
        url: String,
    },
    TrackEvent {
        event_name: String,
    },
    ShowNotification {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailSettings {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// One declarative custom-code operation. String arguments are templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CodeOp {
    AddTag { tag: String },
    RemoveTag { tag: String },
    Log { message: String },
    Fail { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomCode {
    pub operations: Vec<CodeOp>,
    /// A free-form script was supplied; it is never executed.
    pub legacy_script: bool,
}

/// Maps a page localStorage key into a job payload key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapping {
    pub local_storage_key: String,
    pub payload_key: String,
}

/// Typed interpretation of a node, selected by kind and title.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    // Triggers
    PageView(UrlMatch),
    TimeSpent { seconds: u64 },
    ScrollDepth { percent: u32 },
    ExitIntent,
    ElementClick { selector: String },
    Inactivity { seconds: u64 },
    CustomEvent { event_name: String },
    Funnel(FunnelTrigger),

    // Conditions
    UrlPath(UrlMatch),
    DeviceType { device: Option<String> },
    Browser { browser: Option<String> },
    TrafficSource(ReferrerMatch),
    NewVsReturning { visitor_type: Option<String> },
    AbSplit { percent: u32 },
    BranchSplit(BranchWeights),
    TimeWindow(TimeWindow),
    QueryParam(QueryMatch),
    Tag { tag_name: Option<String> },
    Join { timeout_secs: u64 },
    FrequencyCap { cooldown_secs: Option<u64> },

    // Actions
    Local(LocalAction),
    Wait { seconds: u64 },
    SendEmail(EmailSettings),
    Webhook(WebhookSettings),
    AddTag { tag_name: String },
    RemoveTag { tag_name: String },
    CustomCode(CustomCode),

    /// Title this build does not know; passes through permissively.
    Unknown { kind: NodeKind, title: String },
}

/// Read-only accessor over a settings object.
struct Settings<'a>(&'a Value);

impl<'a> Settings<'a> {
    fn str(&self, key: &str) -> Option<&'a str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.str(key).map(str::to_string)
    }

    fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn u64(&self, key: &str) -> Option<u64> {
        self.f64(key).filter(|v| *v >= 0.0).map(|v| v as u64)
    }

    fn percent(&self, key: &str, default: u32) -> u32 {
        self.f64(key).map_or(default, |v| v.clamp(0.0, 100.0) as u32)
    }
}

impl NodeSpec {
    /// Interpret a node's settings, rejecting values no run could use.
    pub fn parse(kind: NodeKind, title: &str, settings: &Value) -> Result<Self> {
        let s = Settings(settings);
        let spec = match (kind, title) {
            (NodeKind::Trigger, "Page View") => Self::PageView(url_match(&s)),
            (NodeKind::Trigger, "Time Spent") => Self::TimeSpent {
                seconds: s.u64("seconds").unwrap_or(0),
            },
            (NodeKind::Trigger, "Scroll Depth") => Self::ScrollDepth {
                percent: s.percent("scrollDepth", 0),
            },
            (NodeKind::Trigger, "Exit Intent") => Self::ExitIntent,
            (NodeKind::Trigger, "Element Click") => Self::ElementClick {
                selector: require(&s, "selector", title)?,
            },
            (NodeKind::Trigger, "Inactivity") => Self::Inactivity {
                seconds: s.u64("inactivitySeconds").unwrap_or(30),
            },
            (NodeKind::Trigger, "Custom Event") => Self::CustomEvent {
                event_name: require(&s, "customEventName", title)?,
            },
            (NodeKind::Trigger, "Funnel") => Self::Funnel(FunnelTrigger {
                funnel_id: s.string("funnelId"),
                event_type: s.string("eventType"),
                step_index: s.u64("stepIndex").map(|v| v as u32),
                time_threshold_minutes: s.u64("timeThreshold").filter(|v| *v > 0),
                segments: s
                    .str("userSegment")
                    .map(|v| {
                        v.split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                min_value: s.f64("minValue").filter(|v| *v != 0.0),
                max_value: s.f64("maxValue").filter(|v| *v != 0.0),
            }),

            (NodeKind::Condition, "URL Path") => Self::UrlPath(url_match(&s)),
            (NodeKind::Condition, "Device Type") => Self::DeviceType {
                device: s.string("deviceType"),
            },
            (NodeKind::Condition, "Browser") => Self::Browser {
                browser: s.string("browser"),
            },
            (NodeKind::Condition, "Traffic Source") => Self::TrafficSource(ReferrerMatch {
                referrer_url: s.string("referrerUrl"),
                mode: MatchMode::parse(s.str("referrerMatchType")),
            }),
            (NodeKind::Condition, "New vs Returning") => Self::NewVsReturning {
                visitor_type: s.string("visitorType"),
            },
            (NodeKind::Condition, "A/B Split") => Self::AbSplit {
                percent: s.percent("variantAPercent", 50),
            },
            (NodeKind::Condition, "Branch Split") => Self::BranchSplit(branch_weights(&s)),
            (NodeKind::Condition, "Time Window") => Self::TimeWindow(time_window(settings, &s)?),
            (NodeKind::Condition, "Query Param") => Self::QueryParam(QueryMatch {
                name: s.string("queryParam"),
                mode: match s.str("queryMatchType") {
                    Some("exact") => QueryMode::Exact,
                    Some("contains") => QueryMode::Contains,
                    Some("startsWith") => QueryMode::StartsWith,
                    Some("endsWith") => QueryMode::EndsWith,
                    _ => QueryMode::Exists,
                },
                value: s.string("queryValue").unwrap_or_default(),
            }),
            (NodeKind::Condition, "Tag") => Self::Tag {
                tag_name: s.string("tagName"),
            },
            (NodeKind::Condition, "Join") => Self::Join {
                timeout_secs: s.u64("joinTimeoutSeconds").unwrap_or(0),
            },
            (NodeKind::Condition, "Frequency Cap") => Self::FrequencyCap {
                cooldown_secs: s.u64("cooldownSeconds").filter(|v| *v > 0),
            },

            (NodeKind::Action, "Show Modal") => Self::Local(LocalAction::ShowModal {
                title: s.string("modalTitle"),
                content: s.string("modalContent"),
                custom_html: s.string("customHtml"),
            }),
            (NodeKind::Action, "Show Banner") => Self::Local(LocalAction::ShowBanner {
                content: s.string("bannerContent"),
                position: s.string("bannerPosition").unwrap_or_else(|| "top".into()),
                custom_html: s.string("customHtml"),
            }),
            (NodeKind::Action, "Insert Section") => Self::Local(LocalAction::InsertSection {
                selector: require(&s, "selector", title)?,
                position: s.string("insertPosition").unwrap_or_else(|| "append".into()),
            }),
            (NodeKind::Action, "Redirect URL") => Self::Local(LocalAction::RedirectUrl {
                url: require(&s, "redirectUrl", title)?,
            }),
            (NodeKind::Action, "Track Event") => Self::Local(LocalAction::TrackEvent {
                event_name: require(&s, "eventName", title)?,
            }),
            (NodeKind::Action, "Show Notification") => {
                Self::Local(LocalAction::ShowNotification {
                    message: s.string("notificationMessage").unwrap_or_default(),
                })
            }
            (NodeKind::Action, "Wait") => Self::Wait {
                seconds: s.u64("waitSeconds").unwrap_or(0),
            },
            (NodeKind::Action, "Send Email") => {
                let to = require(&s, "emailTo", title)?;
                if !to.contains('@') && !to.contains("{{") {
                    return Err(VisitflowError::Validation(format!(
                        "Send Email: invalid recipient '{}'",
                        to
                    )));
                }
                Self::SendEmail(EmailSettings {
                    to,
                    subject: s.string("emailSubject").unwrap_or_default(),
                    body: s.string("emailBody").unwrap_or_default(),
                })
            }
            (NodeKind::Action, "Webhook") => Self::Webhook(webhook(settings, &s)?),
            (NodeKind::Action, "Add Tag") => Self::AddTag {
                tag_name: require(&s, "tagName", title)?,
            },
            (NodeKind::Action, "Remove Tag") => Self::RemoveTag {
                tag_name: require(&s, "tagName", title)?,
            },
            (NodeKind::Action, "Custom Code") => Self::CustomCode(custom_code(settings, &s)?),

            (kind, title) => {
                debug!(%kind, title, "Unknown node title, passing through");
                Self::Unknown {
                    kind,
                    title: title.to_string(),
                }
            }
        };
        Ok(spec)
    }

    /// Actions executed by the server worker rather than the page.
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            Self::SendEmail(_)
                | Self::Webhook(_)
                | Self::AddTag { .. }
                | Self::RemoveTag { .. }
                | Self::CustomCode(_)
        )
    }
}

/// Repeat policy of an action node. Absent or unrecognized means every trigger.
pub fn action_frequency(settings: &Value) -> ActionFrequency {
    match Settings(settings).str("frequency") {
        Some("once_per_session") => ActionFrequency::OncePerSession,
        Some("once_ever") => ActionFrequency::OnceEver,
        _ => ActionFrequency::EveryTrigger,
    }
}

/// localStorage keys an authoritative action forwards to the worker.
pub fn storage_mappings(settings: &Value) -> Vec<StorageMapping> {
    settings
        .get("localStorageData")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn require(s: &Settings<'_>, key: &str, title: &str) -> Result<String> {
    s.string(key)
        .ok_or_else(|| VisitflowError::Validation(format!("{}: '{}' is required", title, key)))
}

fn url_match(s: &Settings<'_>) -> UrlMatch {
    UrlMatch {
        url: s.string("url"),
        mode: MatchMode::parse(s.str("urlMatchType")),
    }
}

fn branch_weights(s: &Settings<'_>) -> BranchWeights {
    let three = s.u64("variantsCount") == Some(3);
    let mut weights = vec![
        s.percent("variantAPercent", 50),
        s.percent("variantBPercent", 50),
    ];
    let mut labels = vec![s.string("variantALabel"), s.string("variantBLabel")];
    if three {
        weights.push(s.percent("variantCPercent", 0));
        labels.push(s.string("variantCLabel"));
    }
    BranchWeights { weights, labels }
}

fn time_window(raw: &Value, s: &Settings<'_>) -> Result<TimeWindow> {
    let start_hour = s.u64("startHour").unwrap_or(0) as u32;
    let end_hour = s.u64("endHour").unwrap_or(23) as u32;
    if start_hour > 23 || end_hour > 23 {
        return Err(VisitflowError::Validation(format!(
            "Time Window: hours must be 0-23 (got {}-{})",
            start_hour, end_hour
        )));
    }
    let days = raw
        .get("daysOfWeek")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .filter(|d| *d <= 6)
                .map(|d| d as u32)
                .collect()
        })
        .unwrap_or_default();
    Ok(TimeWindow {
        start_hour,
        end_hour,
        days,
    })
}

fn webhook(raw: &Value, s: &Settings<'_>) -> Result<WebhookSettings> {
    let url = require(s, "webhookUrl", "Webhook")?;
    let valid = ["http://", "https://"]
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme));
    if !valid {
        return Err(VisitflowError::Validation(format!(
            "Webhook: invalid URL '{}'",
            url
        )));
    }
    let headers = raw
        .get("webhookHeaders")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(WebhookSettings {
        url,
        method: s
            .string("webhookMethod")
            .unwrap_or_else(|| "POST".into())
            .to_uppercase(),
        headers,
        body: s.string("webhookBody"),
    })
}

fn custom_code(raw: &Value, s: &Settings<'_>) -> Result<CustomCode> {
    let operations: Vec<CodeOp> = match raw.get("operations") {
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            VisitflowError::Validation(format!("Custom Code: invalid operations: {}", e))
        })?,
        None => Vec::new(),
    };
    if operations.len() > MAX_CODE_OPERATIONS {
        return Err(VisitflowError::Validation(format!(
            "Custom Code: at most {} operations allowed",
            MAX_CODE_OPERATIONS
        )));
    }
    let legacy_script = s.str("customCode").is_some();
    if operations.is_empty() && !legacy_script {
        return Err(VisitflowError::Validation(
            "Custom Code: 'operations' is required".into(),
        ));
    }
    Ok(CustomCode {
        operations,
        legacy_script,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(title: &str, settings: Value) -> Result<NodeSpec> {
        NodeSpec::parse(NodeKind::Action, title, &settings)
    }

    #[test]
    fn test_email_requires_recipient() {
        assert!(action("Send Email", json!({})).is_err());
        assert!(action("Send Email", json!({"emailTo": "  "})).is_err());
        assert!(action("Send Email", json!({"emailTo": "not-an-address"})).is_err());
        let spec = action(
            "Send Email",
            json!({"emailTo": "{{user.email}}", "emailSubject": "Hi"}),
        )
        .unwrap();
        assert!(matches!(spec, NodeSpec::SendEmail(ref e) if e.subject == "Hi"));
        assert!(spec.is_authoritative());
    }

    #[test]
    fn test_webhook_url_validation() {
        assert!(action("Webhook", json!({"webhookUrl": "ftp://x"})).is_err());
        assert!(action("Webhook", json!({"webhookUrl": "https://"})).is_err());
        let spec = action(
            "Webhook",
            json!({
                "webhookUrl": "https://hooks.example.com/in",
                "webhookMethod": "put",
                "webhookHeaders": {"X-Token": "{{visitorId}}", "Bad": 3}
            }),
        )
        .unwrap();
        let NodeSpec::Webhook(w) = spec else {
            panic!("expected webhook")
        };
        assert_eq!(w.method, "PUT");
        assert_eq!(w.headers.len(), 1);
    }

    #[test]
    fn test_tag_actions_require_name() {
        assert!(action("Add Tag", json!({})).is_err());
        assert!(action("Remove Tag", json!({"tagName": ""})).is_err());
        assert_eq!(
            action("Add Tag", json!({"tagName": "vip"})).unwrap(),
            NodeSpec::AddTag {
                tag_name: "vip".into()
            }
        );
    }

    #[test]
    fn test_custom_code_operations() {
        let spec = action(
            "Custom Code",
            json!({"operations": [{"op": "add_tag", "tag": "x"}, {"op": "log", "message": "hi"}]}),
        )
        .unwrap();
        let NodeSpec::CustomCode(code) = spec else {
            panic!("expected custom code")
        };
        assert_eq!(code.operations.len(), 2);
        assert!(!code.legacy_script);

        let legacy = action("Custom Code", json!({"customCode": "alert(1)"})).unwrap();
        assert!(matches!(legacy, NodeSpec::CustomCode(ref c) if c.legacy_script));

        assert!(action("Custom Code", json!({})).is_err());
        assert!(action("Custom Code", json!({"operations": [{"op": "eval"}]})).is_err());
    }

    #[test]
    fn test_unknown_titles_pass_through() {
        let spec = action("Launch Rocket", json!({})).unwrap();
        assert!(matches!(spec, NodeSpec::Unknown { .. }));
        assert!(!spec.is_authoritative());
    }

    #[test]
    fn test_branch_split_defaults_and_clamping() {
        let spec = NodeSpec::parse(
            NodeKind::Condition,
            "Branch Split",
            &json!({"variantAPercent": "70", "variantBPercent": 250}),
        )
        .unwrap();
        let NodeSpec::BranchSplit(b) = spec else {
            panic!("expected branch split")
        };
        assert_eq!(b.weights, vec![70, 100]);

        let spec = NodeSpec::parse(
            NodeKind::Condition,
            "Branch Split",
            &json!({"variantsCount": 3, "variantCPercent": 20, "variantCLabel": "Gamma"}),
        )
        .unwrap();
        let NodeSpec::BranchSplit(b) = spec else {
            panic!("expected branch split")
        };
        assert_eq!(b.weights, vec![50, 50, 20]);
        assert_eq!(b.labels[2].as_deref(), Some("Gamma"));
    }

    #[test]
    fn test_time_window_validation() {
        assert!(
            NodeSpec::parse(NodeKind::Condition, "Time Window", &json!({"startHour": 25})).is_err()
        );
        let spec = NodeSpec::parse(
            NodeKind::Condition,
            "Time Window",
            &json!({"startHour": 22, "endHour": 2, "daysOfWeek": [0, 6, 9]}),
        )
        .unwrap();
        assert_eq!(
            spec,
            NodeSpec::TimeWindow(TimeWindow {
                start_hour: 22,
                end_hour: 2,
                days: vec![0, 6]
            })
        );
    }

    #[test]
    fn test_frequency_and_mappings() {
        assert_eq!(
            action_frequency(&json!({"frequency": "once_ever"})),
            ActionFrequency::OnceEver
        );
        assert_eq!(action_frequency(&json!({})), ActionFrequency::EveryTrigger);
        let maps = storage_mappings(&json!({
            "localStorageData": [{"localStorageKey": "cart", "payloadKey": "cartId"}]
        }));
        assert_eq!(maps[0].payload_key, "cartId");
    }

    #[test]
    fn test_frequency_cap_zero_means_default() {
        let spec = NodeSpec::parse(
            NodeKind::Condition,
            "Frequency Cap",
            &json!({"cooldownSeconds": 0}),
        )
        .unwrap();
        assert_eq!(spec, NodeSpec::FrequencyCap { cooldown_secs: None });
    }
}
