use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use visitflow_core::settings::{
    MatchMode, NodeSpec, QueryMatch, QueryMode, ReferrerMatch, TimeWindow, UrlMatch,
};
use visitflow_core::traits::{KeyValueStore, TagStore};
use visitflow_core::types::VisitorContext;

/// Evaluates Condition node predicates against a visitor context.
pub struct ConditionEvaluator {
    tags: Arc<dyn TagStore>,
    kv: Arc<dyn KeyValueStore>,
    tag_ttl_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct CachedTag {
    value: bool,
    cached_at_ms: i64,
}

impl ConditionEvaluator {
    pub fn new(tags: Arc<dyn TagStore>, kv: Arc<dyn KeyValueStore>, tag_ttl_secs: u64) -> Self {
        Self {
            tags,
            kv,
            tag_ttl_ms: (tag_ttl_secs as i64).saturating_mul(1000),
        }
    }

    pub async fn evaluate(&self, spec: &NodeSpec, ctx: &VisitorContext) -> bool {
        match spec {
            NodeSpec::UrlPath(m) => url_matches(m, &ctx.url),
            NodeSpec::DeviceType { device } => device.as_deref().map_or(false, |d| {
                let detected = if is_mobile(&ctx.user_agent) { "mobile" } else { "desktop" };
                d.eq_ignore_ascii_case(detected)
            }),
            NodeSpec::Browser { browser } => browser
                .as_deref()
                .map_or(false, |b| b.eq_ignore_ascii_case(detect_browser(&ctx.user_agent))),
            NodeSpec::TrafficSource(r) => referrer_matches(r, &ctx.referrer),
            NodeSpec::NewVsReturning { visitor_type } => {
                visitor_type.as_deref().map_or(false, |t| {
                    t.eq_ignore_ascii_case(if ctx.is_returning { "returning" } else { "new" })
                })
            }
            NodeSpec::AbSplit { percent } => rand::random::<f64>() * 100.0 < *percent as f64,
            NodeSpec::TimeWindow(tw) => time_window_allows(tw, &ctx.now),
            NodeSpec::QueryParam(q) => query_matches(q, &ctx.url),
            NodeSpec::Tag { tag_name } => match tag_name {
                Some(tag) => self.has_tag_cached(ctx, tag).await,
                None => false,
            },
            // Selection and gating happen elsewhere
            NodeSpec::BranchSplit(_) | NodeSpec::Join { .. } | NodeSpec::FrequencyCap { .. } => true,
            NodeSpec::Unknown { title, .. } => {
                debug!(title = %title, "Unknown condition, passing through");
                true
            }
            other => {
                debug!(spec = ?other, "Non-condition evaluated as condition");
                true
            }
        }
    }

    async fn has_tag_cached(&self, ctx: &VisitorContext, tag: &str) -> bool {
        let scope = ctx.session_scope();
        let key = format!("visitflow_tag_{}_{}_{}", ctx.site_id, ctx.visitor_id, tag);
        let now_ms = Utc::now().timestamp_millis();

        if let Ok(Some(raw)) = self.kv.get(&scope, &key).await {
            if let Ok(cached) = serde_json::from_str::<CachedTag>(&raw) {
                if now_ms - cached.cached_at_ms < self.tag_ttl_ms {
                    return cached.value;
                }
            }
        }

        match self.tags.has_tag(&ctx.site_id, &ctx.visitor_id, tag).await {
            Ok(value) => {
                let entry = CachedTag {
                    value,
                    cached_at_ms: now_ms,
                };
                if let Ok(json) = serde_json::to_string(&entry) {
                    if let Err(e) = self.kv.set(&scope, &key, &json).await {
                        debug!(error = %e, "Failed to cache tag lookup");
                    }
                }
                value
            }
            Err(e) => {
                warn!(tag, visitor_id = %ctx.visitor_id, error = %e, "Tag lookup failed");
                false
            }
        }
    }
}

/// Parse a page URL, accepting bare paths like `/pricing?x=1`.
fn parse_url(url: &str) -> Option<Url> {
    Url::parse(url)
        .ok()
        .or_else(|| Url::parse("http://localhost").ok()?.join(url).ok())
}

fn url_path(url: &str) -> String {
    parse_url(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|| url.to_string())
}

/// URL Path condition and Page View trigger filter. No target matches every page.
pub fn url_matches(m: &UrlMatch, url: &str) -> bool {
    let Some(target) = m.url.as_deref() else {
        return true;
    };
    let path = url_path(url);
    match m.mode {
        MatchMode::Exact => url == target || path == target,
        MatchMode::Contains => url.contains(target),
        MatchMode::StartsWith => path.starts_with(target),
        MatchMode::EndsWith => path.ends_with(target),
    }
}

/// With no filter, only direct (empty-referrer) traffic matches.
pub fn referrer_matches(r: &ReferrerMatch, referrer: &str) -> bool {
    match r.referrer_url.as_deref() {
        None => referrer.is_empty(),
        Some(_) if referrer.is_empty() => false,
        Some(target) => r.mode.matches(referrer, target),
    }
}

/// Coarse browser family from a user agent. Edge is checked before Chrome
/// because Edge user agents also contain "Chrome", and Chrome before Safari
/// for the same reason.
pub fn detect_browser(user_agent: &str) -> &'static str {
    if user_agent.contains("Edg") {
        "edge"
    } else if user_agent.contains("Chrome") {
        "chrome"
    } else if user_agent.contains("Firefox") {
        "firefox"
    } else if user_agent.contains("Safari") {
        "safari"
    } else {
        "other"
    }
}

pub fn is_mobile(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua.contains("mobi") || ua.contains("android")
}

/// Inclusive hour range, wrapping past midnight when start > end.
pub fn time_window_allows(tw: &TimeWindow, now: &DateTime<FixedOffset>) -> bool {
    let hour = now.hour();
    let hour_ok = if tw.start_hour <= tw.end_hour {
        hour >= tw.start_hour && hour <= tw.end_hour
    } else {
        hour >= tw.start_hour || hour <= tw.end_hour
    };
    let day_ok = tw.days.is_empty() || tw.days.contains(&now.weekday().num_days_from_sunday());
    hour_ok && day_ok
}

pub fn query_matches(q: &QueryMatch, url: &str) -> bool {
    let Some(name) = q.name.as_deref() else {
        return false;
    };
    let Some(parsed) = parse_url(url) else {
        return false;
    };
    let value = parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned());
    match (q.mode, value) {
        (QueryMode::Exists, v) => v.is_some(),
        (_, None) => false,
        (QueryMode::Exact, Some(v)) => v == q.value,
        (QueryMode::Contains, Some(v)) => v.contains(&q.value),
        (QueryMode::StartsWith, Some(v)) => v.starts_with(&q.value),
        (QueryMode::EndsWith, Some(v)) => v.ends_with(&q.value),
    }
}
