//! Core domain model for the deal crawl pipeline: merchants, connectors and
//! their health state machine, crawl runs, extracted candidates and deals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealcrawl-core";

/// Consecutive failures after which a connector is parked in `error`.
pub const FAIL_THRESHOLD: i32 = 4;

/// Days an expired deal stays visible as `expired` before the sweeper hides it.
pub const HIDE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} status `{value}`")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum!(ConnectorStatus, "connector", {
    Active => "active",
    Error => "error",
    Disabled => "disabled",
    Running => "running",
});

status_enum!(RunStatus, "run", {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

status_enum!(RunTrigger, "trigger", {
    Scheduled => "scheduled",
    Manual => "manual",
});

status_enum!(DealStatus, "deal", {
    Pending => "pending",
    Active => "active",
    Expired => "expired",
    Hidden => "hidden",
});

/// Merchant owning connectors and deals.
///
/// `active_deal_count` is a cache refreshed by the lifecycle sweeper; it may
/// lag behind the deals table between sweeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    pub name: String,
    pub active_deal_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl Merchant {
    pub fn new(id: Uuid, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            active_deal_count: 0,
            updated_at: now,
        }
    }
}

/// Recurring crawl target bound to one merchant and one source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub source_url: String,
    pub extraction_config: serde_json::Value,
    pub status: ConnectorStatus,
    pub fail_count: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Run-claim lease. Set while a run owns the connector.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Health columns written back after a run finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub status: ConnectorStatus,
    pub fail_count: i32,
    pub last_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Connector {
    pub fn new(
        merchant_id: Uuid,
        name: impl Into<String>,
        source_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            merchant_id,
            name: name.into(),
            source_url: source_url.into(),
            extraction_config: serde_json::Value::Object(Default::default()),
            status: ConnectorStatus::Active,
            fail_count: 0,
            last_run_at: None,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for the scheduled sweep.
    pub fn is_schedulable(&self) -> bool {
        self.status == ConnectorStatus::Active
    }

    /// Eligible for an operator-triggered run.
    pub fn is_runnable(&self) -> bool {
        self.status != ConnectorStatus::Disabled
    }

    /// Status shown to the admin surface: `running` while a claim is held.
    pub fn display_status(&self) -> ConnectorStatus {
        match (self.status, self.claimed_at) {
            (ConnectorStatus::Disabled, _) => ConnectorStatus::Disabled,
            (_, Some(_)) => ConnectorStatus::Running,
            (status, None) => status,
        }
    }

    pub fn health_after_success(&self, at: DateTime<Utc>) -> HealthTransition {
        let status = match self.status {
            ConnectorStatus::Disabled => ConnectorStatus::Disabled,
            _ => ConnectorStatus::Active,
        };
        HealthTransition {
            status,
            fail_count: 0,
            last_run_at: at,
            last_error: None,
        }
    }

    pub fn health_after_failure(&self, at: DateTime<Utc>, message: &str) -> HealthTransition {
        let fail_count = self.fail_count.saturating_add(1);
        let status = match self.status {
            ConnectorStatus::Disabled => ConnectorStatus::Disabled,
            _ if fail_count >= FAIL_THRESHOLD => ConnectorStatus::Error,
            // `running` is a display marker, never a resting health state.
            ConnectorStatus::Running => ConnectorStatus::Active,
            other => other,
        };
        HealthTransition {
            status,
            fail_count,
            last_run_at: at,
            last_error: Some(message.to_string()),
        }
    }

    /// Applies a transition and releases the run claim.
    pub fn apply_health(&mut self, transition: &HealthTransition) {
        self.status = transition.status;
        self.fail_count = transition.fail_count;
        self.last_run_at = Some(transition.last_run_at);
        self.last_error = transition.last_error.clone();
        self.claimed_at = None;
        self.updated_at = transition.last_run_at;
    }
}

/// Audit row for one crawl attempt of one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: Uuid,
    pub connector_id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub new_count: i32,
    pub updated_count: i32,
    pub skipped_count: i32,
    pub tokens_used: i64,
    pub error_message: Option<String>,
}

impl CrawlRun {
    pub fn start(connector_id: Uuid, trigger: RunTrigger, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector_id,
            trigger,
            status: RunStatus::Running,
            started_at: at,
            completed_at: None,
            new_count: 0,
            updated_count: 0,
            skipped_count: 0,
            tokens_used: 0,
            error_message: None,
        }
    }

    pub fn apply_completion(&mut self, completion: &RunCompletion, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        match completion {
            RunCompletion::Success {
                new_count,
                updated_count,
                skipped_count,
                tokens_used,
            } => {
                self.status = RunStatus::Success;
                self.new_count = *new_count;
                self.updated_count = *updated_count;
                self.skipped_count = *skipped_count;
                self.tokens_used = *tokens_used;
            }
            RunCompletion::Failed { error_message } => {
                self.status = RunStatus::Failed;
                self.error_message = Some(error_message.clone());
            }
        }
    }
}

/// Terminal state written exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCompletion {
    Success {
        new_count: i32,
        updated_count: i32,
        skipped_count: i32,
        tokens_used: i64,
    },
    Failed {
        error_message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("malformed candidate: {0}")]
    Malformed(String),
    #[error("candidate has no title")]
    MissingTitle,
    #[error("candidate has no landing url")]
    MissingLandingUrl,
    #[error("invalid landing url `{url}`: {reason}")]
    InvalidLandingUrl { url: String, reason: String },
    #[error("negative {field}: {value}")]
    NegativePrice { field: &'static str, value: Decimal },
    #[error("validity window ends ({ends_at}) before it starts ({starts_at})")]
    InvertedWindow {
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },
}

/// Deal extracted by the adapter, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealCandidate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub benefit_summary: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub original_price: Option<Decimal>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_evergreen: bool,
    #[serde(default)]
    pub landing_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl DealCandidate {
    pub fn new(title: impl Into<String>, landing_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            benefit_summary: None,
            coupon_code: None,
            price: None,
            original_price: None,
            starts_at: None,
            ends_at: None,
            is_evergreen: false,
            landing_url: landing_url.into(),
            image_url: None,
        }
    }

    /// Checks the fields the reconciler relies on and returns the parsed landing URL.
    pub fn validate(&self) -> Result<Url, CandidateError> {
        if self.title.trim().is_empty() {
            return Err(CandidateError::MissingTitle);
        }
        let raw_url = self.landing_url.trim();
        if raw_url.is_empty() {
            return Err(CandidateError::MissingLandingUrl);
        }
        let url = Url::parse(raw_url).map_err(|e| CandidateError::InvalidLandingUrl {
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(CandidateError::InvalidLandingUrl {
                url: raw_url.to_string(),
                reason: "expected an absolute http(s) url".to_string(),
            });
        }
        for (field, value) in [("price", self.price), ("original price", self.original_price)] {
            if let Some(value) = value {
                if value.is_sign_negative() && !value.is_zero() {
                    return Err(CandidateError::NegativePrice { field, value });
                }
            }
        }
        if let (Some(starts_at), Some(ends_at)) = (self.starts_at, self.ends_at) {
            if ends_at < starts_at {
                return Err(CandidateError::InvertedWindow { starts_at, ends_at });
            }
        }
        Ok(url)
    }
}

/// One element of an extraction's candidate list.
///
/// Elements are decoded one at a time, so a wrongly typed field rejects only
/// the element it sits in.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedCandidate {
    Parsed(DealCandidate),
    Malformed {
        title: Option<String>,
        message: String,
    },
}

impl ExtractedCandidate {
    pub fn title(&self) -> Option<&str> {
        match self {
            ExtractedCandidate::Parsed(candidate) => Some(candidate.title.as_str()),
            ExtractedCandidate::Malformed { title, .. } => title.as_deref(),
        }
    }

    pub fn parsed(&self) -> Result<&DealCandidate, CandidateError> {
        match self {
            ExtractedCandidate::Parsed(candidate) => Ok(candidate),
            ExtractedCandidate::Malformed { message, .. } => {
                Err(CandidateError::Malformed(message.clone()))
            }
        }
    }
}

impl From<DealCandidate> for ExtractedCandidate {
    fn from(candidate: DealCandidate) -> Self {
        ExtractedCandidate::Parsed(candidate)
    }
}

impl<'de> Deserialize<'de> for ExtractedCandidate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(match serde_json::from_value::<DealCandidate>(value) {
            Ok(candidate) => ExtractedCandidate::Parsed(candidate),
            Err(err) => ExtractedCandidate::Malformed {
                title,
                message: err.to_string(),
            },
        })
    }
}

/// Persisted deal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub merchant_id: Uuid,
    /// Connector that produced the deal; `None` for manually created deals.
    pub connector_id: Option<Uuid>,
    pub natural_key: String,
    pub slug: String,
    pub title: String,
    pub benefit_summary: Option<String>,
    pub coupon_code: Option<String>,
    pub price: Option<Decimal>,
    pub original_price: Option<Decimal>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_evergreen: bool,
    pub landing_url: String,
    pub image_url: Option<String>,
    pub status: DealStatus,
    pub expired_at: Option<DateTime<Utc>>,
    pub view_count: i64,
    pub click_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn from_candidate(
        merchant_id: Uuid,
        connector_id: Option<Uuid>,
        natural_key: impl Into<String>,
        candidate: &DealCandidate,
        status: DealStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let natural_key = natural_key.into();
        let slug = deal_slug(&candidate.title, &natural_key);
        Self {
            id: Uuid::new_v4(),
            merchant_id,
            connector_id,
            natural_key,
            slug,
            title: candidate.title.trim().to_string(),
            benefit_summary: candidate.benefit_summary.clone(),
            coupon_code: candidate.coupon_code.clone(),
            price: candidate.price,
            original_price: candidate.original_price,
            starts_at: candidate.starts_at,
            ends_at: candidate.ends_at,
            is_evergreen: candidate.is_evergreen,
            landing_url: candidate.landing_url.trim().to_string(),
            image_url: candidate.image_url.clone(),
            status,
            expired_at: None,
            view_count: 0,
            click_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Tracked fields whose value differs from the candidate.
    pub fn changed_fields(&self, candidate: &DealCandidate) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.title != candidate.title.trim() {
            changed.push("title");
        }
        if self.benefit_summary != candidate.benefit_summary {
            changed.push("benefit_summary");
        }
        if self.coupon_code != candidate.coupon_code {
            changed.push("coupon_code");
        }
        if !decimal_eq(self.price, candidate.price) {
            changed.push("price");
        }
        if !decimal_eq(self.original_price, candidate.original_price) {
            changed.push("original_price");
        }
        if self.starts_at != candidate.starts_at {
            changed.push("starts_at");
        }
        if self.ends_at != candidate.ends_at {
            changed.push("ends_at");
        }
        if self.is_evergreen != candidate.is_evergreen {
            changed.push("is_evergreen");
        }
        if self.image_url != candidate.image_url {
            changed.push("image_url");
        }
        changed
    }

    /// Copies tracked candidate fields in place. Identity, slug, status,
    /// creation time and engagement counters are left alone.
    pub fn apply_candidate(&mut self, candidate: &DealCandidate, now: DateTime<Utc>) {
        self.title = candidate.title.trim().to_string();
        self.benefit_summary = candidate.benefit_summary.clone();
        self.coupon_code = candidate.coupon_code.clone();
        self.price = candidate.price;
        self.original_price = candidate.original_price;
        self.starts_at = candidate.starts_at;
        self.ends_at = candidate.ends_at;
        self.is_evergreen = candidate.is_evergreen;
        self.image_url = candidate.image_url.clone();
        self.updated_at = now;
    }
}

impl Deal {
    /// True when an `expired` or `hidden` deal shows up again as a live offer:
    /// evergreen, open-ended, or ending after `now`.
    pub fn relisted_by(&self, candidate: &DealCandidate, now: DateTime<Utc>) -> bool {
        matches!(self.status, DealStatus::Expired | DealStatus::Hidden)
            && (candidate.is_evergreen || candidate.ends_at.map_or(true, |ends_at| ends_at > now))
    }
}

// NUMERIC round-trips can change scale (`10.0` vs `10.00`); compare by value.
fn decimal_eq(a: Option<Decimal>, b: Option<Decimal>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.normalize() == b.normalize(),
        (None, None) => true,
        _ => false,
    }
}

/// URL-safe slug of `title`, suffixed with a stable fragment of the natural key.
pub fn deal_slug(title: &str, natural_key: &str) -> String {
    let base = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let suffix: String = natural_key.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    match (base.is_empty(), suffix.is_empty()) {
        (true, true) => "deal".to_string(),
        (true, false) => format!("deal-{suffix}"),
        (false, true) => base,
        (false, false) => format!("{base}-{suffix}"),
    }
}
