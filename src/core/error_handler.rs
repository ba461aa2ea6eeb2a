//! Centralized error classification with per-category cooldowns
//!
//! Every failure the bot sees is funnelled through [`ErrorHandler::record`].
//! The handler keeps a bounded ring log, tracks an `available ⇄ cooling-down`
//! state per category and caps outbound error notifications per hour.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::config::ErrorHandlerConfig;
use crate::core::events::{BotEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ApiTimeout,
    NetworkError,
    DataProcessingError,
    ExchangeError,
    OrderPlacementError,
    ConfigurationError,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::ApiTimeout,
        ErrorCategory::NetworkError,
        ErrorCategory::DataProcessingError,
        ErrorCategory::ExchangeError,
        ErrorCategory::OrderPlacementError,
        ErrorCategory::ConfigurationError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ApiTimeout => "api_timeout",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::DataProcessingError => "data_processing_error",
            ErrorCategory::ExchangeError => "exchange_error",
            ErrorCategory::OrderPlacementError => "order_placement_error",
            ErrorCategory::ConfigurationError => "configuration_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    fn notifies(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High | Severity::Medium)
    }
}

/// A failure as reported by a component, before it is logged
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: Option<String>,
}

impl ErrorReport {
    pub fn new(category: ErrorCategory, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub notified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    Available,
    CoolingDown { until: DateTime<Utc> },
}

/// What the caller learns from recording an error
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDisposition {
    pub record: ErrorRecord,
    /// The category was already cooling down when this error arrived
    pub repeated_during_cooldown: bool,
    pub notified: bool,
}

impl ErrorDisposition {
    /// Dependent actions should skip rather than retry
    pub fn should_skip(&self) -> bool {
        self.record.cooldown_until.is_some()
    }
}

#[derive(Debug, Default)]
struct CategoryTracker {
    cooldown_until: Option<DateTime<Utc>>,
    occurrences: u64,
    successes: u64,
    last_error_at: Option<DateTime<Utc>>,
    notifications: VecDeque<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct HandlerState {
    log: VecDeque<ErrorRecord>,
    categories: HashMap<ErrorCategory, CategoryTracker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub time_period_hours: i64,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub most_recent: Vec<ErrorRecord>,
}

#[derive(Debug)]
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    state: Mutex<HandlerState>,
    events: EventSink,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig, events: EventSink) -> Self {
        Self {
            config,
            state: Mutex::new(HandlerState::default()),
            events,
        }
    }

    pub fn record(&self, report: ErrorReport) -> ErrorDisposition {
        self.record_at(report, Utc::now())
    }

    pub fn record_at(&self, report: ErrorReport, now: DateTime<Utc>) -> ErrorDisposition {
        let cooldown = self.cooldown_for(report.category);
        let cap = self.notification_cap_for(report.category);

        let (record, repeated, snapshot) = {
            let mut state = self.state.lock();
            let tracker = state.categories.entry(report.category).or_default();

            let repeated = matches!(tracker.cooldown_until, Some(until) if until > now);
            if !repeated {
                tracker.cooldown_until = Some(now + cooldown);
            }
            tracker.occurrences += 1;
            tracker.last_error_at = Some(now);

            let notified = Self::should_notify(tracker, report.severity, cap, now);
            if notified {
                tracker.notifications.push_back(now);
            }

            let record = ErrorRecord {
                id: format!("{}_{}_{}", now.timestamp(), report.category.as_str(), uuid::Uuid::new_v4().simple()),
                category: report.category,
                severity: report.severity,
                message: report.message,
                context: report.context,
                timestamp: now,
                cooldown_until: tracker.cooldown_until,
                notified,
            };

            state.log.push_back(record.clone());
            while state.log.len() > self.config.max_log_size {
                state.log.pop_front();
            }

            let snapshot = self
                .config
                .error_log_path
                .as_ref()
                .map(|_| state.log.iter().cloned().collect::<Vec<_>>());

            (record, repeated, snapshot)
        };

        Self::log_record(&record, repeated);

        if record.notified {
            self.events.emit(BotEvent::Error { record: record.clone() });
        }

        if let (Some(path), Some(entries)) = (&self.config.error_log_path, snapshot) {
            if let Err(e) = Self::persist(path, &entries) {
                warn!("⚠️  Failed to update error log {}: {}", path, e);
            }
        }

        let notified = record.notified;
        ErrorDisposition {
            record,
            repeated_during_cooldown: repeated,
            notified,
        }
    }

    /// Escalate a failure that must halt trading
    pub fn escalate_critical(&self, category: ErrorCategory, message: impl Into<String>) -> ErrorDisposition {
        self.record(ErrorReport::new(category, Severity::Critical, message))
    }

    /// Successful outcomes are counted but never reset an active cooldown
    pub fn record_success(&self, category: ErrorCategory) {
        let mut state = self.state.lock();
        state.categories.entry(category).or_default().successes += 1;
    }

    pub fn category_state(&self, category: ErrorCategory) -> CategoryState {
        self.category_state_at(category, Utc::now())
    }

    pub fn category_state_at(&self, category: ErrorCategory, now: DateTime<Utc>) -> CategoryState {
        let mut state = self.state.lock();
        let Some(tracker) = state.categories.get_mut(&category) else {
            return CategoryState::Available;
        };

        match tracker.cooldown_until {
            Some(until) if until > now => CategoryState::CoolingDown { until },
            Some(_) => {
                tracker.cooldown_until = None;
                debug!("Category {} available again", category.as_str());
                CategoryState::Available
            }
            None => CategoryState::Available,
        }
    }

    pub fn is_cooling_down(&self, category: ErrorCategory) -> bool {
        self.is_cooling_down_at(category, Utc::now())
    }

    pub fn is_cooling_down_at(&self, category: ErrorCategory, now: DateTime<Utc>) -> bool {
        matches!(self.category_state_at(category, now), CategoryState::CoolingDown { .. })
    }

    pub fn occurrences(&self, category: ErrorCategory) -> u64 {
        self.state
            .lock()
            .categories
            .get(&category)
            .map(|t| t.occurrences)
            .unwrap_or(0)
    }

    pub fn successes(&self, category: ErrorCategory) -> u64 {
        self.state
            .lock()
            .categories
            .get(&category)
            .map(|t| t.successes)
            .unwrap_or(0)
    }

    /// Snapshot of the ring log, oldest first
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.state.lock().log.iter().cloned().collect()
    }

    pub fn summary(&self, hours: i64) -> ErrorSummary {
        Self::summarize(&self.recent(), hours, Utc::now())
    }

    /// Summarize a set of records, e.g. the persisted log
    pub fn summarize(records: &[ErrorRecord], hours: i64, now: DateTime<Utc>) -> ErrorSummary {
        let cutoff = now - Duration::hours(hours);
        let recent: Vec<&ErrorRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();

        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for record in &recent {
            *by_category.entry(record.category.as_str().to_string()).or_insert(0) += 1;
            *by_severity.entry(record.severity.as_str().to_string()).or_insert(0) += 1;
        }

        let skip = recent.len().saturating_sub(5);
        ErrorSummary {
            total_errors: recent.len(),
            time_period_hours: hours,
            by_category,
            by_severity,
            most_recent: recent.into_iter().skip(skip).cloned().collect(),
        }
    }

    /// Read a log previously written by a handler with `error_log_path` set
    pub fn read_log<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<ErrorRecord>> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn cooldown_for(&self, category: ErrorCategory) -> Duration {
        let minutes = self
            .config
            .cooldown_minutes
            .get(category.as_str())
            .copied()
            .unwrap_or(self.config.default_cooldown_minutes);
        Duration::minutes(minutes as i64)
    }

    fn notification_cap_for(&self, category: ErrorCategory) -> u32 {
        self.config
            .max_notifications_per_hour
            .get(category.as_str())
            .copied()
            .unwrap_or(self.config.default_notifications_per_hour)
    }

    fn should_notify(tracker: &mut CategoryTracker, severity: Severity, cap: u32, now: DateTime<Utc>) -> bool {
        let hour_ago = now - Duration::hours(1);
        while matches!(tracker.notifications.front(), Some(t) if *t <= hour_ago) {
            tracker.notifications.pop_front();
        }

        if severity == Severity::Critical {
            return true;
        }
        if !severity.notifies() {
            return false;
        }
        tracker.notifications.len() < cap as usize
    }

    fn log_record(record: &ErrorRecord, repeated: bool) {
        let suffix = if repeated { " (cooling down)" } else { "" };
        let message = format!(
            "[{}] {}: {}{}",
            record.severity.as_str(),
            record.category.as_str(),
            record.message,
            suffix
        );

        match record.severity {
            Severity::Critical => error!("🚨 {}", message),
            Severity::High | Severity::Medium => error!("❌ {}", message),
            Severity::Low => warn!("⚠️  {}", message),
            Severity::Info => info!("ℹ️  {}", message),
        }
    }

    fn persist(path: &str, entries: &[ErrorRecord]) -> std::io::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}
