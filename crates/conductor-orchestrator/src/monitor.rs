use crate::context::ExecutionContext;
use crate::sampler::{ResourceSampler, SystemSampler};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Gauge reporting host CPU usage in percent.
pub const CPU_USAGE_METRIC: &str = "system.cpu.usage";
/// Gauge reporting host memory usage in percent.
pub const MEMORY_USAGE_METRIC: &str = "system.memory.usage";
/// Timer recorded once per completed workflow step, in seconds.
pub const STEP_DURATION_METRIC: &str = "workflow.step.duration";
/// Timer recorded once per finished workflow, in seconds.
pub const WORKFLOW_DURATION_METRIC: &str = "workflow.duration";
/// Counter of workflows that finished successfully.
pub const WORKFLOW_COMPLETED_METRIC: &str = "workflow.completed";
/// Counter of workflows that failed.
pub const WORKFLOW_FAILED_METRIC: &str = "workflow.failed";
/// Timer recorded once per finished agent task, in seconds.
pub const TASK_DURATION_METRIC: &str = "agent.task.duration";
/// Counter of agent tasks that completed.
pub const TASK_COMPLETED_METRIC: &str = "agent.task.completed";
/// Counter of agent tasks that failed after exhausting retries.
pub const TASK_FAILED_METRIC: &str = "agent.task.failed";

const MAX_ALERT_HISTORY: usize = 1_000;
const MAX_COMPLETED_PROFILES: usize = 100;

/// Tuning for [`PerformanceMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period of the background resource sampling loop.
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    /// Samples older than this are evicted.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Per-metric sample cap; the oldest are evicted first.
    #[serde(default = "default_max_samples")]
    pub max_samples_per_metric: usize,
    /// CPU level that counts as a warning.
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning_percent: f64,
    /// Memory level that counts as a warning.
    #[serde(default = "default_memory_warning")]
    pub memory_warning_percent: f64,
    /// Consecutive resource samples above the warning level that count as sustained.
    #[serde(default = "default_sustained_samples")]
    pub sustained_samples: usize,
    /// Average step duration, in seconds, above which a recommendation is raised.
    #[serde(default = "default_slow_step_secs")]
    pub slow_step_secs: f64,
    /// Failure share above which a recommendation is raised.
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio_warning: f64,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_monitoring_interval_ms() -> u64 {
    5_000
}
fn default_retention_secs() -> u64 {
    3_600
}
fn default_max_samples() -> usize {
    1_000
}
fn default_cpu_warning() -> f64 {
    80.0
}
fn default_memory_warning() -> f64 {
    85.0
}
fn default_sustained_samples() -> usize {
    3
}
fn default_slow_step_secs() -> f64 {
    60.0
}
fn default_failure_ratio() -> f64 {
    0.2
}
fn default_event_capacity() -> usize {
    256
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: default_monitoring_interval_ms(),
            retention_secs: default_retention_secs(),
            max_samples_per_metric: default_max_samples(),
            cpu_warning_percent: default_cpu_warning(),
            memory_warning_percent: default_memory_warning(),
            sustained_samples: default_sustained_samples(),
            slow_step_secs: default_slow_step_secs(),
            failure_ratio_warning: default_failure_ratio(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// How a metric's samples are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Point-in-time level.
    Gauge,
    /// Monotonic count.
    Counter,
    /// Duration in seconds.
    Timer,
}

/// One recorded sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric the sample belongs to.
    pub name: String,
    /// Sampled value.
    pub value: f64,
    /// Kind of metric.
    pub metric_type: MetricType,
    /// Unit label, e.g. `"percent"`.
    pub unit: String,
    /// Time of the sample.
    pub timestamp: DateTime<Utc>,
}

/// Summary of a metric's retained samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    /// Number of samples.
    pub count: usize,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median value.
    pub median: f64,
    /// 95th percentile.
    pub p95: f64,
    /// Newest value.
    pub latest: f64,
}

impl MetricStatistics {
    fn from_values(mut values: Vec<f64>, latest: f64) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        } else {
            values[n / 2]
        };
        // nearest-rank
        let rank = ((0.95 * n as f64).ceil() as usize).clamp(1, n);
        Some(Self {
            count: n,
            min: values[0],
            max: values[n - 1],
            mean,
            median,
            p95: values[rank - 1],
            latest,
        })
    }
}

/// Comparison applied between a sample and a rule's threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `value > threshold`
    GreaterThan,
    /// `value >= threshold`
    GreaterOrEqual,
    /// `value < threshold`
    LessThan,
    /// `value <= threshold`
    LessOrEqual,
    /// Equal within `f64::EPSILON`.
    Equal,
}

impl Comparison {
    /// True if `value` violates `threshold` under this comparison.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
            Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate action.
    Critical,
}

/// Raises an alert once a metric violates its threshold for
/// `consecutive_violations` samples in a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Unique id of the rule.
    #[serde(default = "Uuid::new_v4")]
    pub rule_id: Uuid,
    /// Metric the rule watches.
    pub metric_name: String,
    /// Threshold the samples are compared against.
    pub threshold_value: f64,
    /// How samples are compared.
    pub comparison: Comparison,
    /// Severity of the alerts it raises.
    #[serde(default = "default_severity")]
    pub severity: AlertSeverity,
    /// Supports `{metric}`, `{value}` and `{threshold}` placeholders.
    #[serde(default = "default_message_template")]
    pub message_template: String,
    /// Violations in a row needed to raise an alert.
    #[serde(default = "default_consecutive_violations")]
    pub consecutive_violations: u32,
}

fn default_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

fn default_message_template() -> String {
    "{metric} is {value} (threshold {threshold})".to_string()
}

fn default_consecutive_violations() -> u32 {
    1
}

impl ThresholdRule {
    /// Rule with warning severity and a single-violation trigger.
    pub fn new(metric_name: impl Into<String>, comparison: Comparison, threshold_value: f64) -> Self {
        Self {
            rule_id: Uuid::new_v4(),
            metric_name: metric_name.into(),
            threshold_value,
            comparison,
            severity: default_severity(),
            message_template: default_message_template(),
            consecutive_violations: default_consecutive_violations(),
        }
    }

    /// Set the alert severity.
    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Require `n` violations in a row.
    pub fn with_consecutive_violations(mut self, n: u32) -> Self {
        self.consecutive_violations = n;
        self
    }

    /// Set the message template.
    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    /// Alert message for `value`.
    pub fn render_message(&self, value: f64) -> String {
        self.message_template
            .replace("{metric}", &self.metric_name)
            .replace("{value}", &format!("{value:.2}"))
            .replace("{threshold}", &format!("{:.2}", self.threshold_value))
    }
}

/// Evaluation state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// No open alert.
    Ok,
    /// An alert is open.
    Alerting,
}

/// An alert raised by a threshold rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id of the alert.
    pub alert_id: Uuid,
    /// Rule that raised it.
    pub rule_id: Uuid,
    /// Metric that violated the rule.
    pub metric_name: String,
    /// Severity copied from the rule.
    pub severity: AlertSeverity,
    /// Rendered message.
    pub message: String,
    /// Value that triggered the alert.
    pub value: f64,
    /// Threshold at the time it was raised.
    pub threshold_value: f64,
    /// Time it was raised.
    pub raised_at: DateTime<Utc>,
    /// Set once the rule stops violating or is removed.
    pub resolved_at: Option<DateTime<Utc>>,
}

struct RuleState {
    rule: ThresholdRule,
    violations: u32,
    state: AlertState,
    active_alert: Option<Uuid>,
}

/// Per-execution profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionStats {
    /// Execution being profiled.
    pub execution_id: Uuid,
    /// Workflow being executed.
    pub workflow_id: String,
    /// When profiling started.
    pub start_time: DateTime<Utc>,
    /// When the execution finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Completed step count.
    pub completed_steps: usize,
    /// Running mean over steps that reported a duration, in seconds.
    pub average_step_duration: f64,
    #[serde(skip)]
    timed_steps: usize,
    #[serde(skip)]
    seen_steps: HashSet<String>,
}

impl WorkflowExecutionStats {
    fn new(execution_id: Uuid, workflow_id: String) -> Self {
        Self {
            execution_id,
            workflow_id,
            start_time: Utc::now(),
            end_time: None,
            completed_steps: 0,
            average_step_duration: 0.0,
            timed_steps: 0,
            seen_steps: HashSet::new(),
        }
    }

    /// Fold newly completed steps into the counters.
    fn absorb(&mut self, context: &ExecutionContext) -> Vec<f64> {
        let mut new_durations = Vec::new();
        for (step_id, step) in &context.completed_steps {
            if !self.seen_steps.insert(step_id.clone()) {
                continue;
            }
            self.completed_steps += 1;
            if let Some(ms) = step.duration_ms {
                let secs = ms as f64 / 1000.0;
                self.timed_steps += 1;
                self.average_step_duration +=
                    (secs - self.average_step_duration) / self.timed_steps as f64;
                new_durations.push(secs);
            }
        }
        new_durations
    }

    /// Wall time, once the execution has finished.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .and_then(|end| (end - self.start_time).to_std().ok())
    }
}

/// Events pushed to observability subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A rule started alerting.
    AlertRaised(Alert),
    /// An open alert was resolved.
    AlertResolved(Alert),
    /// An execution finished profiling.
    WorkflowCompleted(WorkflowExecutionStats),
}

/// Overall health bucket derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Score of at least 80.
    Healthy,
    /// Score of at least 50.
    Degraded,
    /// Score below 50.
    Critical,
}

/// Snapshot of resource usage and monitor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthSummary {
    /// Latest CPU usage.
    pub cpu_percent: f64,
    /// Latest memory usage.
    pub memory_percent: f64,
    /// Executions being profiled.
    pub active_executions: usize,
    /// Metric series held.
    pub metric_series: usize,
    /// Samples across all series.
    pub total_samples: usize,
    /// Open alerts.
    pub active_alerts: usize,
    /// Always within `[0, 100]`.
    pub health_score: f64,
    /// Bucket derived from `health_score`.
    pub status: HealthStatus,
    /// Time of the snapshot.
    pub timestamp: DateTime<Utc>,
}

/// Area a recommendation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationType {
    /// CPU or memory pressure.
    Resource,
    /// Slow steps.
    Performance,
    /// Failing executions.
    Reliability,
    /// Open critical alerts.
    Alerting,
}

/// Urgency of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    /// Can wait.
    Low,
    /// Worth scheduling.
    Medium,
    /// Act soon.
    High,
}

/// Advice derived from the collected metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Area addressed.
    #[serde(rename = "type")]
    pub recommendation_type: RecommendationType,
    /// Urgency.
    pub priority: RecommendationPriority,
    /// Short summary.
    pub title: String,
    /// Details.
    pub description: String,
}

/// Metric recording, threshold alerting, workflow profiling and a background
/// resource sampling loop.
///
/// All recording paths take `&self` and are safe to call from any number of
/// concurrent executions.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    series: RwLock<HashMap<String, VecDeque<Metric>>>,
    rules: Mutex<Vec<RuleState>>,
    active_alerts: RwLock<BTreeMap<Uuid, Alert>>,
    alert_history: Mutex<VecDeque<Alert>>,
    profiles: RwLock<HashMap<Uuid, WorkflowExecutionStats>>,
    completed_profiles: Mutex<VecDeque<WorkflowExecutionStats>>,
    events: broadcast::Sender<MonitorEvent>,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    background: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl PerformanceMonitor {
    /// Monitor sampling the host through `sysinfo`.
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_sampler(config, Box::new(SystemSampler::new()))
    }

    /// Monitor with a custom resource sampler.
    pub fn with_sampler(config: MonitorConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            active_alerts: RwLock::new(BTreeMap::new()),
            alert_history: Mutex::new(VecDeque::new()),
            profiles: RwLock::new(HashMap::new()),
            completed_profiles: Mutex::new(VecDeque::new()),
            events,
            sampler: Mutex::new(sampler),
            background: Mutex::new(None),
        }
    }

    /// Monitor configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Subscribe to alerts and workflow completions.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    // --- Metrics ---

    /// Append a sample and evaluate threshold rules against it.
    ///
    /// Returns the alerts raised by this sample.
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        unit: &str,
    ) -> Vec<Alert> {
        let now = Utc::now();
        {
            let mut series = self.series.write();
            let samples = series.entry(name.to_string()).or_default();
            samples.push_back(Metric {
                name: name.to_string(),
                value,
                metric_type,
                unit: unit.to_string(),
                timestamp: now,
            });
            while samples.len() > self.config.max_samples_per_metric.max(1) {
                samples.pop_front();
            }
            if let Some(cutoff) = self.retention_cutoff(now) {
                while samples.front().is_some_and(|m| m.timestamp < cutoff) {
                    samples.pop_front();
                }
            }
        }
        self.evaluate_rules(name, value)
    }

    /// Shorthand for a counter increment of one.
    pub fn increment(&self, name: &str) -> Vec<Alert> {
        self.record_metric(name, 1.0, MetricType::Counter, "count")
    }

    /// Shorthand for a timer sample in seconds.
    pub fn record_duration(&self, name: &str, duration: Duration) -> Vec<Alert> {
        self.record_metric(name, duration.as_secs_f64(), MetricType::Timer, "seconds")
    }

    /// Statistics over a metric's retained samples.
    pub fn get_metric_statistics(&self, name: &str) -> Option<MetricStatistics> {
        let series = self.series.read();
        let samples = series.get(name)?;
        let latest = samples.back()?.value;
        MetricStatistics::from_values(samples.iter().map(|m| m.value).collect(), latest)
    }

    /// Newest value of a metric.
    pub fn latest_value(&self, name: &str) -> Option<f64> {
        self.series.read().get(name)?.back().map(|m| m.value)
    }

    /// Samples of one metric, oldest first.
    pub fn metric_series(&self, name: &str) -> Vec<Metric> {
        self.series
            .read()
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all recorded metrics, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Sum of a counter's retained samples.
    pub fn counter_total(&self, name: &str) -> f64 {
        self.series
            .read()
            .get(name)
            .map(|s| s.iter().map(|m| m.value).sum())
            .unwrap_or(0.0)
    }

    /// Drop samples older than the retention window. Returns how many went.
    pub fn prune_expired(&self) -> usize {
        let Some(cutoff) = self.retention_cutoff(Utc::now()) else {
            return 0;
        };
        let mut removed = 0;
        let mut series = self.series.write();
        for samples in series.values_mut() {
            while samples.front().is_some_and(|m| m.timestamp < cutoff) {
                samples.pop_front();
                removed += 1;
            }
        }
        series.retain(|_, s| !s.is_empty());
        removed
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.config.retention_secs).ok()?;
        now.checked_sub_signed(chrono::Duration::try_seconds(secs)?)
    }

    // --- Alerting ---

    /// Register a rule and return its id.
    pub fn add_threshold_rule(&self, rule: ThresholdRule) -> Uuid {
        let rule_id = rule.rule_id;
        info!(
            metric = %rule.metric_name,
            threshold = rule.threshold_value,
            consecutive = rule.consecutive_violations,
            "Threshold rule added"
        );
        self.rules.lock().push(RuleState {
            rule,
            violations: 0,
            state: AlertState::Ok,
            active_alert: None,
        });
        rule_id
    }

    /// Remove every rule for a metric. Returns how many were removed.
    /// Their open alerts are resolved.
    pub fn remove_threshold_rules(&self, metric_name: &str) -> usize {
        let mut resolved = Vec::new();
        let removed = {
            let mut rules = self.rules.lock();
            let before = rules.len();
            rules.retain_mut(|r| {
                if r.rule.metric_name != metric_name {
                    return true;
                }
                if let Some(alert) = r.active_alert.take().and_then(|id| self.resolve_alert(id)) {
                    resolved.push(alert);
                }
                false
            });
            before - rules.len()
        };
        for alert in resolved {
            let _ = self.events.send(MonitorEvent::AlertResolved(alert));
        }
        removed
    }

    /// Alert state of a rule, if it exists.
    pub fn rule_state(&self, rule_id: Uuid) -> Option<AlertState> {
        self.rules
            .lock()
            .iter()
            .find(|r| r.rule.rule_id == rule_id)
            .map(|r| r.state)
    }

    /// Alerts currently open.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active_alerts.read().values().cloned().collect()
    }

    /// Raised alerts, oldest first.
    pub fn alert_history(&self) -> Vec<Alert> {
        self.alert_history.lock().iter().cloned().collect()
    }

    /// Rule state, active alerts and history change under the `rules` lock,
    /// so concurrent samples of one metric cannot strand an alert. Only the
    /// broadcast happens after it is released.
    fn evaluate_rules(&self, name: &str, value: f64) -> Vec<Alert> {
        let mut raised = Vec::new();
        let mut events = Vec::new();
        {
            let mut rules = self.rules.lock();
            for state in rules.iter_mut().filter(|r| r.rule.metric_name == name) {
                let rule = &state.rule;
                if rule.comparison.holds(value, rule.threshold_value) {
                    state.violations = state.violations.saturating_add(1);
                    if state.state == AlertState::Ok
                        && state.violations >= rule.consecutive_violations.max(1)
                    {
                        let alert = Alert {
                            alert_id: Uuid::new_v4(),
                            rule_id: rule.rule_id,
                            metric_name: rule.metric_name.clone(),
                            severity: rule.severity,
                            message: rule.render_message(value),
                            value,
                            threshold_value: rule.threshold_value,
                            raised_at: Utc::now(),
                            resolved_at: None,
                        };
                        warn!(
                            metric = %alert.metric_name,
                            severity = ?alert.severity,
                            value,
                            "{}",
                            alert.message
                        );
                        state.state = AlertState::Alerting;
                        state.active_alert = Some(alert.alert_id);
                        self.active_alerts
                            .write()
                            .insert(alert.alert_id, alert.clone());
                        self.push_history(alert.clone());
                        events.push(MonitorEvent::AlertRaised(alert.clone()));
                        raised.push(alert);
                    }
                } else {
                    state.violations = 0;
                    if state.state == AlertState::Alerting {
                        state.state = AlertState::Ok;
                        let resolved =
                            state.active_alert.take().and_then(|id| self.resolve_alert(id));
                        if let Some(alert) = resolved {
                            info!(metric = %alert.metric_name, value, "Alert resolved");
                            events.push(MonitorEvent::AlertResolved(alert));
                        }
                    }
                }
            }
        }

        for event in events {
            let _ = self.events.send(event);
        }
        raised
    }

    /// Move an active alert to history as resolved. Callers hold `rules`.
    fn resolve_alert(&self, alert_id: Uuid) -> Option<Alert> {
        let mut alert = self.active_alerts.write().remove(&alert_id)?;
        alert.resolved_at = Some(Utc::now());
        self.push_history(alert.clone());
        Some(alert)
    }

    fn push_history(&self, alert: Alert) {
        let mut history = self.alert_history.lock();
        history.push_back(alert);
        while history.len() > MAX_ALERT_HISTORY {
            history.pop_front();
        }
    }

    // --- Workflow profiling ---

    /// Begin profiling an execution.
    pub fn start_workflow_profiling(&self, context: &ExecutionContext) {
        let mut stats = WorkflowExecutionStats::new(context.execution_id, context.workflow_id.clone());
        // Steps completed before a recovery are not re-timed.
        stats.absorb(context);
        let active = {
            let mut profiles = self.profiles.write();
            profiles.insert(context.execution_id, stats);
            profiles.len()
        };
        debug!(execution_id = %context.execution_id, "Workflow profiling started");
        self.record_metric("workflow.active", active as f64, MetricType::Gauge, "count");
    }

    /// Fold steps completed since the last update into the profile.
    pub fn update_workflow_progress(
        &self,
        context: &ExecutionContext,
    ) -> Option<WorkflowExecutionStats> {
        let (snapshot, new_durations) = {
            let mut profiles = self.profiles.write();
            let stats = profiles.get_mut(&context.execution_id)?;
            let new_durations = stats.absorb(context);
            (stats.clone(), new_durations)
        };
        for secs in new_durations {
            self.record_metric(STEP_DURATION_METRIC, secs, MetricType::Timer, "seconds");
        }
        Some(snapshot)
    }

    /// Finish profiling and broadcast the final stats.
    pub fn complete_workflow_profiling(
        &self,
        context: &ExecutionContext,
    ) -> Option<WorkflowExecutionStats> {
        self.update_workflow_progress(context);
        let (mut stats, active) = {
            let mut profiles = self.profiles.write();
            let stats = profiles.remove(&context.execution_id)?;
            (stats, profiles.len())
        };
        stats.end_time = Some(Utc::now());

        if let Some(duration) = stats.duration() {
            self.record_duration(WORKFLOW_DURATION_METRIC, duration);
        }
        self.record_metric("workflow.active", active as f64, MetricType::Gauge, "count");

        info!(
            execution_id = %stats.execution_id,
            completed_steps = stats.completed_steps,
            average_step_duration = stats.average_step_duration,
            "Workflow profiling complete"
        );

        {
            let mut completed = self.completed_profiles.lock();
            completed.push_back(stats.clone());
            while completed.len() > MAX_COMPLETED_PROFILES {
                completed.pop_front();
            }
        }
        let _ = self
            .events
            .send(MonitorEvent::WorkflowCompleted(stats.clone()));
        Some(stats)
    }

    /// Stats for an active or recently completed execution.
    pub fn workflow_stats(&self, execution_id: Uuid) -> Option<WorkflowExecutionStats> {
        if let Some(stats) = self.profiles.read().get(&execution_id) {
            return Some(stats.clone());
        }
        self.completed_profiles
            .lock()
            .iter()
            .rev()
            .find(|s| s.execution_id == execution_id)
            .cloned()
    }

    /// Executions being profiled.
    pub fn active_execution_count(&self) -> usize {
        self.profiles.read().len()
    }

    // --- Health & recommendations ---

    /// Aggregate resource gauges, activity and alerts into a score.
    ///
    /// `score = 100 − 0.3·cpu − 0.3·memory − alert penalty`, where each active
    /// alert costs 20 (critical), 10 (warning) or 2 (info), capped at 40.
    pub fn get_system_health_summary(&self) -> SystemHealthSummary {
        let cpu = self
            .latest_value(CPU_USAGE_METRIC)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0);
        let memory = self
            .latest_value(MEMORY_USAGE_METRIC)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0);

        let (metric_series, total_samples) = {
            let series = self.series.read();
            (series.len(), series.values().map(VecDeque::len).sum())
        };

        let alerts = self.active_alerts();
        let alert_penalty: f64 = alerts
            .iter()
            .map(|a| match a.severity {
                AlertSeverity::Critical => 20.0,
                AlertSeverity::Warning => 10.0,
                AlertSeverity::Info => 2.0,
            })
            .sum::<f64>()
            .min(40.0);

        let score = (100.0 - 0.3 * cpu - 0.3 * memory - alert_penalty).clamp(0.0, 100.0);
        let status = if score >= 80.0 {
            HealthStatus::Healthy
        } else if score >= 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        SystemHealthSummary {
            cpu_percent: cpu,
            memory_percent: memory,
            active_executions: self.active_execution_count(),
            metric_series,
            total_samples,
            active_alerts: alerts.len(),
            health_score: score,
            status,
            timestamp: Utc::now(),
        }
    }

    fn is_sustained_above(&self, name: &str, threshold: f64) -> Option<f64> {
        let needed = self.config.sustained_samples.max(1);
        let series = self.series.read();
        let samples = series.get(name)?;
        if samples.len() < needed {
            return None;
        }
        let recent: Vec<f64> = samples.iter().rev().take(needed).map(|m| m.value).collect();
        if recent.iter().all(|v| *v >= threshold) {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        } else {
            None
        }
    }

    /// Heuristics over sustained pressure, slow steps, failures and alerts.
    pub fn get_performance_recommendations(&self) -> Vec<Recommendation> {
        let mut out = Vec::new();

        if let Some(avg) = self.is_sustained_above(CPU_USAGE_METRIC, self.config.cpu_warning_percent)
        {
            out.push(Recommendation {
                recommendation_type: RecommendationType::Resource,
                priority: RecommendationPriority::High,
                title: "Sustained high CPU usage".to_string(),
                description: format!(
                    "CPU averaged {avg:.1}% over the last {} samples; lower max_concurrent_agents or add capacity.",
                    self.config.sustained_samples
                ),
            });
        }

        if let Some(avg) =
            self.is_sustained_above(MEMORY_USAGE_METRIC, self.config.memory_warning_percent)
        {
            out.push(Recommendation {
                recommendation_type: RecommendationType::Resource,
                priority: RecommendationPriority::High,
                title: "Sustained high memory usage".to_string(),
                description: format!(
                    "Memory averaged {avg:.1}% over the last {} samples; use lighter checkpoint levels or lower max_concurrent_workflows.",
                    self.config.sustained_samples
                ),
            });
        }

        if let Some(stats) = self.get_metric_statistics(STEP_DURATION_METRIC) {
            if stats.p95 > self.config.slow_step_secs {
                out.push(Recommendation {
                    recommendation_type: RecommendationType::Performance,
                    priority: RecommendationPriority::Medium,
                    title: "Slow workflow steps".to_string(),
                    description: format!(
                        "p95 step duration is {:.1}s (limit {:.1}s); split long steps or use SCATTER_GATHER.",
                        stats.p95, self.config.slow_step_secs
                    ),
                });
            }
        }

        let failed = self.counter_total(TASK_FAILED_METRIC);
        let completed = self.counter_total(TASK_COMPLETED_METRIC);
        let total = failed + completed;
        if total >= 5.0 && failed / total >= self.config.failure_ratio_warning {
            out.push(Recommendation {
                recommendation_type: RecommendationType::Reliability,
                priority: RecommendationPriority::High,
                title: "High agent task failure rate".to_string(),
                description: format!(
                    "{failed:.0} of {total:.0} agent tasks failed; review agent health and retry policies."
                ),
            });
        }

        let critical = self
            .active_alerts()
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .count();
        if critical > 0 {
            out.push(Recommendation {
                recommendation_type: RecommendationType::Alerting,
                priority: RecommendationPriority::High,
                title: "Critical alerts active".to_string(),
                description: format!("{critical} critical alert(s) are currently firing."),
            });
        }

        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }

    // --- Background sampling ---

    /// Take one resource sample and prune expired metrics.
    pub fn sample_resources(&self) {
        let sample = self.sampler.lock().sample();
        self.record_metric(CPU_USAGE_METRIC, sample.cpu_percent, MetricType::Gauge, "percent");
        self.record_metric(
            MEMORY_USAGE_METRIC,
            sample.memory_percent,
            MetricType::Gauge,
            "percent",
        );
        self.record_metric(
            "system.memory.used",
            sample.memory_used_bytes as f64,
            MetricType::Gauge,
            "bytes",
        );
        self.prune_expired();
    }

    /// Start the background sampling loop. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut background = self.background.lock();
        if background.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.monitoring_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.sample_resources();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Monitor sampling loop stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Monitor sampling loop started");
        *background = Some((stop_tx, handle));
        true
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.background.lock().take();
        if let Some((stop_tx, handle)) = running {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor sampling loop ended abnormally");
            }
        }
    }

    /// True while the background loop runs.
    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sampler::ScriptedSampler;
    use serde_json::json;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::with_sampler(
            MonitorConfig::default(),
            Box::new(ScriptedSampler::constant(10.0, 20.0)),
        )
    }

    #[test]
    fn test_statistics() {
        let m = monitor();
        for v in (1..=10).map(|i| f64::from(i) * 10.0) {
            m.record_metric("latency", v, MetricType::Timer, "ms");
        }
        let stats = m.get_metric_statistics("latency").unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!(stats.mean, 55.0);
        assert_eq!(stats.median, 55.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.p95, 100.0);
        assert_eq!(stats.latest, 100.0);
    }

    #[test]
    fn test_statistics_odd_count() {
        let m = monitor();
        for v in [3.0, 1.0, 2.0] {
            m.record_metric("x", v, MetricType::Gauge, "");
        }
        let stats = m.get_metric_statistics("x").unwrap();
        assert_eq!(stats.median, 2.0);
        assert_eq!(stats.latest, 2.0);
    }

    #[test]
    fn test_unknown_metric() {
        assert!(monitor().get_metric_statistics("nope").is_none());
    }

    #[test]
    fn test_series_is_bounded() {
        let m = PerformanceMonitor::with_sampler(
            MonitorConfig {
                max_samples_per_metric: 5,
                ..MonitorConfig::default()
            },
            Box::new(ScriptedSampler::constant(0.0, 0.0)),
        );
        for i in 0..20 {
            m.record_metric("x", f64::from(i), MetricType::Counter, "count");
        }
        let series = m.metric_series("x");
        assert_eq!(series.len(), 5);
        assert_eq!(series[0].value, 15.0);
    }

    #[test]
    fn test_consecutive_violations() {
        let m = monitor();
        let rule_id = m.add_threshold_rule(
            ThresholdRule::new("cpu", Comparison::GreaterThan, 80.0)
                .with_consecutive_violations(2),
        );

        assert!(m.record_metric("cpu", 90.0, MetricType::Gauge, "%").is_empty());
        assert_eq!(m.rule_state(rule_id), Some(AlertState::Ok));

        let raised = m.record_metric("cpu", 95.0, MetricType::Gauge, "%");
        assert_eq!(raised.len(), 1);
        assert_eq!(m.rule_state(rule_id), Some(AlertState::Alerting));

        // Still violating: no duplicate alert.
        assert!(m.record_metric("cpu", 99.0, MetricType::Gauge, "%").is_empty());
        assert_eq!(m.active_alerts().len(), 1);
    }

    #[test]
    fn test_violation_streak_resets() {
        let m = monitor();
        m.add_threshold_rule(
            ThresholdRule::new("cpu", Comparison::GreaterThan, 80.0)
                .with_consecutive_violations(2),
        );
        m.record_metric("cpu", 90.0, MetricType::Gauge, "%");
        m.record_metric("cpu", 50.0, MetricType::Gauge, "%");
        assert!(m.record_metric("cpu", 90.0, MetricType::Gauge, "%").is_empty());
    }

    #[test]
    fn test_alert_clears() {
        let m = monitor();
        let mut events = m.subscribe();
        let rule_id = m.add_threshold_rule(ThresholdRule::new("queue", Comparison::GreaterOrEqual, 10.0));

        assert_eq!(m.record_metric("queue", 12.0, MetricType::Gauge, "").len(), 1);
        m.record_metric("queue", 3.0, MetricType::Gauge, "");

        assert_eq!(m.rule_state(rule_id), Some(AlertState::Ok));
        assert!(m.active_alerts().is_empty());
        let history = m.alert_history();
        assert_eq!(history.len(), 2);
        assert!(history[1].resolved_at.is_some());

        assert!(matches!(events.try_recv().unwrap(), MonitorEvent::AlertRaised(_)));
        assert!(matches!(events.try_recv().unwrap(), MonitorEvent::AlertResolved(_)));
    }

    #[test]
    fn test_message_template() {
        let rule = ThresholdRule::new("mem", Comparison::GreaterThan, 85.0)
            .with_message("{metric} hit {value}% (> {threshold}%)");
        assert_eq!(rule.render_message(91.5), "mem hit 91.50% (> 85.00%)");
    }

    #[test]
    fn test_remove_rules() {
        let m = monitor();
        m.add_threshold_rule(ThresholdRule::new("a", Comparison::LessThan, 1.0));
        m.add_threshold_rule(ThresholdRule::new("a", Comparison::GreaterThan, 5.0));
        m.add_threshold_rule(ThresholdRule::new("b", Comparison::Equal, 1.0));
        assert_eq!(m.remove_threshold_rules("a"), 2);
        assert!(m.record_metric("a", 0.0, MetricType::Gauge, "").is_empty());
    }

    #[test]
    fn test_remove_rules_resolves_open_alerts() {
        let m = monitor();
        m.add_threshold_rule(ThresholdRule::new("lag", Comparison::GreaterThan, 1.0));
        assert_eq!(m.record_metric("lag", 5.0, MetricType::Gauge, "s").len(), 1);
        assert_eq!(m.active_alerts().len(), 1);

        assert_eq!(m.remove_threshold_rules("lag"), 1);
        assert!(m.active_alerts().is_empty());
        assert!(m.alert_history().last().unwrap().resolved_at.is_some());
    }

    #[test]
    fn test_concurrent_samples_leave_no_stranded_alerts() {
        let m = monitor();
        let rule_id =
            m.add_threshold_rule(ThresholdRule::new("queue", Comparison::GreaterThan, 10.0));

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let m = &m;
                scope.spawn(move || {
                    for i in 0..500 {
                        let value = if (i + worker) % 2 == 0 { 50.0 } else { 0.0 };
                        m.record_metric("queue", value, MetricType::Gauge, "items");
                    }
                });
            }
        });

        m.record_metric("queue", 0.0, MetricType::Gauge, "items");
        assert_eq!(m.rule_state(rule_id), Some(AlertState::Ok));
        assert!(m.active_alerts().is_empty());
        assert_eq!(m.get_system_health_summary().active_alerts, 0);
    }

    #[test]
    fn test_workflow_profiling() {
        let m = monitor();
        let mut ctx = ExecutionContext::new("wf", json!(null));
        m.start_workflow_profiling(&ctx);
        assert_eq!(m.active_execution_count(), 1);

        ctx.mark_step_completed("step-1", Some(Duration::from_secs(5)));
        m.update_workflow_progress(&ctx);

        let stats = m.complete_workflow_profiling(&ctx).unwrap();
        assert_eq!(stats.completed_steps, 1);
        assert_eq!(stats.average_step_duration, 5.0);
        assert!(stats.end_time.is_some());
        assert_eq!(m.active_execution_count(), 0);
        assert!(m.workflow_stats(ctx.execution_id).is_some());
    }

    #[test]
    fn test_running_mean() {
        let m = monitor();
        let mut ctx = ExecutionContext::new("wf", json!(null));
        m.start_workflow_profiling(&ctx);

        ctx.mark_step_completed("a", Some(Duration::from_secs(2)));
        let stats = m.update_workflow_progress(&ctx).unwrap();
        assert_eq!(stats.average_step_duration, 2.0);

        ctx.mark_step_completed("b", Some(Duration::from_secs(4)));
        ctx.mark_step_completed("c", None);
        let stats = m.update_workflow_progress(&ctx).unwrap();
        assert_eq!(stats.completed_steps, 3);
        assert_eq!(stats.average_step_duration, 3.0);

        // Re-reporting the same context does not double count.
        let stats = m.update_workflow_progress(&ctx).unwrap();
        assert_eq!(stats.completed_steps, 3);
        assert_eq!(m.get_metric_statistics(STEP_DURATION_METRIC).unwrap().count, 2);
    }

    #[test]
    fn test_health_score_bounds() {
        let m = monitor();
        let summary = m.get_system_health_summary();
        assert_eq!(summary.health_score, 100.0);
        assert_eq!(summary.status, HealthStatus::Healthy);

        m.record_metric(CPU_USAGE_METRIC, 100.0, MetricType::Gauge, "percent");
        m.record_metric(MEMORY_USAGE_METRIC, 100.0, MetricType::Gauge, "percent");
        for i in 0..5 {
            m.add_threshold_rule(
                ThresholdRule::new(format!("m{i}"), Comparison::GreaterThan, 0.0)
                    .with_severity(AlertSeverity::Critical),
            );
            m.record_metric(&format!("m{i}"), 1.0, MetricType::Gauge, "");
        }
        let summary = m.get_system_health_summary();
        assert!((0.0..=100.0).contains(&summary.health_score));
        assert_eq!(summary.health_score, 0.0);
        assert_eq!(summary.status, HealthStatus::Critical);
        assert_eq!(summary.active_alerts, 5);
    }

    #[test]
    fn test_recommendations_for_sustained_cpu() {
        let m = monitor();
        for _ in 0..3 {
            m.record_metric(CPU_USAGE_METRIC, 95.0, MetricType::Gauge, "percent");
        }
        let recs = m.get_performance_recommendations();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].recommendation_type, RecommendationType::Resource);
        assert_eq!(recs[0].priority, RecommendationPriority::High);

        let json = serde_json::to_value(&recs[0]).unwrap();
        assert_eq!(json["type"], "resource");
        assert!(json["title"].is_string());
        assert!(json["description"].is_string());
    }

    #[test]
    fn test_no_recommendation_for_spike() {
        let m = monitor();
        m.record_metric(CPU_USAGE_METRIC, 20.0, MetricType::Gauge, "percent");
        m.record_metric(CPU_USAGE_METRIC, 99.0, MetricType::Gauge, "percent");
        m.record_metric(CPU_USAGE_METRIC, 99.0, MetricType::Gauge, "percent");
        assert!(m.get_performance_recommendations().is_empty());
    }

    #[test]
    fn test_failure_ratio_recommendation() {
        let m = monitor();
        for _ in 0..3 {
            m.increment(TASK_COMPLETED_METRIC);
        }
        for _ in 0..2 {
            m.increment(TASK_FAILED_METRIC);
        }
        let recs = m.get_performance_recommendations();
        assert!(recs
            .iter()
            .any(|r| r.recommendation_type == RecommendationType::Reliability));
    }

    #[tokio::test]
    async fn test_concurrent_recording() {
        let m = Arc::new(monitor());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    m.increment("hits");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(m.counter_total("hits"), 400.0);
    }

    #[tokio::test]
    async fn test_background_loop_samples() {
        let m = Arc::new(PerformanceMonitor::with_sampler(
            MonitorConfig {
                monitoring_interval_ms: 10,
                ..MonitorConfig::default()
            },
            Box::new(ScriptedSampler::constant(42.0, 21.0)),
        ));
        assert!(m.start());
        assert!(!m.start());
        tokio::time::sleep(Duration::from_millis(60)).await;
        m.stop().await;
        assert!(!m.is_running());

        assert_eq!(m.latest_value(CPU_USAGE_METRIC), Some(42.0));
        assert_eq!(m.latest_value(MEMORY_USAGE_METRIC), Some(21.0));
        let samples = m.metric_series(CPU_USAGE_METRIC).len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(m.metric_series(CPU_USAGE_METRIC).len(), samples);
    }
}
