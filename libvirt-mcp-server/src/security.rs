//! Security gate for every operation.
//!
//! Provides:
//! - Operation allow-listing
//! - Per-(user, operation) rate limiting over a rolling window
//! - Domain name and descriptor sanitization
//! - Audit logging with redacted parameters

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use libvirt_mcp_hypervisor::{AllowList, HypervisorError, Result};

use crate::config::SecurityConfig;

/// Rate-limit window. Every counter is cleared when it elapses.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Largest descriptor accepted, in bytes.
pub const MAX_DESCRIPTOR_BYTES: usize = 1024 * 1024;

const MAX_NAME_LEN: usize = 255;

const TRAVERSAL_PATTERNS: [&str; 6] = ["../", "..\\", "/etc/", "/proc/", "/sys/", "\\windows\\"];

const DESCRIPTOR_BLOCKLIST: [&str; 10] = [
    "<!entity",
    "<!doctype",
    "system \"",
    "system '",
    "public \"",
    "public '",
    "file://",
    "http://",
    "https://",
    "ftp://",
];

const SENSITIVE_KEYS: [&str; 5] = ["password", "secret", "token", "key", "auth"];

/// Who is calling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub user: Option<String>,
    pub client: Option<String>,
}

impl CallerContext {
    pub fn new(user: Option<String>, client: Option<String>) -> Self {
        Self { user, client }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// User name used for rate keys and audit records.
    pub fn user_name(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }
}

// =============================================================================
// AUDIT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    OperationDenied,
    RateLimitExceeded,
    OperationAuthorized,
    OperationStarted,
    OperationExecuted,
    SuspiciousDomainName,
    InvalidDomainName,
    SuspiciousXmlContent,
    XmlSizeLimitExceeded,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub operation: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, operation: &str, caller: &CallerContext) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            operation: operation.to_string(),
            user: caller.user_name().to_string(),
            client: caller.client.clone(),
            allowed: true,
            request_id: None,
            parameters: None,
            result: None,
            duration_ms: None,
            reason: None,
        }
    }

    pub fn denied(mut self, reason: impl Into<String>) -> Self {
        self.allowed = false;
        self.reason = Some(reason.into());
        self
    }

    pub fn with_request_id(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_parameters(mut self, params: &Value) -> Self {
        self.parameters = Some(sanitize_parameters(params));
        self
    }

    pub fn with_result(mut self, summary: Value) -> Self {
        self.result = Some(summary);
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Log this entry.
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));

        if self.allowed {
            info!(audit = true, entry = %json, "Audit log");
        } else {
            warn!(audit = true, entry = %json, "Audit log (denied)");
        }
    }
}

/// Emits audit records from a background task so callers never wait on
/// log I/O. Without a runtime, records are emitted inline.
///
/// Counts are taken when a record is accepted, before it is written.
#[derive(Clone)]
pub struct AuditLogger {
    sender: Option<mpsc::UnboundedSender<AuditEvent>>,
    counts: Arc<std::sync::Mutex<HashMap<AuditEventType, u64>>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        let sender = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
            handle.spawn(async move {
                while let Some(event) = rx.recv().await {
                    event.log();
                }
            });
            tx
        });
        Self {
            sender,
            counts: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<AuditEventType, u64>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records accepted so far for `event_type`.
    pub fn recorded(&self, event_type: AuditEventType) -> u64 {
        self.counts().get(&event_type).copied().unwrap_or(0)
    }

    pub fn record(&self, event: AuditEvent) {
        *self.counts().entry(event.event_type).or_insert(0) += 1;

        match &self.sender {
            Some(tx) => {
                if let Err(mpsc::error::SendError(event)) = tx.send(event) {
                    event.log();
                }
            }
            None => event.log(),
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RATE LIMITING
// =============================================================================

struct RateState {
    counts: HashMap<String, u32>,
    window_start: Instant,
    last_reset: DateTime<Utc>,
}

impl RateState {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            window_start: Instant::now(),
            last_reset: Utc::now(),
        }
    }

    fn roll(&mut self, window: Duration) {
        if self.window_start.elapsed() > window {
            debug!(keys = self.counts.len(), "Rate limit window reset");
            self.counts.clear();
            self.window_start = Instant::now();
            self.last_reset = Utc::now();
        }
    }
}

fn rate_key(user: &str, operation: &str) -> String {
    format!("{}:{}", user, operation)
}

// =============================================================================
// GATE
// =============================================================================

/// Snapshot of gate state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SecuritySummary {
    pub audit_enabled: bool,
    pub auth_required: bool,
    pub allowed_operations: Vec<String>,
    pub max_concurrent_ops: u32,
    pub active_operations: HashMap<String, u32>,
    pub last_reset: DateTime<Utc>,
    pub audit_events: HashMap<AuditEventType, u64>,
}

pub struct SecurityGate {
    allowed: Arc<AllowList>,
    max_concurrent_ops: u32,
    audit_enabled: bool,
    auth_required: bool,
    window: Duration,
    rate: Mutex<RateState>,
    audit: AuditLogger,
}

impl SecurityGate {
    pub fn new(config: &SecurityConfig, allowed: Arc<AllowList>) -> Self {
        Self {
            allowed,
            max_concurrent_ops: config.max_concurrent_ops,
            audit_enabled: config.audit_log,
            auth_required: config.auth_required,
            window: RATE_WINDOW,
            rate: Mutex::new(RateState::new()),
            audit: AuditLogger::new(),
        }
    }

    /// Override the rate window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Authorize an operation and reserve a rate-limit slot.
    ///
    /// Every successful call must be paired with `complete_operation`.
    pub async fn validate_operation(&self, operation: &str, caller: &CallerContext) -> Result<()> {
        if !self.allowed.is_allowed(operation) {
            let reason = format!("Operation '{}' is not allowed", operation);
            self.audit.record(
                AuditEvent::new(AuditEventType::OperationDenied, operation, caller).denied(&reason),
            );
            return Err(HypervisorError::Permission(reason));
        }

        let key = rate_key(caller.user_name(), operation);
        let count = {
            let mut rate = self.rate.lock().await;
            rate.roll(self.window);
            let count = rate.counts.entry(key).or_insert(0);
            if *count >= self.max_concurrent_ops {
                let current = *count;
                drop(rate);
                let reason = format!(
                    "Rate limit exceeded for '{}' ({} operations in flight, limit {})",
                    operation, current, self.max_concurrent_ops
                );
                self.audit.record(
                    AuditEvent::new(AuditEventType::RateLimitExceeded, operation, caller).denied(&reason),
                );
                return Err(HypervisorError::Permission(reason));
            }
            *count += 1;
            *count
        };

        debug!(operation, user = caller.user_name(), in_flight = count, "Operation authorized");
        self.audit
            .record(AuditEvent::new(AuditEventType::OperationAuthorized, operation, caller));
        Ok(())
    }

    /// Record the start of an authorized operation. Always recorded,
    /// whatever `audit_log` says.
    pub fn record_start(&self, request_id: Uuid, operation: &str, caller: &CallerContext, params: &Value) {
        self.audit.record(
            AuditEvent::new(AuditEventType::OperationStarted, operation, caller)
                .with_request_id(request_id)
                .with_parameters(params),
        );
    }

    /// Release the rate-limit slot and record the outcome.
    pub async fn complete_operation(
        &self,
        request_id: Uuid,
        operation: &str,
        caller: &CallerContext,
        params: &Value,
        summary: Value,
        elapsed: Duration,
    ) {
        {
            let mut rate = self.rate.lock().await;
            if let Some(count) = rate.counts.get_mut(&rate_key(caller.user_name(), operation)) {
                *count = count.saturating_sub(1);
            }
        }

        if !self.audit_enabled {
            return;
        }
        self.audit.record(
            AuditEvent::new(AuditEventType::OperationExecuted, operation, caller)
                .with_request_id(request_id)
                .with_parameters(params)
                .with_result(summary)
                .with_duration(elapsed),
        );
    }

    /// Reject names that are empty, too long, carry control characters
    /// or look like filesystem paths.
    pub fn validate_domain_name(&self, name: &str, caller: &CallerContext) -> Result<()> {
        let invalid = if name.is_empty() {
            Some("Domain name must not be empty".to_string())
        } else if name.chars().count() > MAX_NAME_LEN {
            Some(format!("Domain name exceeds {} characters", MAX_NAME_LEN))
        } else if name
            .chars()
            .any(|c| (c as u32) < 32 && !matches!(c, '\t' | '\n' | '\r'))
        {
            Some("Domain name contains control characters".to_string())
        } else {
            None
        };

        if let Some(reason) = invalid {
            self.audit.record(
                AuditEvent::new(AuditEventType::InvalidDomainName, "validate_domain_name", caller)
                    .denied(&reason),
            );
            return Err(HypervisorError::Operation(reason));
        }

        let lowered = name.to_lowercase();
        if let Some(pattern) = TRAVERSAL_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            let reason = format!("Domain name contains forbidden pattern '{}'", pattern);
            self.audit.record(
                AuditEvent::new(AuditEventType::SuspiciousDomainName, "validate_domain_name", caller)
                    .denied(&reason),
            );
            return Err(HypervisorError::Permission(reason));
        }

        Ok(())
    }

    /// Coarse block-list check on descriptor text. Not a schema check.
    pub fn validate_descriptor(&self, xml: &str, caller: &CallerContext) -> Result<()> {
        if xml.trim().is_empty() {
            return Err(HypervisorError::Operation("Descriptor must not be empty".to_string()));
        }

        if xml.len() > MAX_DESCRIPTOR_BYTES {
            let reason = format!(
                "Descriptor of {} bytes exceeds the {} byte limit",
                xml.len(),
                MAX_DESCRIPTOR_BYTES
            );
            self.audit.record(
                AuditEvent::new(AuditEventType::XmlSizeLimitExceeded, "validate_descriptor", caller)
                    .denied(&reason),
            );
            return Err(HypervisorError::Operation(reason));
        }

        let lowered = xml.to_lowercase();
        if let Some(pattern) = DESCRIPTOR_BLOCKLIST.iter().find(|p| lowered.contains(*p)) {
            let reason = format!("Descriptor contains forbidden content '{}'", pattern);
            self.audit.record(
                AuditEvent::new(AuditEventType::SuspiciousXmlContent, "validate_descriptor", caller)
                    .denied(&reason),
            );
            return Err(HypervisorError::Permission(reason));
        }

        Ok(())
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub async fn summary(&self) -> SecuritySummary {
        let rate = self.rate.lock().await;
        SecuritySummary {
            audit_enabled: self.audit_enabled,
            auth_required: self.auth_required,
            allowed_operations: self.allowed.iter().map(String::from).collect(),
            max_concurrent_ops: self.max_concurrent_ops,
            active_operations: rate.counts.clone(),
            last_reset: rate.last_reset,
            audit_events: self.audit.counts().clone(),
        }
    }
}

/// Copy of `params` with credential-like values replaced, recursively.
pub fn sanitize_parameters(params: &Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    let value = if SENSITIVE_KEYS.iter().any(|s| lowered.contains(s)) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        sanitize_parameters(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_parameters).collect()),
        other => other.clone(),
    }
}

/// Short description of a result for the audit trail.
pub fn summarize_result(result: &Value) -> Value {
    match result {
        Value::Object(map) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), json!("object"));
            for key in ["success", "message"] {
                if let Some(v) = map.get(key) {
                    summary.insert(key.to_string(), v.clone());
                }
            }
            if let Some(Value::Array(items)) = map.get("data") {
                summary.insert("count".to_string(), json!(items.len()));
            }
            Value::Object(summary)
        }
        Value::Array(items) => json!({ "type": "array", "count": items.len() }),
        Value::String(_) => json!({ "type": "string" }),
        Value::Null => json!({ "type": "null" }),
        Value::Bool(_) => json!({ "type": "bool" }),
        Value::Number(_) => json!({ "type": "number" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: u32) -> SecurityGate {
        let config = SecurityConfig {
            max_concurrent_ops: max,
            ..Default::default()
        };
        SecurityGate::new(&config, Arc::new(AllowList::default()))
    }

    fn alice() -> CallerContext {
        CallerContext::new(Some("alice".to_string()), Some("cli".to_string()))
    }

    #[test]
    fn test_domain_names() {
        let gate = gate(10);
        let caller = CallerContext::anonymous();

        for ok in ["test-vm", "vm-123", "production.web.server"] {
            assert!(gate.validate_domain_name(ok, &caller).is_ok(), "{}", ok);
        }

        assert!(gate.validate_domain_name("", &caller).is_err());
        assert!(gate.validate_domain_name(&"a".repeat(300), &caller).is_err());
        assert!(gate.validate_domain_name("bad\0name", &caller).is_err());

        let err = gate.validate_domain_name("../etc/passwd", &caller).unwrap_err();
        assert_eq!(err.kind(), "permission_error");
        assert!(gate.validate_domain_name("C:\\Windows\\system32", &caller).is_err());
    }

    #[test]
    fn test_descriptors() {
        let gate = gate(10);
        let caller = CallerContext::anonymous();

        let minimal = "<domain type='kvm'><name>vm</name><devices><emulator>/usr/bin/qemu-system-x86_64</emulator></devices></domain>";
        assert!(gate.validate_descriptor(minimal, &caller).is_ok());

        assert!(gate.validate_descriptor("", &caller).is_err());
        assert!(gate
            .validate_descriptor("<!DOCTYPE d [<!ENTITY x SYSTEM \"file:///etc/passwd\">]><d>&x;</d>", &caller)
            .is_err());
        assert!(gate.validate_descriptor("<!entity x 'y'>", &caller).is_err());
        assert!(gate
            .validate_descriptor("<disk><source file='http://evil/x.iso'/></disk>", &caller)
            .is_err());

        let huge = format!("<d>{}</d>", "x".repeat(MAX_DESCRIPTOR_BYTES));
        assert!(gate.validate_descriptor(&huge, &caller).is_err());
    }

    #[tokio::test]
    async fn test_allow_list_denies() {
        let gate = gate(10);
        let err = gate.validate_operation("domain.delete", &alice()).await.unwrap_err();
        assert_eq!(err.kind(), "permission_error");
        assert!(gate.summary().await.active_operations.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_n_plus_one() {
        let gate = gate(3);
        let caller = alice();

        for _ in 0..3 {
            gate.validate_operation("domain.list", &caller).await.unwrap();
        }
        let err = gate.validate_operation("domain.list", &caller).await.unwrap_err();
        assert!(err.message().contains("Rate limit"));

        // Other keys are independent
        gate.validate_operation("domain.info", &caller).await.unwrap();
        gate.validate_operation("domain.list", &CallerContext::anonymous()).await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_releases_slot() {
        let gate = gate(1);
        let caller = alice();
        let id = Uuid::new_v4();

        gate.validate_operation("host.info", &caller).await.unwrap();
        assert!(gate.validate_operation("host.info", &caller).await.is_err());

        gate.complete_operation(id, "host.info", &caller, &json!({}), json!(null), Duration::ZERO)
            .await;
        gate.validate_operation("host.info", &caller).await.unwrap();

        // Never below zero
        for _ in 0..3 {
            gate.complete_operation(id, "host.info", &caller, &json!({}), json!(null), Duration::ZERO)
                .await;
        }
        assert_eq!(gate.summary().await.active_operations["alice:host.info"], 0);
    }

    #[tokio::test]
    async fn test_window_reset_clears_all_counters() {
        let gate = gate(1).with_window(Duration::from_millis(50));
        let caller = alice();

        gate.validate_operation("domain.list", &caller).await.unwrap();
        gate.validate_operation("domain.info", &caller).await.unwrap();
        assert!(gate.validate_operation("domain.list", &caller).await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        gate.validate_operation("domain.list", &caller).await.unwrap();

        let summary = gate.summary().await;
        assert_eq!(summary.active_operations.len(), 1);
        assert_eq!(summary.active_operations["alice:domain.list"], 1);
    }

    #[tokio::test]
    async fn test_start_recorded_with_audit_log_disabled() {
        let config = SecurityConfig {
            audit_log: false,
            ..Default::default()
        };
        let gate = SecurityGate::new(&config, Arc::new(AllowList::default()));
        let caller = alice();
        let id = Uuid::new_v4();

        gate.validate_operation("domain.list", &caller).await.unwrap();
        gate.record_start(id, "domain.list", &caller, &json!({}));
        gate.complete_operation(id, "domain.list", &caller, &json!({}), json!([]), Duration::ZERO)
            .await;
        assert!(gate.validate_operation("domain.delete", &caller).await.is_err());

        let audit = gate.audit();
        assert_eq!(audit.recorded(AuditEventType::OperationAuthorized), 1);
        assert_eq!(audit.recorded(AuditEventType::OperationStarted), 1);
        assert_eq!(audit.recorded(AuditEventType::OperationDenied), 1);
        assert_eq!(audit.recorded(AuditEventType::OperationExecuted), 0);

        let summary = gate.summary().await;
        assert_eq!(summary.audit_events[&AuditEventType::OperationStarted], 1);
    }

    #[test]
    fn test_sanitize_parameters() {
        let params = json!({
            "name": "vm1",
            "password": "hunter2",
            "api_token": "abc",
            "nested": { "SecretValue": 1, "disk": "/img/a.qcow2" },
            "list": [{ "auth_header": "x" }]
        });
        let clean = sanitize_parameters(&params);

        assert_eq!(clean["name"], "vm1");
        assert_eq!(clean["password"], "[REDACTED]");
        assert_eq!(clean["api_token"], "[REDACTED]");
        assert_eq!(clean["nested"]["SecretValue"], "[REDACTED]");
        assert_eq!(clean["nested"]["disk"], "/img/a.qcow2");
        assert_eq!(clean["list"][0]["auth_header"], "[REDACTED]");
    }

    #[test]
    fn test_summarize_result() {
        let summary = summarize_result(&json!({"success": true, "message": "ok", "data": [1, 2, 3]}));
        assert_eq!(summary, json!({"type": "object", "success": true, "message": "ok", "count": 3}));

        assert_eq!(summarize_result(&json!([1, 2])), json!({"type": "array", "count": 2}));
        assert_eq!(summarize_result(&json!("xml")), json!({"type": "string"}));
    }

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::new(AuditEventType::RateLimitExceeded, "domain.list", &alice())
            .denied("too many")
            .with_parameters(&json!({"token": "t"}));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "rate_limit_exceeded");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["client"], "cli");
        assert_eq!(value["allowed"], false);
        assert_eq!(value["parameters"]["token"], "[REDACTED]");
        assert!(value.get("duration_ms").is_none());
    }
}
