use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use std::sync::Arc;

use super::decode::normalize;
use super::patterns::{classify, is_bad_bot};
use crate::config::WafConfig;
use crate::context::RequestContext;
use crate::models::{IpBlacklistEntry, ThreatKind, WafLogEntry};
use crate::services::{AuditContext, AuditLogger, StoreError, WafStore};

/// Tracing target for firewall decisions.
pub const WAF_TARGET: &str = "waf";

/// One externally controlled string and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanInput {
    /// e.g. `uri`, `get:page`, `post:comment`, `header:referer`, `cookie:theme`
    pub source: String,
    pub value: String,
}

impl ScanInput {
    pub fn new(source: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub threat: ThreatKind,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block {
        threat: ThreatKind,
        source: String,
        /// Incident correlator shown to the client.
        reference: String,
    },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Block { .. })
    }
}

#[derive(Clone)]
pub struct Firewall {
    store: Arc<dyn WafStore>,
    audit: AuditLogger,
    config: WafConfig,
}

impl Firewall {
    pub fn new(store: Arc<dyn WafStore>, audit: AuditLogger, config: WafConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &WafConfig {
        &self.config
    }

    /// Pure pattern check. The User-Agent tool list runs first, then every
    /// input is decoded once and tested against the families in order. The
    /// first hit wins.
    pub fn scan(inputs: &[ScanInput], user_agent: Option<&str>) -> Option<Detection> {
        if let Some(ua) = user_agent.filter(|ua| is_bad_bot(ua)) {
            tracing::debug!(target: WAF_TARGET, user_agent = ua, "Scanner user agent");
            return Some(Detection {
                threat: ThreatKind::BadBot,
                source: "user_agent".to_string(),
            });
        }

        inputs.iter().find_map(|input| {
            classify(&normalize(&input.value)).map(|threat| Detection {
                threat,
                source: input.source.clone(),
            })
        })
    }

    pub async fn inspect(&self, ctx: &RequestContext, inputs: &[ScanInput]) -> Verdict {
        self.inspect_at(ctx, inputs, Utc::now()).await
    }

    pub async fn inspect_at(
        &self,
        ctx: &RequestContext,
        inputs: &[ScanInput],
        now: DateTime<Utc>,
    ) -> Verdict {
        if !self.config.enabled {
            return Verdict::Allow;
        }

        match self.store.is_blacklisted(&ctx.ip_address, now).await {
            Ok(true) => {
                let reference = reference_code(now, &ctx.ip_address);
                tracing::warn!(
                    target: WAF_TARGET,
                    ip = %ctx.ip_address,
                    uri = %ctx.uri,
                    reference = %reference,
                    "Request from blacklisted IP"
                );
                return Verdict::Block {
                    threat: ThreatKind::Blacklisted,
                    source: "ip".to_string(),
                    reference,
                };
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(target: WAF_TARGET, error = %e, "Blacklist lookup failed");
            }
        }

        let Some(detection) = Self::scan(inputs, ctx.user_agent.as_deref()) else {
            return Verdict::Allow;
        };

        let reference = reference_code(now, &ctx.ip_address);
        self.record_block(ctx, &detection, &reference, now).await;

        Verdict::Block {
            threat: detection.threat,
            source: detection.source,
            reference,
        }
    }

    async fn record_block(
        &self,
        ctx: &RequestContext,
        detection: &Detection,
        reference: &str,
        now: DateTime<Utc>,
    ) {
        tracing::warn!(
            target: WAF_TARGET,
            threat = detection.threat.as_str(),
            source = %detection.source,
            ip = %ctx.ip_address,
            uri = %ctx.uri,
            method = %ctx.method,
            reference,
            "Request blocked"
        );

        let entry = WafLogEntry {
            threat: detection.threat,
            source: detection.source.clone(),
            ip_address: ctx.ip_address.clone(),
            uri: ctx.uri.clone(),
            method: ctx.method.clone(),
            created_at: now,
        };
        if let Err(e) = self.store.record_event(&entry).await {
            tracing::error!(target: WAF_TARGET, error = %e, "Failed to record firewall event");
        }

        self.audit
            .waf_block(
                &AuditContext::new(ctx.clone()),
                detection.threat,
                &detection.source,
                reference,
            )
            .await;

        self.maybe_auto_blacklist(&ctx.ip_address, now).await;
    }

    async fn maybe_auto_blacklist(&self, ip: &str, now: DateTime<Utc>) {
        let threshold = self.config.auto_blacklist_threshold;
        if threshold == 0 {
            return;
        }

        let count = match self
            .store
            .count_recent_events(ip, now - Duration::hours(1))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(target: WAF_TARGET, error = %e, "Failed to count firewall events");
                return;
            }
        };

        if count >= threshold {
            let entry = IpBlacklistEntry {
                ip_address: ip.to_string(),
                reason: format!("{} blocked requests within an hour", count),
                expires_at: Some(now + Duration::minutes(self.config.blacklist_minutes)),
                created_at: now,
            };
            match self.store.blacklist(&entry).await {
                Ok(()) => tracing::warn!(target: WAF_TARGET, ip, count, "IP blacklisted"),
                Err(e) => tracing::error!(target: WAF_TARGET, error = %e, "Failed to blacklist IP"),
            }
        }
    }

    /// Operator blacklist; `None` duration is permanent.
    pub async fn blacklist_ip(
        &self,
        ip: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .blacklist(&IpBlacklistEntry {
                ip_address: ip.to_string(),
                reason: reason.to_string(),
                expires_at: duration.map(|d| now + d),
                created_at: now,
            })
            .await
    }

    pub async fn purge_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.purge_expired_blacklist(now).await
    }
}

/// First 8 hex characters of MD5(timestamp + ip). An incident correlator for
/// support requests, not a secret.
pub fn reference_code(now: DateTime<Utc>, ip: &str) -> String {
    let digest = Md5::digest(format!("{}{}", now.timestamp(), ip).as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;

    fn firewall(config: WafConfig) -> (Arc<MemoryStore>, Firewall) {
        let store = Arc::new(MemoryStore::new());
        let firewall = Firewall::new(store.clone(), AuditLogger::new(store.clone()), config);
        (store, firewall)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            ip_address: "203.0.113.50".to_string(),
            user_agent: Some("Mozilla/5.0".to_string()),
            uri: "/pages".to_string(),
            method: "POST".to_string(),
            request_id: None,
        }
    }

    #[test]
    fn test_first_hit_wins() {
        let inputs = vec![
            ScanInput::new("uri", "/pages"),
            ScanInput::new("post:title", "%3Cscript%3Ealert(1)%3C/script%3E"),
            ScanInput::new("post:path", "../../etc/passwd"),
        ];
        let detection = Firewall::scan(&inputs, Some("Mozilla/5.0")).unwrap();
        assert_eq!(detection.threat, ThreatKind::Xss);
        assert_eq!(detection.source, "post:title");
    }

    #[test]
    fn test_bad_bot_checked_first() {
        let inputs = vec![ScanInput::new("uri", "/")];
        let detection = Firewall::scan(&inputs, Some("sqlmap/1.7")).unwrap();
        assert_eq!(detection.threat, ThreatKind::BadBot);
    }

    #[test]
    fn test_reference_code_is_short_hex() {
        let code = reference_code(Utc::now(), "203.0.113.50");
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_reference_code_is_md5_of_timestamp_and_ip() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(reference_code(now, "203.0.113.50"), "a9e3c3b1");
    }

    #[tokio::test]
    async fn test_block_is_logged_and_audited() {
        let (store, firewall) = firewall(WafConfig::default());
        let inputs = vec![ScanInput::new("get:q", "1 union select password from users")];

        let verdict = firewall.inspect(&ctx(), &inputs).await;
        assert!(verdict.is_blocked());

        let events = store.waf_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].threat, ThreatKind::SqlInjection);
        assert_eq!(events[0].source, "get:q");

        let audit = AuditLogger::new(store.clone()).recent(5).await.unwrap();
        assert_eq!(audit[0].event_type, "waf_block");
    }

    #[tokio::test]
    async fn test_storage_failure_still_blocks() {
        let (store, firewall) = firewall(WafConfig::default());
        store.set_unavailable(true);
        let inputs = vec![ScanInput::new("get:q", "<script>")];
        assert!(firewall.inspect(&ctx(), &inputs).await.is_blocked());
    }

    #[tokio::test]
    async fn test_auto_blacklist_after_threshold() {
        let (_, firewall) = firewall(WafConfig {
            auto_blacklist_threshold: 2,
            ..WafConfig::default()
        });
        let now = Utc::now();
        let bad = vec![ScanInput::new("get:q", "<script>")];
        let clean = vec![ScanInput::new("uri", "/")];

        firewall.inspect_at(&ctx(), &bad, now).await;
        assert_eq!(firewall.inspect_at(&ctx(), &clean, now).await, Verdict::Allow);

        firewall.inspect_at(&ctx(), &bad, now).await;
        let verdict = firewall.inspect_at(&ctx(), &clean, now).await;
        assert!(matches!(
            verdict,
            Verdict::Block { threat: ThreatKind::Blacklisted, .. }
        ));

        let later = now + Duration::minutes(61);
        assert_eq!(firewall.purge_expired_blacklist(later).await.unwrap(), 1);
        assert_eq!(firewall.inspect_at(&ctx(), &clean, later).await, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_disabled_allows_everything() {
        let (_, firewall) = firewall(WafConfig {
            enabled: false,
            ..WafConfig::default()
        });
        let inputs = vec![ScanInput::new("uri", "../../etc/passwd")];
        assert_eq!(firewall.inspect(&ctx(), &inputs).await, Verdict::Allow);
    }
}
