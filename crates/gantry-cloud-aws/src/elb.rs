//! AWS ELBv2 listener reconciler
//!
//! Listener state is converged in a fixed order: load balancer lookup,
//! target group, target registration, listener, then HTTP/HTTPS rules.
//! Every step describes first and only issues the mutating call when the
//! cloud state drifts from the listener description.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::types::{
    Listener as SdkListener, Rule, TargetHealthDescription, TargetHealthStateEnum,
};
use moka::sync::Cache;
use tracing::{debug, info, warn};

use gantry_api::model::{
    Backend, BackendHealthStatus, HEALTH_STATUS_HEALTHY, HEALTH_STATUS_UNHEALTHY,
    HEALTH_STATUS_UNKNOWN, HealthCheck, Listener, ListenerAttribute, ListenerResult, ListenerRule,
    LoadBalancerObject, PROTOCOL_HTTP, PROTOCOL_HTTPS, TargetGroup,
};
use gantry_cloud::{
    DEFAULT_BATCH_CONCURRENCY, LoadBalance, delete_in_batches, diff_backends, ensure_in_batches,
    expand_segment_listener, segment_listener_ids_joined,
};
use gantry_common::{CloudError, Result, naming};

use crate::aga;
use crate::config::AwsConfig;
use crate::sdk::{AwsSdk, is_accelerator_arn};

/// Load balancer attributes are immutable for our purposes, so entries can
/// live for a very long time
const LB_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const LB_CACHE_CAPACITY: u64 = 10_000;

/// Prefix marking target groups owned by this reconciler
const TG_NAME_PREFIX: &str = "gty";

/// AWS implementation of [`LoadBalance`]
pub struct AwsElb {
    sdk: AwsSdk,
    lb_cache: Cache<String, LoadBalancerObject>,
}

impl AwsElb {
    pub fn new(config: AwsConfig) -> Self {
        Self {
            sdk: AwsSdk::new(config),
            lb_cache: Cache::builder()
                .max_capacity(LB_CACHE_CAPACITY)
                .time_to_live(LB_CACHE_TTL)
                .build(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AwsConfig::from_env())
    }

    async fn describe_cached(
        &self,
        region: &str,
        lb_id: &str,
        name: &str,
    ) -> Result<LoadBalancerObject> {
        let cache_key = format!("{}/{}/{}", region, lb_id, name);
        if let Some(cached) = self.lb_cache.get(&cache_key) {
            return Ok(cached);
        }
        let lb = self.sdk.describe_load_balancer(region, lb_id, name).await?;
        let object = LoadBalancerObject {
            lb_id: lb.load_balancer_arn().unwrap_or_default().to_string(),
            region: region.to_string(),
            name: lb.load_balancer_name().unwrap_or_default().to_string(),
            lb_type: lb.r#type().map(|t| t.as_str().to_string()).unwrap_or_default(),
            vpc_id: lb.vpc_id().unwrap_or_default().to_string(),
            scheme: lb.scheme().map(|s| s.as_str().to_string()).unwrap_or_default(),
            ip_address: None,
            dns_name: lb.dns_name().map(String::from),
        };
        self.lb_cache.insert(cache_key, object.clone());
        Ok(object)
    }

    /// Converge one target group and its membership, returning the ARN
    #[allow(clippy::too_many_arguments)]
    async fn ensure_target_group(
        &self,
        region: &str,
        name: &str,
        vpc_id: &str,
        desired: &TargetGroup,
        health_check: Option<&HealthCheck>,
        tg_port: i32,
    ) -> Result<String> {
        let tg_arn = match self.sdk.describe_target_group(region, name).await? {
            Some(existing) => {
                let arn = existing.target_group_arn().unwrap_or_default().to_string();
                let existing_protocol = existing
                    .protocol()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                if !existing_protocol.eq_ignore_ascii_case(&desired.protocol) {
                    // Target group protocol cannot be modified in place
                    info!(
                        "target group {} protocol changed {} -> {}, recreating",
                        name, existing_protocol, desired.protocol
                    );
                    self.sdk.delete_target_group(region, &arn).await?;
                    self.sdk
                        .create_target_group(region, name, &desired.protocol, tg_port, vpc_id, health_check)
                        .await?
                } else {
                    if let Some(hc) = health_check {
                        self.sdk.modify_target_group_health(region, &arn, hc).await?;
                    }
                    arn
                }
            }
            None => {
                self.sdk
                    .create_target_group(region, name, &desired.protocol, tg_port, vpc_id, health_check)
                    .await?
            }
        };

        let registered = registered_backends(&self.sdk.describe_target_health(region, &tg_arn).await?);
        let (to_add, to_del) = diff_backends(&registered, &desired.backends);
        debug!(
            "target group {}: {} to register, {} to deregister",
            name,
            to_add.len(),
            to_del.len()
        );
        self.sdk.register_targets(region, &tg_arn, &to_add).await?;
        self.sdk.deregister_targets(region, &tg_arn, &to_del).await?;
        Ok(tg_arn)
    }

    async fn apply_stickiness(
        &self,
        region: &str,
        tg_arn: &str,
        layer7: bool,
        attribute: &ListenerAttribute,
    ) -> Result<()> {
        if attribute.session_time <= 0 {
            return Ok(());
        }
        let mut attrs = vec![("stickiness.enabled".to_string(), "true".to_string())];
        if layer7 {
            attrs.push(("stickiness.type".to_string(), "lb_cookie".to_string()));
            attrs.push((
                "stickiness.lb_cookie.duration_seconds".to_string(),
                attribute.session_time.to_string(),
            ));
        } else {
            attrs.push(("stickiness.type".to_string(), "source_ip".to_string()));
        }
        self.sdk
            .modify_target_group_attributes(region, tg_arn, &attrs)
            .await
    }

    async fn ensure_plain_listener(&self, region: &str, listener: &Listener) -> Result<String> {
        let target_group = listener.spec.target_group.as_ref().ok_or_else(|| {
            CloudError::Validation(format!("listener '{}' has no target group", listener.key()))
        })?;
        let lb = self
            .describe_cached(region, &listener.spec.loadbalancer_id, "")
            .await?;

        let tg_name = listener_target_group_name(listener);
        let health_check = listener
            .spec
            .listener_attribute
            .as_ref()
            .and_then(|a| a.health_check.as_ref());
        let tg_port = target_group
            .backends
            .first()
            .map(|b| b.port)
            .unwrap_or(listener.spec.port);
        let tg_arn = self
            .ensure_target_group(region, &tg_name, &lb.vpc_id, target_group, health_check, tg_port)
            .await?;

        if let Some(attribute) = &listener.spec.listener_attribute {
            self.apply_stickiness(region, &tg_arn, listener.is_layer7(), attribute)
                .await?;
        }

        let existing = self.sdk.describe_listeners(region, &lb.lb_id).await?;
        let listener_arn = match existing.iter().find(|l| l.port() == Some(listener.spec.port)) {
            Some(found) => {
                let arn = found.listener_arn().unwrap_or_default().to_string();
                self.sdk
                    .modify_listener(
                        region,
                        &arn,
                        &listener.spec.protocol,
                        listener.spec.certificate.as_ref(),
                        &tg_arn,
                    )
                    .await?;
                arn
            }
            None => {
                self.sdk
                    .create_listener(
                        region,
                        &lb.lb_id,
                        listener.spec.port,
                        &listener.spec.protocol,
                        listener.spec.certificate.as_ref(),
                        &tg_arn,
                    )
                    .await?
            }
        };

        if listener.is_layer7() {
            self.ensure_rules(region, listener, &listener_arn, &lb.vpc_id).await?;
        }
        info!("listener '{}' ensured as {}", listener.key(), listener_arn);
        Ok(listener_arn)
    }

    async fn ensure_rules(
        &self,
        region: &str,
        listener: &Listener,
        listener_arn: &str,
        vpc_id: &str,
    ) -> Result<()> {
        let existing = self.sdk.describe_rules(region, listener_arn).await?;
        let changes = classify_rules(&existing, &listener.spec.rules);
        debug!(
            "listener '{}' rules: {} add, {} modify, {} delete",
            listener.key(),
            changes.adds.len(),
            changes.modifies.len(),
            changes.deletes.len()
        );

        let mut priority = max_priority(&existing);
        for want in &changes.adds {
            let tg_arn = self
                .ensure_rule_target_group(region, listener, want, vpc_id)
                .await?;
            priority += 1;
            self.sdk
                .create_rule(region, listener_arn, priority, &want.domain, &want.path, &tg_arn)
                .await?;
        }

        for (rule, want) in &changes.modifies {
            let tg_arn = self
                .ensure_rule_target_group(region, listener, want, vpc_id)
                .await?;
            let current = rule
                .actions()
                .iter()
                .filter_map(|a| a.target_group_arn())
                .next();
            if current != Some(tg_arn.as_str()) {
                self.sdk
                    .modify_rule(region, rule.rule_arn().unwrap_or_default(), &tg_arn)
                    .await?;
            }
        }

        // Deletes go last so live traffic always has a matching rule
        for rule in &changes.deletes {
            let tg_arns: Vec<String> = rule
                .actions()
                .iter()
                .filter_map(|a| a.target_group_arn())
                .map(String::from)
                .collect();
            self.sdk
                .delete_rule(region, rule.rule_arn().unwrap_or_default())
                .await?;
            for arn in tg_arns {
                if is_owned_target_group(&arn) {
                    self.sdk.delete_target_group(region, &arn).await?;
                }
            }
        }
        Ok(())
    }

    async fn ensure_rule_target_group(
        &self,
        region: &str,
        listener: &Listener,
        rule: &ListenerRule,
        vpc_id: &str,
    ) -> Result<String> {
        let target_group = rule.target_group.as_ref().ok_or_else(|| {
            CloudError::Validation(format!(
                "rule '{}' of listener '{}' has no target group",
                rule.key(),
                listener.key()
            ))
        })?;
        let health_check = rule
            .listener_attribute
            .as_ref()
            .and_then(|a| a.health_check.as_ref());
        let tg_port = target_group
            .backends
            .first()
            .map(|b| b.port)
            .unwrap_or(listener.spec.port);
        let name = rule_target_group_name(listener, rule);
        self.ensure_target_group(region, &name, vpc_id, target_group, health_check, tg_port)
            .await
    }

    async fn delete_plain_listener(&self, region: &str, listener: &Listener) -> Result<()> {
        let existing = match self
            .sdk
            .describe_listeners(region, &listener.spec.loadbalancer_id)
            .await
        {
            Ok(listeners) => listeners,
            Err(err) if err.is_not_found() => {
                warn!(
                    "load balancer {} already gone while deleting listener '{}'",
                    listener.spec.loadbalancer_id,
                    listener.key()
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Some(found) = existing.iter().find(|l| l.port() == Some(listener.spec.port)) else {
            warn!(
                "listener '{}' not found on {}, nothing to delete",
                listener.key(),
                listener.spec.loadbalancer_id
            );
            return Ok(());
        };
        let listener_arn = found.listener_arn().unwrap_or_default().to_string();

        let mut tg_arns: Vec<String> = found
            .default_actions()
            .iter()
            .filter_map(|a| a.target_group_arn())
            .map(String::from)
            .collect();
        if is_layer7_listener(found) {
            for rule in self.sdk.describe_rules(region, &listener_arn).await? {
                tg_arns.extend(
                    rule.actions()
                        .iter()
                        .filter_map(|a| a.target_group_arn())
                        .map(String::from),
                );
            }
        }
        tg_arns.sort();
        tg_arns.dedup();

        // Listener first: rules cascade and target groups become unreferenced
        self.sdk.delete_listener(region, &listener_arn).await?;
        for arn in &tg_arns {
            if is_owned_target_group(arn) {
                self.sdk.delete_target_group(region, arn).await?;
            }
        }
        info!("listener '{}' deleted from {}", listener.key(), listener.spec.loadbalancer_id);
        Ok(())
    }

    async fn backend_status_for_lb(
        &self,
        region: &str,
        lb_id: &str,
    ) -> Result<Vec<BackendHealthStatus>> {
        let mut statuses = Vec::new();
        for sdk_listener in self.sdk.describe_listeners(region, lb_id).await? {
            let listener_port = sdk_listener.port().unwrap_or_default();
            let protocol = sdk_listener
                .protocol()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            let listener_arn = sdk_listener.listener_arn().unwrap_or_default();

            let mut tg_arns: Vec<String> = sdk_listener
                .default_actions()
                .iter()
                .filter_map(|a| a.target_group_arn())
                .map(String::from)
                .collect();
            if is_layer7_listener(&sdk_listener) {
                for rule in self.sdk.describe_rules(region, listener_arn).await? {
                    tg_arns.extend(
                        rule.actions()
                            .iter()
                            .filter_map(|a| a.target_group_arn())
                            .map(String::from),
                    );
                }
            }
            tg_arns.sort();
            tg_arns.dedup();

            for tg_arn in &tg_arns {
                for description in self.sdk.describe_target_health(region, tg_arn).await? {
                    let Some(target) = description.target() else { continue };
                    let (healthy, status) = normalize_state(&description);
                    statuses.push(BackendHealthStatus {
                        ip: target.id().unwrap_or_default().to_string(),
                        port: target.port().unwrap_or_default(),
                        protocol: protocol.clone(),
                        listener_port,
                        healthy,
                        status,
                        target_group_name: target_group_name_from_arn(tg_arn),
                    });
                }
            }
        }
        Ok(statuses)
    }
}

#[async_trait]
impl LoadBalance for AwsElb {
    async fn describe_load_balancer(
        &self,
        region: &str,
        lb_id: &str,
        name: &str,
    ) -> Result<LoadBalancerObject> {
        if is_accelerator_arn(lb_id) {
            let accelerator = self.sdk.describe_custom_routing_accelerator(lb_id).await?;
            return Ok(LoadBalancerObject {
                lb_id: lb_id.to_string(),
                region: region.to_string(),
                name: accelerator.name().unwrap_or_default().to_string(),
                lb_type: "accelerator".to_string(),
                dns_name: accelerator.dns_name().map(String::from),
                ..Default::default()
            });
        }
        self.describe_cached(region, lb_id, name).await
    }

    async fn ensure_listener(&self, region: &str, listener: &Listener) -> Result<String> {
        if listener.is_segment() {
            return self.ensure_segment_listener(region, listener).await;
        }
        self.ensure_plain_listener(region, listener).await
    }

    async fn delete_listener(&self, region: &str, listener: &Listener) -> Result<()> {
        if listener.is_segment() {
            return self.delete_segment_listener(region, listener).await;
        }
        self.delete_plain_listener(region, listener).await
    }

    async fn ensure_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(ensure_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.ensure_listener(region, &listener).await
        })
        .await)
    }

    async fn delete_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(delete_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.delete_listener(region, &listener).await
        })
        .await)
    }

    async fn ensure_segment_listener(&self, region: &str, listener: &Listener) -> Result<String> {
        if is_accelerator_arn(&listener.spec.loadbalancer_id) {
            return aga::ensure_custom_routing(
                &self.sdk,
                region,
                &listener.spec.loadbalancer_id,
                listener,
            )
            .await;
        }
        if !listener.is_segment() {
            return self.ensure_plain_listener(region, listener).await;
        }
        let expanded = expand_segment_listener(listener);
        let results = self.ensure_multi_listeners(region, &expanded).await?;
        segment_listener_ids_joined(listener, &results)
    }

    async fn ensure_multi_segment_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(ensure_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.ensure_segment_listener(region, &listener).await
        })
        .await)
    }

    async fn delete_segment_listener(&self, region: &str, listener: &Listener) -> Result<()> {
        if is_accelerator_arn(&listener.spec.loadbalancer_id) {
            return aga::delete_custom_routing(&self.sdk, &listener.spec.loadbalancer_id, listener)
                .await;
        }
        if !listener.is_segment() {
            return self.delete_plain_listener(region, listener).await;
        }
        let expanded = expand_segment_listener(listener);
        let results = self.delete_multi_listeners(region, &expanded).await?;
        for (name, result) in &results {
            if result.is_error {
                return Err(CloudError::Operation {
                    name: name.clone(),
                    message: result.message.clone(),
                });
            }
        }
        Ok(())
    }

    async fn describe_backend_status(
        &self,
        region: &str,
        _namespace: &str,
        lb_ids: &[String],
    ) -> Result<HashMap<String, Vec<BackendHealthStatus>>> {
        let mut result = HashMap::new();
        for lb_id in lb_ids {
            let statuses = self.backend_status_for_lb(region, lb_id).await?;
            result.insert(lb_id.clone(), statuses);
        }
        Ok(result)
    }
}

/// Deterministic name for a listener-level target group
fn listener_target_group_name(listener: &Listener) -> String {
    target_group_name(&format!("{}/{}", listener.key(), listener.spec.port))
}

/// Deterministic name for a rule-level target group
fn rule_target_group_name(listener: &Listener, rule: &ListenerRule) -> String {
    target_group_name(&format!(
        "{}/{}/{}/{}",
        listener.key(),
        rule.domain,
        rule.path,
        listener.spec.port
    ))
}

fn target_group_name(key: &str) -> String {
    format!("{}-{}", TG_NAME_PREFIX, &naming::md5_hex(key)[..24])
}

fn is_owned_target_group(arn: &str) -> bool {
    arn.contains(&format!("targetgroup/{}-", TG_NAME_PREFIX))
}

fn target_group_name_from_arn(arn: &str) -> Option<String> {
    arn.split('/').nth(1).map(String::from)
}

fn is_layer7_listener(listener: &SdkListener) -> bool {
    listener
        .protocol()
        .map(|p| {
            let protocol = p.as_str();
            protocol == PROTOCOL_HTTP || protocol == PROTOCOL_HTTPS
        })
        .unwrap_or(false)
}

fn registered_backends(descriptions: &[TargetHealthDescription]) -> Vec<Backend> {
    descriptions
        .iter()
        .filter_map(|d| d.target())
        .filter_map(|t| {
            let ip = t.id()?.to_string();
            let port = t.port()?;
            Some(Backend::new(ip, port))
        })
        .collect()
}

fn normalize_state(description: &TargetHealthDescription) -> (bool, String) {
    match description.target_health().and_then(|h| h.state()) {
        Some(TargetHealthStateEnum::Healthy) => (true, HEALTH_STATUS_HEALTHY.to_string()),
        Some(TargetHealthStateEnum::Unhealthy) => (false, HEALTH_STATUS_UNHEALTHY.to_string()),
        _ => (false, HEALTH_STATUS_UNKNOWN.to_string()),
    }
}

/// Values of one condition field, merged across the plain and config forms
fn condition_values<'a>(rule: &'a Rule, field: &str) -> Vec<&'a str> {
    let mut values = Vec::new();
    for condition in rule.conditions() {
        if condition.field() != Some(field) {
            continue;
        }
        values.extend(condition.values().iter().map(|v| v.as_str()));
        if field == "host-header" {
            if let Some(config) = condition.host_header_config() {
                values.extend(config.values().iter().map(|v| v.as_str()));
            }
        }
        if field == "path-pattern" {
            if let Some(config) = condition.path_pattern_config() {
                values.extend(config.values().iter().map(|v| v.as_str()));
            }
        }
    }
    values.sort_unstable();
    values.dedup();
    values
}

/// Order-independent condition equality between a cloud rule and a desired
/// rule
fn is_same_rule_condition(rule: &Rule, desired: &ListenerRule) -> bool {
    let hosts = condition_values(rule, "host-header");
    let paths = condition_values(rule, "path-pattern");
    let want_hosts: Vec<&str> = if desired.domain.is_empty() {
        Vec::new()
    } else {
        vec![desired.domain.as_str()]
    };
    let want_paths: Vec<&str> = if desired.path.is_empty() {
        Vec::new()
    } else {
        vec![desired.path.as_str()]
    };
    hosts == want_hosts && paths == want_paths
}

fn is_default_rule(rule: &Rule) -> bool {
    rule.priority() == Some("default")
}

fn max_priority(existing: &[Rule]) -> i32 {
    existing
        .iter()
        .filter_map(|r| r.priority().and_then(|p| p.parse::<i32>().ok()))
        .max()
        .unwrap_or(0)
}

pub(crate) struct RuleChanges {
    pub adds: Vec<ListenerRule>,
    pub modifies: Vec<(Rule, ListenerRule)>,
    pub deletes: Vec<Rule>,
}

/// Partition cloud rules against the desired rules by condition equality
pub(crate) fn classify_rules(existing: &[Rule], desired: &[ListenerRule]) -> RuleChanges {
    let mut changes = RuleChanges {
        adds: Vec::new(),
        modifies: Vec::new(),
        deletes: Vec::new(),
    };
    for want in desired {
        match existing
            .iter()
            .find(|r| !is_default_rule(r) && is_same_rule_condition(r, want))
        {
            Some(rule) => changes.modifies.push((rule.clone(), want.clone())),
            None => changes.adds.push(want.clone()),
        }
    }
    for rule in existing {
        if is_default_rule(rule) {
            continue;
        }
        if !desired.iter().any(|want| is_same_rule_condition(rule, want)) {
            changes.deletes.push(rule.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use aws_sdk_elasticloadbalancingv2::types::RuleCondition;
    use proptest::prelude::*;

    use super::*;

    fn sdk_rule(arn: &str, priority: &str, domain: &str, path: &str) -> Rule {
        let mut builder = Rule::builder().rule_arn(arn).priority(priority);
        if !domain.is_empty() {
            builder = builder.conditions(
                RuleCondition::builder()
                    .field("host-header")
                    .values(domain)
                    .build(),
            );
        }
        if !path.is_empty() {
            builder = builder.conditions(
                RuleCondition::builder()
                    .field("path-pattern")
                    .values(path)
                    .build(),
            );
        }
        builder.build()
    }

    fn desired_rule(domain: &str, path: &str) -> ListenerRule {
        ListenerRule {
            domain: domain.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_rules_partition() {
        let existing = vec![
            sdk_rule("arn-1", "1", "a.example.com", "/api"),
            sdk_rule("arn-2", "2", "b.example.com", "/"),
            sdk_rule("arn-default", "default", "", ""),
        ];
        let desired = vec![
            desired_rule("a.example.com", "/api"),
            desired_rule("c.example.com", "/new"),
        ];

        let changes = classify_rules(&existing, &desired);
        assert_eq!(changes.adds.len(), 1);
        assert_eq!(changes.adds[0].domain, "c.example.com");
        assert_eq!(changes.modifies.len(), 1);
        assert_eq!(changes.modifies[0].0.rule_arn(), Some("arn-1"));
        assert_eq!(changes.deletes.len(), 1);
        assert_eq!(changes.deletes[0].rule_arn(), Some("arn-2"));
    }

    #[test]
    fn test_condition_match_is_order_independent() {
        let rule = Rule::builder()
            .rule_arn("arn-1")
            .priority("1")
            .conditions(
                RuleCondition::builder()
                    .field("path-pattern")
                    .values("/api")
                    .build(),
            )
            .conditions(
                RuleCondition::builder()
                    .field("host-header")
                    .values("a.example.com")
                    .build(),
            )
            .build();

        assert!(is_same_rule_condition(&rule, &desired_rule("a.example.com", "/api")));
        assert!(!is_same_rule_condition(&rule, &desired_rule("a.example.com", "/other")));
    }

    #[test]
    fn test_max_priority_skips_default() {
        let existing = vec![
            sdk_rule("arn-1", "7", "a.example.com", "/"),
            sdk_rule("arn-2", "3", "b.example.com", "/"),
            sdk_rule("arn-default", "default", "", ""),
        ];
        assert_eq!(max_priority(&existing), 7);
        assert_eq!(max_priority(&[]), 0);
    }

    #[test]
    fn test_target_group_names_are_deterministic_and_bounded() {
        let listener = Listener::new(
            "a-fairly-long-listener-name".to_string(),
            "production-namespace".to_string(),
            Default::default(),
        );
        let name_a = listener_target_group_name(&listener);
        let name_b = listener_target_group_name(&listener);
        assert_eq!(name_a, name_b);
        assert!(name_a.len() <= 32);
        assert!(name_a.starts_with("gty-"));

        let rule = desired_rule("example.com", "/api");
        let rule_name = rule_target_group_name(&listener, &rule);
        assert_ne!(rule_name, name_a);
        assert!(rule_name.len() <= 32);
    }

    #[test]
    fn test_owned_target_group_guard() {
        assert!(is_owned_target_group(
            "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/gty-abc123/9f"
        ));
        assert!(!is_owned_target_group(
            "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/user-made/9f"
        ));
    }

    fn rule_key(rule: &Rule) -> (String, String) {
        let host = condition_values(rule, "host-header")
            .first()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let path = condition_values(rule, "path-pattern")
            .first()
            .map(|s| s.to_string())
            .unwrap_or_default();
        (host, path)
    }

    proptest! {
        #[test]
        fn prop_rule_diff_partitions_existing_and_desired(
            existing_keys in prop::collection::hash_set((0..4usize, 0..4usize), 0..10),
            desired_keys in prop::collection::hash_set((0..4usize, 0..4usize), 0..10),
        ) {
            let domains = ["a.example.com", "b.example.com", "c.example.com", "d.example.com"];
            let paths = ["/", "/api", "/static", "/ws"];

            let existing: Vec<Rule> = existing_keys
                .iter()
                .enumerate()
                .map(|(i, (d, p))| sdk_rule(&format!("arn-{}", i), &(i + 1).to_string(), domains[*d], paths[*p]))
                .collect();
            let desired: Vec<ListenerRule> = desired_keys
                .iter()
                .map(|(d, p)| desired_rule(domains[*d], paths[*p]))
                .collect();

            let changes = classify_rules(&existing, &desired);

            let e_keys: HashSet<(String, String)> = existing_keys
                .iter()
                .map(|(d, p)| (domains[*d].to_string(), paths[*p].to_string()))
                .collect();
            let d_keys: HashSet<(String, String)> = desired_keys
                .iter()
                .map(|(d, p)| (domains[*d].to_string(), paths[*p].to_string()))
                .collect();

            let add_keys: HashSet<(String, String)> = changes
                .adds
                .iter()
                .map(|r| (r.domain.clone(), r.path.clone()))
                .collect();
            let modify_keys: HashSet<(String, String)> =
                changes.modifies.iter().map(|(r, _)| rule_key(r)).collect();
            let del_keys: HashSet<(String, String)> =
                changes.deletes.iter().map(rule_key).collect();

            let expected_adds: HashSet<_> = d_keys.difference(&e_keys).cloned().collect();
            let expected_dels: HashSet<_> = e_keys.difference(&d_keys).cloned().collect();
            let expected_mods: HashSet<_> = d_keys.intersection(&e_keys).cloned().collect();

            prop_assert_eq!(add_keys, expected_adds);
            prop_assert_eq!(del_keys, expected_dels);
            prop_assert_eq!(modify_keys, expected_mods);
        }
    }
}
