//! Rate limited, metered wrappers around the AWS SDK clients
//!
//! Every cloud call goes through this layer: take a token from the bucket,
//! time the call, classify the error. Retries stay inside the SDK's
//! standard retry mode; nothing above this layer retries on its own.

use aws_config::{BehaviorVersion, Region, retry::RetryConfig};
use aws_sdk_elasticloadbalancingv2 as elbv2;
use aws_sdk_elasticloadbalancingv2::config::Credentials;
use aws_sdk_elasticloadbalancingv2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, Certificate, Listener, LoadBalancer, Matcher, ProtocolEnum, Rule,
    RuleCondition, TargetDescription, TargetGroup, TargetGroupAttribute, TargetHealthDescription,
    TargetTypeEnum,
};
use aws_sdk_globalaccelerator as aga;
use aws_sdk_globalaccelerator::types::{
    CustomRoutingDestinationConfiguration, CustomRoutingEndpointGroup, CustomRoutingListener,
    CustomRoutingProtocol, PortRange,
};
use dashmap::DashMap;
use tracing::debug;

use gantry_api::model::{AgaMappingInfo, Backend, HealthCheck, PROTOCOL_UDP};
use gantry_common::metrics::{ApiTimer, CloudMetrics};
use gantry_common::{CloudError, RateLimiter, Result};

use crate::config::AwsConfig;

/// Global Accelerator is a global service with a fixed API region
pub const GLOBAL_ACCELERATOR_REGION: &str = "us-west-2";

const CLOUD_LABEL: &str = "aws";

/// Map a listener protocol string onto the SDK enum
pub fn protocol_enum(protocol: &str) -> ProtocolEnum {
    ProtocolEnum::from(protocol.to_uppercase().as_str())
}

/// Whether the load balancer id points at a Global Accelerator
pub fn is_accelerator_arn(lb_id: &str) -> bool {
    lb_id.starts_with("arn:") && lb_id.contains(":globalaccelerator:")
}

fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            CloudError::Network(format!("{} could not reach AWS: {}", operation, err))
        }
        _ => {
            let code = err.code().unwrap_or("Unknown");
            let message = err.message().unwrap_or("no message");
            if code.contains("NotFound") {
                CloudError::ResourceNotFound {
                    kind: code.trim_end_matches("NotFound").to_string(),
                    name: message.to_string(),
                }
            } else if code.contains("Throttling") || code.contains("TooManyRequests") {
                CloudError::Retryable(format!("{}: {}", code, message))
            } else {
                CloudError::Operation {
                    name: operation.to_string(),
                    message: format!("{}: {}", code, message),
                }
            }
        }
    }
}

fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.code().is_some_and(|code| code.contains("NotFound"))
}

fn build_error(what: &str, err: impl std::fmt::Display) -> CloudError {
    CloudError::Other(anyhow::anyhow!("building {} failed: {}", what, err))
}

/// Shared AWS clients plus the cross-cutting call plumbing
pub struct AwsSdk {
    config: AwsConfig,
    limiter: RateLimiter,
    metrics: &'static CloudMetrics,
    elb_clients: DashMap<String, elbv2::Client>,
    aga_clients: DashMap<String, aga::Client>,
}

impl AwsSdk {
    pub fn new(config: AwsConfig) -> Self {
        let limiter = RateLimiter::new(config.ratelimit_bucket_size, config.ratelimit_qps as f64);
        Self {
            config,
            limiter,
            metrics: gantry_common::metrics::global(),
            elb_clients: DashMap::new(),
            aga_clients: DashMap::new(),
        }
    }

    async fn sdk_config(&self, region: &str) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .retry_config(RetryConfig::standard().with_max_attempts(self.config.max_attempts));
        if self.config.has_static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                self.config.access_key_id.clone(),
                self.config.secret_access_key.clone(),
                None,
                None,
                "gantry",
            ));
        }
        loader.load().await
    }

    async fn elb(&self, region: &str) -> elbv2::Client {
        if let Some(client) = self.elb_clients.get(region) {
            return client.clone();
        }
        debug!("creating ELBv2 client for region {}", region);
        let client = elbv2::Client::new(&self.sdk_config(region).await);
        self.elb_clients.insert(region.to_string(), client.clone());
        client
    }

    async fn aga(&self) -> aga::Client {
        if let Some(client) = self.aga_clients.get(GLOBAL_ACCELERATOR_REGION) {
            return client.clone();
        }
        debug!("creating Global Accelerator client");
        let client = aga::Client::new(&self.sdk_config(GLOBAL_ACCELERATOR_REGION).await);
        self.aga_clients
            .insert(GLOBAL_ACCELERATOR_REGION.to_string(), client.clone());
        client
    }

    fn timer(&self, operation: &str) -> ApiTimer<'static> {
        ApiTimer::start(self.metrics, CLOUD_LABEL, operation)
    }

    /// Fetch one load balancer by ARN, or by name when the ARN is empty
    pub async fn describe_load_balancer(
        &self,
        region: &str,
        lb_id: &str,
        name: &str,
    ) -> Result<LoadBalancer> {
        self.limiter.acquire().await;
        let timer = self.timer("DescribeLoadBalancers");
        let client = self.elb(region).await;
        let mut req = client.describe_load_balancers();
        if !lb_id.is_empty() {
            req = req.load_balancer_arns(lb_id);
        } else {
            req = req.names(name);
        }
        match req.send().await {
            Ok(out) => {
                timer.success();
                out.load_balancers().first().cloned().ok_or_else(|| {
                    CloudError::LoadBalancerNotFound(if lb_id.is_empty() {
                        name.to_string()
                    } else {
                        lb_id.to_string()
                    })
                })
            }
            Err(err) => {
                if is_not_found(&err) {
                    timer.failure("lb_not_found");
                    return Err(CloudError::LoadBalancerNotFound(if lb_id.is_empty() {
                        name.to_string()
                    } else {
                        lb_id.to_string()
                    }));
                }
                let cloud_err = classify("DescribeLoadBalancers", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// All listeners of a load balancer
    pub async fn describe_listeners(&self, region: &str, lb_arn: &str) -> Result<Vec<Listener>> {
        let timer = self.timer("DescribeListeners");
        let client = self.elb(region).await;
        let mut listeners = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            self.limiter.acquire().await;
            let mut req = client.describe_listeners().load_balancer_arn(lb_arn);
            if let Some(m) = &marker {
                req = req.marker(m);
            }
            let out = match req.send().await {
                Ok(out) => out,
                Err(err) => {
                    let cloud_err = classify("DescribeListeners", err);
                    timer.failure(cloud_err.label());
                    return Err(cloud_err);
                }
            };
            listeners.extend(out.listeners().iter().cloned());
            match out.next_marker() {
                Some(m) => marker = Some(m.to_string()),
                None => break,
            }
        }
        timer.success();
        Ok(listeners)
    }

    /// Create a listener forwarding to `tg_arn` and return its ARN
    pub async fn create_listener(
        &self,
        region: &str,
        lb_arn: &str,
        port: i32,
        protocol: &str,
        certificate: Option<&gantry_api::model::Certificate>,
        tg_arn: &str,
    ) -> Result<String> {
        self.limiter.acquire().await;
        let timer = self.timer("CreateListener");
        let client = self.elb(region).await;
        let action = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(tg_arn)
            .build()
            .map_err(|e| build_error("listener action", e))?;
        let mut req = client
            .create_listener()
            .load_balancer_arn(lb_arn)
            .port(port)
            .protocol(protocol_enum(protocol))
            .default_actions(action);
        if let Some(cert) = certificate {
            req = req.certificates(Certificate::builder().certificate_arn(&cert.cert_id).build());
        }
        match req.send().await {
            Ok(out) => {
                timer.success();
                Ok(out
                    .listeners()
                    .first()
                    .and_then(|l| l.listener_arn())
                    .unwrap_or_default()
                    .to_string())
            }
            Err(err) => {
                let cloud_err = classify("CreateListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Re-point an existing listener at `tg_arn`
    pub async fn modify_listener(
        &self,
        region: &str,
        listener_arn: &str,
        protocol: &str,
        certificate: Option<&gantry_api::model::Certificate>,
        tg_arn: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("ModifyListener");
        let client = self.elb(region).await;
        let action = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(tg_arn)
            .build()
            .map_err(|e| build_error("listener action", e))?;
        let mut req = client
            .modify_listener()
            .listener_arn(listener_arn)
            .protocol(protocol_enum(protocol))
            .default_actions(action);
        if let Some(cert) = certificate {
            req = req.certificates(Certificate::builder().certificate_arn(&cert.cert_id).build());
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("ModifyListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Delete a listener; an already missing listener is success
    pub async fn delete_listener(&self, region: &str, listener_arn: &str) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("DeleteListener");
        let client = self.elb(region).await;
        match client
            .delete_listener()
            .listener_arn(listener_arn)
            .send()
            .await
        {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeleteListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// All rules of a listener
    pub async fn describe_rules(&self, region: &str, listener_arn: &str) -> Result<Vec<Rule>> {
        let timer = self.timer("DescribeRules");
        let client = self.elb(region).await;
        let mut rules = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            self.limiter.acquire().await;
            let mut req = client.describe_rules().listener_arn(listener_arn);
            if let Some(m) = &marker {
                req = req.marker(m);
            }
            let out = match req.send().await {
                Ok(out) => out,
                Err(err) => {
                    let cloud_err = classify("DescribeRules", err);
                    timer.failure(cloud_err.label());
                    return Err(cloud_err);
                }
            };
            rules.extend(out.rules().iter().cloned());
            match out.next_marker() {
                Some(m) => marker = Some(m.to_string()),
                None => break,
            }
        }
        timer.success();
        Ok(rules)
    }

    /// Create a host/path rule forwarding to `tg_arn`
    pub async fn create_rule(
        &self,
        region: &str,
        listener_arn: &str,
        priority: i32,
        domain: &str,
        path: &str,
        tg_arn: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("CreateRule");
        let client = self.elb(region).await;
        let action = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(tg_arn)
            .build()
            .map_err(|e| build_error("rule action", e))?;
        let mut req = client
            .create_rule()
            .listener_arn(listener_arn)
            .priority(priority)
            .actions(action);
        if !domain.is_empty() {
            req = req.conditions(
                RuleCondition::builder()
                    .field("host-header")
                    .values(domain)
                    .build(),
            );
        }
        if !path.is_empty() {
            req = req.conditions(
                RuleCondition::builder()
                    .field("path-pattern")
                    .values(path)
                    .build(),
            );
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("CreateRule", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Re-point an existing rule at `tg_arn`
    pub async fn modify_rule(&self, region: &str, rule_arn: &str, tg_arn: &str) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("ModifyRule");
        let client = self.elb(region).await;
        let action = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(tg_arn)
            .build()
            .map_err(|e| build_error("rule action", e))?;
        match client
            .modify_rule()
            .rule_arn(rule_arn)
            .actions(action)
            .send()
            .await
        {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("ModifyRule", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Delete a rule; an already missing rule is success
    pub async fn delete_rule(&self, region: &str, rule_arn: &str) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("DeleteRule");
        let client = self.elb(region).await;
        match client.delete_rule().rule_arn(rule_arn).send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeleteRule", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Fetch a target group by name; `None` when it does not exist
    pub async fn describe_target_group(
        &self,
        region: &str,
        name: &str,
    ) -> Result<Option<TargetGroup>> {
        self.limiter.acquire().await;
        let timer = self.timer("DescribeTargetGroups");
        let client = self.elb(region).await;
        match client.describe_target_groups().names(name).send().await {
            Ok(out) => {
                timer.success();
                Ok(out.target_groups().first().cloned())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(None)
            }
            Err(err) => {
                let cloud_err = classify("DescribeTargetGroups", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Create an ip-target group and return its ARN
    pub async fn create_target_group(
        &self,
        region: &str,
        name: &str,
        protocol: &str,
        port: i32,
        vpc_id: &str,
        health_check: Option<&HealthCheck>,
    ) -> Result<String> {
        self.limiter.acquire().await;
        let timer = self.timer("CreateTargetGroup");
        let client = self.elb(region).await;
        let mut req = client
            .create_target_group()
            .name(name)
            .protocol(protocol_enum(protocol))
            .port(port)
            .vpc_id(vpc_id)
            .target_type(TargetTypeEnum::Ip);
        if let Some(hc) = health_check {
            req = req.health_check_enabled(hc.enabled);
            if hc.interval_time > 0 {
                req = req.health_check_interval_seconds(hc.interval_time);
            }
            if hc.timeout > 0 {
                req = req.health_check_timeout_seconds(hc.timeout);
            }
            if hc.healthy_threshold > 0 {
                req = req.healthy_threshold_count(hc.healthy_threshold);
            }
            if hc.unhealthy_threshold > 0 {
                req = req.unhealthy_threshold_count(hc.unhealthy_threshold);
            }
            if !hc.http_check_path.is_empty() {
                req = req
                    .health_check_path(&hc.http_check_path)
                    .health_check_protocol(ProtocolEnum::Http);
            }
            if let Some(codes) = &hc.http_code {
                req = req.matcher(Matcher::builder().http_code(codes).build());
            }
        }
        match req.send().await {
            Ok(out) => {
                timer.success();
                Ok(out
                    .target_groups()
                    .first()
                    .and_then(|tg| tg.target_group_arn())
                    .unwrap_or_default()
                    .to_string())
            }
            Err(err) => {
                let cloud_err = classify("CreateTargetGroup", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Update the health check settings of an existing target group
    pub async fn modify_target_group_health(
        &self,
        region: &str,
        tg_arn: &str,
        health_check: &HealthCheck,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("ModifyTargetGroup");
        let client = self.elb(region).await;
        let mut req = client
            .modify_target_group()
            .target_group_arn(tg_arn)
            .health_check_enabled(health_check.enabled);
        if health_check.interval_time > 0 {
            req = req.health_check_interval_seconds(health_check.interval_time);
        }
        if health_check.timeout > 0 {
            req = req.health_check_timeout_seconds(health_check.timeout);
        }
        if health_check.healthy_threshold > 0 {
            req = req.healthy_threshold_count(health_check.healthy_threshold);
        }
        if health_check.unhealthy_threshold > 0 {
            req = req.unhealthy_threshold_count(health_check.unhealthy_threshold);
        }
        if !health_check.http_check_path.is_empty() {
            req = req.health_check_path(&health_check.http_check_path);
        }
        if let Some(codes) = &health_check.http_code {
            req = req.matcher(Matcher::builder().http_code(codes).build());
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("ModifyTargetGroup", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Apply key/value attributes, e.g. stickiness settings
    pub async fn modify_target_group_attributes(
        &self,
        region: &str,
        tg_arn: &str,
        attributes: &[(String, String)],
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("ModifyTargetGroupAttributes");
        let client = self.elb(region).await;
        let mut req = client
            .modify_target_group_attributes()
            .target_group_arn(tg_arn);
        for (key, value) in attributes {
            req = req.attributes(TargetGroupAttribute::builder().key(key).value(value).build());
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("ModifyTargetGroupAttributes", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Delete a target group; already missing is success
    pub async fn delete_target_group(&self, region: &str, tg_arn: &str) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("DeleteTargetGroup");
        let client = self.elb(region).await;
        match client
            .delete_target_group()
            .target_group_arn(tg_arn)
            .send()
            .await
        {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeleteTargetGroup", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Register backends with a target group
    pub async fn register_targets(
        &self,
        region: &str,
        tg_arn: &str,
        backends: &[Backend],
    ) -> Result<()> {
        if backends.is_empty() {
            return Ok(());
        }
        self.limiter.acquire().await;
        let timer = self.timer("RegisterTargets");
        let client = self.elb(region).await;
        let mut req = client.register_targets().target_group_arn(tg_arn);
        for backend in backends {
            let target = TargetDescription::builder()
                .id(&backend.ip)
                .port(backend.port)
                .build()
                .map_err(|e| build_error("target description", e))?;
            req = req.targets(target);
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("RegisterTargets", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Deregister backends from a target group
    pub async fn deregister_targets(
        &self,
        region: &str,
        tg_arn: &str,
        backends: &[Backend],
    ) -> Result<()> {
        if backends.is_empty() {
            return Ok(());
        }
        self.limiter.acquire().await;
        let timer = self.timer("DeregisterTargets");
        let client = self.elb(region).await;
        let mut req = client.deregister_targets().target_group_arn(tg_arn);
        for backend in backends {
            let target = TargetDescription::builder()
                .id(&backend.ip)
                .port(backend.port)
                .build()
                .map_err(|e| build_error("target description", e))?;
            req = req.targets(target);
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeregisterTargets", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Current health of every registered target
    pub async fn describe_target_health(
        &self,
        region: &str,
        tg_arn: &str,
    ) -> Result<Vec<TargetHealthDescription>> {
        self.limiter.acquire().await;
        let timer = self.timer("DescribeTargetHealth");
        let client = self.elb(region).await;
        match client
            .describe_target_health()
            .target_group_arn(tg_arn)
            .send()
            .await
        {
            Ok(out) => {
                timer.success();
                Ok(out.target_health_descriptions().to_vec())
            }
            Err(err) => {
                let cloud_err = classify("DescribeTargetHealth", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Fetch a custom routing accelerator by ARN
    pub async fn describe_custom_routing_accelerator(
        &self,
        accelerator_arn: &str,
    ) -> Result<aga::types::CustomRoutingAccelerator> {
        self.limiter.acquire().await;
        let timer = self.timer("DescribeCustomRoutingAccelerator");
        let client = self.aga().await;
        match client
            .describe_custom_routing_accelerator()
            .accelerator_arn(accelerator_arn)
            .send()
            .await
        {
            Ok(out) => {
                timer.success();
                out.accelerator().cloned().ok_or_else(|| {
                    CloudError::LoadBalancerNotFound(accelerator_arn.to_string())
                })
            }
            Err(err) => {
                if is_not_found(&err) {
                    timer.failure("lb_not_found");
                    return Err(CloudError::LoadBalancerNotFound(accelerator_arn.to_string()));
                }
                let cloud_err = classify("DescribeCustomRoutingAccelerator", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// All custom routing listeners of an accelerator
    pub async fn list_custom_routing_listeners(
        &self,
        accelerator_arn: &str,
    ) -> Result<Vec<CustomRoutingListener>> {
        let timer = self.timer("ListCustomRoutingListeners");
        let client = self.aga().await;
        let mut listeners = Vec::new();
        let mut token: Option<String> = None;
        loop {
            self.limiter.acquire().await;
            let mut req = client
                .list_custom_routing_listeners()
                .accelerator_arn(accelerator_arn);
            if let Some(t) = &token {
                req = req.next_token(t);
            }
            let out = match req.send().await {
                Ok(out) => out,
                Err(err) => {
                    let cloud_err = classify("ListCustomRoutingListeners", err);
                    timer.failure(cloud_err.label());
                    return Err(cloud_err);
                }
            };
            listeners.extend(out.listeners().iter().cloned());
            match out.next_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        timer.success();
        Ok(listeners)
    }

    /// Create a custom routing listener covering the given port runs
    pub async fn create_custom_routing_listener(
        &self,
        accelerator_arn: &str,
        runs: &[AgaMappingInfo],
    ) -> Result<String> {
        self.limiter.acquire().await;
        let timer = self.timer("CreateCustomRoutingListener");
        let client = self.aga().await;
        let mut req = client
            .create_custom_routing_listener()
            .accelerator_arn(accelerator_arn);
        for run in runs {
            req = req.port_ranges(
                PortRange::builder()
                    .from_port(run.cloud_start_port)
                    .to_port(run.cloud_end_port)
                    .build(),
            );
        }
        match req.send().await {
            Ok(out) => {
                timer.success();
                Ok(out
                    .listener()
                    .and_then(|l| l.listener_arn())
                    .unwrap_or_default()
                    .to_string())
            }
            Err(err) => {
                let cloud_err = classify("CreateCustomRoutingListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Replace the port runs of a custom routing listener
    pub async fn update_custom_routing_listener(
        &self,
        listener_arn: &str,
        runs: &[AgaMappingInfo],
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("UpdateCustomRoutingListener");
        let client = self.aga().await;
        let mut req = client
            .update_custom_routing_listener()
            .listener_arn(listener_arn);
        for run in runs {
            req = req.port_ranges(
                PortRange::builder()
                    .from_port(run.cloud_start_port)
                    .to_port(run.cloud_end_port)
                    .build(),
            );
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("UpdateCustomRoutingListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Delete a custom routing listener; already missing is success
    pub async fn delete_custom_routing_listener(&self, listener_arn: &str) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("DeleteCustomRoutingListener");
        let client = self.aga().await;
        match client
            .delete_custom_routing_listener()
            .listener_arn(listener_arn)
            .send()
            .await
        {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeleteCustomRoutingListener", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// All endpoint groups of a custom routing listener
    pub async fn list_custom_routing_endpoint_groups(
        &self,
        listener_arn: &str,
    ) -> Result<Vec<CustomRoutingEndpointGroup>> {
        let timer = self.timer("ListCustomRoutingEndpointGroups");
        let client = self.aga().await;
        let mut groups = Vec::new();
        let mut token: Option<String> = None;
        loop {
            self.limiter.acquire().await;
            let mut req = client
                .list_custom_routing_endpoint_groups()
                .listener_arn(listener_arn);
            if let Some(t) = &token {
                req = req.next_token(t);
            }
            let out = match req.send().await {
                Ok(out) => out,
                Err(err) => {
                    let cloud_err = classify("ListCustomRoutingEndpointGroups", err);
                    timer.failure(cloud_err.label());
                    return Err(cloud_err);
                }
            };
            groups.extend(out.endpoint_groups().iter().cloned());
            match out.next_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        timer.success();
        Ok(groups)
    }

    /// Create an endpoint group whose destinations cover the local port runs
    pub async fn create_custom_routing_endpoint_group(
        &self,
        listener_arn: &str,
        region: &str,
        runs: &[AgaMappingInfo],
        protocol: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("CreateCustomRoutingEndpointGroup");
        let client = self.aga().await;
        let routing_protocol = if protocol.eq_ignore_ascii_case(PROTOCOL_UDP) {
            CustomRoutingProtocol::Udp
        } else {
            CustomRoutingProtocol::Tcp
        };
        let mut req = client
            .create_custom_routing_endpoint_group()
            .listener_arn(listener_arn)
            .endpoint_group_region(region);
        for run in runs {
            let destination = CustomRoutingDestinationConfiguration::builder()
                .from_port(run.local_start_port)
                .to_port(run.local_end_port)
                .protocols(routing_protocol.clone())
                .build()
                .map_err(|e| build_error("destination configuration", e))?;
            req = req.destination_configurations(destination);
        }
        match req.send().await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("CreateCustomRoutingEndpointGroup", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }

    /// Delete an endpoint group; already missing is success
    pub async fn delete_custom_routing_endpoint_group(
        &self,
        endpoint_group_arn: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let timer = self.timer("DeleteCustomRoutingEndpointGroup");
        let client = self.aga().await;
        match client
            .delete_custom_routing_endpoint_group()
            .endpoint_group_arn(endpoint_group_arn)
            .send()
            .await
        {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                timer.success();
                Ok(())
            }
            Err(err) => {
                let cloud_err = classify("DeleteCustomRoutingEndpointGroup", err);
                timer.failure(cloud_err.label());
                Err(cloud_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_enum_mapping() {
        assert_eq!(protocol_enum("tcp"), ProtocolEnum::Tcp);
        assert_eq!(protocol_enum("HTTPS"), ProtocolEnum::Https);
        assert_eq!(protocol_enum("http"), ProtocolEnum::Http);
    }

    #[test]
    fn test_accelerator_arn_detection() {
        assert!(is_accelerator_arn(
            "arn:aws:globalaccelerator::123456789012:accelerator/11111111-2222"
        ));
        assert!(!is_accelerator_arn(
            "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/50dc6c"
        ));
        assert!(!is_accelerator_arn("lb-1234"));
    }
}
