use crate::actions::{SpfAction, SpfActions};
use crate::adapter::PolicyConfigAdapter;
use crate::config::{ConfigFile, PolicyChannel, SpfParams};
use crate::error::ChappsError;
use crate::policy::{EmailPolicy, GreylistingPolicy, InstanceCache, PolicyOutcome};
use crate::request::PolicyRequest;
use async_trait::async_trait;
use log::{debug, warn};
use mail_auth::{Resolver, SpfResult};
use std::net::IpAddr;
use std::sync::Arc;

/// SPF enforcement: check the HELO identity, then MAIL FROM, and translate
/// the result into an MTA directive through the configured action table.
///
/// Unlike the pass/fail policies this engine produces a first-class
/// directive of its own; the acceptance/rejection messages of its channel
/// are not consulted.
pub struct SpfEnforcementPolicy {
    params: SpfParams,
    actions: SpfActions,
    resolver: Resolver,
    /// Receiver identity stamped into Received-SPF headers
    local_host: String,
    greylist: Arc<GreylistingPolicy>,
    adapter: Arc<PolicyConfigAdapter>,
    whitelist: Vec<String>,
    helo_fail: Vec<String>,
    instance_cache: InstanceCache,
}

fn result_name(result: SpfResult) -> &'static str {
    match result {
        SpfResult::Pass => "pass",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::Neutral => "neutral",
        SpfResult::None => "none",
        SpfResult::TempError => "temperror",
        SpfResult::PermError => "permerror",
    }
}

impl SpfEnforcementPolicy {
    pub fn new(
        config: &ConfigFile,
        greylist: Arc<GreylistingPolicy>,
        adapter: Arc<PolicyConfigAdapter>,
    ) -> Result<Self, ChappsError> {
        let params = config.spf.clone();
        let actions = SpfActions::from_params(&config.spf_actions)?;
        let resolver = Resolver::new_system_conf().map_err(|e| {
            ChappsError::StartupError(format!("Failed to set up the SPF resolver: {e:?}"))
        })?;
        let local_host = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "localhost".to_string());
        let whitelist = params.whitelisted_helos();
        let helo_fail = params.helo_fail_set();
        Ok(Self {
            params,
            actions,
            resolver,
            local_host,
            greylist,
            adapter,
            whitelist,
            helo_fail,
            instance_cache: InstanceCache::new(),
        })
    }

    /// Whether the recipient domain opts into SPF enforcement
    async fn enforcing(&self, domain: &str) -> bool {
        match self.adapter.domain_flags(domain).await {
            Ok(Some(flags)) => flags.check_spf,
            Ok(None) => self.params.enforce_unknown_domain,
            Err(error) => {
                warn!("Domain flags lookup failed for {domain} ({error}); treating as unknown");
                self.params.enforce_unknown_domain
            }
        }
    }

    fn spf_header(&self, result: SpfResult, request: &PolicyRequest) -> String {
        format!(
            "Received-SPF: {} receiver={}; client-ip={}; helo={}; envelope-from={};",
            result_name(result),
            self.local_host,
            request.client_address().unwrap_or_default(),
            request.helo_name().unwrap_or_default(),
            request.sender().unwrap_or_default(),
        )
    }

    /// HELO first; a short-circuiting HELO result stands, otherwise the
    /// MAIL FROM identity decides (postmaster@helo for the null sender).
    async fn check_host(&self, request: &PolicyRequest) -> Result<(SpfResult, String), ChappsError> {
        let client_address: IpAddr = request
            .client_address()
            .unwrap_or_default()
            .parse()
            .map_err(|e| {
                ChappsError::SpfQueryError(format!(
                    "client_address is not an IP address: {e:?}"
                ))
            })?;
        let helo = request.helo_name().unwrap_or_default();

        let helo_output = self
            .resolver
            .verify_spf_helo(client_address, &helo, &self.local_host)
            .await;
        if self
            .helo_fail
            .iter()
            .any(|r| r == result_name(helo_output.result()))
        {
            debug!(
                "HELO SPF check of {helo} returned {}; short-circuiting MAIL FROM",
                result_name(helo_output.result())
            );
            let reason = format!("{helo} is not designated per its SPF record");
            return Ok((helo_output.result(), reason));
        }

        let sender = match request.sender() {
            Some(sender) if !sender.is_empty() => sender,
            _ => format!("postmaster@{helo}"),
        };
        let output = self
            .resolver
            .verify_spf_sender(client_address, &helo, &self.local_host, &sender)
            .await;
        let reason = format!(
            "{sender} is {}designated per its SPF record",
            match output.result() {
                SpfResult::Pass => "",
                _ => "not ",
            }
        );
        Ok((output.result(), reason))
    }

    /// Translate a result into the directive actually sent, resolving the
    /// `greylist` action by synthesizing a greylist evaluation of this PRR
    async fn outcome_for(
        &self,
        result: SpfResult,
        reason: &str,
        request: &PolicyRequest,
    ) -> Result<PolicyOutcome, ChappsError> {
        let action = self.actions.action_for(result);
        match action {
            SpfAction::Greylist => {
                let greylisted = self.greylist.approve(request).await?;
                if greylisted.is_ok() {
                    let directive = self
                        .actions
                        .passing()
                        .directive(reason, Some(&self.spf_header(result, request)))?;
                    Ok(PolicyOutcome::accept(directive, self.name()))
                } else {
                    let reason = match reason.is_empty() {
                        true => "due to SPF enforcement policy",
                        false => reason,
                    };
                    Ok(PolicyOutcome::deny(
                        format!("{} {reason}", greylisted.directive),
                        self.name(),
                    ))
                }
            }
            SpfAction::Dunno | SpfAction::Okay | SpfAction::Prepend => {
                let directive =
                    action.directive(reason, Some(&self.spf_header(result, request)))?;
                Ok(PolicyOutcome::accept(directive, self.name()))
            }
            _ => {
                let directive = action.directive(reason, None)?;
                Ok(PolicyOutcome::deny(directive, self.name()))
            }
        }
    }
}

#[async_trait]
impl EmailPolicy for SpfEnforcementPolicy {
    fn name(&self) -> &'static str {
        "SPFEnforcementPolicy"
    }

    fn channel(&self) -> &PolicyChannel {
        &self.params.channel
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError> {
        let helo = request.helo_name().unwrap_or_default();
        if self.whitelist.iter().any(|w| w == &helo) {
            debug!("HELO {helo} is whitelisted; skipping SPF enforcement");
            return Ok(PolicyOutcome::pass_through("DUNNO", self.name()));
        }
        let domain = match request.recipient_domain() {
            Ok(domain) => domain,
            Err(ChappsError::NoRecipients) => {
                warn!("{request} contains no recipients");
                return Ok(PolicyOutcome::deny(
                    self.actions
                        .action_for(SpfResult::PermError)
                        .directive("no recipients in request", None)?,
                    self.name(),
                ));
            }
            Err(error) => return Err(error),
        };
        if !self.enforcing(&domain).await {
            return Ok(PolicyOutcome::pass_through("DUNNO", self.name()));
        }

        let instance = request.instance().unwrap_or_default();
        if let Some(cached) = self.instance_cache.get(&instance) {
            debug!("Returning cached response for {instance}");
            return Ok(cached);
        }
        let outcome = match self.check_host(request).await {
            Ok((result, reason)) => self.outcome_for(result, &reason, request).await?,
            Err(error) => {
                // resolver trouble is a temperror, not a verdict
                warn!("SPF query failed for {instance}: {error}");
                let directive = self
                    .actions
                    .action_for(SpfResult::TempError)
                    .directive(&error.to_string(), None)?;
                PolicyOutcome::deny(directive, self.name())
            }
        };
        self.instance_cache.put(&instance, &outcome);
        Ok(outcome)
    }
}
