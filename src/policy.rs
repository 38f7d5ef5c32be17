use crate::adapter::PolicyConfigAdapter;
use crate::cache::{rediskey, CacheClient};
use crate::config::{ConfigFile, GlobalParams, GreylistParams, PolicyChannel, QuotaParams, SdaParams};
use crate::error::ChappsError;
use crate::request::PolicyRequest;
use crate::{INSTANCE_CACHE_ENTRIES, INSTANCE_CACHE_TTL_MS, SECONDS_PER_DAY};
use async_trait::async_trait;
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How a policy wants the dispatcher to proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Deny,
    /// Accepted without consulting any state (e.g. a domain which does not
    /// enforce the policy); cascading continues as for Accept
    PassThrough,
}

/// A first-class policy outcome: the verdict gates cascading, the
/// directive is what actually goes back to the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub verdict: Verdict,
    pub directive: String,
    pub source: &'static str,
}

impl PolicyOutcome {
    pub fn accept(directive: impl Into<String>, source: &'static str) -> Self {
        Self {
            verdict: Verdict::Accept,
            directive: directive.into(),
            source,
        }
    }

    pub fn deny(directive: impl Into<String>, source: &'static str) -> Self {
        Self {
            verdict: Verdict::Deny,
            directive: directive.into(),
            source,
        }
    }

    pub fn pass_through(directive: impl Into<String>, source: &'static str) -> Self {
        Self {
            verdict: Verdict::PassThrough,
            directive: directive.into(),
            source,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.verdict != Verdict::Deny
    }
}

/// Memoizes `instance -> outcome` for a few seconds, because Postfix
/// re-checks the same policy decision several times within one mail
/// transaction.
pub struct InstanceCache {
    entries: Mutex<LruCache<String, (Instant, PolicyOutcome)>>,
    ttl: Duration,
}

impl Default for InstanceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceCache {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(INSTANCE_CACHE_ENTRIES)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_millis(INSTANCE_CACHE_TTL_MS),
        }
    }

    pub fn get(&self, instance: &str) -> Option<PolicyOutcome> {
        let mut entries = self.entries.lock();
        match entries.get(instance) {
            Some((stamp, outcome)) if stamp.elapsed() < self.ttl => Some(outcome.clone()),
            Some(_) => {
                entries.pop(instance);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, instance: &str, outcome: &PolicyOutcome) {
        self.entries
            .lock()
            .put(instance.to_string(), (Instant::now(), outcome.clone()));
    }
}

/// One policy engine's admission procedure over a parsed request
#[async_trait]
pub trait EmailPolicy: Send + Sync {
    /// Section name, used as the outcome source tag and in logs
    fn name(&self) -> &'static str;

    /// Listener and response configuration for this policy
    fn channel(&self) -> &PolicyChannel;

    /// Decide one request.  Address-shape errors (`NullSender` and kin)
    /// surface as errors for the dispatcher to translate; everything else
    /// resolves to an outcome here.
    async fn approve(&self, request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError>;
}

/// Seconds since the epoch as Redis stores it: a float score
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

const QUOTA_PREFIX: &str = "oqp";
const GREYLIST_PREFIX: &str = "grl";
const SDA_PREFIX: &str = "sda";

/// Outbound quota enforcement: an upper bound on send attempts per user
/// over a rolling 24-hour window, with anti-spam throttling and a
/// configurable overage margin.
///
/// The margin exists to absorb the race window created by pipelined
/// accounting without client-side locks; it is not a quota increase.
pub struct OutboundQuotaPolicy {
    params: QuotaParams,
    global: GlobalParams,
    cache: Arc<CacheClient>,
    adapter: Arc<PolicyConfigAdapter>,
    /// Enforcement interval in seconds, one day
    interval: u64,
    instance_cache: InstanceCache,
}

impl OutboundQuotaPolicy {
    pub fn new(
        config: &ConfigFile,
        cache: Arc<CacheClient>,
        adapter: Arc<PolicyConfigAdapter>,
    ) -> Self {
        Self {
            params: config.outbound_quota.clone(),
            global: config.chapps.clone(),
            cache,
            adapter,
            interval: SECONDS_PER_DAY,
            instance_cache: InstanceCache::new(),
        }
    }

    fn limit_key(&self, user: &str) -> String {
        rediskey(QUOTA_PREFIX, &[user, "limit"])
    }

    fn margin_key(&self, user: &str) -> String {
        rediskey(QUOTA_PREFIX, &[user, "margin"])
    }

    fn attempts_key(&self, user: &str) -> String {
        rediskey(QUOTA_PREFIX, &[user, "attempts"])
    }

    fn computed_margin(&self, quota: i64) -> Result<i64, ChappsError> {
        normalized_margin(self.params.margin, quota)
    }

    async fn detect_control_data(&self, user: &str) -> Result<Option<String>, ChappsError> {
        let mut conn = self.cache.master().await?;
        let cached: Option<String> = conn.get(self.limit_key(user)).await?;
        Ok(cached)
    }

    async fn store_control_data(
        &self,
        user: &str,
        quota: i64,
        margin: i64,
    ) -> Result<(), ChappsError> {
        let mut conn = self.cache.master().await?;
        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.limit_key(user), quota, SECONDS_PER_DAY)
            .ignore()
            .set_ex(self.margin_key(user), margin, SECONDS_PER_DAY)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Go get the quota for a sender from the config store and seed the
    /// cached control data
    async fn acquire_policy_for(&self, user: &str) -> Result<Option<i64>, ChappsError> {
        let quota = self.adapter.quota_for_user(user).await?;
        if let Some(quota) = quota {
            let margin = self.computed_margin(quota)?;
            self.store_control_data(user, quota, margin).await?;
        }
        Ok(quota)
    }

    /// The accounting step: one atomic pipeline trims the attempt log to
    /// the enforcement interval, records this attempt (one entry per
    /// recipient when counting recipients), reads back the control data,
    /// and refreshes every TTL.
    async fn get_control_data(
        &self,
        user: &str,
        request: &PolicyRequest,
    ) -> Result<(Option<i64>, i64, Vec<String>), ChappsError> {
        let time_now = unix_now();
        let tries_key = self.attempts_key(user);
        let limit_key = self.limit_key(user);
        let margin_key = self.margin_key(user);

        let mut entries: Vec<(f64, String)> = vec![];
        if self.params.counting_recipients {
            for (i, _) in request.recipients().iter().enumerate() {
                entries.push((time_now, format!("{time_now}:{i:05}")));
            }
        }
        if entries.is_empty() {
            entries.push((time_now, format!("{time_now}")));
        }

        let mut conn = self.cache.master().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&tries_key, 0f64, time_now - self.interval as f64)
            .ignore()
            .zadd_multiple(&tries_key, &entries)
            .ignore()
            .get(&limit_key)
            .get(&margin_key)
            .zrange(&tries_key, 0, -1)
            .expire(&tries_key, self.interval as i64)
            .ignore()
            .expire(&limit_key, self.interval as i64)
            .ignore()
            .expire(&margin_key, self.interval as i64)
            .ignore();
        let (limit, margin, attempts): (Option<String>, Option<String>, Vec<String>) =
            pipe.query_async(&mut conn).await?;

        let limit = limit.and_then(|l| l.parse::<i64>().ok());
        let margin = margin
            .and_then(|m| {
                m.parse::<i64>()
                    .ok()
                    .or_else(|| m.parse::<f64>().ok().map(|f| f as i64))
            })
            .unwrap_or(0);
        Ok((limit, margin, attempts))
    }

    async fn evaluate(&self, user: &str, request: &PolicyRequest) -> Result<bool, ChappsError> {
        if self.detect_control_data(user).await?.is_none() {
            debug!("Obtaining quota policy for {user}");
            if self.acquire_policy_for(user).await?.is_none() {
                debug!("No quota profile exists for {user}");
                return Ok(false);
            }
        }
        let (limit, margin, attempts) = self.get_control_data(user, request).await?;
        Ok(evaluate_quota_control(
            &self.params,
            limit,
            margin,
            &attempts,
            request.recipients().len(),
        ))
    }

    /// Remaining quota plus remarks, for the live admin surface
    pub async fn current_quota(&self, user: &str) -> Result<(i64, Vec<String>), ChappsError> {
        let mut remarks: Vec<String> = vec![];
        let mut conn = self.cache.master().await?;
        let (limit, attempts): (Option<String>, Vec<String>) = redis::pipe()
            .atomic()
            .get(self.limit_key(user))
            .zrange(self.attempts_key(user), 0, -1)
            .query_async(&mut conn)
            .await?;
        let limit = match limit.and_then(|l| l.parse::<i64>().ok()) {
            Some(limit) => limit,
            None => match self.adapter.quota_for_user(user).await? {
                Some(quota) => {
                    remarks.push(format!("Quota policy not yet cached for {user}"));
                    quota
                }
                None => {
                    return Err(ChappsError::Generic(format!(
                        "There is no quota profile for {user}"
                    )))
                }
            },
        };
        let remaining = limit - attempts.len() as i64;
        if remaining <= 0 {
            remarks.push(format!("Outbound quota is fulfilled for {user}"));
        }
        Ok((remaining.max(0), remarks))
    }

    /// Drop the send-attempt log for a user
    pub async fn reset_quota(&self, user: &str) -> Result<(), ChappsError> {
        let mut conn = self.cache.master().await?;
        let _: () = conn.del(self.attempts_key(user)).await?;
        debug!("Reset quota attempt log for {user}");
        Ok(())
    }

    /// Re-seed the cached limit and margin, e.g. after a config change
    pub async fn refresh_policy_cache(&self, user: &str, quota: i64) -> Result<(), ChappsError> {
        let margin = self.computed_margin(quota)?;
        self.store_control_data(user, quota, margin).await
    }
}

/// Normalize a configured margin against a quota: whole numbers are
/// absolute counts, fractions in (0,1] scale the quota, values in (1,100)
/// are percentages of it.
pub fn normalized_margin(margin: f64, quota: i64) -> Result<i64, ChappsError> {
    if margin < 0.0 {
        return Err(ChappsError::InvalidValue(format!(
            "margin must not be negative, got {margin}"
        )));
    }
    if margin.fract() == 0.0 {
        // whole numbers are absolute counts
        return Ok(margin as i64);
    }
    let fraction = if margin > 1.0 {
        if margin >= 100.0 {
            return Err(ChappsError::InvalidValue(
                "margin must be a positive integer or a positive float less than 1 (a percentage)"
                    .to_string(),
            ));
        }
        margin / 100.0
    } else {
        margin
    };
    Ok((fraction * quota as f64) as i64)
}

/// Seconds between this attempt and the previous one.  Attempt records are
/// `<ts>` or `<ts>:<serial>` when counting recipients, in which case the
/// indices shift back by the recipient count to land on the tail of the
/// previous attempt.  None when the log is too short to hold one.
fn quota_delta(params: &QuotaParams, recipient_count: usize, attempts: &[String]) -> Option<f64> {
    let offset = match params.counting_recipients {
        true => recipient_count as isize,
        false => 0,
    };
    let len = attempts.len() as isize;
    let newest = len - 1 - offset;
    let previous = len - 2 - offset;
    if previous < 0 {
        return None;
    }
    let timestamp = |index: isize| -> f64 {
        let raw = &attempts[index as usize];
        raw.split(':')
            .next()
            .unwrap_or(raw)
            .parse::<f64>()
            .unwrap_or_default()
    };
    Some(timestamp(newest) - timestamp(previous))
}

/// The quota admission decision over the read-back control data.  Pure, so
/// the decision table is testable without a live cache.
pub fn evaluate_quota_control(
    params: &QuotaParams,
    limit: Option<i64>,
    margin: i64,
    attempts: &[String],
    recipient_count: usize,
) -> bool {
    let Some(limit) = limit else {
        // user does not have a quota profile
        return false;
    };
    if attempts.len() < 2 {
        // first attempt in the cache history
        return true;
    }
    if params.min_delta != 0.0 {
        if let Some(delta) = quota_delta(params, recipient_count, attempts) {
            if delta < params.min_delta {
                debug!("Rejecting for trying too fast ({delta}s since last attempt)");
                return false;
            }
        }
    }
    let tries = attempts.len() as i64;
    if tries > limit {
        if tries - margin > limit || tries - recipient_count as i64 >= limit {
            debug!(
                "Rejecting for too many attempts in the last interval: recip: {recipient_count} limit: {limit} tries: {tries}"
            );
            return false;
        }
        debug!("Accepting within margin: recip: {recipient_count} limit: {limit} tries: {tries}");
    }
    true
}

#[async_trait]
impl EmailPolicy for OutboundQuotaPolicy {
    fn name(&self) -> &'static str {
        "OutboundQuotaPolicy"
    }

    fn channel(&self) -> &PolicyChannel {
        &self.params.channel
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError> {
        let instance = request.instance().unwrap_or_default();
        if let Some(cached) = self.instance_cache.get(&instance) {
            debug!("Returning cached response for {instance}");
            return Ok(cached);
        }
        let user = request.user(&self.global)?;
        let outcome = match self.evaluate(&user, request).await {
            Ok(true) => {
                PolicyOutcome::accept(&self.params.channel.acceptance_message, self.name())
            }
            Ok(false) => PolicyOutcome::deny(&self.params.channel.rejection_message, self.name()),
            Err(error) => {
                // quota fails closed
                warn!("Quota evaluation failed for {user} ({error}); denying {instance}");
                PolicyOutcome::deny(&self.params.channel.rejection_message, self.name())
            }
        };
        self.instance_cache.put(&instance, &outcome);
        debug!("Caching and returning response {:?} for {instance}", outcome.verdict);
        Ok(outcome)
    }
}

/// Greylisting: defer the first occurrence of each
/// `(client, sender, recipient)` triplet, accept retries past the deferral
/// window, and auto-accept clients with a good enough track record.
pub struct GreylistingPolicy {
    params: GreylistParams,
    cache: Arc<CacheClient>,
    adapter: Arc<PolicyConfigAdapter>,
    min_defer: u64,
    cache_ttl: u64,
    allow_after: i64,
    instance_cache: InstanceCache,
}

impl GreylistingPolicy {
    pub fn new(
        config: &ConfigFile,
        cache: Arc<CacheClient>,
        adapter: Arc<PolicyConfigAdapter>,
    ) -> Self {
        let params = config.greylisting.clone();
        let min_defer = params.minimum_deferral;
        let mut cache_ttl = params.cache_ttl;
        if cache_ttl <= min_defer {
            warn!(
                "Cache TTL ({cache_ttl}s) is not allowed to be smaller than or equal to the minimum deferral window ({min_defer}s). Defaulting to 24 hr."
            );
            cache_ttl = SECONDS_PER_DAY;
        }
        if min_defer > 60 * 15 {
            warn!(
                "It may be unreasonable to expect the sending server to defer for more than 15 minutes. ({:.2}m)",
                min_defer as f64 / 60.0
            );
        }
        let allow_after = params.auto_allow_after;
        if allow_after == 0 {
            warn!("Sender auto-approval is turned off.");
        } else if allow_after < 2 {
            warn!("Sender auto-approval is set to a fairly low threshold. ({allow_after})");
        }
        Self {
            params,
            cache,
            adapter,
            min_defer,
            cache_ttl,
            allow_after,
            instance_cache: InstanceCache::new(),
        }
    }

    /// `grl:<client>:<sender>:<recipient>`
    fn tuple_key(&self, request: &PolicyRequest) -> String {
        rediskey(
            GREYLIST_PREFIX,
            &[
                &request.client_address().unwrap_or_default(),
                &request.sender().unwrap_or_default(),
                &request.recipient().unwrap_or_default(),
            ],
        )
    }

    fn client_key(&self, request: &PolicyRequest) -> String {
        rediskey(
            GREYLIST_PREFIX,
            &[&request.client_address().unwrap_or_default()],
        )
    }

    /// Whether the recipient domain opts into greylisting at all
    async fn enforcing(&self, domain: &str) -> bool {
        match self.adapter.domain_flags(domain).await {
            Ok(Some(flags)) => flags.greylist,
            Ok(None) => {
                debug!("No domain record for {domain}; enforce_unknown_domain={}",
                    self.params.enforce_unknown_domain);
                self.params.enforce_unknown_domain
            }
            Err(error) => {
                warn!("Domain flags lookup failed for {domain} ({error}); treating as unknown");
                self.params.enforce_unknown_domain
            }
        }
    }

    /// One pipeline: trim the client tally to the TTL window, read the
    /// triplet timestamp, take the tally cardinality.
    async fn get_control_data(
        &self,
        request: &PolicyRequest,
    ) -> Result<(Option<f64>, Option<i64>), ChappsError> {
        let now = unix_now();
        let tuple_key = self.tuple_key(request);
        let client_key = self.client_key(request);
        let mut conn = self.cache.master().await?;
        let (tuple_bits, tally): (Option<String>, i64) = redis::pipe()
            .atomic()
            .zrembyscore(&client_key, 0f64, now - self.cache_ttl as f64)
            .ignore()
            .get(&tuple_key)
            .zcard(&client_key)
            .query_async(&mut conn)
            .await?;
        let tuple_seen = tuple_bits.and_then(|bits| bits.parse::<f64>().ok());
        let client_tally = (self.allow_after > 0).then_some(tally);
        Ok((tuple_seen, client_tally))
    }

    /// An email got through: bump the client's reliability tally, keeping
    /// one entry more than the auto-allow threshold
    async fn update_client_tally(&self, request: &PolicyRequest) -> Result<(), ChappsError> {
        if self.allow_after == 0 {
            return Ok(());
        }
        let client_key = self.client_key(request);
        let mut conn = self.cache.master().await?;
        let _: () = redis::pipe()
            .atomic()
            .zadd(
                &client_key,
                request.instance().unwrap_or_default(),
                unix_now(),
            )
            .ignore()
            .zremrangebyrank(&client_key, 0, -(self.allow_after as isize + 2))
            .ignore()
            .expire(&client_key, self.cache_ttl as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_tuple(&self, request: &PolicyRequest) -> Result<(), ChappsError> {
        let mut conn = self.cache.master().await?;
        let _: () = conn
            .set_ex(self.tuple_key(request), unix_now(), self.cache_ttl)
            .await?;
        Ok(())
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<bool, ChappsError> {
        let (tuple_seen, client_tally) = self.get_control_data(request).await?;
        match evaluate_greylist_control(
            self.min_defer,
            self.allow_after,
            tuple_seen,
            client_tally,
            unix_now(),
        ) {
            GreylistDecision::Allow => {
                self.update_client_tally(request).await?;
                Ok(true)
            }
            GreylistDecision::Defer => {
                self.update_tuple(request).await?;
                Ok(false)
            }
        }
    }
}

/// What greylisting wants done with an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreylistDecision {
    Allow,
    Defer,
}

/// The greylist decision itself, given the control data.  Pure.
pub fn evaluate_greylist_control(
    minimum_deferral: u64,
    auto_allow_after: i64,
    tuple_seen: Option<f64>,
    client_tally: Option<i64>,
    now: f64,
) -> GreylistDecision {
    if auto_allow_after > 0 {
        if let Some(tally) = client_tally {
            if tally >= auto_allow_after {
                return GreylistDecision::Allow;
            }
        }
    }
    if let Some(seen) = tuple_seen {
        if now - seen >= minimum_deferral as f64 {
            return GreylistDecision::Allow;
        }
    }
    // the tuple either isn't stored or was stored too recently
    GreylistDecision::Defer
}

#[async_trait]
impl EmailPolicy for GreylistingPolicy {
    fn name(&self) -> &'static str {
        "GreylistingPolicy"
    }

    fn channel(&self) -> &PolicyChannel {
        &self.params.channel
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError> {
        // domain gating comes first and touches no state
        let domain = match request.recipient_domain() {
            Ok(domain) => domain,
            Err(ChappsError::NoRecipients) => {
                warn!("{request} contains no recipients");
                return Ok(PolicyOutcome::deny(
                    &self.params.channel.rejection_message,
                    self.name(),
                ));
            }
            Err(error) => return Err(error),
        };
        if !self.enforcing(&domain).await {
            return Ok(PolicyOutcome::pass_through(
                &self.params.channel.acceptance_message,
                self.name(),
            ));
        }

        let instance = request.instance().unwrap_or_default();
        if let Some(cached) = self.instance_cache.get(&instance) {
            debug!("Returning cached response for {instance}");
            return Ok(cached);
        }
        let outcome = match self.evaluate(request).await {
            Ok(true) => {
                PolicyOutcome::accept(&self.params.channel.acceptance_message, self.name())
            }
            Ok(false) => PolicyOutcome::deny(&self.params.channel.rejection_message, self.name()),
            Err(error) => {
                warn!("Greylist evaluation failed ({error}); deferring {instance}");
                PolicyOutcome::deny(&self.params.channel.rejection_message, self.name())
            }
        };
        self.instance_cache.put(&instance, &outcome);
        Ok(outcome)
    }
}

/// Sender-domain authorization: may this authenticated user send mail
/// appearing to come from that domain (or that exact address)?
pub struct SenderDomainAuthPolicy {
    params: SdaParams,
    global: GlobalParams,
    cache: Arc<CacheClient>,
    adapter: Arc<PolicyConfigAdapter>,
    instance_cache: InstanceCache,
}

impl SenderDomainAuthPolicy {
    pub fn new(
        config: &ConfigFile,
        cache: Arc<CacheClient>,
        adapter: Arc<PolicyConfigAdapter>,
    ) -> Self {
        Self {
            params: config.sender_domain_auth.clone(),
            global: config.chapps.clone(),
            cache,
            adapter,
            instance_cache: InstanceCache::new(),
        }
    }

    /// `sda:<user>:<domain>`, one cached verdict per mapping
    fn sender_domain_key(&self, user: &str, domain: &str) -> String {
        rediskey(SDA_PREFIX, &[user, domain])
    }

    async fn detect_control_data(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<Option<String>, ChappsError> {
        let mut conn = self.cache.master().await?;
        let cached: Option<String> = conn.get(self.sender_domain_key(user, domain)).await?;
        Ok(cached)
    }

    async fn store_control_data(
        &self,
        user: &str,
        domain: &str,
        allowed: bool,
    ) -> Result<(), ChappsError> {
        let mut conn = self.cache.master().await?;
        let _: () = conn
            .set_ex(
                self.sender_domain_key(user, domain),
                if allowed { "1" } else { "0" },
                SECONDS_PER_DAY,
            )
            .await?;
        Ok(())
    }

    /// Ask the config store; authorization holds when the user owns either
    /// the sender domain or the exact sender address
    async fn acquire_policy_for(
        &self,
        user: &str,
        domain: &str,
        sender: &str,
    ) -> Result<bool, ChappsError> {
        let allowed = self.adapter.check_domain_for_user(user, domain).await?
            || self.adapter.check_email_for_user(user, sender).await?;
        if let Err(error) = self.store_control_data(user, domain, allowed).await {
            warn!("Could not cache SDA verdict for {user}:{domain}: {error}");
        }
        Ok(allowed)
    }
}

#[async_trait]
impl EmailPolicy for SenderDomainAuthPolicy {
    fn name(&self) -> &'static str {
        "SenderDomainAuthPolicy"
    }

    fn channel(&self) -> &PolicyChannel {
        &self.params.channel
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError> {
        let instance = request.instance().unwrap_or_default();
        if let Some(cached) = self.instance_cache.get(&instance) {
            debug!("Returning cached response for {instance}");
            return Ok(cached);
        }
        let user = request.user(&self.global)?;
        // NullSender / TooManyAts / NotAnEmailAddress surface to the dispatcher
        let domain = request.sender_domain()?;
        let sender = request.sender().unwrap_or_default();

        let allowed = match self.detect_control_data(&user, &domain).await {
            Ok(Some(bits)) => bits.trim() == "1",
            Ok(None) => self.acquire_policy_for(&user, &domain, &sender).await?,
            Err(error) => {
                // the cache being away is not authorization failure: fall
                // open to the config store
                warn!("Cache unavailable for SDA ({error}); querying config store directly");
                self.adapter.check_domain_for_user(&user, &domain).await?
                    || self.adapter.check_email_for_user(&user, &sender).await?
            }
        };
        let outcome = match allowed {
            true => PolicyOutcome::accept(&self.params.channel.acceptance_message, self.name()),
            false => PolicyOutcome::deny(&self.params.channel.rejection_message, self.name()),
        };
        self.instance_cache.put(&instance, &outcome);
        Ok(outcome)
    }
}
