use clap::ArgMatches;
use concread::cowcell::asynch::{CowCell, CowCellReadTxn};
use config::{Config, File};
use flexi_logger::filter::{LogLineFilter, LogLineWriter};
use flexi_logger::{DeferredNow, LoggerHandle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::LazyLock;

/// The `[CHAPPS]` section: process-wide knobs
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GlobalParams {
    /// Character encoding of policy payloads, default utf-8
    pub payload_encoding: String,
    /// Preferred request attribute for identifying the sending user
    pub user_key: String,
    /// Deny outbound mail when the configured user key is absent
    pub require_user_key: bool,
    /// Listen backlog for the policy sockets
    pub listener_backlog: u32,
    /// sha256 hex digest of the admin password
    pub password: String,
    /// Default is "DEBUG"
    pub log_level: String,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            payload_encoding: "utf-8".to_string(),
            user_key: "sasl_username".to_string(),
            require_user_key: false,
            listener_backlog: 100,
            password: String::new(),
            log_level: "DEBUG".to_string(),
        }
    }
}

impl GlobalParams {
    /// Compare a candidate admin password against the stored digest
    pub fn admin_password_ok(&self, candidate: &str) -> bool {
        if self.password.is_empty() {
            return false;
        }
        let digest = hex::encode(Sha256::digest(candidate.as_bytes()));
        digest == self.password.to_ascii_lowercase()
    }
}

/// The `[PolicyConfigAdapter]` section: where the config of record lives
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AdapterParams {
    /// `mariadb` or `mysql`; both speak the same wire protocol
    pub adapter: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
}

impl Default for AdapterParams {
    fn default() -> Self {
        Self {
            adapter: "mariadb".to_string(),
            db_host: "localhost".to_string(),
            db_port: 3306,
            db_name: "chapps".to_string(),
            db_user: "chapps".to_string(),
            db_pass: "chapps".to_string(),
        }
    }
}

impl AdapterParams {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }
}

/// The `[Redis]` section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RedisParams {
    pub server: String,
    pub port: u16,
    /// Space-separated `host:port` sentinel quorum; empty means direct
    pub sentinel_servers: String,
    /// Logical dataset name registered with the sentinels
    pub sentinel_dataset: String,
}

impl Default for RedisParams {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 6379,
            sentinel_servers: String::new(),
            sentinel_dataset: String::new(),
        }
    }
}

impl RedisParams {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.server, self.port)
    }

    /// Sentinel quorum as connection URLs; empty when not configured
    pub fn sentinel_nodes(&self) -> Vec<String> {
        self.sentinel_servers
            .split_whitespace()
            .map(|hp| format!("redis://{hp}/"))
            .collect()
    }
}

/// Listener and response settings shared by every policy section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PolicyChannel {
    pub listen_address: String,
    pub listen_port: u16,
    /// Sent verbatim (after `action=`) when the policy passes
    pub acceptance_message: String,
    /// Sent verbatim when the policy denies
    pub rejection_message: String,
    /// Whether mail from the null sender sails through this policy
    pub null_sender_ok: bool,
}

impl PolicyChannel {
    pub fn new(port: u16, accept: &str, reject: &str) -> Self {
        Self {
            listen_address: "localhost".to_string(),
            listen_port: port,
            acceptance_message: accept.to_string(),
            rejection_message: reject.to_string(),
            null_sender_ok: false,
        }
    }

    /// Get a bindable SocketAddr for the policy listener
    pub fn listener_address(&self) -> Result<SocketAddr, crate::error::ChappsError> {
        let listen_addr = format!("{}:{}", self.listen_address, self.listen_port);
        // "localhost" isn't a SocketAddr; resolve it the cheap way
        let listen_addr = listen_addr.replace("localhost", "127.0.0.1");
        listen_addr.parse::<SocketAddr>().map_err(|e| {
            crate::error::ChappsError::StartupError(format!(
                "Failed to parse listener address {listen_addr}: {e:?}"
            ))
        })
    }
}

/// The `[OutboundQuotaPolicy]` section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QuotaParams {
    #[serde(flatten)]
    pub channel: PolicyChannel,
    /// Tolerable overage: an absolute count, a fraction in (0,1], or a percent in (1,100)
    pub margin: f64,
    /// Each recipient counts as one send attempt
    pub counting_recipients: bool,
    /// Minimum seconds between consecutive attempts; 0 disables throttling
    pub min_delta: f64,
}

impl Default for QuotaParams {
    fn default() -> Self {
        Self {
            channel: PolicyChannel::new(
                10225,
                "DUNNO",
                "REJECT Rejected - outbound quota fulfilled",
            ),
            margin: 0.10,
            counting_recipients: true,
            min_delta: 5.0,
        }
    }
}

/// The `[GreylistingPolicy]` section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GreylistParams {
    #[serde(flatten)]
    pub channel: PolicyChannel,
    /// Seconds a fresh triplet must wait before a retry is honored
    pub minimum_deferral: u64,
    /// Lifetime of triplet and tally records
    pub cache_ttl: u64,
    /// Successful passes after which a client is auto-accepted; 0 disables
    pub auto_allow_after: i64,
    /// Enforce greylisting for recipient domains with no config record
    pub enforce_unknown_domain: bool,
}

impl Default for GreylistParams {
    fn default() -> Self {
        Self {
            channel: PolicyChannel::new(
                10226,
                "DUNNO",
                "DEFER_IF_PERMIT Service temporarily unavailable - greylisted",
            ),
            minimum_deferral: 60,
            cache_ttl: crate::SECONDS_PER_DAY,
            auto_allow_after: 10,
            enforce_unknown_domain: false,
        }
    }
}

/// The `[SenderDomainAuthPolicy]` section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SdaParams {
    #[serde(flatten)]
    pub channel: PolicyChannel,
}

impl Default for SdaParams {
    fn default() -> Self {
        Self {
            channel: PolicyChannel::new(
                10225,
                "DUNNO",
                "REJECT Rejected - not allowed to send mail from this domain",
            ),
        }
    }
}

/// The `[SPFEnforcementPolicy]` section
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SpfParams {
    #[serde(flatten)]
    pub channel: PolicyChannel,
    /// Space-separated HELO names exempt from SPF enforcement
    pub whitelist: String,
    /// Space-separated HELO results which short-circuit the MAIL FROM check
    pub helo_fail_results: String,
    /// Enforce SPF for recipient domains with no config record
    pub enforce_unknown_domain: bool,
}

impl Default for SpfParams {
    fn default() -> Self {
        Self {
            // acceptance/rejection are unused by SPF; the action table rules
            channel: PolicyChannel::new(10227, "DUNNO", "DUNNO"),
            whitelist: String::new(),
            helo_fail_results: "fail".to_string(),
            enforce_unknown_domain: false,
        }
    }
}

impl SpfParams {
    pub fn whitelisted_helos(&self) -> Vec<String> {
        self.whitelist
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn helo_fail_set(&self) -> Vec<String> {
        self.helo_fail_results
            .split_whitespace()
            .map(|r| r.to_ascii_lowercase())
            .collect()
    }
}

/// The `[PostfixSPFActions]` section: one directive template per SPF result
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SpfActionParams {
    pub passing: String,
    pub fail: String,
    pub softfail: String,
    pub temperror: String,
    pub permerror: String,
    /// `none` and `neutral` deliberately share one action
    pub none_neutral: String,
}

impl Default for SpfActionParams {
    fn default() -> Self {
        Self {
            passing: "prepend".to_string(),
            fail: "550 5.7.1 SPF check failed: {reason}".to_string(),
            softfail: "greylist".to_string(),
            temperror: "451 4.4.3 SPF record(s) temporarily unavailable: {reason}".to_string(),
            permerror: "550 5.5.2 SPF record(s) are malformed: {reason}".to_string(),
            none_neutral: "greylist".to_string(),
        }
    }
}

/// The main config blob for CHAPPS, read from an INI file
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct ConfigFile {
    pub chapps: GlobalParams,
    pub adapter: AdapterParams,
    pub redis: RedisParams,
    pub outbound_quota: QuotaParams,
    pub greylisting: GreylistParams,
    pub sender_domain_auth: SdaParams,
    pub spf: SpfParams,
    pub spf_actions: SpfActionParams,
}

static CONFIG_LOCATIONS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| ["/etc/chapps/chapps.ini", "~/.config/chapps.ini"].to_vec());

impl ConfigFile {
    /// JSONify the configfile in a pretty way using serde
    pub fn as_json_pretty(&self) -> Result<String, crate::error::ChappsError> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::ChappsError::Generic(format!("Failed to serialize config: {e:?}"))
        })
    }

    /// Uses [Self::try_from_path] and wraps it in a CowCell (moo)
    ///
    /// The default locations are `/etc/chapps/chapps.ini` and
    /// `~/.config/chapps.ini`, overridable with `$CHAPPS_CONFIG`.
    pub fn try_as_cowcell(
        config_path: Option<&String>,
    ) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from_path(config_path)?))
    }

    /// Loads the configuration from a given file or from some default locations.
    pub fn try_from_path(config_path: Option<&String>) -> Result<ConfigFile, std::io::Error> {
        let env_path = std::env::var("CHAPPS_CONFIG").ok();
        let file_locations: Vec<String> = match config_path.or(env_path.as_ref()) {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        // clean up the file paths and filter them by the ones that exist
        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(&f).into_owned();
                let filepath = std::path::Path::new(&path);
                match filepath.exists() {
                    false => {
                        eprintln!("Config file {path} doesn't exist, skipping.");
                        None
                    }
                    true => Some(path),
                }
            })
            .collect();

        if found_files.is_empty() {
            eprintln!(
                "No configuration files exist, using built-in defaults. Tried: {}",
                file_locations.join(", ")
            );
            return Ok(ConfigFile::default());
        }

        for config_filename in found_files {
            let builder = Config::builder()
                .add_source(File::new(&config_filename, config::FileFormat::Ini))
                .add_source(config::Environment::with_prefix("chapps").separator("__"));

            let config = builder.build().map_err(|e| {
                std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("Couldn't load config from {config_filename}: {e:?}"),
                )
            });

            match config {
                Ok(config) => {
                    eprintln!("Successfully loaded config from: {config_filename}");
                    return Ok(ConfigFile::from(config));
                }
                Err(err) => eprintln!("{err:?}"),
            }
        }

        Ok(ConfigFile::default())
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "user_key=\"{}\" adapter={}@{}:{}/{} redis={} log_level={}",
            self.chapps.user_key,
            self.adapter.db_user,
            self.adapter.db_host,
            self.adapter.db_port,
            self.adapter.db_name,
            match self.redis.sentinel_servers.is_empty() {
                true => self.redis.url(),
                false => format!(
                    "sentinel[{}]/{}",
                    self.redis.sentinel_servers, self.redis.sentinel_dataset
                ),
            },
            self.chapps.log_level,
        ))
    }
}

/// Pull one key out of a section, falling back to the given default
fn get_or<'de, T: Deserialize<'de>>(config: &Config, key: &str, dfl: T) -> T {
    config.get(key).unwrap_or(dfl)
}

fn channel_from(config: &Config, section: &str, dfl: &PolicyChannel) -> PolicyChannel {
    PolicyChannel {
        listen_address: get_or(
            config,
            &format!("{section}.listen_address"),
            dfl.listen_address.clone(),
        ),
        listen_port: get_or(config, &format!("{section}.listen_port"), dfl.listen_port),
        acceptance_message: get_or(
            config,
            &format!("{section}.acceptance_message"),
            dfl.acceptance_message.clone(),
        ),
        rejection_message: get_or(
            config,
            &format!("{section}.rejection_message"),
            dfl.rejection_message.clone(),
        ),
        null_sender_ok: get_or(
            config,
            &format!("{section}.null_sender_ok"),
            dfl.null_sender_ok,
        ),
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        let dfl = ConfigFile::default();
        ConfigFile {
            chapps: GlobalParams {
                payload_encoding: get_or(
                    &config,
                    "CHAPPS.payload_encoding",
                    dfl.chapps.payload_encoding,
                ),
                user_key: get_or(&config, "CHAPPS.user_key", dfl.chapps.user_key),
                require_user_key: get_or(
                    &config,
                    "CHAPPS.require_user_key",
                    dfl.chapps.require_user_key,
                ),
                listener_backlog: get_or(
                    &config,
                    "CHAPPS.listener_backlog",
                    dfl.chapps.listener_backlog,
                ),
                password: get_or(&config, "CHAPPS.password", dfl.chapps.password),
                log_level: get_or(&config, "CHAPPS.log_level", dfl.chapps.log_level),
            },
            adapter: AdapterParams {
                adapter: get_or(&config, "PolicyConfigAdapter.adapter", dfl.adapter.adapter),
                db_host: get_or(&config, "PolicyConfigAdapter.db_host", dfl.adapter.db_host),
                db_port: get_or(&config, "PolicyConfigAdapter.db_port", dfl.adapter.db_port),
                db_name: get_or(&config, "PolicyConfigAdapter.db_name", dfl.adapter.db_name),
                db_user: get_or(&config, "PolicyConfigAdapter.db_user", dfl.adapter.db_user),
                db_pass: get_or(&config, "PolicyConfigAdapter.db_pass", dfl.adapter.db_pass),
            },
            redis: RedisParams {
                server: get_or(&config, "Redis.server", dfl.redis.server),
                port: get_or(&config, "Redis.port", dfl.redis.port),
                sentinel_servers: get_or(
                    &config,
                    "Redis.sentinel_servers",
                    dfl.redis.sentinel_servers,
                ),
                sentinel_dataset: get_or(
                    &config,
                    "Redis.sentinel_dataset",
                    dfl.redis.sentinel_dataset,
                ),
            },
            outbound_quota: QuotaParams {
                channel: channel_from(&config, "OutboundQuotaPolicy", &dfl.outbound_quota.channel),
                margin: get_or(
                    &config,
                    "OutboundQuotaPolicy.margin",
                    dfl.outbound_quota.margin,
                ),
                counting_recipients: get_or(
                    &config,
                    "OutboundQuotaPolicy.counting_recipients",
                    dfl.outbound_quota.counting_recipients,
                ),
                min_delta: get_or(
                    &config,
                    "OutboundQuotaPolicy.min_delta",
                    dfl.outbound_quota.min_delta,
                ),
            },
            greylisting: GreylistParams {
                channel: channel_from(&config, "GreylistingPolicy", &dfl.greylisting.channel),
                minimum_deferral: get_or(
                    &config,
                    "GreylistingPolicy.minimum_deferral",
                    dfl.greylisting.minimum_deferral,
                ),
                cache_ttl: get_or(
                    &config,
                    "GreylistingPolicy.cache_ttl",
                    dfl.greylisting.cache_ttl,
                ),
                auto_allow_after: get_or(
                    &config,
                    "GreylistingPolicy.auto_allow_after",
                    dfl.greylisting.auto_allow_after,
                ),
                enforce_unknown_domain: get_or(
                    &config,
                    "GreylistingPolicy.enforce_unknown_domain",
                    dfl.greylisting.enforce_unknown_domain,
                ),
            },
            sender_domain_auth: SdaParams {
                channel: channel_from(
                    &config,
                    "SenderDomainAuthPolicy",
                    &dfl.sender_domain_auth.channel,
                ),
            },
            spf: SpfParams {
                channel: channel_from(&config, "SPFEnforcementPolicy", &dfl.spf.channel),
                whitelist: get_or(&config, "SPFEnforcementPolicy.whitelist", dfl.spf.whitelist),
                helo_fail_results: get_or(
                    &config,
                    "SPFEnforcementPolicy.helo_fail_results",
                    dfl.spf.helo_fail_results,
                ),
                enforce_unknown_domain: get_or(
                    &config,
                    "SPFEnforcementPolicy.enforce_unknown_domain",
                    dfl.spf.enforce_unknown_domain,
                ),
            },
            spf_actions: SpfActionParams {
                passing: get_or(&config, "PostfixSPFActions.passing", dfl.spf_actions.passing),
                fail: get_or(&config, "PostfixSPFActions.fail", dfl.spf_actions.fail),
                softfail: get_or(
                    &config,
                    "PostfixSPFActions.softfail",
                    dfl.spf_actions.softfail,
                ),
                temperror: get_or(
                    &config,
                    "PostfixSPFActions.temperror",
                    dfl.spf_actions.temperror,
                ),
                permerror: get_or(
                    &config,
                    "PostfixSPFActions.permerror",
                    dfl.spf_actions.permerror,
                ),
                none_neutral: get_or(
                    &config,
                    "PostfixSPFActions.none_neutral",
                    dfl.spf_actions.none_neutral,
                ),
            },
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let configfile = File::from_str(input, config::FileFormat::Ini);

        let res = Config::builder()
            .add_source(configfile)
            .build()
            .map_err(|e| format!("{e:?}"))?;

        Ok(res.into())
    }
}

pub async fn setup_logging(
    config: CowCellReadTxn<ConfigFile>,
    clap_results: &ArgMatches,
) -> Result<LoggerHandle, std::io::Error> {
    // force the log level to info if we're testing config
    let log_level = match clap_results.get_flag("configcheck") {
        true => "info".to_string(),
        false => config.chapps.log_level.to_ascii_lowercase(),
    };

    let logger = flexi_logger::Logger::try_with_str(log_level)
        .map_err(|e| std::io::Error::other(format!("Failed to start logger! {e:?}")))?;

    logger
        .write_mode(flexi_logger::WriteMode::Async)
        .filter(Box::new(LogFilter {
            filters: vec!["sqlx", "hickory", "mail_auth"],
        }))
        .set_palette("b1;3;2;6;5".to_string())
        .start()
        .map_err(|e| std::io::Error::other(format!("Failed to start logger! {e:?}")))
}

pub struct LogFilter {
    filters: Vec<&'static str>,
}

impl LogLineFilter for LogFilter {
    fn write(
        &self,
        now: &mut DeferredNow,
        record: &log::Record,
        log_line_writer: &dyn LogLineWriter,
    ) -> std::io::Result<()> {
        if self
            .filters
            .iter()
            .any(|r| record.metadata().target().starts_with(r))
        {
            return Ok(());
        }
        log_line_writer.write(now, record)?;
        Ok(())
    }
}
