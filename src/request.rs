use crate::config::GlobalParams;
use crate::error::ChappsError;
use encoding_rs::Encoding;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};

/// Look up the payload encoding by its configured label
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding, ChappsError> {
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| ChappsError::StartupError(format!("Unknown payload encoding {label:?}")))
}

/// One parsed policy delegation frame.
///
/// Postfix sends a frame of `key=value` lines; most requests only ever have
/// a handful of their attributes inspected, so parsing is lazy: the first
/// lookup of a key scans the payload once and memoizes the binding, and
/// full iteration materializes the whole mapping.  Two requests are equal
/// iff their `(instance, queue_id)` pair matches.
pub struct PolicyRequest {
    payload: Vec<String>,
    memo: Mutex<HashMap<String, Option<String>>>,
}

macro_rules! attribute {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub fn $name(&self) -> Option<String> {
            self.get(stringify!($name))
        }
    };
}

impl PolicyRequest {
    /// Parse one frame.  The two terminator bytes are discarded before the
    /// payload is split into lines.
    pub fn parse(frame: &[u8], encoding: &'static Encoding) -> Result<Self, ChappsError> {
        let body = &frame[..frame.len().saturating_sub(2)];
        let (decoded, _, had_errors) = encoding.decode(body);
        if had_errors {
            return Err(ChappsError::MalformedFrame(format!(
                "payload is not valid {}",
                encoding.name()
            )));
        }
        let payload: Vec<String> = decoded
            .split('\n')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            payload,
            memo: Mutex::new(HashMap::new()),
        })
    }

    /// Keyed access; scans the payload on first use and memoizes the result.
    /// Missing keys yield `None`, never an error.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.memo.lock().get(key) {
            return value.clone();
        }
        let found = self.payload.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k == key).then(|| v.to_string())
        });
        self.memo.lock().insert(key.to_string(), found.clone());
        if found.is_none() {
            debug!("No lines in {self} matched {key}.");
        }
        found
    }

    /// The number of payload lines
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Materialize every `(key, value)` pair in payload order, memoizing
    /// them all for future random access.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mapping: Vec<(String, String)> = self
            .payload
            .iter()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        let mut memo = self.memo.lock();
        for (k, v) in &mapping {
            memo.entry(k.clone()).or_insert_with(|| Some(v.clone()));
        }
        mapping
    }

    attribute!(
        /// Opaque per-decision transaction id; repeats across MTA rechecks
        instance
    );
    attribute!(queue_id);
    attribute!(protocol_state);
    attribute!(protocol_name);
    attribute!(helo_name);
    attribute!(client_address);
    attribute!(client_name);
    attribute!(reverse_client_name);
    attribute!(
        /// RFC5321 MAIL FROM, possibly empty (the null sender)
        sender
    );
    attribute!(
        /// RFC5321 RCPT TO; may hold several comma-separated addresses
        recipient
    );
    attribute!(recipient_count);
    attribute!(sasl_username);
    attribute!(ccert_subject);
    attribute!(size);

    /// The `recipient` datum split into comma-separated tokens, for easier
    /// counting
    pub fn recipients(&self) -> Vec<String> {
        match self.recipient() {
            Some(value) if !value.is_empty() => {
                value.split(',').map(str::to_string).collect()
            }
            _ => vec![],
        }
    }

    /// The identity under which outbound mail is accounted.
    ///
    /// Walks the configured user key followed by the standard priority list,
    /// taking the first attribute with a real value; Postfix sometimes sends
    /// the literal string `None`, which does not count.
    pub fn user(&self, params: &GlobalParams) -> Result<String, ChappsError> {
        if params.require_user_key {
            return match self.get(&params.user_key) {
                Some(value) if !value.is_empty() && value != "None" => Ok(value),
                _ => Err(ChappsError::AuthenticationFailure(params.user_key.clone())),
            };
        }
        let mut keys: Vec<&str> = vec![params.user_key.as_str()];
        for key in ["sasl_username", "ccert_subject", "sender", "client_address"] {
            if key != params.user_key {
                keys.push(key);
            }
        }
        for key in &keys {
            if let Some(value) = self.get(key) {
                if !value.is_empty() && value != "None" {
                    debug!("Selecting quota-identifier {value} from key {key}");
                    return Ok(value);
                }
            }
        }
        Err(ChappsError::AuthenticationFailure(keys.join(", ")))
    }

    /// Domain portion of the sender address, for sender-domain authorization
    pub fn sender_domain(&self) -> Result<String, ChappsError> {
        let sender = self.sender().unwrap_or_default();
        if sender.is_empty() {
            return Err(ChappsError::NullSender);
        }
        match sender.matches('@').count() {
            0 => Err(ChappsError::NotAnEmailAddress(sender)),
            1 => Ok(domain_part(&sender).to_string()),
            _ => {
                debug!(
                    "Found sender email with more than one at-sign: sender={sender} instance={}",
                    self.instance().unwrap_or_default()
                );
                Err(ChappsError::TooManyAts(sender))
            }
        }
    }

    /// Domain portion of the first recipient, for inbound domain gating
    pub fn recipient_domain(&self) -> Result<String, ChappsError> {
        let recipients = self.recipients();
        let first = recipients.first().ok_or(ChappsError::NoRecipients)?;
        let domains: HashSet<&str> = recipients.iter().map(|r| domain_part(r)).collect();
        if domains.len() > 1 {
            debug!("Using first recipient {first} for domain flags.");
        }
        Ok(domain_part(first).to_string())
    }

    /// The payload re-serialized as `key=value` lines
    pub fn serialized(&self) -> String {
        self.pairs()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

fn domain_part(address: &str) -> &str {
    address.rsplit('@').next().unwrap_or(address)
}

impl PartialEq for PolicyRequest {
    fn eq(&self, other: &Self) -> bool {
        self.instance() == other.instance() && self.queue_id() == other.queue_id()
    }
}

impl Eq for PolicyRequest {}

impl Hash for PolicyRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance().hash(state);
        self.queue_id().hash(state);
    }
}

impl Display for PolicyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "i={} sender={} client_address={} recipient={}",
            self.instance().unwrap_or_default(),
            self.sender().unwrap_or_else(|| "None".to_string()),
            self.client_address().unwrap_or_default(),
            self.recipient().unwrap_or_default(),
        ))
    }
}

impl Debug for PolicyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRequest")
            .field("payload", &self.payload)
            .finish()
    }
}
