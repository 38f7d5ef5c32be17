use crate::config::SpfActionParams;
use crate::error::ChappsError;
use mail_auth::SpfResult;

/// Shortest header Postfix will accept with a PREPEND directive
const MIN_PREPEND_LEN: usize = 5;

/// Config key for an SPF result.  `pass` is a reserved word in too many
/// places, so it maps to `passing`; `none` and `neutral` deliberately share
/// one action.
pub fn action_key(result: SpfResult) -> &'static str {
    match result {
        SpfResult::Pass => "passing",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::TempError => "temperror",
        SpfResult::PermError => "permerror",
        SpfResult::None | SpfResult::Neutral => "none_neutral",
    }
}

/// One parsed directive head from the `[PostfixSPFActions]` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfAction {
    /// `DUNNO`: defer to later filters
    Dunno,
    /// `OK`: accept unconditionally
    Okay,
    /// `PREPEND <header>`: accept and add one header line
    Prepend,
    /// `DEFER_IF_PERMIT <reason>`
    DeferIfPermit(String),
    /// `REJECT <reason>`
    Reject(String),
    /// Explicit `<code> <enhanced> <reason>` line; `{reason}` is substituted
    Template(String),
    /// Fall through into the greylisting policy
    Greylist,
}

impl SpfAction {
    pub fn parse(input: &str) -> Result<Self, ChappsError> {
        let input = input.trim();
        let head = input.split(' ').next().unwrap_or_default();
        let rest = input[head.len()..].trim_start().to_string();
        match head {
            "DUNNO" | "dunno" => Ok(SpfAction::Dunno),
            "OK" | "ok" | "okay" => Ok(SpfAction::Okay),
            "PREPEND" | "prepend" => Ok(SpfAction::Prepend),
            "DEFER_IF_PERMIT" | "defer_if_permit" => Ok(SpfAction::DeferIfPermit(rest)),
            "REJECT" | "reject" => Ok(SpfAction::Reject(rest)),
            "greylist" => Ok(SpfAction::Greylist),
            _ if head.parse::<u16>().is_ok() => Ok(SpfAction::Template(input.to_string())),
            _ => Err(ChappsError::InvalidValue(format!(
                "Unrecognized action directive {input:?}"
            ))),
        }
    }

    /// Render the final MTA directive.  `header` feeds PREPEND; `reason`
    /// is appended to reason-bearing heads and substituted into templates.
    pub fn directive(&self, reason: &str, header: Option<&str>) -> Result<String, ChappsError> {
        match self {
            SpfAction::Dunno => Ok("DUNNO".to_string()),
            SpfAction::Okay => Ok("OK".to_string()),
            SpfAction::Prepend => {
                let header = header.unwrap_or_default();
                if header.len() < MIN_PREPEND_LEN {
                    return Err(ChappsError::InvalidValue(format!(
                        "Prepended header expected to be at least {MIN_PREPEND_LEN} chars in length, got {header:?}"
                    )));
                }
                Ok(format!("PREPEND {header}"))
            }
            SpfAction::DeferIfPermit(msg) => {
                Ok(format!("DEFER_IF_PERMIT {}", join_reason(msg, reason)))
            }
            SpfAction::Reject(msg) => Ok(format!("REJECT {}", join_reason(msg, reason))),
            SpfAction::Template(template) => Ok(template.replace("{reason}", reason)),
            SpfAction::Greylist => Err(ChappsError::InvalidValue(
                "greylist actions must be resolved by the policy engine".to_string(),
            )),
        }
    }
}

fn join_reason(msg: &str, reason: &str) -> String {
    match (msg.is_empty(), reason.is_empty()) {
        (true, _) => reason.to_string(),
        (_, true) => msg.to_string(),
        _ => format!("{msg} {reason}"),
    }
}

/// The per-result action table for SPF enforcement, parsed once from config
#[derive(Debug, Clone)]
pub struct SpfActions {
    passing: SpfAction,
    fail: SpfAction,
    softfail: SpfAction,
    temperror: SpfAction,
    permerror: SpfAction,
    none_neutral: SpfAction,
}

impl SpfActions {
    pub fn from_params(params: &SpfActionParams) -> Result<Self, ChappsError> {
        Ok(Self {
            passing: SpfAction::parse(&params.passing)?,
            fail: SpfAction::parse(&params.fail)?,
            softfail: SpfAction::parse(&params.softfail)?,
            temperror: SpfAction::parse(&params.temperror)?,
            permerror: SpfAction::parse(&params.permerror)?,
            none_neutral: SpfAction::parse(&params.none_neutral)?,
        })
    }

    pub fn action_for(&self, result: SpfResult) -> &SpfAction {
        match action_key(result) {
            "passing" => &self.passing,
            "fail" => &self.fail,
            "softfail" => &self.softfail,
            "temperror" => &self.temperror,
            "permerror" => &self.permerror,
            _ => &self.none_neutral,
        }
    }

    /// The action used when a greylist fall-through passes
    pub fn passing(&self) -> &SpfAction {
        &self.passing
    }
}
