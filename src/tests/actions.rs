use crate::actions::{action_key, SpfAction, SpfActions};
use crate::config::SpfActionParams;
use mail_auth::SpfResult;

#[test]
fn test_parse_simple_heads() {
    assert_eq!(
        SpfAction::parse("DUNNO").expect("parse"),
        SpfAction::Dunno
    );
    assert_eq!(SpfAction::parse("OK").expect("parse"), SpfAction::Okay);
    assert_eq!(
        SpfAction::parse("prepend").expect("parse"),
        SpfAction::Prepend
    );
    assert_eq!(
        SpfAction::parse("greylist").expect("parse"),
        SpfAction::Greylist
    );
}

#[test]
fn test_parse_reason_bearing_heads() {
    assert_eq!(
        SpfAction::parse("REJECT Rejected - no thanks").expect("parse"),
        SpfAction::Reject("Rejected - no thanks".to_string())
    );
    assert_eq!(
        SpfAction::parse("DEFER_IF_PERMIT try again later").expect("parse"),
        SpfAction::DeferIfPermit("try again later".to_string())
    );
}

#[test]
fn test_parse_numeric_template() {
    assert_eq!(
        SpfAction::parse("550 5.7.1 SPF check failed: {reason}").expect("parse"),
        SpfAction::Template("550 5.7.1 SPF check failed: {reason}".to_string())
    );
}

#[test]
fn test_parse_rejects_gibberish() {
    assert!(SpfAction::parse("explode violently").is_err());
}

#[test]
fn test_template_substitutes_the_reason() {
    let action = SpfAction::parse("550 5.7.1 SPF check failed: {reason}").expect("parse");
    assert_eq!(
        action.directive("R", None).expect("directive"),
        "550 5.7.1 SPF check failed: R"
    );
}

#[test]
fn test_reject_appends_the_reason() {
    let action = SpfAction::Reject("Rejected".to_string());
    assert_eq!(
        action.directive("bad SPF", None).expect("directive"),
        "REJECT Rejected bad SPF"
    );
    assert_eq!(action.directive("", None).expect("directive"), "REJECT Rejected");
}

#[test]
fn test_defer_if_permit_directive() {
    let action = SpfAction::DeferIfPermit("Service temporarily unavailable".to_string());
    assert_eq!(
        action.directive("", None).expect("directive"),
        "DEFER_IF_PERMIT Service temporarily unavailable"
    );
}

#[test]
fn test_prepend_requires_a_real_header() {
    let action = SpfAction::Prepend;
    assert_eq!(
        action
            .directive("", Some("Received-SPF: pass"))
            .expect("directive"),
        "PREPEND Received-SPF: pass"
    );
    assert!(action.directive("", Some("hi")).is_err());
    assert!(action.directive("", None).is_err());
}

#[test]
fn test_none_and_neutral_share_one_action() {
    assert_eq!(action_key(SpfResult::None), "none_neutral");
    assert_eq!(action_key(SpfResult::Neutral), "none_neutral");
    assert_eq!(action_key(SpfResult::Pass), "passing");
}

#[test]
fn test_default_action_table() {
    let actions = SpfActions::from_params(&SpfActionParams::default()).expect("table");
    assert_eq!(*actions.action_for(SpfResult::SoftFail), SpfAction::Greylist);
    assert_eq!(*actions.action_for(SpfResult::Neutral), SpfAction::Greylist);
    assert_eq!(*actions.action_for(SpfResult::Pass), SpfAction::Prepend);
    assert!(matches!(
        actions.action_for(SpfResult::Fail),
        SpfAction::Template(_)
    ));
    assert!(matches!(
        actions.action_for(SpfResult::TempError),
        SpfAction::Template(_)
    ));
}
