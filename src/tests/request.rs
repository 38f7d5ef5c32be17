use crate::config::GlobalParams;
use crate::error::ChappsError;
use crate::request::PolicyRequest;
use crate::tests::request_from;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

#[test]
fn test_empty_frame_parses_to_empty_record() {
    let record = PolicyRequest::parse(b"\n\n", encoding_rs::UTF_8).expect("Failed to parse");
    assert!(record.is_empty());
    assert_eq!(record.len(), 0);
    assert_eq!(record.instance(), None);
    assert!(record.recipients().is_empty());
}

#[test]
fn test_round_trip_preserves_every_pair() {
    let record = request_from(&[
        "instance=a413.1",
        "queue_id=B9A3F1",
        "sender=somebody@chapps.io",
        "recipient=bar@foo.tld",
        "client_address=10.10.10.10",
    ]);
    let reserialized = record.serialized();
    let original: HashSet<&str> = [
        "instance=a413.1",
        "queue_id=B9A3F1",
        "sender=somebody@chapps.io",
        "recipient=bar@foo.tld",
        "client_address=10.10.10.10",
    ]
    .into_iter()
    .collect();
    let round_tripped: HashSet<&str> = reserialized.split('\n').collect();
    assert_eq!(original, round_tripped);
}

#[test]
fn test_keyed_access_matches_named_accessor() {
    let record = request_from(&["sender=somebody@chapps.io", "helo_name=mail.chapps.io"]);
    assert_eq!(record.get("sender"), record.sender());
    assert_eq!(record.get("helo_name"), record.helo_name());
    assert_eq!(record.get("sasl_username"), record.sasl_username());
}

#[test]
fn test_missing_key_yields_none_not_error() {
    let record = request_from(&["instance=a413.1"]);
    assert_eq!(record.get("no_such_key"), None);
    // and again, via the memo this time
    assert_eq!(record.get("no_such_key"), None);
}

#[test]
fn test_value_containing_equals_sign_survives() {
    let record = request_from(&["ccert_subject=CN=relay.chapps.io"]);
    assert_eq!(
        record.ccert_subject(),
        Some("CN=relay.chapps.io".to_string())
    );
}

#[test]
fn test_five_recipients_split_on_comma() {
    let record = request_from(&[
        "recipient=one@foo.tld,two@foo.tld,three@foo.tld,four@foo.tld,five@foo.tld",
    ]);
    assert_eq!(record.recipients().len(), 5);
    assert_eq!(record.recipients()[0], "one@foo.tld");
    assert_eq!(record.recipients()[4], "five@foo.tld");
}

#[test]
fn test_equality_and_hash_follow_instance_and_queue_id() {
    let first = request_from(&["instance=a413.1", "queue_id=B9A3F1", "sender=x@y.z"]);
    let second = request_from(&["instance=a413.1", "queue_id=B9A3F1", "sender=other@y.z"]);
    let third = request_from(&["instance=a413.2", "queue_id=B9A3F1", "sender=x@y.z"]);
    assert_eq!(first, second);
    assert_ne!(first, third);

    let hash_of = |record: &PolicyRequest| {
        let mut hasher = DefaultHasher::new();
        record.hash(&mut hasher);
        hasher.finish()
    };
    assert_eq!(hash_of(&first), hash_of(&second));
}

#[test]
fn test_literal_none_falls_through_to_next_identity_key() {
    let record = request_from(&[
        "sasl_username=None",
        "ccert_subject=ccullen@easydns.com",
        "sender=caleb@chapps.io",
    ]);
    let user = record
        .user(&GlobalParams::default())
        .expect("Failed to resolve user");
    assert_eq!(user, "ccullen@easydns.com");
}

#[test]
fn test_user_prefers_the_configured_key() {
    let params = GlobalParams {
        user_key: "ccert_subject".to_string(),
        ..Default::default()
    };
    let record = request_from(&[
        "sasl_username=somebody",
        "ccert_subject=ccullen@easydns.com",
    ]);
    assert_eq!(
        record.user(&params).expect("Failed to resolve user"),
        "ccullen@easydns.com"
    );
}

#[test]
fn test_user_falls_back_to_client_address() {
    let record = request_from(&["client_address=10.10.10.10"]);
    let user = record
        .user(&GlobalParams::default())
        .expect("Failed to resolve user");
    assert_eq!(user, "10.10.10.10");
}

#[test]
fn test_require_user_key_denies_when_absent() {
    let params = GlobalParams {
        require_user_key: true,
        ..Default::default()
    };
    let record = request_from(&["sender=caleb@chapps.io"]);
    assert!(matches!(
        record.user(&params),
        Err(ChappsError::AuthenticationFailure(_))
    ));
}

#[test]
fn test_no_identity_at_all_is_an_authentication_failure() {
    let record = request_from(&["instance=a413.1"]);
    assert!(matches!(
        record.user(&GlobalParams::default()),
        Err(ChappsError::AuthenticationFailure(_))
    ));
}

#[test]
fn test_sender_domain() {
    let record = request_from(&["sender=caleb@chapps.io"]);
    assert_eq!(
        record.sender_domain().expect("Failed to get domain"),
        "chapps.io"
    );
}

#[test]
fn test_sender_domain_with_two_ats_raises() {
    let record = request_from(&["sender=caleb@chapps@io"]);
    assert!(matches!(
        record.sender_domain(),
        Err(ChappsError::TooManyAts(_))
    ));
}

#[test]
fn test_sender_domain_without_at_raises() {
    let record = request_from(&["sender=not-an-address"]);
    assert!(matches!(
        record.sender_domain(),
        Err(ChappsError::NotAnEmailAddress(_))
    ));
}

#[test]
fn test_empty_sender_is_the_null_sender() {
    let record = request_from(&["sender=", "recipient=bar@foo.tld"]);
    assert!(matches!(
        record.sender_domain(),
        Err(ChappsError::NullSender)
    ));
}

#[test]
fn test_recipient_domain_of_first_recipient_wins() {
    let record = request_from(&["recipient=bar@foo.tld,other@else.where"]);
    assert_eq!(
        record.recipient_domain().expect("Failed to get domain"),
        "foo.tld"
    );
}

#[test]
fn test_recipient_domain_without_recipients_raises() {
    let record = request_from(&["instance=a413.1"]);
    assert!(matches!(
        record.recipient_domain(),
        Err(ChappsError::NoRecipients)
    ));
}
