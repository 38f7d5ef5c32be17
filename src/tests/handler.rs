use crate::config::PolicyChannel;
use crate::error::ChappsError;
use crate::handler::{handle_connection, read_frame, PolicyDispatcher};
use crate::policy::{EmailPolicy, PolicyOutcome};
use crate::request::PolicyRequest;
use crate::tests::request_from;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_read_frame_returns_one_frame() {
    let wire: &[u8] = b"instance=a413.1\nsender=x@y.z\n\n";
    let mut reader = BufReader::new(wire);
    let frame = read_frame(&mut reader)
        .await
        .expect("read failed")
        .expect("expected a frame");
    assert_eq!(frame, wire.to_vec());
}

#[tokio::test]
async fn test_read_frame_splits_consecutive_frames() {
    let wire: &[u8] = b"instance=a413.1\n\ninstance=a413.2\n\n";
    let mut reader = BufReader::new(wire);
    let first = read_frame(&mut reader)
        .await
        .expect("read failed")
        .expect("expected a frame");
    let second = read_frame(&mut reader)
        .await
        .expect("read failed")
        .expect("expected a frame");
    assert_eq!(first, b"instance=a413.1\n\n".to_vec());
    assert_eq!(second, b"instance=a413.2\n\n".to_vec());
    assert!(read_frame(&mut reader).await.expect("read failed").is_none());
}

#[tokio::test]
async fn test_read_frame_terminator_only_is_an_empty_record() {
    let wire: &[u8] = b"\n\n";
    let mut reader = BufReader::new(wire);
    let frame = read_frame(&mut reader)
        .await
        .expect("read failed")
        .expect("expected a frame");
    let record = PolicyRequest::parse(&frame, encoding_rs::UTF_8).expect("parse failed");
    assert!(record.is_empty());
}

#[tokio::test]
async fn test_read_frame_clean_eof_is_none() {
    let wire: &[u8] = b"";
    let mut reader = BufReader::new(wire);
    assert!(read_frame(&mut reader).await.expect("read failed").is_none());
}

#[tokio::test]
async fn test_read_frame_mid_frame_hangup_is_unexpected_eof() {
    let wire: &[u8] = b"instance=a413.1\n";
    let mut reader = BufReader::new(wire);
    let error = read_frame(&mut reader).await.expect_err("expected an error");
    assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
}

enum StubBehavior {
    Accept,
    Deny,
    NullSender,
}

struct StubPolicy {
    name: &'static str,
    channel: PolicyChannel,
    behavior: StubBehavior,
}

impl StubPolicy {
    fn new(name: &'static str, behavior: StubBehavior) -> Self {
        Self {
            name,
            channel: PolicyChannel::new(0, &format!("DUNNO {name}"), &format!("REJECT {name}")),
            behavior,
        }
    }

    fn null_sender_ok(mut self) -> Self {
        self.channel.null_sender_ok = true;
        self
    }
}

#[async_trait]
impl EmailPolicy for StubPolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn channel(&self) -> &PolicyChannel {
        &self.channel
    }

    async fn approve(&self, _request: &PolicyRequest) -> Result<PolicyOutcome, ChappsError> {
        match self.behavior {
            StubBehavior::Accept => Ok(PolicyOutcome::accept(
                &self.channel.acceptance_message,
                self.name,
            )),
            StubBehavior::Deny => Ok(PolicyOutcome::deny(
                &self.channel.rejection_message,
                self.name,
            )),
            StubBehavior::NullSender => Err(ChappsError::NullSender),
        }
    }
}

fn dispatcher_of(policies: Vec<Arc<dyn EmailPolicy>>) -> PolicyDispatcher {
    PolicyDispatcher::new(policies, encoding_rs::UTF_8).expect("Failed to build dispatcher")
}

#[tokio::test]
async fn test_cascade_first_denial_wins() {
    let dispatcher = dispatcher_of(vec![
        Arc::new(StubPolicy::new("first", StubBehavior::Deny)),
        Arc::new(StubPolicy::new("second", StubBehavior::Accept)),
    ]);
    let request = request_from(&["instance=a413.1", "queue_id=Q"]);
    assert_eq!(dispatcher.dispatch(&request).await, "REJECT first");
}

#[tokio::test]
async fn test_cascade_middle_denial_short_circuits() {
    let dispatcher = dispatcher_of(vec![
        Arc::new(StubPolicy::new("first", StubBehavior::Accept)),
        Arc::new(StubPolicy::new("second", StubBehavior::Deny)),
        Arc::new(StubPolicy::new("third", StubBehavior::Accept)),
    ]);
    let request = request_from(&["instance=a413.1", "queue_id=Q"]);
    assert_eq!(dispatcher.dispatch(&request).await, "REJECT second");
}

#[tokio::test]
async fn test_cascade_last_acceptance_message_is_sent() {
    let dispatcher = dispatcher_of(vec![
        Arc::new(StubPolicy::new("first", StubBehavior::Accept)),
        Arc::new(StubPolicy::new("second", StubBehavior::Accept)),
    ]);
    let request = request_from(&["instance=a413.1", "queue_id=Q"]);
    assert_eq!(dispatcher.dispatch(&request).await, "DUNNO second");
}

#[tokio::test]
async fn test_null_sender_honored_when_allowed() {
    let dispatcher = dispatcher_of(vec![Arc::new(
        StubPolicy::new("sda", StubBehavior::NullSender).null_sender_ok(),
    )]);
    let request = request_from(&["instance=a413.1", "sender="]);
    assert_eq!(dispatcher.dispatch(&request).await, "DUNNO sda");
}

#[tokio::test]
async fn test_null_sender_denied_by_default() {
    let dispatcher = dispatcher_of(vec![Arc::new(StubPolicy::new(
        "sda",
        StubBehavior::NullSender,
    ))]);
    let request = request_from(&["instance=a413.1", "sender="]);
    assert_eq!(dispatcher.dispatch(&request).await, "REJECT sda");
}

#[tokio::test]
async fn test_dispatcher_requires_at_least_one_policy() {
    assert!(PolicyDispatcher::new(vec![], encoding_rs::UTF_8).is_err());
}

/// One real connection: several frames in, matching directives out, in order
#[tokio::test]
async fn test_connection_loop_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let dispatcher = Arc::new(dispatcher_of(vec![Arc::new(StubPolicy::new(
        "quota",
        StubBehavior::Accept,
    ))]));
    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.expect("Failed to accept");
        handle_connection(stream, peer, dispatcher).await;
    });

    let mut client = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to test server");
    for i in 0..3 {
        let frame = format!("instance=a413.{i}\nqueue_id=Q{i}\nsender=x@y.z\n\n");
        client
            .write_all(frame.as_bytes())
            .await
            .expect("Failed to send frame");
        let expected = b"action=DUNNO quota\n\n";
        let mut response = vec![0u8; expected.len()];
        client
            .read_exact(&mut response)
            .await
            .expect("Failed to read response");
        assert_eq!(&response[..], &expected[..]);
    }
    drop(client);
    server.await.expect("Server task panicked");
}
