use crate::config::PolicyChannel;
use crate::error::ChappsError;
use crate::policy::{EmailPolicy, PolicyOutcome};
use crate::request::PolicyRequest;
use encoding_rs::Encoding;
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;

/// Read one policy frame: `key=value` lines up to and including the blank
/// line which terminates the frame.  Returns `Ok(None)` on a clean
/// disconnect, and `UnexpectedEof` when the peer hangs up mid-frame.
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut frame: Vec<u8> = vec![];
    loop {
        let read = reader.read_until(b'\n', &mut frame).await?;
        if read == 0 {
            if frame.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        if frame.ends_with(crate::FRAME_TERMINATOR) {
            return Ok(Some(frame));
        }
    }
}

/// An ordered bundle of policies sharing one listener.  A single policy is
/// just a bundle of one.
pub struct PolicyDispatcher {
    policies: Vec<Arc<dyn EmailPolicy>>,
    pub encoding: &'static Encoding,
}

impl PolicyDispatcher {
    pub fn new(
        policies: Vec<Arc<dyn EmailPolicy>>,
        encoding: &'static Encoding,
    ) -> Result<Self, ChappsError> {
        if policies.is_empty() {
            return Err(ChappsError::StartupError(
                "A list of policy objects must be provided.".to_string(),
            ));
        }
        Ok(Self { policies, encoding })
    }

    /// The first policy's listener settings rule the bundle
    pub fn channel(&self) -> &PolicyChannel {
        self.policies[0].channel()
    }

    /// Evaluate the policies in order on one request.  The first engine to
    /// deny ends the cascade and its directive is the response; when all
    /// engines accept, the last outcome's directive is sent.  A `NullSender`
    /// raised by an engine resolves per that engine's `null_sender_ok`.
    pub async fn dispatch(&self, request: &PolicyRequest) -> String {
        let mut response: Option<PolicyOutcome> = None;
        for policy in &self.policies {
            let channel = policy.channel();
            let outcome = match policy.approve(request).await {
                Ok(outcome) => outcome,
                Err(ChappsError::NullSender) => match channel.null_sender_ok {
                    true => {
                        debug!("{} accepted {request} on null sender", policy.name());
                        PolicyOutcome::accept(&channel.acceptance_message, policy.name())
                    }
                    false => {
                        debug!("{} denied {request} on null sender", policy.name());
                        PolicyOutcome::deny(&channel.rejection_message, policy.name())
                    }
                },
                Err(error) => {
                    warn!("{} raised {error} for {request}; denying", policy.name());
                    PolicyOutcome::deny(&channel.rejection_message, policy.name())
                }
            };
            debug!(
                " .. Policy {} answered {:?} with '{}'",
                policy.name(),
                outcome.verdict,
                outcome.directive
            );
            let denied = !outcome.is_ok();
            response = Some(outcome);
            if denied {
                break;
            }
        }
        response
            .map(|outcome| outcome.directive)
            .unwrap_or_else(|| "DUNNO".to_string())
    }
}

/// Handle one MTA connection: many frames may arrive over its lifetime,
/// and responses go back in request order.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<PolicyDispatcher>,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Postfix said goodbye. Terminating this task.");
                return;
            }
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Postfix hung up before a read could be completed. Terminating this task.");
                return;
            }
            Err(error) => {
                warn!("Error reading policy frame from {peer}: {error:?}");
                continue;
            }
        };
        let request = match PolicyRequest::parse(&frame, dispatcher.encoding) {
            Ok(request) => request,
            Err(error) => {
                // a frame we cannot decode poisons the whole stream
                error!("Malformed frame from {peer}: {error}");
                return;
            }
        };
        let directive = dispatcher.dispatch(&request).await;
        let response = format!("action={directive}\n\n");
        debug!("  .. Sending {response:?}");
        if let Err(error) = writer.write_all(response.as_bytes()).await {
            error!("Failed to send response to {peer}: {error:?}");
            return;
        }
    }
}

/// Main loop for one policy service: accept connections forever, one task
/// per connection.
pub async fn policy_server(
    dispatcher: Arc<PolicyDispatcher>,
    backlog: u32,
) -> std::io::Result<()> {
    let addr = dispatcher.channel().listener_address()?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(backlog)?;
    info!("Started policy listener on {addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(value) => value,
            Err(error) => {
                error!("Couldn't accept TCP connection: {error:?}");
                continue;
            }
        };
        debug!("TCP connection from {peer:?}");
        let conn_dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, conn_dispatcher).await;
        });
    }
}

/// Handles to the running service tasks
#[derive(Debug, Default)]
pub struct Servers {
    pub policyserver: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl Servers {
    pub fn with_policyserver(self, policyserver: JoinHandle<Result<(), std::io::Error>>) -> Self {
        Self {
            policyserver: Some(policyserver),
        }
    }

    pub fn all_finished(&self) -> bool {
        self.policyserver
            .as_ref()
            .map(|server| server.is_finished())
            .unwrap_or(true)
    }
}
