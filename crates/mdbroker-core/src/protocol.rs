//! Majordomo wire protocol: roles, commands and the frame codec
//!
//! Every message exchanged with the broker is an ordered list of byte frames:
//!
//! ```text
//! [senderAddress, "", roleTag, commandTag, ...payload]
//! ```
//!
//! The sender address is supplied by the transport, not by the peer. Peers
//! themselves write `["", roleTag, commandTag, ...payload]` and receive the
//! same shape back from the broker.

use std::fmt;
use thiserror::Error;

/// A single message frame
pub type Frame = Vec<u8>;

/// An ordered multi-frame message
pub type Multipart = Vec<Frame>;

/// Minimum number of frames in a routed message
pub const MIN_ROUTED_FRAMES: usize = 4;

/// Reasons a frame list is rejected by the codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message has {count} frames, expected at least {expected}")]
    TooFewFrames { count: usize, expected: usize },

    #[error("second frame must be an empty delimiter")]
    MissingDelimiter,

    #[error("unknown role tag: {0}")]
    UnknownRole(String),

    #[error("unknown command tag: {0}")]
    UnknownCommand(String),

    #[error("envelope is missing the client address")]
    MissingClientAddress,

    #[error("message is missing the service name")]
    MissingServiceName,

    #[error("request for service '{0}' has no body")]
    EmptyRequestBody(String),

    #[error("{role} peers may not send {command}")]
    UnexpectedCommand { role: Role, command: Command },
}

/// Opaque peer address as reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(Vec<u8>);

impl PeerAddress {
    /// Create a new address from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw address bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Address with a suffix appended, e.g. the `_receiver` inbound address
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut bytes = Vec::with_capacity(self.0.len() + suffix.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(suffix.as_bytes());
        Self(bytes)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Frame> for PeerAddress {
    fn from(frame: Frame) -> Self {
        Self(frame)
    }
}

/// Peer role carried in the role tag frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Worker,
}

impl Role {
    /// Wire tag for this role
    pub fn tag(&self) -> &'static [u8] {
        match self {
            Role::Client => b"CLIENT",
            Role::Worker => b"WORKER",
        }
    }

    /// Parse a role tag frame
    pub fn from_tag(tag: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            b"CLIENT" => Ok(Role::Client),
            b"WORKER" => Ok(Role::Worker),
            other => Err(ProtocolError::UnknownRole(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "CLIENT"),
            Role::Worker => write!(f, "WORKER"),
        }
    }
}

/// Protocol command carried in the command tag frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Request,
    VerificationRequest,
    VerificationResponse,
    Reply,
    Heartbeat,
    Disconnect,
}

impl Command {
    /// Wire tag for this command
    pub fn tag(&self) -> &'static [u8] {
        match self {
            Command::Request => b"REQUEST",
            Command::VerificationRequest => b"VERIFICATION_REQUEST",
            Command::VerificationResponse => b"VERIFICATION_RESPONSE",
            Command::Reply => b"REPLY",
            Command::Heartbeat => b"HEARTBEAT",
            Command::Disconnect => b"DISCONNECT",
        }
    }

    /// Parse a command tag frame
    pub fn from_tag(tag: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            b"REQUEST" => Ok(Command::Request),
            b"VERIFICATION_REQUEST" => Ok(Command::VerificationRequest),
            b"VERIFICATION_RESPONSE" => Ok(Command::VerificationResponse),
            b"REPLY" => Ok(Command::Reply),
            b"HEARTBEAT" => Ok(Command::Heartbeat),
            b"DISCONNECT" => Ok(Command::Disconnect),
            other => Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.tag()))
    }
}

/// A validated message received by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Address of the peer that sent the message
    pub sender: PeerAddress,
    /// Role declared by the sender
    pub role: Role,
    /// Command
    pub command: Command,
    /// Frames following the command tag
    pub body: Vec<Frame>,
}

/// A validated message received by a peer from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub role: Role,
    pub command: Command,
    pub body: Vec<Frame>,
}

/// Parse a routed frame list `[sender, "", role, command, ...body]`
pub fn parse(frames: Multipart) -> Result<Message, ProtocolError> {
    if frames.len() < MIN_ROUTED_FRAMES {
        return Err(ProtocolError::TooFewFrames {
            count: frames.len(),
            expected: MIN_ROUTED_FRAMES,
        });
    }

    let mut frames = frames.into_iter();
    let sender = frames.next().map(PeerAddress::from).unwrap_or_default();
    let delivery = parse_delivery(frames.collect())?;

    Ok(Message {
        sender,
        role: delivery.role,
        command: delivery.command,
        body: delivery.body,
    })
}

/// Parse a frame list whose address frame was already stripped:
/// `["", role, command, ...body]`
pub fn parse_delivery(frames: Multipart) -> Result<Delivery, ProtocolError> {
    let expected = MIN_ROUTED_FRAMES - 1;
    if frames.len() < expected {
        return Err(ProtocolError::TooFewFrames {
            count: frames.len(),
            expected,
        });
    }

    let mut frames = frames.into_iter();
    let delimiter = frames.next().unwrap_or_default();
    if !delimiter.is_empty() {
        return Err(ProtocolError::MissingDelimiter);
    }
    let role = Role::from_tag(&frames.next().unwrap_or_default())?;
    let command = Command::from_tag(&frames.next().unwrap_or_default())?;

    Ok(Delivery {
        role,
        command,
        body: frames.collect(),
    })
}

/// Build a message as a peer writes it: `["", role, command, ...payload]`
pub fn encode(role: Role, command: Command, payload: Vec<Frame>) -> Multipart {
    let mut frames = Vec::with_capacity(payload.len() + 3);
    frames.push(Vec::new());
    frames.push(role.tag().to_vec());
    frames.push(command.tag().to_vec());
    frames.extend(payload);
    frames
}

/// Build a message addressed to `destination`:
/// `[destination, "", role, command, ...payload]`
pub fn encode_routed(
    destination: &PeerAddress,
    role: Role,
    command: Command,
    payload: Vec<Frame>,
) -> Multipart {
    let mut frames = Vec::with_capacity(payload.len() + 4);
    frames.push(destination.as_bytes().to_vec());
    frames.extend(encode(role, command, payload));
    frames
}

/// Prepend the reply route `[client, ""]` onto a request body
pub fn wrap_envelope(client: &PeerAddress, body: Vec<Frame>) -> Multipart {
    let mut frames = Vec::with_capacity(body.len() + 2);
    frames.push(client.as_bytes().to_vec());
    frames.push(Vec::new());
    frames.extend(body);
    frames
}

/// Split the reply route off an envelope, returning the client address and
/// the remaining body. The empty delimiter after the address is optional.
pub fn unwrap_envelope(frames: Vec<Frame>) -> Result<(PeerAddress, Vec<Frame>), ProtocolError> {
    let mut frames = frames.into_iter().peekable();
    let client = frames
        .next()
        .map(PeerAddress::from)
        .ok_or(ProtocolError::MissingClientAddress)?;
    if frames.peek().is_some_and(|f| f.is_empty()) {
        frames.next();
    }
    Ok((client, frames.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Multipart {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_valid_request() {
        let msg = parse(frames(&["client-1", "", "CLIENT", "REQUEST", "echo", "id-1", "hi"]))
            .unwrap();
        assert_eq!(msg.sender, PeerAddress::from("client-1"));
        assert_eq!(msg.role, Role::Client);
        assert_eq!(msg.command, Command::Request);
        assert_eq!(msg.body, frames(&["echo", "id-1", "hi"]));
    }

    #[test]
    fn test_parse_minimal_message_has_empty_body() {
        let msg = parse(frames(&["w", "", "WORKER", "HEARTBEAT"])).unwrap();
        assert_eq!(msg.command, Command::Heartbeat);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_parse_too_few_frames() {
        let err = parse(frames(&["client-1", ""])).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TooFewFrames {
                count: 2,
                expected: 4
            }
        );
    }

    #[test]
    fn test_parse_non_empty_delimiter() {
        let err = parse(frames(&["client-1", "x", "CLIENT", "REQUEST"])).unwrap_err();
        assert_eq!(err, ProtocolError::MissingDelimiter);
    }

    #[test]
    fn test_parse_unknown_role() {
        let err = parse(frames(&["peer", "", "ADMIN", "REQUEST"])).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownRole("ADMIN".to_string()));
    }

    #[test]
    fn test_parse_unknown_command() {
        let err = parse(frames(&["peer", "", "WORKER", "READY"])).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("READY".to_string()));
    }

    #[test]
    fn test_encode_routed_layout() {
        let dest = PeerAddress::from("w1_receiver");
        let msg = encode_routed(&dest, Role::Worker, Command::Disconnect, vec![]);
        assert_eq!(msg, frames(&["w1_receiver", "", "WORKER", "DISCONNECT"]));
    }

    #[test]
    fn test_parse_delivery_from_encoded() {
        let msg = encode(
            Role::Client,
            Command::VerificationResponse,
            vec![b"broker-1".to_vec()],
        );
        let delivery = parse_delivery(msg).unwrap();
        assert_eq!(delivery.command, Command::VerificationResponse);
        assert_eq!(delivery.body, frames(&["broker-1"]));
    }

    #[test]
    fn test_envelope_carries_reply_route() {
        let client = PeerAddress::from("client-7");
        let envelope = wrap_envelope(&client, frames(&["corr-1", "payload"]));
        assert_eq!(envelope, frames(&["client-7", "", "corr-1", "payload"]));

        let (addr, body) = unwrap_envelope(envelope).unwrap();
        assert_eq!(addr, client);
        assert_eq!(body, frames(&["corr-1", "payload"]));
    }

    #[test]
    fn test_unwrap_envelope_without_delimiter() {
        let (addr, body) = unwrap_envelope(frames(&["client-7", "data"])).unwrap();
        assert_eq!(addr, PeerAddress::from("client-7"));
        assert_eq!(body, frames(&["data"]));
    }

    #[test]
    fn test_unwrap_empty_envelope() {
        assert_eq!(
            unwrap_envelope(vec![]).unwrap_err(),
            ProtocolError::MissingClientAddress
        );
    }

    #[test]
    fn test_inbound_suffix() {
        let addr = PeerAddress::from("worker-3");
        assert_eq!(addr.with_suffix("_receiver").to_string(), "worker-3_receiver");
    }
}
