//! Binary TCP protocol: commands, package framing and message bodies.
//!
//! # Frame Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       4     length of the package (i32, big-endian)
//! 4       1     command
//! 5       1     flags
//! 6       16    correlation id
//! 22      1     login length        (only when flags & AUTHENTICATED)
//! 23      n     login
//! 23+n    1     password length
//! 24+n    m     password
//! ...           message body
//! ```
//!
//! The length prefix covers everything after itself. Frames larger than
//! [`MAX_FRAME_SIZE`] are rejected.

pub mod messages;

pub use messages::*;

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::constants::{
    FRAME_LENGTH_PREFIX_SIZE, MAX_CREDENTIAL_LENGTH, MAX_FRAME_SIZE, PACKAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::types::UserCredentials;

/// Command byte of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpCommand {
    HeartbeatRequest,
    HeartbeatResponse,
    Ping,
    Pong,

    WriteEvents,
    WriteEventsCompleted,
    TransactionStart,
    TransactionStartCompleted,
    TransactionWrite,
    TransactionWriteCompleted,
    TransactionCommit,
    TransactionCommitCompleted,
    DeleteStream,
    DeleteStreamCompleted,

    ReadEvent,
    ReadEventCompleted,
    ReadStreamEventsForward,
    ReadStreamEventsForwardCompleted,
    ReadStreamEventsBackward,
    ReadStreamEventsBackwardCompleted,
    ReadAllEventsForward,
    ReadAllEventsForwardCompleted,
    ReadAllEventsBackward,
    ReadAllEventsBackwardCompleted,

    SubscribeToStream,
    SubscriptionConfirmation,
    StreamEventAppeared,
    UnsubscribeFromStream,
    SubscriptionDropped,
    ConnectToPersistentSubscription,
    PersistentSubscriptionConfirmation,
    PersistentSubscriptionStreamEventAppeared,
    CreatePersistentSubscription,
    CreatePersistentSubscriptionCompleted,
    DeletePersistentSubscription,
    DeletePersistentSubscriptionCompleted,
    PersistentSubscriptionAckEvents,
    PersistentSubscriptionNakEvents,
    UpdatePersistentSubscription,
    UpdatePersistentSubscriptionCompleted,

    BadRequest,
    NotHandled,
    Authenticate,
    Authenticated,
    NotAuthenticated,
    IdentifyClient,
    ClientIdentified,

    Unknown(u8),
}

impl TcpCommand {
    /// Command name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            TcpCommand::HeartbeatRequest => "HeartbeatRequest",
            TcpCommand::HeartbeatResponse => "HeartbeatResponse",
            TcpCommand::Ping => "Ping",
            TcpCommand::Pong => "Pong",
            TcpCommand::WriteEvents => "WriteEvents",
            TcpCommand::WriteEventsCompleted => "WriteEventsCompleted",
            TcpCommand::TransactionStart => "TransactionStart",
            TcpCommand::TransactionStartCompleted => "TransactionStartCompleted",
            TcpCommand::TransactionWrite => "TransactionWrite",
            TcpCommand::TransactionWriteCompleted => "TransactionWriteCompleted",
            TcpCommand::TransactionCommit => "TransactionCommit",
            TcpCommand::TransactionCommitCompleted => "TransactionCommitCompleted",
            TcpCommand::DeleteStream => "DeleteStream",
            TcpCommand::DeleteStreamCompleted => "DeleteStreamCompleted",
            TcpCommand::ReadEvent => "ReadEvent",
            TcpCommand::ReadEventCompleted => "ReadEventCompleted",
            TcpCommand::ReadStreamEventsForward => "ReadStreamEventsForward",
            TcpCommand::ReadStreamEventsForwardCompleted => "ReadStreamEventsForwardCompleted",
            TcpCommand::ReadStreamEventsBackward => "ReadStreamEventsBackward",
            TcpCommand::ReadStreamEventsBackwardCompleted => "ReadStreamEventsBackwardCompleted",
            TcpCommand::ReadAllEventsForward => "ReadAllEventsForward",
            TcpCommand::ReadAllEventsForwardCompleted => "ReadAllEventsForwardCompleted",
            TcpCommand::ReadAllEventsBackward => "ReadAllEventsBackward",
            TcpCommand::ReadAllEventsBackwardCompleted => "ReadAllEventsBackwardCompleted",
            TcpCommand::SubscribeToStream => "SubscribeToStream",
            TcpCommand::SubscriptionConfirmation => "SubscriptionConfirmation",
            TcpCommand::StreamEventAppeared => "StreamEventAppeared",
            TcpCommand::UnsubscribeFromStream => "UnsubscribeFromStream",
            TcpCommand::SubscriptionDropped => "SubscriptionDropped",
            TcpCommand::ConnectToPersistentSubscription => "ConnectToPersistentSubscription",
            TcpCommand::PersistentSubscriptionConfirmation => "PersistentSubscriptionConfirmation",
            TcpCommand::PersistentSubscriptionStreamEventAppeared => "PersistentSubscriptionStreamEventAppeared",
            TcpCommand::CreatePersistentSubscription => "CreatePersistentSubscription",
            TcpCommand::CreatePersistentSubscriptionCompleted => "CreatePersistentSubscriptionCompleted",
            TcpCommand::DeletePersistentSubscription => "DeletePersistentSubscription",
            TcpCommand::DeletePersistentSubscriptionCompleted => "DeletePersistentSubscriptionCompleted",
            TcpCommand::PersistentSubscriptionAckEvents => "PersistentSubscriptionAckEvents",
            TcpCommand::PersistentSubscriptionNakEvents => "PersistentSubscriptionNakEvents",
            TcpCommand::UpdatePersistentSubscription => "UpdatePersistentSubscription",
            TcpCommand::UpdatePersistentSubscriptionCompleted => "UpdatePersistentSubscriptionCompleted",
            TcpCommand::BadRequest => "BadRequest",
            TcpCommand::NotHandled => "NotHandled",
            TcpCommand::Authenticate => "Authenticate",
            TcpCommand::Authenticated => "Authenticated",
            TcpCommand::NotAuthenticated => "NotAuthenticated",
            TcpCommand::IdentifyClient => "IdentifyClient",
            TcpCommand::ClientIdentified => "ClientIdentified",
            TcpCommand::Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for TcpCommand {
    fn from(value: u8) -> Self {
        match value {
            0x01 => TcpCommand::HeartbeatRequest,
            0x02 => TcpCommand::HeartbeatResponse,
            0x03 => TcpCommand::Ping,
            0x04 => TcpCommand::Pong,

            0x82 => TcpCommand::WriteEvents,
            0x83 => TcpCommand::WriteEventsCompleted,
            0x84 => TcpCommand::TransactionStart,
            0x85 => TcpCommand::TransactionStartCompleted,
            0x86 => TcpCommand::TransactionWrite,
            0x87 => TcpCommand::TransactionWriteCompleted,
            0x88 => TcpCommand::TransactionCommit,
            0x89 => TcpCommand::TransactionCommitCompleted,
            0x8A => TcpCommand::DeleteStream,
            0x8B => TcpCommand::DeleteStreamCompleted,

            0xB0 => TcpCommand::ReadEvent,
            0xB1 => TcpCommand::ReadEventCompleted,
            0xB2 => TcpCommand::ReadStreamEventsForward,
            0xB3 => TcpCommand::ReadStreamEventsForwardCompleted,
            0xB4 => TcpCommand::ReadStreamEventsBackward,
            0xB5 => TcpCommand::ReadStreamEventsBackwardCompleted,
            0xB6 => TcpCommand::ReadAllEventsForward,
            0xB7 => TcpCommand::ReadAllEventsForwardCompleted,
            0xB8 => TcpCommand::ReadAllEventsBackward,
            0xB9 => TcpCommand::ReadAllEventsBackwardCompleted,

            0xC0 => TcpCommand::SubscribeToStream,
            0xC1 => TcpCommand::SubscriptionConfirmation,
            0xC2 => TcpCommand::StreamEventAppeared,
            0xC3 => TcpCommand::UnsubscribeFromStream,
            0xC4 => TcpCommand::SubscriptionDropped,
            0xC5 => TcpCommand::ConnectToPersistentSubscription,
            0xC6 => TcpCommand::PersistentSubscriptionConfirmation,
            0xC7 => TcpCommand::PersistentSubscriptionStreamEventAppeared,
            0xC8 => TcpCommand::CreatePersistentSubscription,
            0xC9 => TcpCommand::CreatePersistentSubscriptionCompleted,
            0xCA => TcpCommand::DeletePersistentSubscription,
            0xCB => TcpCommand::DeletePersistentSubscriptionCompleted,
            0xCC => TcpCommand::PersistentSubscriptionAckEvents,
            0xCD => TcpCommand::PersistentSubscriptionNakEvents,
            0xCE => TcpCommand::UpdatePersistentSubscription,
            0xCF => TcpCommand::UpdatePersistentSubscriptionCompleted,

            0xF0 => TcpCommand::BadRequest,
            0xF1 => TcpCommand::NotHandled,
            0xF2 => TcpCommand::Authenticate,
            0xF3 => TcpCommand::Authenticated,
            0xF4 => TcpCommand::NotAuthenticated,
            0xF5 => TcpCommand::IdentifyClient,
            0xF6 => TcpCommand::ClientIdentified,

            n => TcpCommand::Unknown(n),
        }
    }
}

impl From<TcpCommand> for u8 {
    fn from(command: TcpCommand) -> Self {
        match command {
            TcpCommand::HeartbeatRequest => 0x01,
            TcpCommand::HeartbeatResponse => 0x02,
            TcpCommand::Ping => 0x03,
            TcpCommand::Pong => 0x04,

            TcpCommand::WriteEvents => 0x82,
            TcpCommand::WriteEventsCompleted => 0x83,
            TcpCommand::TransactionStart => 0x84,
            TcpCommand::TransactionStartCompleted => 0x85,
            TcpCommand::TransactionWrite => 0x86,
            TcpCommand::TransactionWriteCompleted => 0x87,
            TcpCommand::TransactionCommit => 0x88,
            TcpCommand::TransactionCommitCompleted => 0x89,
            TcpCommand::DeleteStream => 0x8A,
            TcpCommand::DeleteStreamCompleted => 0x8B,

            TcpCommand::ReadEvent => 0xB0,
            TcpCommand::ReadEventCompleted => 0xB1,
            TcpCommand::ReadStreamEventsForward => 0xB2,
            TcpCommand::ReadStreamEventsForwardCompleted => 0xB3,
            TcpCommand::ReadStreamEventsBackward => 0xB4,
            TcpCommand::ReadStreamEventsBackwardCompleted => 0xB5,
            TcpCommand::ReadAllEventsForward => 0xB6,
            TcpCommand::ReadAllEventsForwardCompleted => 0xB7,
            TcpCommand::ReadAllEventsBackward => 0xB8,
            TcpCommand::ReadAllEventsBackwardCompleted => 0xB9,

            TcpCommand::SubscribeToStream => 0xC0,
            TcpCommand::SubscriptionConfirmation => 0xC1,
            TcpCommand::StreamEventAppeared => 0xC2,
            TcpCommand::UnsubscribeFromStream => 0xC3,
            TcpCommand::SubscriptionDropped => 0xC4,
            TcpCommand::ConnectToPersistentSubscription => 0xC5,
            TcpCommand::PersistentSubscriptionConfirmation => 0xC6,
            TcpCommand::PersistentSubscriptionStreamEventAppeared => 0xC7,
            TcpCommand::CreatePersistentSubscription => 0xC8,
            TcpCommand::CreatePersistentSubscriptionCompleted => 0xC9,
            TcpCommand::DeletePersistentSubscription => 0xCA,
            TcpCommand::DeletePersistentSubscriptionCompleted => 0xCB,
            TcpCommand::PersistentSubscriptionAckEvents => 0xCC,
            TcpCommand::PersistentSubscriptionNakEvents => 0xCD,
            TcpCommand::UpdatePersistentSubscription => 0xCE,
            TcpCommand::UpdatePersistentSubscriptionCompleted => 0xCF,

            TcpCommand::BadRequest => 0xF0,
            TcpCommand::NotHandled => 0xF1,
            TcpCommand::Authenticate => 0xF2,
            TcpCommand::Authenticated => 0xF3,
            TcpCommand::NotAuthenticated => 0xF4,
            TcpCommand::IdentifyClient => 0xF5,
            TcpCommand::ClientIdentified => 0xF6,

            TcpCommand::Unknown(n) => n,
        }
    }
}

/// Flag bits of a package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NONE: Self = TcpFlags(0x00);
    /// Credentials follow the correlation id.
    pub const AUTHENTICATED: Self = TcpFlags(0x01);
    pub const TRUSTED_WRITE: Self = TcpFlags(0x02);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        TcpFlags(self.0 | rhs.0)
    }
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub command: TcpCommand,
    pub flags: TcpFlags,
    pub correlation_id: Uuid,
    pub credentials: Option<UserCredentials>,
    pub data: Bytes,
}

impl Package {
    /// A package without a body.
    pub fn new(command: TcpCommand, correlation_id: Uuid) -> Self {
        Self {
            command,
            flags: TcpFlags::NONE,
            correlation_id,
            credentials: None,
            data: Bytes::new(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    /// Attach credentials and set the matching flag.
    pub fn with_credentials(mut self, credentials: Option<UserCredentials>) -> Self {
        match credentials {
            Some(creds) => {
                self.flags = self.flags | TcpFlags::AUTHENTICATED;
                self.credentials = Some(creds);
            }
            None => {
                self.flags =
                    TcpFlags::from_bits(self.flags.bits() & !TcpFlags::AUTHENTICATED.bits());
                self.credentials = None;
            }
        }
        self
    }

    /// Build a package carrying a typed message body.
    pub fn from_message<M: Message>(message: &M, correlation_id: Uuid) -> Result<Self> {
        let mut body = BytesMut::new();
        message.encode_body(&mut body)?;
        Ok(Package::new(message.command(), correlation_id).with_data(body.freeze()))
    }

    /// Decode the body as `M`.
    pub fn message<M: Message>(&self) -> Result<M> {
        M::decode_body(self.command, self.data.clone())
    }

    /// Body interpreted as a UTF-8 reason string (BadRequest, NotAuthenticated).
    pub fn data_as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Serialize everything after the frame length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PACKAGE_HEADER_SIZE + self.data.len());
        buf.put_u8(self.command.into());
        buf.put_u8(self.flags.bits());
        buf.put_slice(self.correlation_id.as_bytes());

        if self.flags.contains(TcpFlags::AUTHENTICATED) {
            let creds = self.credentials.as_ref().ok_or_else(|| {
                Error::InvalidArgument("authenticated flag set without credentials".to_string())
            })?;
            put_credential(&mut buf, "login", &creds.username)?;
            put_credential(&mut buf, "password", &creds.password)?;
        }

        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Parse a package from a frame whose length prefix was already removed.
    pub fn decode(mut frame: Bytes) -> Result<Package> {
        if frame.len() < PACKAGE_HEADER_SIZE {
            return Err(Error::ParsingError(frame));
        }
        let original = frame.clone();

        let command = TcpCommand::from(frame.get_u8());
        let flags = TcpFlags::from_bits(frame.get_u8());
        let correlation_id = Uuid::from_slice(&frame.split_to(16))
            .map_err(|_| Error::ParsingError(original.clone()))?;

        let credentials = if flags.contains(TcpFlags::AUTHENTICATED) {
            let username =
                take_credential(&mut frame).ok_or_else(|| Error::ParsingError(original.clone()))?;
            let password =
                take_credential(&mut frame).ok_or_else(|| Error::ParsingError(original.clone()))?;
            Some(UserCredentials { username, password })
        } else {
            None
        };

        Ok(Package {
            command,
            flags,
            correlation_id,
            credentials,
            data: frame,
        })
    }
}

fn put_credential(buf: &mut BytesMut, field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_CREDENTIAL_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "{} is longer than {} bytes",
            field, MAX_CREDENTIAL_LENGTH
        )));
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_credential(frame: &mut Bytes) -> Option<String> {
    if frame.is_empty() {
        return None;
    }
    let len = frame.get_u8() as usize;
    if frame.len() < len {
        return None;
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec()).ok()
}

/// Read one length-prefixed frame.
///
/// A clean end-of-stream before the prefix surfaces as [`Error::MissingData`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut size_buf = [0u8; FRAME_LENGTH_PREFIX_SIZE];
    if let Err(e) = reader.read_exact(&mut size_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::MissingData("Connection closed".to_owned()));
        }
        return Err(Error::IoError(e.kind()));
    }

    let size = (&size_buf[..]).get_i32();
    if size < 0 {
        return Err(Error::MissingData(format!(
            "Invalid negative frame size: {}",
            size
        )));
    }
    let size = size as usize;
    if size > MAX_FRAME_SIZE {
        return Err(Error::MissingData(format!(
            "Frame size {} exceeds maximum allowed size {}",
            size, MAX_FRAME_SIZE
        )));
    }

    let mut data = vec![0u8; size];
    if let Err(e) = reader.read_exact(&mut data).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::MissingData("Connection closed mid-frame".to_owned()));
        }
        return Err(Error::IoError(e.kind()));
    }

    Ok(Bytes::from(data))
}

/// Write `package` as one length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, package: &Package) -> Result<()> {
    let body = package.encode()?;
    let mut frame = BytesMut::with_capacity(FRAME_LENGTH_PREFIX_SIZE + body.len());
    frame.put_i32(body.len() as i32);
    frame.put_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_byte_mapping() {
        assert_eq!(u8::from(TcpCommand::WriteEvents), 0x82);
        assert_eq!(TcpCommand::from(0x83), TcpCommand::WriteEventsCompleted);
        assert_eq!(TcpCommand::from(0x77), TcpCommand::Unknown(0x77));
        assert_eq!(u8::from(TcpCommand::Unknown(0x77)), 0x77);
        for byte in 0..=u8::MAX {
            assert_eq!(u8::from(TcpCommand::from(byte)), byte);
        }
    }

    #[test]
    fn test_package_header_layout() {
        let id = Uuid::new_v4();
        let pkg = Package::new(TcpCommand::Ping, id).with_data(Bytes::from_static(b"abc"));
        let encoded = pkg.encode().unwrap();

        assert_eq!(encoded.len(), PACKAGE_HEADER_SIZE + 3);
        assert_eq!(encoded[0], 0x03);
        assert_eq!(encoded[1], 0x00);
        assert_eq!(&encoded[2..18], id.as_bytes());
        assert_eq!(&encoded[18..], b"abc");
        assert_eq!(Package::decode(encoded).unwrap(), pkg);
    }

    #[test]
    fn test_package_with_credentials() {
        let pkg = Package::new(TcpCommand::ReadEvent, Uuid::new_v4())
            .with_credentials(Some(UserCredentials::new("admin", "changeit")))
            .with_data(Bytes::from_static(b"body"));
        assert!(pkg.flags.contains(TcpFlags::AUTHENTICATED));

        let decoded = Package::decode(pkg.encode().unwrap()).unwrap();
        let creds = decoded.credentials.unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "changeit");
        assert_eq!(decoded.data, Bytes::from_static(b"body"));
    }

    #[test]
    fn test_credentials_too_long() {
        let pkg = Package::new(TcpCommand::ReadEvent, Uuid::new_v4())
            .with_credentials(Some(UserCredentials::new("a".repeat(300), "p")));
        assert!(matches!(pkg.encode(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_decode_truncated_header() {
        let frame = Bytes::from_static(&[0x01, 0x00, 0x01]);
        assert!(matches!(
            Package::decode(frame),
            Err(Error::ParsingError(_))
        ));
    }

    #[test]
    fn test_decode_truncated_credentials() {
        let mut raw = vec![0xB0, TcpFlags::AUTHENTICATED.bits()];
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        raw.extend_from_slice(&[10, b'a']);
        assert!(Package::decode(Bytes::from(raw)).is_err());
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let pkg = Package::new(TcpCommand::HeartbeatRequest, Uuid::new_v4());

        write_frame(&mut client, &pkg).await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(Package::decode(frame).unwrap(), pkg);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as i32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(Error::MissingData(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert_eq!(
            read_frame(&mut server).await,
            Err(Error::MissingData("Connection closed".to_owned()))
        );
    }
}
