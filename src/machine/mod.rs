#[cfg(test)]
mod test_session;

mod aead;
mod queue;
mod stream;

pub use self::stream::{CipherId, CipherStream};

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use std::{error, fmt};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use tokio::sync::oneshot;

use crate::packet::{EncAck, EncInit};
use crate::wire;

use self::aead::TAG_SIZE;
use self::queue::ByteQueue;

/// Frames whose decrypted payload size exceeds this are rejected.
pub const MAX_MESSAGE: usize = 12_000_000;

// a payload carries at least a one byte command, its one byte length
// prefix and a four byte body length
const MIN_PAYLOAD: usize = 6;

#[derive(Debug)]
pub enum Error {
    Crypto(secp256k1::Error),
    KeyDerivation,
    NotInitialized,
    InitAlreadySent,
    InitAlreadyReceived,
    AckAlreadySent,
    AckAlreadyReceived,
    AckUnsolicited,
    CipherMismatch { expected: u8, received: u8 },
    UnsolicitedRekey,
    SessionCompleted,
    HandshakeTimeout,
    SessionDestroyed,
    BadCommand,
    BadPacketSize(u32),
    BadTag([u8; TAG_SIZE]),
    Malformed(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Crypto(e) => write!(f, "crypto error: {}", e),
            KeyDerivation => write!(f, "key derivation failed"),
            NotInitialized => write!(f, "stream not initialized"),
            InitAlreadySent => write!(f, "encinit already sent"),
            InitAlreadyReceived => write!(f, "encinit already received"),
            AckAlreadySent => write!(f, "encack already sent"),
            AckAlreadyReceived => write!(f, "encack already received"),
            AckUnsolicited => write!(f, "encack without encinit"),
            CipherMismatch { expected, received } => write!(
                f,
                "cipher mismatch: expected {}, received {}",
                expected, received
            ),
            UnsolicitedRekey => write!(f, "rekey before handshake completion"),
            SessionCompleted => write!(f, "handshake already settled"),
            HandshakeTimeout => write!(f, "handshake timed out"),
            SessionDestroyed => write!(f, "stream destroyed"),
            BadCommand => write!(f, "bad packet command"),
            BadPacketSize(size) => write!(f, "Bad packet size: {}.", size),
            BadTag(tag) => write!(f, "Bad tag: {}.", hex::encode(tag)),
            Malformed(msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use self::Error::*;

        match self {
            Crypto(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything a session reports back to its owner. Events are queued
/// synchronously by `feed` and `pack` and drained with `next_event`;
/// exactly one owner drives the session, there is no listener bus.
#[derive(Debug)]
pub enum SessionEvent {
    Handshake,
    Rekey,
    Packet { command: String, body: Vec<u8> },
    Error(Error),
}

/// Hook for an identity layer that wants to drive re-keying with its
/// own key material. When present and authenticated it supplies the
/// replacement key pair; the session still installs the keys itself,
/// the hook never reaches into cipher state.
pub trait AuthProvider {
    fn authenticated(&self) -> bool;
    fn rekey_input(&mut self) -> ([u8; 32], [u8; 32]);
    fn rekey_output(&mut self) -> ([u8; 32], [u8; 32]);
}

/// An encrypted link with one peer: two cipher streams, the encinit and
/// encack bookkeeping, and an incremental parser turning ciphertext
/// into packet events.
pub struct Session {
    input: CipherStream,
    output: CipherStream,

    init_sent: bool,
    init_recv: bool,
    ack_sent: bool,
    ack_recv: bool,
    handshake_done: bool,
    completed: bool,

    pending: ByteQueue,
    waiting: usize,
    has_size: bool,
    poisoned: bool,

    events: VecDeque<SessionEvent>,
    completion: Option<oneshot::Sender<Result<(), Error>>>,
    deadline: Option<Instant>,
    auth: Option<Box<dyn AuthProvider>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            r#"
        init sent/recv: {}/{}
        ack sent/recv:  {}/{}
        handshake done: {}
        pending bytes:  {}
        "#,
            self.init_sent,
            self.init_recv,
            self.ack_sent,
            self.ack_recv,
            self.handshake_done,
            self.pending.len(),
        )
    }
}

impl Session {
    pub fn new() -> Self {
        Session::with_cipher(CipherId::ChaChaPoly)
    }

    pub fn with_cipher(cipher: CipherId) -> Self {
        // one ephemeral keypair per session, shared by both directions,
        // so input and output derive the same session id
        let secret = stream::random_secret_key();
        Session {
            input: CipherStream::with_secret(secret, cipher),
            output: CipherStream::with_secret(secret, cipher),
            init_sent: false,
            init_recv: false,
            ack_sent: false,
            ack_recv: false,
            handshake_done: false,
            completed: false,
            pending: ByteQueue::new(),
            waiting: 4,
            has_size: false,
            poisoned: false,
            events: VecDeque::new(),
            completion: None,
            deadline: None,
            auth: None,
        }
    }

    /// Installs the identity-layer hook that overrides re-key material.
    pub fn set_auth(&mut self, provider: Box<dyn AuthProvider>) {
        self.auth = Some(provider);
    }

    pub fn is_established(&self) -> bool {
        self.handshake_done
    }

    /// Session id shared by both directions once the handshake is done.
    pub fn session_id(&self) -> Option<[u8; 32]> {
        self.output.session_id().or_else(|| self.input.session_id())
    }

    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// First half of the handshake: announces our inbound ephemeral key
    /// and cipher choice to the peer.
    pub fn build_encinit(&mut self) -> Result<EncInit, Error> {
        self.check_deadline();
        if self.init_sent {
            return Err(Error::InitAlreadySent);
        }
        self.init_sent = true;
        Ok(EncInit::new(
            self.input.public_key().serialize(),
            self.input.cipher() as u8,
        ))
    }

    /// Keys the outbound stream from the peer's encinit.
    pub fn on_encinit(&mut self, packet: &EncInit) -> Result<(), Error> {
        self.check_deadline();
        if self.completed {
            return Err(Error::SessionCompleted);
        }
        if self.init_recv {
            return Err(Error::InitAlreadyReceived);
        }
        if CipherId::from_u8(packet.cipher()) != Some(self.output.cipher()) {
            return Err(Error::CipherMismatch {
                expected: self.output.cipher() as u8,
                received: packet.cipher(),
            });
        }
        self.init_recv = true;
        self.output.init(&packet.public_key())?;
        trace!(target: "bip151", "outbound stream keyed");
        Ok(())
    }

    /// Acknowledges the peer's encinit with our outbound ephemeral key.
    pub fn build_encack(&mut self) -> Result<EncAck, Error> {
        self.check_deadline();
        if !self.output.is_ready() {
            return Err(Error::NotInitialized);
        }
        if self.ack_sent {
            return Err(Error::AckAlreadySent);
        }
        self.ack_sent = true;
        let ack = EncAck::new(self.output.public_key().serialize());
        self.maybe_complete();
        Ok(ack)
    }

    /// Keys the inbound stream from the peer's encack, or re-keys it
    /// when the packet carries the all-zero re-key signal.
    pub fn on_encack(&mut self, packet: &EncAck) -> Result<(), Error> {
        self.check_deadline();
        if packet.is_rekey() {
            if !self.handshake_done {
                return Err(Error::UnsolicitedRekey);
            }
            debug!(target: "bip151", "re-keying inbound stream on peer signal");
            return self.rekey_input();
        }
        if self.completed {
            return Err(Error::SessionCompleted);
        }
        if !self.init_sent {
            return Err(Error::AckUnsolicited);
        }
        if self.ack_recv {
            return Err(Error::AckAlreadyReceived);
        }
        self.ack_recv = true;
        self.input.init(&packet.public_key())?;
        trace!(target: "bip151", "inbound stream keyed");
        self.maybe_complete();
        Ok(())
    }

    /// Builds the encack that tells the peer to re-key its inbound
    /// stream. The caller pairs it with `rekey_output` so both ends of
    /// the direction move forward together.
    pub fn build_rekey(&self) -> Result<EncAck, Error> {
        if !self.handshake_done {
            return Err(Error::UnsolicitedRekey);
        }
        Ok(EncAck::rekey())
    }

    /// Re-keys the outbound stream, through the auth hook when one is
    /// installed and authenticated. Paired with the `Rekey` event.
    pub fn rekey_output(&mut self) -> Result<(), Error> {
        match self.auth.as_mut() {
            Some(auth) if auth.authenticated() => {
                let (k1, k2) = auth.rekey_output();
                self.output.rekey(Some(k1), Some(k2))
            }
            _ => self.output.rekey(None, None),
        }
    }

    fn rekey_input(&mut self) -> Result<(), Error> {
        match self.auth.as_mut() {
            Some(auth) if auth.authenticated() => {
                let (k1, k2) = auth.rekey_input();
                self.input.rekey(Some(k1), Some(k2))
            }
            _ => self.input.rekey(None, None),
        }
    }

    /// Encodes `body` under `command` into one encrypted frame:
    ///
    /// ```text
    /// offset  size  content
    /// 0       4     payload size, keystream encrypted
    /// 4       v     varstring(command)  |
    /// 4+v     4     body length (le)    |  aead encrypted
    /// 8+v     b     body                |
    /// 8+v+b   16    poly1305 tag
    /// ```
    pub fn pack(&mut self, command: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        if command.is_empty() || command.len() > 12 || !command.is_ascii() {
            return Err(Error::BadCommand);
        }
        if !self.output.is_ready() {
            return Err(Error::NotInitialized);
        }

        let header = wire::varstring_size(command);
        let payload_size = header + 4 + body.len();
        if payload_size > MAX_MESSAGE {
            return Err(Error::BadPacketSize(payload_size as u32));
        }

        let mut frame = vec![0u8; 4 + payload_size + TAG_SIZE];
        LittleEndian::write_u32(&mut frame[..4], payload_size as u32);
        let mut offset = 4;
        offset += wire::write_varstring(&mut frame[offset..], command);
        LittleEndian::write_u32(&mut frame[offset..offset + 4], body.len() as u32);
        offset += 4;
        frame[offset..offset + body.len()].copy_from_slice(body);

        if self.output.should_rekey(&frame) {
            debug!(target: "bip151", "outbound re-key threshold reached");
            self.events.push_back(SessionEvent::Rekey);
            self.rekey_output()?;
        }

        let tag_at = 4 + payload_size;
        self.output.encrypt_size(&mut frame[..4])?;
        self.output.encrypt(&mut frame[4..tag_at])?;
        let tag = self.output.finalize()?;
        frame[tag_at..].copy_from_slice(&tag);
        self.output.sequence()?;

        trace!(target: "bip151", "packed {} frame, {} bytes", command, frame.len());
        Ok(frame)
    }

    /// Buffers raw ciphertext and drains as many complete frames from
    /// it as possible. Packets and failures surface as events; after an
    /// error the parser is a no-op and the session should be torn down.
    pub fn feed(&mut self, data: &[u8]) {
        if self.poisoned {
            return;
        }
        self.pending.push(data);
        while !self.poisoned && self.pending.len() >= self.waiting {
            let chunk = match self.pending.read(self.waiting) {
                Some(chunk) => chunk,
                None => break,
            };
            if let Err(err) = self.parse(chunk) {
                debug!(target: "bip151", "inbound stream poisoned: {}", err);
                self.poisoned = true;
                self.events.push_back(SessionEvent::Error(err));
            }
        }
    }

    fn parse(&mut self, mut chunk: bytes::BytesMut) -> Result<(), Error> {
        if !self.has_size {
            let size = self.input.decrypt_size(&mut chunk[..])?;
            if (size as usize) < MIN_PAYLOAD || size as usize > MAX_MESSAGE {
                return Err(Error::BadPacketSize(size));
            }
            self.has_size = true;
            self.waiting = size as usize + TAG_SIZE;
            return Ok(());
        }

        let payload_size = self.waiting - TAG_SIZE;
        self.has_size = false;
        self.waiting = 4;

        let tag_bytes = chunk.split_off(payload_size);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&tag_bytes);

        self.input.auth(&chunk)?;
        self.input.finalize()?;
        if !self.input.verify(&tag)? {
            // the peer advanced its sequence when it produced this
            // frame, so ours moves too before reporting the failure
            self.input.sequence()?;
            return Err(Error::BadTag(tag));
        }

        self.input.decrypt(&mut chunk)?;
        self.input.sequence()?;
        self.unpack(&chunk)
    }

    // a frame batches one or more command/body packets
    fn unpack(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut offset = 0;
        while offset < payload.len() {
            let (command, used) = wire::read_varstring(&payload[offset..])?;
            offset += used;
            if payload.len() - offset < 4 {
                return Err(Error::Malformed("truncated body length"));
            }
            let body_len = LittleEndian::read_u32(&payload[offset..offset + 4]) as usize;
            offset += 4;
            if payload.len() - offset < body_len {
                return Err(Error::Malformed("body length past end of frame"));
            }
            let body = payload[offset..offset + body_len].to_vec();
            offset += body_len;
            trace!(target: "bip151", "unpacked {} packet, {} bytes", command, body.len());
            self.events.push_back(SessionEvent::Packet {
                command: command,
                body: body,
            });
        }
        Ok(())
    }

    /// Arms the handshake completion future. It resolves once both
    /// encinits and encacks have been exchanged, or fails with
    /// `HandshakeTimeout` or `SessionDestroyed`. One arm per session:
    /// arming again while a wait is outstanding panics.
    pub fn wait(&mut self, timeout: Duration) -> impl Future<Output = Result<(), Error>> {
        let (resolve, result) = oneshot::channel();
        if self.handshake_done {
            let _ = resolve.send(Ok(()));
            self.completed = true;
        } else {
            assert!(self.completion.is_none(), "handshake wait armed twice");
            self.completion = Some(resolve);
            self.deadline = Some(Instant::now() + timeout);
        }
        async move {
            match tokio::time::timeout(timeout, result).await {
                Ok(Ok(settled)) => settled,
                Ok(Err(_)) => Err(Error::SessionDestroyed),
                Err(_) => Err(Error::HandshakeTimeout),
            }
        }
    }

    /// Tears the session down, rejecting a pending handshake wait.
    pub fn destroy(&mut self) {
        self.deadline = None;
        self.poisoned = true;
        if let Some(resolve) = self.completion.take() {
            let _ = resolve.send(Err(Error::SessionDestroyed));
        }
        self.completed = true;
    }

    // an expired deadline settles the promise and freezes the handshake
    fn check_deadline(&mut self) {
        if self.handshake_done || self.completed {
            return;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.deadline = None;
                self.completed = true;
                if let Some(resolve) = self.completion.take() {
                    let _ = resolve.send(Err(Error::HandshakeTimeout));
                }
            }
        }
    }

    fn maybe_complete(&mut self) {
        if self.handshake_done
            || !(self.init_sent && self.init_recv && self.ack_sent && self.ack_recv)
        {
            return;
        }
        self.handshake_done = true;
        self.deadline = None;
        debug!(target: "bip151", "handshake established");
        self.events.push_back(SessionEvent::Handshake);
        if let Some(resolve) = self.completion.take() {
            let _ = resolve.send(Ok(()));
            self.completed = true;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
