//! STUN Protocol Implementation (RFC 5389)
//!
//! Binding requests and responses are all relaymesh needs: a node asks a few
//! STUN servers (public ones or other relaymesh nodes) which address its
//! packets appear to come from, and every relaymesh listener answers such
//! requests on its UDP socket.
//!
//! Supported attributes are MAPPED-ADDRESS, XOR-MAPPED-ADDRESS, SOFTWARE and
//! FINGERPRINT. Messages carrying a FINGERPRINT are verified on decode.
//!
//! [`StunSocket`] multiplexes both roles on one UDP socket: incoming binding
//! requests are answered in place, incoming responses are routed to the
//! pending request with the same transaction id.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Default timeout of a single binding request
pub const STUN_TIMEOUT: Duration = Duration::from_secs(1);

/// Value XORed into the CRC-32 of the FINGERPRINT attribute
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Largest datagram read from the socket
const MAX_DATAGRAM_SIZE: usize = 2048;

/// SOFTWARE attribute sent with every response
const SOFTWARE: &str = "relaymesh";

/// Transaction identifier (96 bits)
pub type TransactionId = [u8; 12];

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode message type and class into a 16-bit value
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method = match self {
            Self::Binding => 0x0001,
        };

        let class_bits = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }
}

/// STUN attribute types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Mapped address (0x0001)
    MappedAddress(SocketAddr),
    /// XOR-Mapped address (0x0020) - preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// Software identifier (0x8022)
    Software(String),
    /// Fingerprint (0x8028) - CRC-32
    Fingerprint(u32),
    /// Unknown attribute type
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    /// Attribute type code
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => 0x0001,
            Self::XorMappedAddress(_) => 0x0020,
            Self::Software(_) => 0x8022,
            Self::Fingerprint(_) => 0x8028,
            Self::Unknown(t, _) => *t,
        }
    }

    /// Encode attribute to bytes, padded to a 4-byte boundary
    fn encode(&self, transaction_id: &TransactionId) -> Vec<u8> {
        let value = self.encode_value(transaction_id);

        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));

        bytes
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => {
                let mut value = vec![0, family_code(addr)];
                value.extend_from_slice(&addr.port().to_be_bytes());
                match addr.ip() {
                    IpAddr::V4(ip) => value.extend_from_slice(&ip.octets()),
                    IpAddr::V6(ip) => value.extend_from_slice(&ip.octets()),
                }
                value
            }
            Self::XorMappedAddress(addr) => {
                let mut value = vec![0, family_code(addr)];

                // XOR port with most significant 16 bits of magic cookie
                let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
                value.extend_from_slice(&xor_port.to_be_bytes());

                // XOR address with magic cookie (+ transaction ID for IPv6)
                let key = xor_key(transaction_id);
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        value.extend(ip.octets().iter().zip(&key).map(|(b, k)| b ^ k));
                    }
                    IpAddr::V6(ip) => {
                        value.extend(ip.octets().iter().zip(&key).map(|(b, k)| b ^ k));
                    }
                }

                value
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Fingerprint(f) => f.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Decode attribute from bytes
    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, StunError> {
        match attr_type {
            0x0001 => decode_address(value, None).map(Self::MappedAddress),
            0x0020 => decode_address(value, Some(transaction_id)).map(Self::XorMappedAddress),
            0x8022 => Ok(Self::Software(String::from_utf8_lossy(value).to_string())),
            0x8028 => {
                let raw: [u8; 4] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::Fingerprint(u32::from_be_bytes(raw)))
            }
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

fn family_code(addr: &SocketAddr) -> u8 {
    if addr.is_ipv4() { 0x01 } else { 0x02 }
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

/// Decode a (XOR-)MAPPED-ADDRESS value. `transaction_id` is given for the
/// XOR variant.
fn decode_address(
    value: &[u8],
    transaction_id: Option<&TransactionId>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let key = transaction_id.map(xor_key);
    if key.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let unmask = |raw: &[u8], out: &mut [u8]| {
        for (i, b) in raw.iter().enumerate() {
            out[i] = match &key {
                Some(key) => b ^ key[i],
                None => *b,
            };
        }
    };

    let ip = match family {
        0x01 => {
            let raw = value.get(4..8).ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 4];
            unmask(raw, &mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let raw = value.get(4..20).ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 16];
            unmask(raw, &mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };

    Ok(SocketAddr::new(ip, port))
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: TransactionId,
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new STUN Binding Request with a random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        use rand::RngCore;

        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Success Response telling the requester that its
    /// packets arrive from `mapped`. Carries XOR-MAPPED-ADDRESS, SOFTWARE and
    /// FINGERPRINT.
    #[must_use]
    pub fn binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        let mut msg = Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![
                StunAttribute::XorMappedAddress(mapped),
                StunAttribute::Software(SOFTWARE.to_string()),
            ],
        };
        msg.add_fingerprint();
        msg
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(|_| true, 0)
    }

    /// Encode the header and the attributes accepted by `keep`. The length
    /// field accounts for `extra` bytes of attributes appended later.
    fn encode_with(&self, keep: impl Fn(&StunAttribute) -> bool, extra: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 64);

        // Message Type (2 bytes)
        let msg_type = self.message_type.encode(self.message_class);
        bytes.extend_from_slice(&msg_type.to_be_bytes());

        // Message Length (2 bytes) - placeholder
        bytes.extend_from_slice(&[0u8; 2]);

        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in self.attributes.iter().filter(|a| keep(a)) {
            bytes.extend_from_slice(&attr.encode(&self.transaction_id));
        }

        // Message length excludes the 20-byte header
        let msg_length = (bytes.len() - HEADER_SIZE + extra) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());

        bytes
    }

    /// Decode message from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed or if a FINGERPRINT
    /// attribute is present but does not match the message.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let (message_type, message_class) = Self::decode_type(msg_type)?;

        let end = bytes.len().min(HEADER_SIZE + msg_length);
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_start = offset;
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            offset += 4;

            if offset + attr_length > end {
                break;
            }

            let attr_value = &bytes[offset..offset + attr_length];
            match StunAttribute::decode(attr_type, attr_value, &transaction_id) {
                Ok(StunAttribute::Fingerprint(expected)) => {
                    if fingerprint_of(&bytes[..attr_start]) != expected {
                        return Err(StunError::FingerprintMismatch);
                    }
                    attributes.push(StunAttribute::Fingerprint(expected));
                }
                Ok(attr) => attributes.push(attr),
                Err(e) => tracing::trace!("skipping STUN attribute {:#06x}: {}", attr_type, e),
            }

            offset += attr_length;

            // Skip padding to 4-byte boundary
            offset += (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    fn decode_type(msg_type: u16) -> Result<(StunMessageType, StunMessageClass), StunError> {
        if msg_type & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType);
        }

        // Extract class bits (C0 at bit 4, C1 at bit 8)
        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;

        let message_class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let m0_m3 = msg_type & 0x0F;
        let m4_m6 = (msg_type >> 1) & 0x70;
        let m7_m11 = (msg_type >> 2) & 0xF80;

        let message_type = match m0_m3 | m4_m6 | m7_m11 {
            0x0001 => StunMessageType::Binding,
            _ => return Err(StunError::InvalidMessageType),
        };

        Ok((message_type, message_class))
    }

    /// Get XOR-MAPPED-ADDRESS attribute
    #[must_use]
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Reflexive address reported by the server: XOR-MAPPED-ADDRESS if
    /// present, MAPPED-ADDRESS otherwise
    #[must_use]
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address().or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// Append a FINGERPRINT attribute, replacing any previous one.
    ///
    /// The fingerprint is the CRC-32 of the message up to the attribute,
    /// XORed with `0x5354554e`.
    pub fn add_fingerprint(&mut self) {
        self.attributes
            .retain(|attr| !matches!(attr, StunAttribute::Fingerprint(_)));

        // Length includes the FINGERPRINT attribute (4 header + 4 CRC)
        let bytes = self.encode_with(|_| true, 8);
        self.attributes
            .push(StunAttribute::Fingerprint(fingerprint_of(&bytes)));
    }

    /// Verify the FINGERPRINT attribute of a constructed message
    ///
    /// # Errors
    ///
    /// Returns error if FINGERPRINT is missing or invalid
    pub fn verify_fingerprint(&self) -> Result<(), StunError> {
        let expected = self
            .attributes
            .iter()
            .rev()
            .find_map(|attr| match attr {
                StunAttribute::Fingerprint(fp) => Some(*fp),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute)?;

        let bytes = self.encode_with(|attr| !matches!(attr, StunAttribute::Fingerprint(_)), 8);
        if fingerprint_of(&bytes) == expected {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }
}

/// Quick check whether a datagram looks like a STUN message
#[must_use]
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

fn fingerprint_of(data: &[u8]) -> u32 {
    crc32(data) ^ FINGERPRINT_XOR
}

/// CRC-32 as used by FINGERPRINT (ISO-HDLC, reflected polynomial 0xEDB88320)
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

type PendingRequests = HashMap<TransactionId, oneshot::Sender<Result<SocketAddr, StunError>>>;

/// UDP socket acting as STUN client and server at the same time
pub struct StunSocket {
    socket: Arc<UdpSocket>,
    pending: Mutex<PendingRequests>,
    answer_requests: bool,
}

impl StunSocket {
    /// Wrap an already bound socket. The caller feeds received datagrams to
    /// [`StunSocket::handle_datagram`] or calls [`StunSocket::spawn_receiver`].
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, answer_requests: bool) -> Arc<Self> {
        Arc::new(Self {
            socket,
            pending: Mutex::new(HashMap::new()),
            answer_requests,
        })
    }

    /// Bind a standalone client socket on `addr` and start its receive loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, JoinHandle<()>), std::io::Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let stun = Self::new(socket, false);
        let receiver = stun.spawn_receiver();
        Ok((stun, receiver))
    }

    /// Drive the socket: every received datagram goes through
    /// [`StunSocket::handle_datagram`]. Non-STUN datagrams are dropped.
    pub fn spawn_receiver(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match this.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if !this.handle_datagram(&buf[..len], from).await {
                            tracing::trace!("dropping non-STUN datagram from {}", from);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("STUN socket receive failed: {}", e);
                        break;
                    }
                }
            }
        })
    }

    /// Local address of the socket
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Process one datagram. Returns `false` if it was not a STUN message.
    ///
    /// Binding requests are answered with the sender's address when this
    /// socket serves requests; responses complete the matching pending
    /// request.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> bool {
        if !is_stun(data) {
            return false;
        }

        let msg = match StunMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("invalid STUN message from {}: {}", from, e);
                return true;
            }
        };

        match msg.message_class {
            StunMessageClass::Request => {
                if self.answer_requests {
                    let response = StunMessage::binding_response(msg.transaction_id, from);
                    if let Err(e) = self.socket.send_to(&response.encode(), from).await {
                        tracing::debug!("failed to answer STUN request from {}: {}", from, e);
                    } else {
                        tracing::trace!("answered STUN request from {}", from);
                    }
                }
            }
            StunMessageClass::SuccessResponse | StunMessageClass::ErrorResponse => {
                let waiter = self.pending.lock().await.remove(&msg.transaction_id);
                let Some(waiter) = waiter else {
                    tracing::trace!("unexpected STUN response from {}, dropping", from);
                    return true;
                };

                let result = if msg.message_class == StunMessageClass::ErrorResponse {
                    Err(StunError::ErrorResponse)
                } else {
                    msg.reflexive_address().ok_or(StunError::MissingAttribute)
                };
                // Requester may have timed out already
                let _ = waiter.send(result);
            }
            StunMessageClass::Indication => {}
        }

        true
    }

    /// Send a binding request to `server` and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns `StunError` if:
    /// - Network I/O fails
    /// - The server does not respond within `timeout`
    /// - The response is an error response or lacks a mapped address
    pub async fn request(
        &self,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<SocketAddr, StunError> {
        let request = StunMessage::binding_request();
        let transaction_id = request.transaction_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(transaction_id, tx);

        if let Err(e) = self.socket.send_to(&request.encode(), server).await {
            self.pending.lock().await.remove(&transaction_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&transaction_id);
                Err(StunError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for StunSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StunSocket")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("answer_requests", &self.answer_requests)
            .finish_non_exhaustive()
    }
}

/// STUN error types
#[derive(Debug)]
pub enum StunError {
    /// I/O error
    Io(std::io::Error),
    /// Query timeout
    Timeout,
    /// Invalid message format
    MessageTooShort,
    /// Invalid magic cookie
    InvalidMagicCookie,
    /// Invalid message type
    InvalidMessageType,
    /// Invalid attribute
    InvalidAttribute,
    /// Error response received
    ErrorResponse,
    /// Missing required attribute
    MissingAttribute,
    /// Fingerprint mismatch
    FingerprintMismatch,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "STUN query timeout"),
            Self::MessageTooShort => write!(f, "STUN message too short"),
            Self::InvalidMagicCookie => write!(f, "Invalid STUN magic cookie"),
            Self::InvalidMessageType => write!(f, "Invalid STUN message type"),
            Self::InvalidAttribute => write!(f, "Invalid STUN attribute"),
            Self::ErrorResponse => write!(f, "STUN error response"),
            Self::MissingAttribute => write!(f, "Missing required STUN attribute"),
            Self::FingerprintMismatch => write!(f, "FINGERPRINT verification failed"),
        }
    }
}

impl std::error::Error for StunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
