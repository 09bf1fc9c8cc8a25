//! Typed payload chain: generic payload header plus the body layout of
//! every payload type this core parses or emits (RFC 7296 §3.3–§3.16).
//!
//! The decoder fails with [`CodecError::InvalidSyntax`] if total length
//! disagrees with the header, a payload's length is under the 4-byte
//! minimum, the chain runs past the declared total length, or an unknown
//! payload arrives with its critical bit set — per spec §4.2.

use super::{CodecError, PayloadType};
use crate::network::ike::GENERIC_PAYLOAD_HEADER_LEN as HDR_LEN;

const CRITICAL_BIT: u8 = 0x80;

pub(super) struct GenericHeader {
    pub(super) next_payload: PayloadType,
    pub(super) critical: bool,
    pub(super) body_len: usize,
}

pub(super) fn decode_generic_header(buf: &[u8]) -> Result<GenericHeader, CodecError> {
    if buf.len() < HDR_LEN {
        return Err(CodecError::InvalidSyntax("payload header truncated".into()));
    }
    let next_payload = PayloadType::from_u8(buf[0]);
    let critical = buf[1] & CRITICAL_BIT != 0;
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length < HDR_LEN {
        return Err(CodecError::InvalidSyntax(format!(
            "payload length {length} below minimum header size"
        )));
    }
    if length > buf.len() {
        return Err(CodecError::InvalidSyntax(
            "payload length extends past chain buffer".into(),
        ));
    }
    Ok(GenericHeader {
        next_payload,
        critical,
        body_len: length - HDR_LEN,
    })
}

pub(super) fn encode_generic_header(out: &mut Vec<u8>, next_payload: PayloadType, critical: bool, body_len: usize) {
    out.push(next_payload.to_u8());
    out.push(if critical { CRITICAL_BIT } else { 0 });
    out.extend_from_slice(&((body_len + HDR_LEN) as u16).to_be_bytes());
}

// ---------------------------------------------------------------------
// Security Association / Proposal / Transform
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformAttribute {
    pub attribute_type: u16,
    pub value: Vec<u8>,
}

const ATTR_FORMAT_TV: u16 = 0x8000;

impl TransformAttribute {
    /// The Key Length attribute (type 14), carried in fixed TV form.
    pub fn key_length(bits: u16) -> Self {
        TransformAttribute {
            attribute_type: 14,
            value: bits.to_be_bytes().to_vec(),
        }
    }

    pub fn key_length_bits(&self) -> Option<u16> {
        if self.attribute_type == 14 && self.value.len() == 2 {
            Some(u16::from_be_bytes([self.value[0], self.value[1]]))
        } else {
            None
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.value.len() == 2 {
            out.extend_from_slice(&(self.attribute_type | ATTR_FORMAT_TV).to_be_bytes());
            out.extend_from_slice(&self.value);
        } else {
            out.extend_from_slice(&self.attribute_type.to_be_bytes());
            out.extend_from_slice(&(self.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.value);
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("attribute header truncated".into()));
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        let is_tv = raw_type & ATTR_FORMAT_TV != 0;
        let attribute_type = raw_type & !ATTR_FORMAT_TV;
        if is_tv {
            let value = buf[2..4].to_vec();
            Ok((TransformAttribute { attribute_type, value }, 4))
        } else {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if buf.len() < 4 + len {
                return Err(CodecError::InvalidSyntax("attribute value truncated".into()));
            }
            let value = buf[4..4 + len].to_vec();
            Ok((TransformAttribute { attribute_type, value }, 4 + len))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Encryption,
    Prf,
    Integrity,
    DiffieHellman,
    ExtendedSequenceNumbers,
}

impl TransformKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Encryption => 1,
            Self::Prf => 2,
            Self::Integrity => 3,
            Self::DiffieHellman => 4,
            Self::ExtendedSequenceNumbers => 5,
        }
    }

    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(Self::Encryption),
            2 => Ok(Self::Prf),
            3 => Ok(Self::Integrity),
            4 => Ok(Self::DiffieHellman),
            5 => Ok(Self::ExtendedSequenceNumbers),
            other => Err(CodecError::InvalidSyntax(format!(
                "unknown transform type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub kind: TransformKind,
    pub transform_id: u16,
    pub attributes: Vec<TransformAttribute>,
}

impl Transform {
    fn encode(&self, last: bool) -> Vec<u8> {
        let mut attrs = Vec::new();
        for a in &self.attributes {
            attrs.extend_from_slice(&a.encode());
        }
        let total_len = 8 + attrs.len();
        let mut out = Vec::with_capacity(total_len);
        out.push(if last { 0 } else { 3 });
        out.push(0);
        out.extend_from_slice(&(total_len as u16).to_be_bytes());
        out.push(self.kind.to_u8());
        out.push(0);
        out.extend_from_slice(&self.transform_id.to_be_bytes());
        out.extend_from_slice(&attrs);
        out
    }

    /// Returns the decoded transform, whether it was marked last, and the
    /// number of bytes consumed.
    fn decode(buf: &[u8]) -> Result<(Self, bool, usize), CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::InvalidSyntax("transform header truncated".into()));
        }
        let last_substruct = buf[0];
        let transform_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if transform_length < 8 || transform_length > buf.len() {
            return Err(CodecError::InvalidSyntax("bad transform length".into()));
        }
        let kind = TransformKind::from_u8(buf[4])?;
        let transform_id = u16::from_be_bytes([buf[6], buf[7]]);
        let mut attributes = Vec::new();
        let mut off = 8;
        while off < transform_length {
            let (attr, consumed) = TransformAttribute::decode(&buf[off..transform_length])?;
            attributes.push(attr);
            off += consumed;
        }
        if off != transform_length {
            return Err(CodecError::InvalidSyntax(
                "transform attributes overrun declared length".into(),
            ));
        }
        Ok((
            Transform {
                kind,
                transform_id,
                attributes,
            },
            last_substruct == 0,
            transform_length,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub proposal_num: u8,
    pub protocol_id: u8,
    pub spi: Vec<u8>,
    pub transforms: Vec<Transform>,
}

impl Proposal {
    fn encode(&self, last: bool) -> Vec<u8> {
        let mut transforms_bytes = Vec::new();
        for (i, t) in self.transforms.iter().enumerate() {
            transforms_bytes.extend_from_slice(&t.encode(i + 1 == self.transforms.len()));
        }
        let total_len = 8 + self.spi.len() + transforms_bytes.len();
        let mut out = Vec::with_capacity(total_len);
        out.push(if last { 0 } else { 2 });
        out.push(0);
        out.extend_from_slice(&(total_len as u16).to_be_bytes());
        out.push(self.proposal_num);
        out.push(self.protocol_id);
        out.push(self.spi.len() as u8);
        out.push(self.transforms.len() as u8);
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&transforms_bytes);
        out
    }

    fn decode(buf: &[u8]) -> Result<(Self, bool, usize), CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::InvalidSyntax("proposal header truncated".into()));
        }
        let last_substruct = buf[0];
        let proposal_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if proposal_length < 8 || proposal_length > buf.len() {
            return Err(CodecError::InvalidSyntax("bad proposal length".into()));
        }
        let proposal_num = buf[4];
        let protocol_id = buf[5];
        let spi_size = buf[6] as usize;
        let num_transforms = buf[7] as usize;
        if 8 + spi_size > proposal_length {
            return Err(CodecError::InvalidSyntax("proposal SPI overruns length".into()));
        }
        let spi = buf[8..8 + spi_size].to_vec();
        let mut off = 8 + spi_size;
        let mut transforms = Vec::with_capacity(num_transforms);
        for _ in 0..num_transforms {
            let (t, is_last, consumed) = Transform::decode(&buf[off..proposal_length])?;
            off += consumed;
            transforms.push(t);
            if is_last && off != proposal_length {
                return Err(CodecError::InvalidSyntax(
                    "transform marked last before end of proposal".into(),
                ));
            }
        }
        if off != proposal_length {
            return Err(CodecError::InvalidSyntax(
                "proposal transforms do not fill declared length".into(),
            ));
        }
        Ok((
            Proposal {
                proposal_num,
                protocol_id,
                spi,
                transforms,
            },
            last_substruct == 0,
            proposal_length,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaPayload {
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, p) in self.proposals.iter().enumerate() {
            out.extend_from_slice(&p.encode(i + 1 == self.proposals.len()));
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut proposals = Vec::new();
        let mut off = 0;
        while off < buf.len() {
            let (p, is_last, consumed) = Proposal::decode(&buf[off..])?;
            off += consumed;
            proposals.push(p);
            if is_last {
                break;
            }
        }
        if off != buf.len() {
            return Err(CodecError::InvalidSyntax(
                "proposals do not fill SA payload body".into(),
            ));
        }
        Ok(SaPayload { proposals })
    }
}

// ---------------------------------------------------------------------
// Key Exchange / Nonce
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangePayload {
    pub dh_group: u16,
    pub data: Vec<u8>,
}

impl KeyExchangePayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&self.dh_group.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("KE payload truncated".into()));
        }
        Ok(KeyExchangePayload {
            dh_group: u16::from_be_bytes([buf[0], buf[1]]),
            data: buf[4..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload(pub Vec<u8>);

// ---------------------------------------------------------------------
// Identification / Authentication
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    pub id_type: u8,
    pub data: Vec<u8>,
}

impl IdPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.id_type);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("ID payload truncated".into()));
        }
        Ok(IdPayload {
            id_type: buf[0],
            data: buf[4..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    pub auth_method: u8,
    pub data: Vec<u8>,
}

impl AuthPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.auth_method);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("AUTH payload truncated".into()));
        }
        Ok(AuthPayload {
            auth_method: buf[0],
            data: buf[4..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------
// Notify / Delete
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    pub protocol_id: u8,
    pub spi: Vec<u8>,
    pub message_type: u16,
    pub data: Vec<u8>,
}

impl NotifyPayload {
    pub fn is_error(&self) -> bool {
        self.message_type < 16384
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        out.push(self.protocol_id);
        out.push(self.spi.len() as u8);
        out.extend_from_slice(&self.message_type.to_be_bytes());
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("Notify payload truncated".into()));
        }
        let protocol_id = buf[0];
        let spi_size = buf[1] as usize;
        let message_type = u16::from_be_bytes([buf[2], buf[3]]);
        if 4 + spi_size > buf.len() {
            return Err(CodecError::InvalidSyntax("Notify SPI overruns payload".into()));
        }
        let spi = buf[4..4 + spi_size].to_vec();
        let data = buf[4 + spi_size..].to_vec();
        Ok(NotifyPayload {
            protocol_id,
            spi,
            message_type,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub protocol_id: u8,
    pub spi_size: u8,
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spis.len() * self.spi_size as usize);
        out.push(self.protocol_id);
        out.push(self.spi_size);
        out.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            out.extend_from_slice(spi);
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("Delete payload truncated".into()));
        }
        let protocol_id = buf[0];
        let spi_size = buf[1];
        let num_spis = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let expected = 4 + num_spis * spi_size as usize;
        if expected != buf.len() {
            return Err(CodecError::InvalidSyntax(
                "Delete payload SPI count disagrees with body length".into(),
            ));
        }
        let mut spis = Vec::with_capacity(num_spis);
        let mut off = 4;
        for _ in 0..num_spis {
            spis.push(buf[off..off + spi_size as usize].to_vec());
            off += spi_size as usize;
        }
        Ok(DeletePayload {
            protocol_id,
            spi_size,
            spis,
        })
    }
}

// ---------------------------------------------------------------------
// Traffic Selectors
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsType {
    Ipv4AddrRange,
    Ipv6AddrRange,
}

impl TsType {
    fn to_u8(self) -> u8 {
        match self {
            Self::Ipv4AddrRange => 7,
            Self::Ipv6AddrRange => 8,
        }
    }

    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            7 => Ok(Self::Ipv4AddrRange),
            8 => Ok(Self::Ipv6AddrRange),
            other => Err(CodecError::InvalidSyntax(format!("unknown TS type {other}"))),
        }
    }

    fn addr_len(self) -> usize {
        match self {
            Self::Ipv4AddrRange => 4,
            Self::Ipv6AddrRange => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    pub ts_type: TsType,
    pub ip_protocol_id: u8,
    pub start_port: u16,
    pub end_port: u16,
    pub start_addr: Vec<u8>,
    pub end_addr: Vec<u8>,
}

impl TrafficSelector {
    /// The all-v4 default selector spec §6 names for unconfigured sessions.
    pub fn all_ipv4() -> Self {
        TrafficSelector {
            ts_type: TsType::Ipv4AddrRange,
            ip_protocol_id: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: vec![0, 0, 0, 0],
            end_addr: vec![255, 255, 255, 255],
        }
    }

    /// Whether `self` is contained within `other`'s address/port range (used
    /// to validate a responder's narrowed TSi/TSr, spec §4.6).
    pub fn is_subset_of(&self, other: &TrafficSelector) -> bool {
        self.ts_type == other.ts_type
            && self.start_port >= other.start_port
            && self.end_port <= other.end_port
            && self.start_addr >= other.start_addr
            && self.end_addr <= other.end_addr
    }

    fn encode(&self) -> Vec<u8> {
        let addr_len = self.ts_type.addr_len();
        let total = 8 + 2 * addr_len;
        let mut out = Vec::with_capacity(total);
        out.push(self.ts_type.to_u8());
        out.push(self.ip_protocol_id);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(&self.start_port.to_be_bytes());
        out.extend_from_slice(&self.end_port.to_be_bytes());
        out.extend_from_slice(&self.start_addr);
        out.extend_from_slice(&self.end_addr);
        out
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::InvalidSyntax("TS entry truncated".into()));
        }
        let ts_type = TsType::from_u8(buf[0])?;
        let ip_protocol_id = buf[1];
        let selector_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let addr_len = ts_type.addr_len();
        let expected = 8 + 2 * addr_len;
        if selector_length != expected || selector_length > buf.len() {
            return Err(CodecError::InvalidSyntax("bad TS selector length".into()));
        }
        let start_port = u16::from_be_bytes([buf[4], buf[5]]);
        let end_port = u16::from_be_bytes([buf[6], buf[7]]);
        let start_addr = buf[8..8 + addr_len].to_vec();
        let end_addr = buf[8 + addr_len..8 + 2 * addr_len].to_vec();
        Ok((
            TrafficSelector {
                ts_type,
                ip_protocol_id,
                start_port,
                end_port,
                start_addr,
                end_addr,
            },
            selector_length,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsPayload {
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.selectors.len() as u8);
        out.extend_from_slice(&[0, 0, 0]);
        for s in &self.selectors {
            out.extend_from_slice(&s.encode());
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidSyntax("TS payload truncated".into()));
        }
        let num_ts = buf[0] as usize;
        let mut off = 4;
        let mut selectors = Vec::with_capacity(num_ts);
        for _ in 0..num_ts {
            let (s, consumed) = TrafficSelector::decode(&buf[off..])?;
            selectors.push(s);
            off += consumed;
        }
        if off != buf.len() {
            return Err(CodecError::InvalidSyntax(
                "TS selectors do not fill payload body".into(),
            ));
        }
        Ok(TsPayload { selectors })
    }
}

// ---------------------------------------------------------------------
// Payload chain
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sa(SaPayload),
    KeyExchange(KeyExchangePayload),
    IdInitiator(IdPayload),
    IdResponder(IdPayload),
    Certificate(Vec<u8>),
    CertificateRequest(Vec<u8>),
    Authentication(AuthPayload),
    Nonce(NoncePayload),
    Notify(NotifyPayload),
    Delete(DeletePayload),
    VendorId(Vec<u8>),
    TsInitiator(TsPayload),
    TsResponder(TsPayload),
    Configuration(Vec<u8>),
    Eap(Vec<u8>),
    /// Carries the raw `IV | ciphertext | ICV` body; see [`super::encrypted`]
    /// for the envelope this wraps.
    Encrypted(Vec<u8>),
    Unknown { payload_type: u8, data: Vec<u8> },
}

impl Payload {
    fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Sa(_) => PayloadType::SecurityAssociation,
            Payload::KeyExchange(_) => PayloadType::KeyExchange,
            Payload::IdInitiator(_) => PayloadType::IdentificationInitiator,
            Payload::IdResponder(_) => PayloadType::IdentificationResponder,
            Payload::Certificate(_) => PayloadType::Certificate,
            Payload::CertificateRequest(_) => PayloadType::CertificateRequest,
            Payload::Authentication(_) => PayloadType::Authentication,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::VendorId(_) => PayloadType::VendorId,
            Payload::TsInitiator(_) => PayloadType::TrafficSelectorInitiator,
            Payload::TsResponder(_) => PayloadType::TrafficSelectorResponder,
            Payload::Configuration(_) => PayloadType::Configuration,
            Payload::Eap(_) => PayloadType::Eap,
            Payload::Encrypted(_) => PayloadType::Encrypted,
            Payload::Unknown { payload_type, .. } => PayloadType::Unknown(*payload_type),
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Payload::Sa(p) => p.encode(),
            Payload::KeyExchange(p) => p.encode(),
            Payload::IdInitiator(p) | Payload::IdResponder(p) => p.encode(),
            Payload::Certificate(d) | Payload::CertificateRequest(d) => d.clone(),
            Payload::Authentication(p) => p.encode(),
            Payload::Nonce(p) => p.0.clone(),
            Payload::Notify(p) => p.encode(),
            Payload::Delete(p) => p.encode(),
            Payload::VendorId(d) => d.clone(),
            Payload::TsInitiator(p) | Payload::TsResponder(p) => p.encode(),
            Payload::Configuration(d) => d.clone(),
            Payload::Eap(d) => d.clone(),
            Payload::Encrypted(d) => d.clone(),
            Payload::Unknown { data, .. } => data.clone(),
        }
    }

    fn decode_body(payload_type: PayloadType, body: &[u8]) -> Result<Self, CodecError> {
        Ok(match payload_type {
            PayloadType::SecurityAssociation => Payload::Sa(SaPayload::decode(body)?),
            PayloadType::KeyExchange => Payload::KeyExchange(KeyExchangePayload::decode(body)?),
            PayloadType::IdentificationInitiator => Payload::IdInitiator(IdPayload::decode(body)?),
            PayloadType::IdentificationResponder => Payload::IdResponder(IdPayload::decode(body)?),
            PayloadType::Certificate => Payload::Certificate(body.to_vec()),
            PayloadType::CertificateRequest => Payload::CertificateRequest(body.to_vec()),
            PayloadType::Authentication => Payload::Authentication(AuthPayload::decode(body)?),
            PayloadType::Nonce => Payload::Nonce(NoncePayload(body.to_vec())),
            PayloadType::Notify => Payload::Notify(NotifyPayload::decode(body)?),
            PayloadType::Delete => Payload::Delete(DeletePayload::decode(body)?),
            PayloadType::VendorId => Payload::VendorId(body.to_vec()),
            PayloadType::TrafficSelectorInitiator => Payload::TsInitiator(TsPayload::decode(body)?),
            PayloadType::TrafficSelectorResponder => Payload::TsResponder(TsPayload::decode(body)?),
            PayloadType::Configuration => Payload::Configuration(body.to_vec()),
            PayloadType::Eap => Payload::Eap(body.to_vec()),
            PayloadType::Encrypted => Payload::Encrypted(body.to_vec()),
            PayloadType::NoNextPayload => {
                return Err(CodecError::InvalidSyntax(
                    "payload chain entry claims type NONE".into(),
                ));
            }
            PayloadType::Unknown(v) => Payload::Unknown {
                payload_type: v,
                data: body.to_vec(),
            },
        })
    }
}

/// The ordered sequence of payloads making up one (possibly inner) message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadChain(pub Vec<Payload>);

impl PayloadChain {
    /// Encodes the chain, returning `(first_payload_type, bytes)`.
    pub fn encode(&self) -> (PayloadType, Vec<u8>) {
        if self.0.is_empty() {
            return (PayloadType::NoNextPayload, Vec::new());
        }
        let first_type = self.0[0].payload_type();
        let mut out = Vec::new();
        for (i, payload) in self.0.iter().enumerate() {
            let next = if i + 1 < self.0.len() {
                self.0[i + 1].payload_type()
            } else {
                PayloadType::NoNextPayload
            };
            let body = payload.body();
            let critical = matches!(payload, Payload::Unknown { .. }) && false;
            encode_generic_header(&mut out, next, critical, body.len());
            out.extend_from_slice(&body);
        }
        (first_type, out)
    }

    /// Decodes a chain starting at `first_payload_type`, failing on any
    /// unknown payload whose critical bit is set.
    pub fn decode(first_payload_type: PayloadType, buf: &[u8]) -> Result<Self, CodecError> {
        let mut payloads = Vec::new();
        let mut cursor = 0usize;
        let mut current_type = first_payload_type;

        while current_type != PayloadType::NoNextPayload {
            if cursor >= buf.len() {
                return Err(CodecError::InvalidSyntax(
                    "payload chain truncated before declared end".into(),
                ));
            }
            let header = decode_generic_header(&buf[cursor..])?;
            let body_start = cursor + HDR_LEN;
            let body_end = body_start + header.body_len;
            if body_end > buf.len() {
                return Err(CodecError::InvalidSyntax(
                    "payload chain extends past message length".into(),
                ));
            }
            let body = &buf[body_start..body_end];

            if matches!(current_type, PayloadType::Unknown(_)) && header.critical {
                if let PayloadType::Unknown(v) = current_type {
                    return Err(CodecError::UnsupportedCritical(v));
                }
            }

            payloads.push(Payload::decode_body(current_type, body)?);
            current_type = header.next_payload;
            cursor = body_end;
        }

        if cursor != buf.len() {
            return Err(CodecError::InvalidSyntax(
                "trailing bytes after last chained payload".into(),
            ));
        }

        Ok(PayloadChain(payloads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sa() -> SaPayload {
        SaPayload {
            proposals: vec![Proposal {
                proposal_num: 1,
                protocol_id: 1,
                spi: vec![],
                transforms: vec![
                    Transform {
                        kind: TransformKind::Encryption,
                        transform_id: 20,
                        attributes: vec![TransformAttribute::key_length(256)],
                    },
                    Transform {
                        kind: TransformKind::Prf,
                        transform_id: 2,
                        attributes: vec![],
                    },
                    Transform {
                        kind: TransformKind::DiffieHellman,
                        transform_id: 14,
                        attributes: vec![],
                    },
                ],
            }],
        }
    }

    #[test]
    fn sa_payload_round_trips() {
        let sa = sample_sa();
        let encoded = sa.encode();
        let decoded = SaPayload::decode(&encoded).unwrap();
        assert_eq!(sa, decoded);
    }

    #[test]
    fn chain_round_trips_for_every_payload_type() {
        let chain = PayloadChain(vec![
            Payload::Sa(sample_sa()),
            Payload::Nonce(NoncePayload(vec![0x11; 32])),
            Payload::KeyExchange(KeyExchangePayload {
                dh_group: 14,
                data: vec![0x22; 256],
            }),
            Payload::IdInitiator(IdPayload {
                id_type: 2,
                data: b"initiator@example.com".to_vec(),
            }),
            Payload::Authentication(AuthPayload {
                auth_method: 2,
                data: vec![0x33; 20],
            }),
            Payload::TsInitiator(TsPayload {
                selectors: vec![TrafficSelector::all_ipv4()],
            }),
            Payload::TsResponder(TsPayload {
                selectors: vec![TrafficSelector::all_ipv4()],
            }),
            Payload::Notify(NotifyPayload {
                protocol_id: 0,
                spi: vec![],
                message_type: super::super::notify::status::USE_TRANSPORT_MODE,
                data: vec![],
            }),
            Payload::Delete(DeletePayload {
                protocol_id: 3,
                spi_size: 4,
                spis: vec![vec![1, 2, 3, 4]],
            }),
        ]);

        let (first, bytes) = chain.encode();
        let decoded = PayloadChain::decode(first, &bytes).unwrap();
        assert_eq!(chain, decoded);
    }

    #[test]
    fn unknown_critical_payload_rejected() {
        let mut buf = Vec::new();
        // generic header marking next=NONE, critical bit set, zero-length body
        buf.push(0);
        buf.push(CRITICAL_BIT);
        buf.extend_from_slice(&4u16.to_be_bytes());
        let err = PayloadChain::decode(PayloadType::Unknown(222), &buf).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedCritical(222)));
    }

    #[test]
    fn ts_subset_check() {
        let wide = TrafficSelector::all_ipv4();
        let narrow = TrafficSelector {
            ts_type: TsType::Ipv4AddrRange,
            ip_protocol_id: 6,
            start_port: 443,
            end_port: 443,
            start_addr: vec![10, 0, 0, 1],
            end_addr: vec![10, 0, 0, 1],
        };
        assert!(narrow.is_subset_of(&wide));
        assert!(!wide.is_subset_of(&narrow));
    }
}
