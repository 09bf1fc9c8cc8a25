//! IKE header: 28 bytes, bit-exact per RFC 7296 §3.1.
//!
//! ```text
//!                      1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Initiator's SPI                |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Responder's SPI                |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::{CodecError, PayloadType};
use crate::network::ike::{IKE_HEADER_LEN, IKE_VERSION};

pub const FLAG_RESPONSE: u8 = 0x20;
pub const FLAG_VERSION: u8 = 0x10;
pub const FLAG_INITIATOR: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeType {
    IkeSaInit = 34,
    IkeAuth = 35,
    CreateChildSa = 36,
    Informational = 37,
}

impl ExchangeType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            34 => Ok(Self::IkeSaInit),
            35 => Ok(Self::IkeAuth),
            36 => Ok(Self::CreateChildSa),
            37 => Ok(Self::Informational),
            other => Err(CodecError::InvalidSyntax(format!(
                "unknown exchange type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: PayloadType,
    pub exchange_type: ExchangeType,
    pub is_initiator: bool,
    pub is_response: bool,
    pub message_id: u32,
    /// Total message length in octets, header included.
    pub length: u32,
}

impl IkeHeader {
    pub fn flags(&self) -> u8 {
        let mut f = FLAG_VERSION;
        if self.is_initiator {
            f |= FLAG_INITIATOR;
        }
        if self.is_response {
            f |= FLAG_RESPONSE;
        }
        f
    }

    pub fn encode(&self) -> [u8; IKE_HEADER_LEN] {
        let mut out = [0u8; IKE_HEADER_LEN];
        out[0..8].copy_from_slice(&self.initiator_spi.to_be_bytes());
        out[8..16].copy_from_slice(&self.responder_spi.to_be_bytes());
        out[16] = self.next_payload.to_u8();
        out[17] = IKE_VERSION;
        out[18] = self.exchange_type as u8;
        out[19] = self.flags();
        out[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        out[24..28].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < IKE_HEADER_LEN {
            return Err(CodecError::InvalidSyntax("header truncated".into()));
        }
        let initiator_spi = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let responder_spi = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let next_payload = PayloadType::from_u8(buf[16]);
        let version = buf[17];
        if version != IKE_VERSION {
            return Err(CodecError::InvalidSyntax(format!(
                "unsupported IKE version {version:#x}"
            )));
        }
        let exchange_type = ExchangeType::from_u8(buf[18])?;
        let flags = buf[19];
        let message_id = u32::from_be_bytes(buf[20..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        if (length as usize) != buf.len() {
            return Err(CodecError::InvalidSyntax(format!(
                "header length {length} disagrees with datagram size {}",
                buf.len()
            )));
        }
        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            exchange_type,
            is_initiator: flags & FLAG_INITIATOR != 0,
            is_response: flags & FLAG_RESPONSE != 0,
            message_id,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = IkeHeader {
            initiator_spi: 0x5F54BF6D8B48E6E1,
            responder_spi: 0,
            next_payload: PayloadType::SecurityAssociation,
            exchange_type: ExchangeType::IkeSaInit,
            is_initiator: true,
            is_response: false,
            message_id: 0,
            length: IKE_HEADER_LEN as u32,
        };
        let encoded = h.encode();
        let decoded = IkeHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut buf = vec![0u8; IKE_HEADER_LEN];
        buf[24..28].copy_from_slice(&100u32.to_be_bytes());
        assert!(IkeHeader::decode(&buf).is_err());
    }
}
