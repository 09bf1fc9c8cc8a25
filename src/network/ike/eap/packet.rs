//! Raw EAP packet framing (RFC 3748 §4): `Code | Identifier | Length |
//! [Type | Type-Data]`. `Success`/`Failure` carry no Type field.

use thiserror::Error;

pub const EAP_TYPE_IDENTITY: u8 = 1;
pub const EAP_TYPE_NOTIFICATION: u8 = 2;
pub const EAP_TYPE_LEGACY_NAK: u8 = 3;
pub const EAP_TYPE_SIM: u8 = 18;
pub const EAP_TYPE_AKA: u8 = 23;
pub const EAP_TYPE_AKA_PRIME: u8 = 50;

#[derive(Debug, Error)]
pub enum EapPacketError {
    #[error("EAP packet truncated")]
    Truncated,
    #[error("EAP packet length field {declared} disagrees with buffer size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown EAP code {0}")]
    UnknownCode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    fn from_u8(v: u8) -> Result<Self, EapPacketError> {
        match v {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Success),
            4 => Ok(Self::Failure),
            other => Err(EapPacketError::UnknownCode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    pub code: EapCode,
    pub identifier: u8,
    /// Absent only for `Success`/`Failure`.
    pub type_field: Option<u8>,
    pub type_data: Vec<u8>,
}

impl EapPacket {
    pub fn request(identifier: u8, type_field: u8, type_data: Vec<u8>) -> Self {
        EapPacket {
            code: EapCode::Request,
            identifier,
            type_field: Some(type_field),
            type_data,
        }
    }

    pub fn response(identifier: u8, type_field: u8, type_data: Vec<u8>) -> Self {
        EapPacket {
            code: EapCode::Response,
            identifier,
            type_field: Some(type_field),
            type_data,
        }
    }

    pub fn success(identifier: u8) -> Self {
        EapPacket {
            code: EapCode::Success,
            identifier,
            type_field: None,
            type_data: Vec::new(),
        }
    }

    pub fn failure(identifier: u8) -> Self {
        EapPacket {
            code: EapCode::Failure,
            identifier,
            type_field: None,
            type_data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.type_field {
            None => {
                let mut out = Vec::with_capacity(4);
                out.push(self.code as u8);
                out.push(self.identifier);
                out.extend_from_slice(&4u16.to_be_bytes());
                out
            }
            Some(type_field) => {
                let length = 5 + self.type_data.len();
                let mut out = Vec::with_capacity(length);
                out.push(self.code as u8);
                out.push(self.identifier);
                out.extend_from_slice(&(length as u16).to_be_bytes());
                out.push(type_field);
                out.extend_from_slice(&self.type_data);
                out
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EapPacketError> {
        if buf.len() < 4 {
            return Err(EapPacketError::Truncated);
        }
        let code = EapCode::from_u8(buf[0])?;
        let identifier = buf[1];
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length != buf.len() {
            return Err(EapPacketError::LengthMismatch {
                declared: length,
                actual: buf.len(),
            });
        }
        match code {
            EapCode::Success | EapCode::Failure => {
                if buf.len() != 4 {
                    return Err(EapPacketError::LengthMismatch {
                        declared: 4,
                        actual: buf.len(),
                    });
                }
                Ok(EapPacket {
                    code,
                    identifier,
                    type_field: None,
                    type_data: Vec::new(),
                })
            }
            EapCode::Request | EapCode::Response => {
                if buf.len() < 5 {
                    return Err(EapPacketError::Truncated);
                }
                Ok(EapPacket {
                    code,
                    identifier,
                    type_field: Some(buf[4]),
                    type_data: buf[5..].to_vec(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let p = EapPacket::request(7, EAP_TYPE_IDENTITY, b"id-payload".to_vec());
        let encoded = p.encode();
        let decoded = EapPacket::decode(&encoded).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn success_has_no_type_field() {
        let p = EapPacket::success(3);
        let encoded = p.encode();
        assert_eq!(encoded.len(), 4);
        let decoded = EapPacket::decode(&encoded).unwrap();
        assert_eq!(decoded.type_field, None);
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut encoded = EapPacket::request(1, EAP_TYPE_SIM, vec![1, 2, 3]).encode();
        let bad_len = (encoded.len() as u16 - 1).to_be_bytes();
        encoded[2] = bad_len[0];
        encoded[3] = bad_len[1];
        assert!(EapPacket::decode(&encoded).is_err());
    }
}
