use std::num::Wrapping;

use super::constants::*;
use super::frame::FrameError;

/// Retries allowed for a message before it is given up on
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mode: AddressMode,
    pub source: u8,
    pub target: u8,
    pub service: u8,
    pub data: Vec<u8>,
    /// Not part of the frame, only used by the send queue
    pub max_retries: u32,
}

impl Message {
    /// Fails when the data and service id don't fit the one byte length.
    pub fn new(
        mode: AddressMode,
        source: u8,
        target: u8,
        service: u8,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        // leave one byte for the service id
        if data.len() >= MAX_DATA_LENGTH {
            return Err(FrameError::RequestedTooMuchData);
        }
        Ok(Self {
            mode,
            source,
            target,
            service,
            data,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Physically addressed request from the tester to `target`
    pub fn request(target: u8, service: ServiceId, data: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(
            AddressMode::Physical,
            TESTER_ADDRESS,
            target,
            service as u8,
            data,
        )
    }

    pub fn service_id(&self) -> Option<ServiceId> {
        ServiceId::from_repr(self.service)
    }

    pub fn is_response(&self) -> bool {
        self.service & RESPONSE_BIT != 0
    }

    /// Serializes the message the way the negotiated key byte 1 allows.
    ///
    /// A one byte header is used when advertised, dropping the address bytes.
    /// The length goes into the format byte when it fits and either the key
    /// byte allows it or the key byte does not describe any length scheme.
    pub fn to_bytes(&self, key_byte_1: u8) -> Vec<u8> {
        let one_byte_header = key_byte_1 & key_byte::ONE_BYTE_HEADER != 0;
        let length_in_format = key_byte_1 & key_byte::LENGTH_IN_FORMAT != 0;
        let additional_length = key_byte_1 & key_byte::ADDITIONAL_LENGTH_BYTE != 0;
        let no_length_info = !length_in_format && !additional_length;

        let mode = if one_byte_header {
            AddressMode::None
        } else {
            self.mode
        };

        // Include service id in length
        let length = 1 + self.data.len();
        let inline_length = length <= SHORT_DATA_LENGTH && (length_in_format || no_length_info);

        let mut bytes = Vec::with_capacity(length + 5);
        if inline_length {
            bytes.push(mode as u8 | length as u8);
        } else {
            bytes.push(mode as u8);
        }

        if !one_byte_header {
            bytes.push(self.target);
            bytes.push(self.source);
        }

        if !inline_length {
            bytes.push(length as u8);
        }

        bytes.push(self.service);
        bytes.extend_from_slice(&self.data);
        bytes.push(checksum(&bytes));
        bytes
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: Wrapping<u8> = bytes.iter().map(|x| Wrapping(*x)).sum();
    sum.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn start_communication_with_default_key_bytes() {
        let message = Message::request(0x01, ServiceId::StartCommunication, vec![]).unwrap();
        assert_eq!(
            message.to_bytes(key_byte::DEFAULT_KEY_BYTE_1),
            vec![0x81, 0x01, 0xF1, 0x81, 0xF4]
        );
    }

    #[test]
    fn long_messages_use_length_byte() {
        let message = Message::request(0x10, ServiceId::TransferData, vec![0xAA; 0x40]).unwrap();
        let bytes = message.to_bytes(key_byte::DEFAULT_KEY_BYTE_1);
        assert_eq!(&bytes[..4], &[0x80, 0x10, 0xF1, 0x41]);
        assert_eq!(bytes.len(), 4 + 0x41 + 1);
        assert_eq!(*bytes.last().unwrap(), checksum(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn additional_length_only_key_byte() {
        // 0x4A: always one, target/source in header, additional length byte
        let message = Message::request(0x10, ServiceId::TesterPresent, vec![0x01]).unwrap();
        assert_eq!(
            message.to_bytes(0x4A),
            vec![0x80, 0x10, 0xF1, 0x02, 0x3E, 0x01, checksum(&[0x80, 0x10, 0xF1, 0x02, 0x3E, 0x01])]
        );
    }

    #[test]
    fn one_byte_header_drops_addresses() {
        let message = Message::request(0x10, ServiceId::TesterPresent, vec![0x01]).unwrap();
        assert_eq!(message.to_bytes(0x45), vec![0x02, 0x3E, 0x01, 0x41]);
    }

    #[test]
    fn data_must_fit_the_length_byte() {
        let too_long = Message::request(0x10, ServiceId::TransferData, vec![0x00; MAX_DATA_LENGTH]);
        assert_eq!(too_long, Err(FrameError::RequestedTooMuchData));

        let longest = Message::request(0x10, ServiceId::TransferData, vec![0x00; MAX_DATA_LENGTH - 1]).unwrap();
        let bytes = longest.to_bytes(key_byte::DEFAULT_KEY_BYTE_1);
        assert_eq!(bytes[3], 0xFF);
        assert_eq!(bytes.len(), 4 + 0xFF + 1);
    }
}
