use super::constants::*;
use super::message::Message;

/// Negative response details, `[request service id, response code]` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeResponse {
    pub request: u8,
    pub code: u8,
}

impl NegativeResponse {
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.service != ServiceResponse::NegativeResponse as u8 {
            return None;
        }
        match message.data[..] {
            [request, code, ..] => Some(Self { request, code }),
            _ => None,
        }
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_repr(self.code)
    }

    pub fn is_for(&self, request: ServiceId) -> bool {
        self.request == request as u8
    }
}

impl std::fmt::Display for NegativeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "negative response to {} with code {}",
            service_name(self.request),
            response_code_name(self.code)
        )
    }
}

pub fn is_positive_response(request: u8, message: &Message) -> bool {
    request & RESPONSE_BIT == 0 && message.service == request | RESPONSE_BIT
}

pub fn is_positive_response_to(request: ServiceId, message: &Message) -> bool {
    is_positive_response(request as u8, message)
}

/// Positive response or negative response naming `request`
pub fn is_response_to(request: u8, message: &Message) -> bool {
    is_positive_response(request, message)
        || (message.service == ServiceResponse::NegativeResponse as u8
            && message.data.first() == Some(&request))
}

pub fn negative_response_to(request: ServiceId, message: &Message) -> Option<NegativeResponse> {
    NegativeResponse::from_message(message).filter(|negative| negative.is_for(request))
}

/// Requests whose response may be split over several messages
pub fn uses_data_segmentation(request: u8) -> bool {
    request == ServiceId::ReadDTCByStatus as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_ecu(service: u8, data: Vec<u8>) -> Message {
        Message::new(AddressMode::Physical, 0x10, TESTER_ADDRESS, service, data).unwrap()
    }

    #[test]
    fn pairs_responses() {
        let positive = from_ecu(0x63, vec![0xAA]);
        assert!(is_response_to(0x23, &positive));
        assert!(is_positive_response_to(ServiceId::ReadMemoryByAddress, &positive));
        assert!(!is_response_to(0x3D, &positive));

        let negative = from_ecu(0x7F, vec![0x23, 0x31]);
        assert!(is_response_to(0x23, &negative));
        assert!(!is_positive_response(0x23, &negative));
        assert_eq!(
            negative_response_to(ServiceId::ReadMemoryByAddress, &negative),
            Some(NegativeResponse {
                request: 0x23,
                code: 0x31
            })
        );
        assert_eq!(negative_response_to(ServiceId::SecurityAccess, &negative), None);
    }

    #[test]
    fn short_negative_response_is_ignored() {
        assert_eq!(NegativeResponse::from_message(&from_ecu(0x7F, vec![0x23])), None);
    }

    #[test]
    fn negative_response_display() {
        let negative = NegativeResponse {
            request: 0x27,
            code: 0x35,
        };
        assert_eq!(negative.response_code(), Some(ResponseCode::InvalidKey));
        assert_eq!(
            negative.to_string(),
            "negative response to SecurityAccess with code InvalidKey"
        );
    }
}
