use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

/// Address the tester uses on the bus
pub const TESTER_ADDRESS: u8 = 0xF1;
/// Slow init address answered by KWP1281 capable ECUs
pub const KWP1281_INIT_ADDRESS: u8 = 0x01;
/// Slow init address answered by KWP2000 ECUs
pub const KWP2000_INIT_ADDRESS: u8 = 0x11;
/// Physical address used for fast init
pub const FAST_INIT_ADDRESS: u8 = 0x01;

/// Maximum number of data bytes in a message, including the service id
pub const MAX_DATA_LENGTH: usize = u8::MAX as usize;
/// Format byte, two address bytes, length byte and checksum
pub const MAX_FRAME_LENGTH: usize = MAX_DATA_LENGTH + 5;
/// Largest length that still fits in the format byte
pub const SHORT_DATA_LENGTH: usize = 0b00111111;

pub mod key_byte {
    pub const LENGTH_IN_FORMAT: u8 = 0x01;
    pub const ADDITIONAL_LENGTH_BYTE: u8 = 0x02;
    pub const ONE_BYTE_HEADER: u8 = 0x04;
    pub const TARGET_SOURCE_IN_HEADER: u8 = 0x08;
    pub const EXTENDED_TIMING: u8 = 0x10;
    pub const NORMAL_TIMING: u8 = 0x20;
    pub const ALWAYS_ONE: u8 = 0x40;
    pub const PARITY: u8 = 0x80;

    pub const DEFAULT_KEY_BYTE_1: u8 = 0x6B;
    pub const KWP2000_KEY_BYTE_2: u8 = 0x0F;
    pub const KWP1281_KEY_BYTE_1: u8 = 0x01;
    pub const KWP1281_KEY_BYTE_2: u8 = 0x0A;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    #[default]
    None = 0b00000000,
    Carb = 0b01000000,
    Physical = 0b10000000,
    Functional = 0b11000000,
}

impl AddressMode {
    pub const MASK: u8 = 0b11000000;

    pub fn from_format(format: u8) -> Self {
        match format & Self::MASK {
            0b00000000 => AddressMode::None,
            0b01000000 => AddressMode::Carb,
            0b10000000 => AddressMode::Physical,
            _ => AddressMode::Functional,
        }
    }

    /// Whether the header carries target and source bytes
    pub fn has_addresses(self) -> bool {
        matches!(self, AddressMode::Physical | AddressMode::Functional)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum TimingParameterIdentifier {
    ReadLimits = 0,
    SetDefaults = 1,
    ReadCurrent = 2,
    SetValues = 3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFormat {
    #[default]
    Uncompressed = 0x00,
    Bosch = 0x10,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionFormat {
    #[default]
    Unencrypted = 0x00,
    Bosch = 0x01,
}

pub const fn data_format_byte(compression: CompressionFormat, encryption: EncryptionFormat) -> u8 {
    compression as u8 | encryption as u8
}

#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSession {
    /// Nothing has been negotiated with the ECU yet
    #[default]
    InternalUndefined = 0x00,
    Standard = 0x81,
    EndOfLineFiat = 0x83,
    EndOfLineSupplier = 0x84,
    Programming = 0x85,
    Development = 0x86,
    Adjustment = 0x87,
    ComponentStarting = 0x89,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum LocalRoutine {
    EraseFlash = 0xC4,
    ValidateFlashChecksum = 0xC5,
}

pub mod baud {
    pub const UNSPECIFIED: u32 = 0;
    pub const B9600: u32 = 9600;
    pub const B10400: u32 = 10400;
    pub const B38400: u32 = 38400;
    pub const B52800: u32 = 52800;
    pub const B124800: u32 = 124800;
    pub const DEFAULT: u32 = B10400;

    /// baud = 2^X * (Y + 32) * 6400 / 32, byte = XXXYYYYY
    pub fn from_byte(byte: u8) -> u32 {
        let exponent = (byte >> 5) & 0x07;
        let scalar = (byte & 0x1F) as u32 + 32;
        ((1u32 << exponent) * scalar * 6400) / 32
    }

    pub fn to_byte(baud: u32) -> u8 {
        let base = baud * 32 / 6400;
        let mut best_exponent = 0u32;
        let mut best_divisor = 1u32;
        let mut best_distance = 64.0f64;

        for exponent in (0..8u32).rev() {
            let divisor = 1u32 << exponent;
            if divisor < base {
                let scalar = base as f64 / divisor as f64;
                if scalar > 32.0 && scalar < 64.0 {
                    let distance = scalar - scalar.floor();
                    if distance < best_distance {
                        best_distance = distance;
                        best_exponent = exponent;
                        best_divisor = divisor;
                    }
                }
            }
        }

        let scalar = (base / best_divisor).saturating_sub(32);
        (((best_exponent & 0x07) << 5) | (scalar & 0x1F)) as u8
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
pub enum ResponseCode {
    GeneralReject = 0x10,
    /// Service not supported by control unit
    ServiceNotSupported = 0x11,
    /// Also returned for an invalid message format
    SubFunctionNotSupported = 0x12,
    /// EDC15 specific
    Edc15Specific = 0x13,
    /// Still working on previous request
    BusyRepeatRequest = 0x21,
    /// Conditions for executing service not met, or interdependent services were sent in the wrong order
    ConditionsNotCorrect = 0x22,
    /// Processing not complete, still working on it
    RoutineNotComplete = 0x23,
    /// One or more parameter values is out of permitted range
    RequestOutOfRange = 0x31,
    /// This service requires security access to be carried out successfully first
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    /// Maximum security access failures has been reached
    ExceedNumberOfAttempts = 0x36,
    /// Wait before making another security access request
    RequiredTimeDelayNotExpired = 0x37,
    DownloadNotAccepted = 0x40,
    ImproperDownloadType = 0x41,
    CanNotDownloadToAddress = 0x42,
    CanNotDownloadNumberOfBytes = 0x43,
    UploadNotAccepted = 0x50,
    ImproperUploadType = 0x51,
    CanNotUploadFromAddress = 0x52,
    CanNotUploadNumberOfBytes = 0x53,
    TransferSuspended = 0x71,
    TransferAborted = 0x72,
    IllegalAddressInBlockTransfer = 0x74,
    IllegalByteCountInBlockTransfer = 0x75,
    IllegalBlockTransferType = 0x76,
    BlockTransferDataChecksumError = 0x77,
    /// Request received correctly, wait until final response is received before sending another
    ResponsePending = 0x78,
    IncorrectByteCountDuringBlockTransfer = 0x79,
    NotSupportedInActiveSession = 0x80,
    NoProgram = 0x90,
}

/// Readable name of a response code, falling back to hex for unknown codes
pub fn response_code_name(code: u8) -> String {
    match ResponseCode::from_repr(code) {
        Some(known) => known.to_string(),
        None => format!("{code:#04x}"),
    }
}

/// Readable name of a request or response service id
pub fn service_name(id: u8) -> String {
    if let Some(request) = ServiceId::from_repr(id) {
        request.to_string()
    } else if id == ServiceResponse::NegativeResponse as u8 {
        ServiceResponse::NegativeResponse.to_string()
    } else if let Some(response) = ServiceResponse::from_repr(id) {
        format!("{response}PositiveResponse")
    } else {
        format!("{id:#04x}")
    }
}

macro_rules! ServiceEnums {
    {$($(#[$attr:meta])? $name:ident = $id:expr => $response:expr),* $(,)?} => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
        pub enum ServiceId {
            $($(#[$attr])* $name = $id,)*
        }
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
        pub enum ServiceResponse {
            NegativeResponse = 0x7F,
            $($(#[$attr])* $name = $response,)*
        }

        impl ServiceId {
            pub const fn positive_response(self) -> ServiceResponse {
                match self {
                    $(ServiceId::$name => ServiceResponse::$name,)*
                }
            }
        }
    };
}

// service name = request id => positive response id
//
// NegativeResponse = 0x7F is always added to the response list
ServiceEnums! {
    StartDiagnosticSession = 0x10 => 0x50,
    EcuReset = 0x11 => 0x51,
    ClearDiagnosticInformation = 0x14 => 0x54,
    ReadDTCByStatus = 0x18 => 0x58,
    ReadECUIdentification = 0x1A => 0x5A,
    StopDiagnosticSession = 0x20 => 0x60,
    ReadDataByLocalIdentifier = 0x21 => 0x61,
    ReadDataByCommonIdentifier = 0x22 => 0x62,
    ReadMemoryByAddress = 0x23 => 0x63,
    SecurityAccess = 0x27 => 0x67,
    StartRoutineByLocalIdentifier = 0x31 => 0x71,
    RequestRoutineResultsByLocalIdentifier = 0x33 => 0x73,
    RequestDownload = 0x34 => 0x74,
    RequestUpload = 0x35 => 0x75,
    TransferData = 0x36 => 0x76,
    RequestTransferExit = 0x37 => 0x77,
    WriteDataByLocalIdentifier = 0x3B => 0x7B,
    WriteMemoryByAddress = 0x3D => 0x7D,
    TesterPresent = 0x3E => 0x7E,
    StartCommunication = 0x81 => 0xC1,
    StopCommunication = 0x82 => 0xC2,
    AccessTimingParameters = 0x83 => 0xC3,
    /// Vendor extension installed by the handler table relocation
    DefineReadVariables = 0xB7 => 0xF7,
    /// Vendor extension installed by the handler table relocation
    ReadVariables = 0xB8 => 0xF8,
}

/// Bit set in every response service id
pub const RESPONSE_BIT: u8 = 0x40;
