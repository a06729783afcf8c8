use super::constants::*;
use super::timing::TimingParameters;

/// Tool code sent with every erase request
pub const ERASE_TOOL_CODE: [u8; 6] = *b"NEFMTO";
/// Pseudo addresses that make EraseFlash clear the whole chip
pub const ERASE_ENTIRE_FLASH_START: u32 = 0xE001;
pub const ERASE_ENTIRE_FLASH_END: u32 = 0xE002;

/// A request the tester knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// optional baud rate
    StartDiagnosticSession(DiagnosticSession, Option<u32>),
    StopDiagnosticSession,
    StopCommunication,
    /// whether or not the ECU should respond
    TesterPresent(bool),
    /// the values are always sent, the ECU ignores them unless setting
    AccessTimingParameters(TimingParameterIdentifier, TimingParameters),
    /// access mode followed by the seed request or key
    SecurityAccess(Vec<u8>),
    ReadMemoryByAddress {
        address: u32,
        size: u8,
    },
    WriteMemoryByAddress {
        address: u32,
        data: Vec<u8>,
    },
    /// inclusive end address
    EraseFlash {
        start: u32,
        end: u32,
    },
    /// inclusive end address
    ValidateFlashChecksum {
        start: u32,
        end: u32,
        checksum: u16,
    },
    RoutineResults(LocalRoutine),
    RequestDownload {
        address: u32,
        size: u32,
        format: u8,
    },
    RequestUpload {
        address: u32,
        size: u32,
        format: u8,
    },
    TransferData(Vec<u8>),
    RequestTransferExit,
    ReadECUIdentification(u8),
    ReadDTCByStatus {
        status: u8,
        group: u16,
    },
    ClearDiagnosticInformation(u16),
    ReadDataByLocalIdentifier(u8),
    ReadDataByCommonIdentifier(u16),
    /// three address bytes per variable
    DefineReadVariables(Vec<u32>),
    ReadVariables {
        max_reads: u8,
        index: u8,
        count: u8,
    },
}

fn push_address(data: &mut Vec<u8>, address: u32) {
    data.extend_from_slice(&address.to_be_bytes()[1..]);
}

impl Request {
    pub fn raw(self) -> (ServiceId, Vec<u8>) {
        let service;
        let mut data: Vec<u8> = vec![];
        match self {
            Request::StartDiagnosticSession(session, baud_rate) => {
                service = ServiceId::StartDiagnosticSession;
                data.push(session as u8);
                if let Some(baud_rate) = baud_rate {
                    data.push(baud::to_byte(baud_rate));
                }
            }
            Request::StopDiagnosticSession => service = ServiceId::StopDiagnosticSession,
            Request::StopCommunication => service = ServiceId::StopCommunication,
            Request::TesterPresent(respond) => {
                service = ServiceId::TesterPresent;
                data.push(if respond { 0x01 } else { 0x02 });
            }
            Request::AccessTimingParameters(identifier, timing) => {
                service = ServiceId::AccessTimingParameters;
                data.push(identifier as u8);
                data.extend_from_slice(&timing.to_bytes());
            }
            Request::SecurityAccess(mut access) => {
                service = ServiceId::SecurityAccess;
                data.append(&mut access);
            }
            Request::ReadMemoryByAddress { address, size } => {
                service = ServiceId::ReadMemoryByAddress;
                push_address(&mut data, address);
                data.push(size);
            }
            Request::WriteMemoryByAddress {
                address,
                data: mut bytes,
            } => {
                service = ServiceId::WriteMemoryByAddress;
                push_address(&mut data, address);
                data.push(bytes.len() as u8);
                data.append(&mut bytes);
            }
            Request::EraseFlash { start, end } => {
                service = ServiceId::StartRoutineByLocalIdentifier;
                data.push(LocalRoutine::EraseFlash as u8);
                push_address(&mut data, start);
                push_address(&mut data, end);
                data.extend_from_slice(&ERASE_TOOL_CODE);
            }
            Request::ValidateFlashChecksum {
                start,
                end,
                checksum,
            } => {
                service = ServiceId::StartRoutineByLocalIdentifier;
                data.push(LocalRoutine::ValidateFlashChecksum as u8);
                push_address(&mut data, start);
                push_address(&mut data, end);
                data.extend_from_slice(&checksum.to_be_bytes());
            }
            Request::RoutineResults(routine) => {
                service = ServiceId::RequestRoutineResultsByLocalIdentifier;
                data.push(routine as u8);
            }
            Request::RequestDownload {
                address,
                size,
                format,
            } => {
                service = ServiceId::RequestDownload;
                push_address(&mut data, address);
                data.push(format);
                push_address(&mut data, size);
            }
            Request::RequestUpload {
                address,
                size,
                format,
            } => {
                service = ServiceId::RequestUpload;
                push_address(&mut data, address);
                data.push(format);
                push_address(&mut data, size);
            }
            Request::TransferData(mut bytes) => {
                service = ServiceId::TransferData;
                data.append(&mut bytes);
            }
            Request::RequestTransferExit => service = ServiceId::RequestTransferExit,
            Request::ReadECUIdentification(option) => {
                service = ServiceId::ReadECUIdentification;
                data.push(option);
            }
            Request::ReadDTCByStatus { status, group } => {
                service = ServiceId::ReadDTCByStatus;
                data.push(status);
                data.extend_from_slice(&group.to_be_bytes());
            }
            Request::ClearDiagnosticInformation(group) => {
                service = ServiceId::ClearDiagnosticInformation;
                data.extend_from_slice(&group.to_be_bytes());
            }
            Request::ReadDataByLocalIdentifier(id) => {
                service = ServiceId::ReadDataByLocalIdentifier;
                data.push(id);
            }
            Request::ReadDataByCommonIdentifier(id) => {
                service = ServiceId::ReadDataByCommonIdentifier;
                data.extend_from_slice(&id.to_be_bytes());
            }
            Request::DefineReadVariables(addresses) => {
                service = ServiceId::DefineReadVariables;
                data.push(addresses.len() as u8);
                for address in addresses {
                    push_address(&mut data, address);
                }
            }
            Request::ReadVariables {
                max_reads,
                index,
                count,
            } => {
                service = ServiceId::ReadVariables;
                data.push(max_reads);
                data.push(index);
                data.push(count);
            }
        }
        (service, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn start_session_with_baud_rate() {
        assert_eq!(
            Request::StartDiagnosticSession(DiagnosticSession::Programming, Some(38400)).raw(),
            (ServiceId::StartDiagnosticSession, vec![0x85, 0x50])
        );
        assert_eq!(
            Request::StartDiagnosticSession(DiagnosticSession::Standard, None).raw(),
            (ServiceId::StartDiagnosticSession, vec![0x81])
        );
    }

    #[test]
    fn memory_requests_use_three_byte_addresses() {
        assert_eq!(
            Request::ReadMemoryByAddress {
                address: 0x380000,
                size: 250
            }
            .raw()
            .1,
            vec![0x38, 0x00, 0x00, 250]
        );
        assert_eq!(
            Request::WriteMemoryByAddress {
                address: 0x00E1B0,
                data: vec![0xAA, 0xBB]
            }
            .raw()
            .1,
            vec![0x00, 0xE1, 0xB0, 0x02, 0xAA, 0xBB]
        );
        assert_eq!(
            Request::RequestDownload {
                address: 0x800000,
                size: 0x4000,
                format: 0x11
            }
            .raw(),
            (
                ServiceId::RequestDownload,
                vec![0x80, 0x00, 0x00, 0x11, 0x00, 0x40, 0x00]
            )
        );
    }

    #[test]
    fn routine_requests() {
        assert_eq!(
            Request::EraseFlash {
                start: ERASE_ENTIRE_FLASH_START,
                end: ERASE_ENTIRE_FLASH_END
            }
            .raw()
            .1,
            vec![0xC4, 0x00, 0xE0, 0x01, 0x00, 0xE0, 0x02, b'N', b'E', b'F', b'M', b'T', b'O']
        );
        assert_eq!(
            Request::ValidateFlashChecksum {
                start: 0x800000,
                end: 0x803FFF,
                checksum: 0x1234
            }
            .raw()
            .1,
            vec![0xC5, 0x80, 0x00, 0x00, 0x80, 0x3F, 0xFF, 0x12, 0x34]
        );
    }

    #[test]
    fn diagnostic_requests() {
        assert_eq!(
            Request::ReadDTCByStatus {
                status: 0x00,
                group: 0xFF00
            }
            .raw(),
            (ServiceId::ReadDTCByStatus, vec![0x00, 0xFF, 0x00])
        );
        assert_eq!(
            Request::ReadDataByCommonIdentifier(0x1234).raw().1,
            vec![0x12, 0x34]
        );
        assert_eq!(
            Request::DefineReadVariables(vec![0x380000, 0x38ABCD]).raw().1,
            vec![0x02, 0x38, 0x00, 0x00, 0x38, 0xAB, 0xCD]
        );
    }
}
