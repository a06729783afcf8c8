//! Operations that run a fixed list of actions after the preamble.

use std::fmt;

use tracing::{debug, info};

use super::{
    Context, Operation, OperationOutput, Preamble, PreambleSettings, SessionSettings, Step,
};
use crate::{
    actions::{
        ActionReport, AnyAction, ClearDiagnosticInformation, ReadDataByIdentifier,
        ReadDtcByStatus, ReadMemory, ValidateFlashChecksum, WriteMemory,
        transfer::DEFAULT_MAX_BLOCK_SIZE,
    },
    kwp2000::constants::DiagnosticSession,
};

/// Serial EEPROM as mapped by the ECU's memory read handler
pub const SERIAL_EEPROM_START: u32 = 0x600000;
pub const SERIAL_EEPROM_SIZE: u32 = 512;
/// The EEPROM read handler can't return more than this per request
pub const SERIAL_EEPROM_BLOCK_SIZE: u8 = 16;

pub const EXTERNAL_RAM_START: u32 = 0x380000;
pub const EXTERNAL_RAM_SIZE: u32 = 0x8000;

/// Trouble codes in every status
const ANY_DTC_STATUS: u8 = 0x00;
/// Trouble code group of every powertrain code
const POWERTRAIN_DTC_GROUP: u16 = 0x0000;

type Collect = fn(Vec<AnyAction>) -> OperationOutput;

/// Runs every action it was given after the preamble, in order.
///
/// A failed action fails the operation unless the operation was told to
/// ignore failures, in which case failed actions are dropped from the output.
pub struct SequentialOperation {
    name: &'static str,
    preamble: Preamble,
    pending: Box<dyn Iterator<Item = AnyAction> + Send>,
    total: usize,
    started: usize,
    done: Vec<AnyAction>,
    ignore_failures: bool,
    collect: Collect,
}

impl SequentialOperation {
    pub fn new(
        name: &'static str,
        preamble: PreambleSettings,
        actions: impl IntoIterator<Item = AnyAction, IntoIter: Send + 'static>,
        total: usize,
        collect: Collect,
    ) -> Self {
        Self {
            name,
            preamble: Preamble::new(preamble),
            pending: Box::new(actions.into_iter()),
            total,
            started: 0,
            done: Vec::new(),
            ignore_failures: false,
            collect,
        }
    }

    fn ignoring_failures(mut self) -> Self {
        self.ignore_failures = true;
        self
    }
}

impl fmt::Debug for SequentialOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialOperation")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("total", &self.total)
            .finish()
    }
}

impl Operation for SequentialOperation {
    fn name(&self) -> &'static str {
        self.name
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        match self.pending.next() {
            Some(action) => {
                self.started += 1;
                Step::Run(action)
            }
            None => Step::Finished(true),
        }
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        if report.success {
            self.done.push(action);
            return true;
        }
        if self.ignore_failures {
            debug!(action = ?action, "ignoring failed action");
            return true;
        }
        false
    }

    fn progress(&self, _running: Option<&AnyAction>) -> Option<f32> {
        (self.total > 0).then(|| self.started as f32 / self.total as f32)
    }

    fn into_output(self: Box<Self>) -> OperationOutput {
        (self.collect)(self.done)
    }
}

fn first_image(done: Vec<AnyAction>) -> OperationOutput {
    done.into_iter()
        .find_map(|action| match action {
            AnyAction::ReadMemory(read) => Some(OperationOutput::Memory(read.into_image())),
            _ => None,
        })
        .unwrap_or_default()
}

fn nothing(_done: Vec<AnyAction>) -> OperationOutput {
    OperationOutput::None
}

fn memory_preamble(settings: &SessionSettings) -> PreambleSettings {
    PreambleSettings::session(DiagnosticSession::Development, settings).with_timing(settings)
}

fn read_memory_with_block(
    name: &'static str,
    settings: &SessionSettings,
    start: u32,
    size: u32,
    max_block_size: u8,
) -> SequentialOperation {
    info!(name, "reading {size:#x} bytes from {start:#08x}");
    SequentialOperation::new(
        name,
        memory_preamble(settings),
        [ReadMemory::new(start, size, max_block_size).into()],
        1,
        first_image,
    )
}

pub fn read_memory(settings: &SessionSettings, start: u32, size: u32) -> SequentialOperation {
    read_memory_with_block("ReadMemory", settings, start, size, DEFAULT_MAX_BLOCK_SIZE)
}

pub fn write_memory(settings: &SessionSettings, start: u32, data: Vec<u8>) -> SequentialOperation {
    SequentialOperation::new(
        "WriteMemory",
        memory_preamble(settings),
        [WriteMemory::new(start, data, DEFAULT_MAX_BLOCK_SIZE).into()],
        1,
        nothing,
    )
}

pub fn read_serial_eeprom(settings: &SessionSettings) -> SequentialOperation {
    read_memory_with_block(
        "ReadSerialEeprom",
        settings,
        SERIAL_EEPROM_START,
        SERIAL_EEPROM_SIZE,
        SERIAL_EEPROM_BLOCK_SIZE,
    )
}

pub fn read_external_ram(settings: &SessionSettings) -> SequentialOperation {
    read_memory_with_block(
        "ReadEntireExternalRam",
        settings,
        EXTERNAL_RAM_START,
        EXTERNAL_RAM_SIZE,
        DEFAULT_MAX_BLOCK_SIZE,
    )
}

pub fn read_dtcs(settings: &SessionSettings) -> SequentialOperation {
    SequentialOperation::new(
        "ReadDiagnosticTroubleCodes",
        PreambleSettings::session(DiagnosticSession::Standard, settings).with_timing(settings),
        [ReadDtcByStatus::new(ANY_DTC_STATUS, POWERTRAIN_DTC_GROUP).into()],
        1,
        |done| {
            let dtcs = done
                .into_iter()
                .filter_map(|action| match action {
                    AnyAction::ReadDtcByStatus(read) => Some(read.dtcs().to_vec()),
                    _ => None,
                })
                .flatten()
                .collect();
            OperationOutput::Dtcs(dtcs)
        },
    )
}

pub fn clear_dtcs(settings: &SessionSettings) -> SequentialOperation {
    SequentialOperation::new(
        "ClearDiagnosticInformation",
        PreambleSettings::session(DiagnosticSession::Standard, settings),
        [ClearDiagnosticInformation::new(POWERTRAIN_DTC_GROUP).into()],
        1,
        nothing,
    )
}

/// Asks the ECU whether the flash at `start` holds `data`.
pub fn flash_checksum_matches(
    settings: &SessionSettings,
    start: u32,
    data: &[u8],
) -> SequentialOperation {
    SequentialOperation::new(
        "DoesFlashChecksumMatch",
        PreambleSettings::session(DiagnosticSession::Programming, settings)
            .with_timing(settings)
            .with_security(settings),
        [ValidateFlashChecksum::new(start, data).into()],
        1,
        |done| {
            let matches = done.iter().any(|action| {
                matches!(action, AnyAction::ValidateFlashChecksum(validate) if validate.is_correct())
            });
            OperationOutput::ChecksumMatches(matches)
        },
    )
}

fn identifiers(done: Vec<AnyAction>) -> OperationOutput {
    OperationOutput::Identifiers(
        done.into_iter()
            .filter_map(|action| match action {
                AnyAction::ReadDataByIdentifier(read) => {
                    Some((read.identifier(), read.data().to_vec()))
                }
                _ => None,
            })
            .collect(),
    )
}

/// Reads every local identifier the ECU answers for.
pub fn read_all_local_identifiers(settings: &SessionSettings) -> SequentialOperation {
    let ids = (0x01..=0xFEu8).rev();
    SequentialOperation::new(
        "ReadAllLocalIdentifiers",
        PreambleSettings::session(DiagnosticSession::Standard, settings),
        ids.map(|id| ReadDataByIdentifier::local(id).into()),
        0xFE,
        identifiers,
    )
    .ignoring_failures()
}

/// Reads every common identifier the ECU answers for.
pub fn read_all_common_identifiers(settings: &SessionSettings) -> SequentialOperation {
    let ids = (0x0000..=0xFFFEu16).rev();
    SequentialOperation::new(
        "ReadAllCommonIdentifiers",
        PreambleSettings::session(DiagnosticSession::Standard, settings),
        ids.map(|id| ReadDataByIdentifier::common(id).into()),
        0xFFFF,
        identifiers,
    )
    .ignoring_failures()
}

#[cfg(test)]
mod tests {
    use super::super::test_ecu::*;
    use super::*;
    use crate::{
        actions::{Dtc, diagnostic::DataIdentifier},
        kwp2000::{Message, constants::*},
    };
    use pretty_assertions::assert_eq;

    fn settings() -> SessionSettings {
        SessionSettings {
            baud_rates: vec![baud::UNSPECIFIED],
            negotiate_timing: false,
            ..SessionSettings::default()
        }
    }

    /// Accepts any session and answers memory reads with the low address byte
    fn memory_ecu(request: &Message) -> Reply {
        match request.service {
            0x10 => Reply::Positive(request.data.clone()),
            0x23 => {
                let size = request.data[3] as usize;
                Reply::Positive((0..size).map(|i| request.data[2].wrapping_add(i as u8)).collect())
            }
            _ => Reply::Negative(ResponseCode::ServiceNotSupported),
        }
    }

    #[test]
    fn eeprom_reads_sixteen_bytes_at_a_time() {
        let mut harness = Harness::new(read_serial_eeprom(&settings()));
        assert_eq!(harness.run(memory_ecu), RunnerState::Finished(true));

        let reads: Vec<_> = harness
            .requests()
            .into_iter()
            .filter(|(service, _)| *service == 0x23)
            .collect();
        assert_eq!(reads.len(), 512 / 12 + 1);
        assert_eq!(reads[0].1, vec![0x60, 0x00, 0x00, 12]);

        let OperationOutput::Memory(image) = harness.output() else {
            panic!("expected a memory image");
        };
        assert_eq!(image.start, SERIAL_EEPROM_START);
        assert_eq!(image.data.len(), 512);
        assert_eq!(image.data[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn memory_read_failure_fails() {
        let mut harness = Harness::new(read_memory(&settings(), 0x380000, 16));
        let state = harness.run(|request| match request.service {
            0x10 => Reply::Positive(request.data.clone()),
            _ => Reply::Negative(ResponseCode::RequestOutOfRange),
        });
        assert_eq!(state, RunnerState::Finished(false));
    }

    #[test]
    fn dtcs_in_standard_session() {
        let mut harness = Harness::new(read_dtcs(&settings()));
        let state = harness.run(|request| match request.service {
            0x18 => Reply::Positive(vec![1, 0x40, 0x71, 0x23]),
            _ => Reply::Negative(ResponseCode::GeneralReject),
        });
        assert_eq!(state, RunnerState::Finished(true));
        // already in the standard session
        assert_eq!(harness.requests(), vec![(0x18, vec![0x00, 0x00, 0x00])]);
        assert_eq!(
            harness.output(),
            OperationOutput::Dtcs(vec![Dtc {
                code: 0x4071,
                status: 0x23
            }])
        );
    }

    #[test]
    fn local_identifiers_skip_refusals() {
        let mut harness = Harness::new(read_all_local_identifiers(&settings()));
        let state = harness.run(|request| match request.data[0] {
            0x90 | 0x01 => Reply::Positive(vec![request.data[0], 0xAA]),
            _ => Reply::Negative(ResponseCode::RequestOutOfRange),
        });
        assert_eq!(state, RunnerState::Finished(true));
        assert_eq!(harness.requests().len(), 0xFE);
        assert_eq!(harness.requests()[0], (0x21, vec![0xFE]));
        assert_eq!(
            harness.output(),
            OperationOutput::Identifiers(vec![
                (DataIdentifier::Local(0x90), vec![0x90, 0xAA]),
                (DataIdentifier::Local(0x01), vec![0x01, 0xAA]),
            ])
        );
    }

    #[test]
    fn checksum_match_reports_answer() {
        let mut harness = Harness::new(flash_checksum_matches(&settings(), 0x800000, &[0xFF; 16]));
        let state = harness.run(|request| match request.service {
            0x1A => Reply::Positive(vec![0x9C, 0, 0, 0, 0]),
            0x27 => Reply::Positive(vec![request.data[0], 0, 0, 0, 0]),
            0x10 => Reply::Positive(request.data.clone()),
            0x31 => Reply::Positive(vec![0xC5]),
            0x33 => Reply::Positive(vec![0xC5, 0x00]),
            _ => Reply::Negative(ResponseCode::ServiceNotSupported),
        });
        assert_eq!(state, RunnerState::Finished(true));
        assert_eq!(harness.output(), OperationOutput::ChecksumMatches(true));
    }

    #[test]
    fn write_memory_in_development_session() {
        let mut harness = Harness::new(write_memory(&settings(), 0x380000, vec![1, 2, 3, 4]));
        let state = harness.run(|request| match request.service {
            0x10 => Reply::Positive(request.data.clone()),
            0x3D => Reply::Positive(Vec::new()),
            _ => Reply::Negative(ResponseCode::ServiceNotSupported),
        });
        assert_eq!(state, RunnerState::Finished(true));
        assert_eq!(harness.link.session, DiagnosticSession::Development);
        assert_eq!(
            harness.requests().last(),
            Some(&(0x3D, vec![0x38, 0x00, 0x00, 4, 1, 2, 3, 4]))
        );
    }
}
