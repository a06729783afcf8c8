//! Reads every identification option the ECU describes.

use tracing::{debug, info};

use super::{Context, Operation, OperationOutput, Preamble, PreambleSettings, SessionSettings, Step};
use crate::{
    actions::{ActionReport, AnyAction, ReadEcuIdentification},
    identification::{IdentificationInfo, SCALING_TABLE_OPTION, ScalingTable, option_name},
    kwp2000::constants::DiagnosticSession,
};

/// Reads the scaling table, then every option it has a record for.
///
/// The collected [`IdentificationInfo`] is only handed out once the
/// operation finishes.
#[derive(Debug)]
pub struct ReadAllEcuIdentification {
    preamble: Preamble,
    info: IdentificationInfo,
    /// Options named by the scaling table, `None` until it was read
    options: Option<Vec<u8>>,
    next_option: usize,
}

impl ReadAllEcuIdentification {
    /// Starts `session` first, or reads in whatever session is active.
    pub fn new(session: Option<DiagnosticSession>, settings: &SessionSettings) -> Self {
        let preamble = match session {
            Some(session) => PreambleSettings::session(session, settings),
            None => PreambleSettings::current_session(),
        };
        Self {
            preamble: Preamble::new(preamble.with_timing(settings)),
            info: IdentificationInfo::default(),
            options: None,
            next_option: 0,
        }
    }
}

impl Operation for ReadAllEcuIdentification {
    fn name(&self) -> &'static str {
        "ReadAllEcuIdentification"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        match &self.options {
            None => Step::Run(ReadEcuIdentification::new(SCALING_TABLE_OPTION).into()),
            Some(options) => match options.get(self.next_option) {
                Some(option) => Step::Run(ReadEcuIdentification::new(*option).into()),
                None => {
                    info!(options = self.info.values.len(), "read ECU identification");
                    Step::Finished(true)
                }
            },
        }
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        let AnyAction::ReadEcuIdentification(read) = action else {
            return report.success;
        };
        if !report.success {
            return false;
        }

        match self.options {
            None => {
                self.info.scaling_table = ScalingTable::from_bytes(read.data());
                let options = self.info.scaling_table.options();
                debug!(?options, "scaling table read");
                self.options = Some(options);
            }
            Some(_) => {
                let option = read.option();
                debug!(option = %option_name(option), "identification option read");
                self.info.values.insert(option, read.into_data());
                self.next_option += 1;
            }
        }
        true
    }

    fn progress(&self, _running: Option<&AnyAction>) -> Option<f32> {
        let options = self.options.as_ref()?;
        if options.is_empty() {
            return Some(1.0);
        }
        Some(self.next_option as f32 / options.len() as f32)
    }

    fn into_output(self: Box<Self>) -> OperationOutput {
        OperationOutput::Identification(self.info)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{RunnerState, test_ecu::*};
    use super::*;
    use crate::{identification::FLASH_STATUS_OPTION, kwp2000::constants::*};
    use pretty_assertions::assert_eq;

    fn scaling_table() -> Vec<u8> {
        vec![
            0x03, 0x9C, 0x04, // flash status
            0x03, 0x91, 0x64, // hardware number, 4 ASCII bytes
            0xFF,
        ]
    }

    #[test]
    fn reads_every_option_in_the_table() {
        let operation = ReadAllEcuIdentification::new(None, &SessionSettings {
            negotiate_timing: false,
            ..SessionSettings::default()
        });
        let mut harness = Harness::new(operation);
        let state = harness.run(|request| match request.data[0] {
            0x81 => Reply::Positive([&[0x81][..], &scaling_table()].concat()),
            0x9C => Reply::Positive(vec![0x9C, 0x00, 0x01, 0x01, 0x00]),
            0x91 => Reply::Positive(vec![0x91, b'0', b'2', b'6', b'1']),
            _ => Reply::Negative(ResponseCode::RequestOutOfRange),
        });
        assert_eq!(state, RunnerState::Finished(true));
        assert_eq!(
            harness.requests(),
            vec![(0x1A, vec![0x81]), (0x1A, vec![0x9C]), (0x1A, vec![0x91])]
        );
        assert!(harness.events.contains(&OperationEvent::Progress(1.0)));

        let OperationOutput::Identification(info) = harness.output() else {
            panic!("expected identification");
        };
        assert_eq!(info.values.len(), 2);
        assert_eq!(info.value(0x91).as_deref(), Some("0261"));
        assert_eq!(info.flash_status().map(|status| status.attempts), Some(1));
        assert!(info.values.contains_key(&FLASH_STATUS_OPTION));
    }

    #[test]
    fn refused_option_fails() {
        let operation = ReadAllEcuIdentification::new(None, &SessionSettings {
            negotiate_timing: false,
            ..SessionSettings::default()
        });
        let mut harness = Harness::new(operation);
        let state = harness.run(|request| match request.data[0] {
            0x81 => Reply::Positive([&[0x81][..], &scaling_table()].concat()),
            _ => Reply::Negative(ResponseCode::RequestOutOfRange),
        });
        assert_eq!(state, RunnerState::Finished(false));
        assert_eq!(harness.requests().len(), 2);
    }
}
