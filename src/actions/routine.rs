//! Flash routines started with StartRoutineByLocalIdentifier.
//!
//! Both routines are started once and then polled for their result with
//! RequestRoutineResultsByLocalIdentifier until the ECU stops answering
//! RoutineNotComplete.

use tracing::{debug, info};

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    request::{ERASE_ENTIRE_FLASH_END, ERASE_ENTIRE_FLASH_START},
    response::{is_positive_response_to, negative_response_to},
};
use crate::memory::flash_checksum;

/// Routine id and status byte of a routine results response
fn routine_result(message: &Message, routine: LocalRoutine) -> Option<u8> {
    match message.data[..] {
        [id, status, ..] if id == routine as u8 => Some(status),
        _ => None,
    }
}

#[derive(Debug)]
pub struct EraseFlash {
    core: ActionCore,
    start: u32,
    /// inclusive
    end: u32,
    failed_because_of_persistent_data: bool,
}

impl EraseFlash {
    /// Erases the whole chip
    pub fn entire() -> Self {
        Self {
            core: ActionCore::default(),
            start: ERASE_ENTIRE_FLASH_START,
            end: ERASE_ENTIRE_FLASH_END,
            failed_because_of_persistent_data: false,
        }
    }

    /// Erases the sectors covering `start..start + size`, both must be even.
    pub fn range(start: u32, size: u32) -> Self {
        debug_assert!(start % 2 == 0 && size > 0 && size % 2 == 0);
        Self {
            core: ActionCore::default(),
            start,
            end: start + size - 1,
            failed_because_of_persistent_data: false,
        }
    }

    pub fn is_entire(&self) -> bool {
        self.start == ERASE_ENTIRE_FLASH_START && self.end == ERASE_ENTIRE_FLASH_END
    }

    /// The ECU keeps data it refuses to erase sector by sector
    pub fn failed_because_of_persistent_data(&self) -> bool {
        self.failed_because_of_persistent_data
    }
}

impl Action for EraseFlash {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "EraseFlash"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.failed_because_of_persistent_data = false;
        if self.is_entire() {
            info!("erasing entire flash");
        } else {
            info!(
                "erasing flash {:#08x} to {:#08x}",
                self.start, self.end
            );
        }
        self.core.send(
            link,
            Request::EraseFlash {
                start: self.start,
                end: self.end,
            },
        );
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::StartRoutineByLocalIdentifier, message) {
            self.core
                .send(link, Request::RoutineResults(LocalRoutine::EraseFlash));
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::StartRoutineByLocalIdentifier, message)
        {
            debug!("erase refused, {negative}");
            self.core.complete(false);
            true
        } else if is_positive_response_to(ServiceId::RequestRoutineResultsByLocalIdentifier, message)
        {
            let status = routine_result(message, LocalRoutine::EraseFlash);
            if status != Some(0) {
                debug!(?status, "erase routine reported failure");
            }
            self.core.complete(status == Some(0));
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::RequestRoutineResultsByLocalIdentifier, message)
        {
            match negative.response_code() {
                Some(ResponseCode::RoutineNotComplete) => {
                    self.core
                        .send(link, Request::RoutineResults(LocalRoutine::EraseFlash));
                    true
                }
                Some(ResponseCode::GeneralReject | ResponseCode::DownloadNotAccepted) => {
                    debug!("erase failed because of persistent data");
                    self.failed_because_of_persistent_data = true;
                    self.core.complete(false);
                    true
                }
                _ => false,
            }
        } else {
            false
        }
    }
}

/// Asks the ECU whether a range of flash matches the given data.
///
/// The action succeeds whenever the ECU gave an answer, the answer itself is
/// [`ValidateFlashChecksum::is_correct`].
#[derive(Debug)]
pub struct ValidateFlashChecksum {
    core: ActionCore,
    start: u32,
    /// inclusive
    end: u32,
    checksum: u16,
    correct: bool,
}

impl ValidateFlashChecksum {
    pub fn new(start: u32, data: &[u8]) -> Self {
        debug_assert!(!data.is_empty());
        Self {
            core: ActionCore::default(),
            start,
            end: start + data.len() as u32 - 1,
            checksum: flash_checksum(data),
            correct: false,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.correct
    }

    fn request_results(&mut self, link: &mut dyn Link) {
        self.core.send(
            link,
            Request::RoutineResults(LocalRoutine::ValidateFlashChecksum),
        );
    }
}

impl Action for ValidateFlashChecksum {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ValidateFlashChecksum"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.correct = false;
        debug!(
            checksum = format_args!("{:#06x}", self.checksum),
            "validating flash {:#08x} to {:#08x}", self.start, self.end
        );
        self.core.send(
            link,
            Request::ValidateFlashChecksum {
                start: self.start,
                end: self.end,
                checksum: self.checksum,
            },
        );
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::StartRoutineByLocalIdentifier, message) {
            self.request_results(link);
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::StartRoutineByLocalIdentifier, message)
        {
            debug!("checksum validation refused, {negative}");
            self.core.complete(false);
            true
        } else if is_positive_response_to(ServiceId::RequestRoutineResultsByLocalIdentifier, message)
        {
            let Some(status) = routine_result(message, LocalRoutine::ValidateFlashChecksum) else {
                return false;
            };
            self.correct = status == 0;
            debug!(correct = self.correct, "flash checksum validated");
            self.core.complete(true);
            true
        } else if let Some(negative) =
            negative_response_to(ServiceId::RequestRoutineResultsByLocalIdentifier, message)
        {
            match negative.response_code() {
                Some(ResponseCode::RoutineNotComplete) => {
                    self.request_results(link);
                    true
                }
                Some(
                    ResponseCode::BlockTransferDataChecksumError
                    | ResponseCode::GeneralReject
                    | ResponseCode::DownloadNotAccepted,
                ) => {
                    self.correct = false;
                    self.core.complete(true);
                    true
                }
                _ => false,
            }
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, start, test_link::*};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn erase_polls_until_complete() {
        let mut link = TestLink::default();
        let mut action = EraseFlash::range(0x800000, 0x4000);
        start(&mut action, &mut link);
        assert_eq!(
            link.last_request().1[..7],
            [0xC4, 0x80, 0x00, 0x00, 0x80, 0x3F, 0xFF]
        );

        dispatch(&mut action, &mut link, &response(0x71, &[0xC4]));
        assert_eq!(link.last_request(), (0x33, vec![0xC4]));

        let pending = negative(
            ServiceId::RequestRoutineResultsByLocalIdentifier,
            ResponseCode::RoutineNotComplete,
        );
        dispatch(&mut action, &mut link, &pending);
        dispatch(&mut action, &mut link, &pending);
        assert_eq!(link.sent.len(), 4);

        dispatch(&mut action, &mut link, &response(0x73, &[0xC4, 0x00]));
        assert!(action.core().success());
    }

    #[test]
    fn erase_persistent_data() {
        let mut link = TestLink::default();
        let mut action = EraseFlash::range(0x810000, 0x10000);
        start(&mut action, &mut link);
        dispatch(&mut action, &mut link, &response(0x71, &[0xC4]));
        dispatch(
            &mut action,
            &mut link,
            &negative(
                ServiceId::RequestRoutineResultsByLocalIdentifier,
                ResponseCode::GeneralReject,
            ),
        );
        assert!(!action.core().success());
        assert!(action.failed_because_of_persistent_data());
        let report = action.core_mut().take_report().unwrap();
        assert!(report.completed_without_communication_error);
    }

    #[test]
    fn erase_entire_uses_pseudo_addresses() {
        let action = EraseFlash::entire();
        assert!(action.is_entire());
        assert!(!EraseFlash::range(0xE000, 4).is_entire());
    }

    #[test]
    fn checksum_mismatch_still_succeeds() {
        let mut link = TestLink::default();
        let data = vec![0xFF; 0x2000];
        let mut action = ValidateFlashChecksum::new(0x804000, &data);
        start(&mut action, &mut link);

        let checksum = flash_checksum(&data).to_be_bytes();
        assert_eq!(
            link.last_request().1,
            vec![0xC5, 0x80, 0x40, 0x00, 0x80, 0x5F, 0xFF, checksum[0], checksum[1]]
        );

        dispatch(&mut action, &mut link, &response(0x71, &[0xC5]));
        dispatch(&mut action, &mut link, &response(0x73, &[0xC5, 0x01]));
        assert!(action.core().success());
        assert!(!action.is_correct());
    }

    #[test]
    fn checksum_matches() {
        let mut link = TestLink::default();
        let mut action = ValidateFlashChecksum::new(0x800000, &[1, 2, 3, 4]);
        start(&mut action, &mut link);
        dispatch(&mut action, &mut link, &response(0x71, &[0xC5]));
        dispatch(&mut action, &mut link, &response(0x73, &[0xC5, 0x00]));
        assert!(action.is_correct());
    }

    #[test]
    fn refused_validation_fails() {
        let mut link = TestLink::default();
        let mut action = ValidateFlashChecksum::new(0x800000, &[1, 2]);
        start(&mut action, &mut link);
        dispatch(
            &mut action,
            &mut link,
            &negative(
                ServiceId::StartRoutineByLocalIdentifier,
                ResponseCode::SecurityAccessDenied,
            ),
        );
        assert!(action.core().is_complete());
        assert!(!action.core().success());
    }
}
