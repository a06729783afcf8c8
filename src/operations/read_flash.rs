//! Reads the external flash sector by sector.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Context, Operation, OperationOutput, Preamble, PreambleSettings, PromptAnswer, PromptKind,
    SessionSettings, Step,
};
use crate::{
    actions::{
        ActionReport, AnyAction, LayoutValidation, RequestTransfer, RequestTransferExit,
        TransferData, ValidateFlashChecksum, ValidateStartAndEnd,
    },
    kwp2000::constants::DiagnosticSession,
    memory::{MemoryImage, MemoryLayout},
};

/// Checksum mismatches after which a block is given up on
const MAX_READ_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFlashSettings {
    /// Compare each block against the data already held before reading it
    pub check_if_read_required: bool,
    /// Skip blocks whose checksum already matches
    pub only_read_non_matching: bool,
    /// Checksum each block after reading it
    pub verify: bool,
}

impl Default for ReadFlashSettings {
    fn default() -> Self {
        Self {
            check_if_read_required: true,
            only_read_non_matching: false,
            verify: true,
        }
    }
}

/// Lets the user decide whether to go on with a layout the ECU didn't
/// confirm, `verb` names what is done to the flash.
pub(super) fn confirm_layout(cx: &mut Context<'_>, validation: LayoutValidation, verb: &str) -> bool {
    let problem = match validation {
        LayoutValidation::Valid => return true,
        LayoutValidation::DidNotComplete | LayoutValidation::Running => {
            "Unable to validate the memory layout."
        }
        _ => "The memory layout appears to be invalid for this ECU.",
    };
    warn!(?validation, "memory layout validation");
    let message = format!("{problem} Continue {verb} flash memory anyway?");
    cx.ask("Memory layout", &message, PromptKind::OkCancel) == PromptAnswer::Ok
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    ValidateMemoryLayout,
    Start,
    CheckIfReadRequired,
    RequestUpload,
    TransferData,
    ExitTransfer,
    ValidateReadData,
    FinishedBlock,
    FinishedAll,
    /// A block failed, the closing checksum is still to be sent
    ReadFailed,
    CompleteFailedRead,
}

/// Reads every block of the external flash with RequestUpload.
///
/// The blocks passed in may already hold data, in which case a matching
/// checksum lets a block be skipped.
#[derive(Debug)]
pub struct ReadExternalFlash {
    preamble: Preamble,
    settings: ReadFlashSettings,
    state: ReadState,
    blocks: Vec<MemoryImage>,
    current: usize,
    attempts: u32,
    max_block_size: u8,
    has_verified_upload: bool,
    validated_bytes: u32,
    total_bytes: u32,
}

impl ReadExternalFlash {
    /// `blocks` are read in order, images of the layout's sectors.
    pub fn new(
        session: &SessionSettings,
        settings: ReadFlashSettings,
        blocks: Vec<MemoryImage>,
    ) -> Self {
        let total_bytes = blocks.iter().map(MemoryImage::size).sum();
        Self {
            preamble: Preamble::new(
                PreambleSettings::session(DiagnosticSession::Programming, session)
                    .with_timing(session)
                    .with_security(session),
            ),
            settings,
            state: ReadState::ValidateMemoryLayout,
            blocks,
            current: 0,
            attempts: 0,
            max_block_size: 0,
            has_verified_upload: false,
            validated_bytes: 0,
            total_bytes,
        }
    }

    /// Reads a whole layout from scratch
    pub fn layout(session: &SessionSettings, settings: ReadFlashSettings, layout: &MemoryLayout) -> Self {
        Self::new(session, settings, layout.empty_sectors())
    }

    fn block(&self) -> &MemoryImage {
        &self.blocks[self.current]
    }

    fn last_block_end(&self) -> u32 {
        self.blocks.last().map_or(0, MemoryImage::end)
    }

    fn enter(&mut self, state: ReadState) -> Step {
        self.state = state;
        let block = &self.blocks[self.current.min(self.blocks.len().saturating_sub(1))];
        match state {
            ReadState::ValidateMemoryLayout => {
                let start = self.blocks.first().map_or(0, |block| block.start);
                Step::Run(ValidateStartAndEnd::new(start, self.last_block_end()).into())
            }
            ReadState::CheckIfReadRequired | ReadState::ValidateReadData => {
                Step::Run(ValidateFlashChecksum::new(block.start, &block.data).into())
            }
            ReadState::RequestUpload => {
                Step::Run(RequestTransfer::upload(block.start, block.size()).into())
            }
            ReadState::TransferData => {
                Step::Run(TransferData::upload(self.max_block_size, block.size()).into())
            }
            ReadState::ExitTransfer => Step::Run(RequestTransferExit::default().into()),
            ReadState::CompleteFailedRead => {
                // leaves the ECU's routine state clean before giving up
                Step::Run(ValidateFlashChecksum::new(self.last_block_end() - 1, &[0, 0]).into())
            }
            ReadState::FinishedAll => Step::Finished(true),
            ReadState::Start | ReadState::FinishedBlock | ReadState::ReadFailed => Step::Wait,
        }
    }

    fn start_block(&mut self) -> Step {
        if self.current >= self.blocks.len() {
            return self.enter(ReadState::FinishedAll);
        }
        self.attempts = 0;
        info!(
            block = self.current,
            "reading flash {:#08x} to {:#08x}",
            self.block().start,
            self.block().end()
        );
        if self.settings.check_if_read_required && self.has_verified_upload {
            self.enter(ReadState::CheckIfReadRequired)
        } else {
            self.enter(ReadState::RequestUpload)
        }
    }

    fn finish_block(&mut self) -> Step {
        self.validated_bytes += self.block().size();
        self.current += 1;
        self.start_block()
    }

    /// Handles an action of the block sequence, returning the state to
    /// enter next or `None` if the action failed.
    fn block_completed(
        &mut self,
        cx: &mut Context<'_>,
        action: AnyAction,
        report: ActionReport,
    ) -> Option<ReadState> {
        match (self.state, action) {
            (ReadState::ValidateMemoryLayout, AnyAction::ValidateStartAndEnd(validate)) => {
                (report.completed_without_communication_error
                    && confirm_layout(cx, validate.result(), "reading"))
                .then_some(ReadState::Start)
            }
            (ReadState::CheckIfReadRequired, AnyAction::ValidateFlashChecksum(validate)) => {
                if report.success && validate.is_correct() && self.settings.only_read_non_matching {
                    debug!(block = self.current, "block already matches, skipping read");
                    Some(ReadState::FinishedBlock)
                } else if report.success || report.completed_without_communication_error {
                    Some(ReadState::RequestUpload)
                } else {
                    None
                }
            }
            (ReadState::RequestUpload, AnyAction::RequestTransfer(request)) => {
                report.success.then(|| {
                    self.max_block_size = request.max_block_size();
                    ReadState::TransferData
                })
            }
            (ReadState::TransferData, AnyAction::TransferData(transfer)) => {
                report.success.then(|| {
                    let block = &mut self.blocks[self.current];
                    let len = transfer.len().min(block.data.len());
                    block.data[..len].copy_from_slice(&transfer.data()[..len]);
                    ReadState::ExitTransfer
                })
            }
            (ReadState::ExitTransfer, _) => report.success.then_some(if self.settings.verify {
                ReadState::ValidateReadData
            } else {
                ReadState::FinishedBlock
            }),
            (ReadState::ValidateReadData, AnyAction::ValidateFlashChecksum(validate)) => {
                self.attempts += 1;
                if report.success {
                    if validate.is_correct() {
                        self.has_verified_upload = true;
                        Some(ReadState::FinishedBlock)
                    } else if self.attempts <= MAX_READ_ATTEMPTS {
                        debug!(block = self.current, attempt = self.attempts, "read data checksum mismatch, reading again");
                        Some(ReadState::RequestUpload)
                    } else {
                        warn!(block = self.current, "read data never matched the flash checksum");
                        Some(ReadState::FinishedBlock)
                    }
                } else if report.completed_without_communication_error {
                    Some(ReadState::FinishedBlock)
                } else {
                    None
                }
            }
            _ => report.success.then_some(self.state),
        }
    }
}

impl Operation for ReadExternalFlash {
    fn name(&self) -> &'static str {
        "ReadExternalFlash"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if self.blocks.is_empty() {
            warn!("no flash blocks to read");
            return Step::Finished(false);
        }
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        match self.state {
            ReadState::Start => self.start_block(),
            ReadState::FinishedBlock => self.finish_block(),
            ReadState::ReadFailed => self.enter(ReadState::CompleteFailedRead),
            ReadState::CompleteFailedRead => Step::Finished(false),
            state => self.enter(state),
        }
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        if self.state == ReadState::CompleteFailedRead {
            return false;
        }
        match self.block_completed(cx, action, report) {
            Some(state) => {
                self.state = state;
                true
            }
            None => {
                warn!(block = self.current, state = ?self.state, "flash read failed");
                self.state = ReadState::ReadFailed;
                true
            }
        }
    }

    fn progress(&self, running: Option<&AnyAction>) -> Option<f32> {
        if self.total_bytes == 0 {
            return None;
        }
        let transferred = match running {
            Some(AnyAction::TransferData(transfer)) => transfer.transferred() as u32,
            _ => 0,
        };
        Some((self.validated_bytes + transferred) as f32 / self.total_bytes as f32)
    }

    fn into_output(self: Box<Self>) -> OperationOutput {
        OperationOutput::Flash(self.blocks)
    }
}
