//! Programs the external flash sector by sector.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Context, Operation, OperationOutput, Preamble, PreambleSettings, PromptAnswer, PromptKind,
    SessionSettings, Step, read_flash::confirm_layout,
};
use crate::{
    actions::{
        ActionReport, AnyAction, EraseFlash, RequestTransfer, RequestTransferExit, TransferData,
        ValidateFlashChecksum, ValidateStartAndEnd, transfer::DEFAULT_MAX_BLOCK_SIZE,
    },
    kwp2000::{ConnectionStatus, constants::DiagnosticSession},
    memory::{MemoryImage, MemoryLayout},
};

/// Attempts after the first before a block is given up on
const MAX_FLASH_BLOCK_RETRIES: u32 = 3;

/// Value of erased flash
const BLANK: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteFlashSettings {
    /// Compare each block against the ECU before programming it
    pub check_if_write_required: bool,
    /// Skip blocks whose checksum already matches
    pub only_write_non_matching: bool,
    /// Checksum each block after programming it
    pub verify: bool,
    /// Erase the whole chip once instead of each sector
    pub erase_entire_flash_at_once: bool,
}

impl Default for WriteFlashSettings {
    fn default() -> Self {
        Self {
            check_if_write_required: true,
            only_write_non_matching: true,
            verify: true,
            erase_entire_flash_at_once: false,
        }
    }
}

/// Progress of one sector being programmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub image: MemoryImage,
    pub flashing_required: bool,
    pub erased: bool,
    pub complete: bool,
    pub successful: bool,
    pub attempts: u32,
    pub bytes_flashed: usize,
}

impl FlashBlock {
    fn new(image: MemoryImage, check_if_required: bool) -> Self {
        Self {
            image,
            flashing_required: !check_if_required,
            erased: false,
            complete: false,
            successful: false,
            attempts: 0,
            bytes_flashed: 0,
        }
    }

    fn reset(&mut self, check_if_required: bool) {
        *self = Self::new(std::mem::take(&mut self.image), check_if_required);
    }
}

/// How every sector of a write went
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlashReport {
    pub blocks: Vec<FlashBlock>,
    pub erased_entire_flash: bool,
}

impl FlashReport {
    pub fn all_successful(&self) -> bool {
        self.blocks.iter().all(|block| block.successful)
    }

    /// Blocks that were given up on or skipped after a failed erase
    pub fn failed_blocks(&self) -> impl Iterator<Item = &FlashBlock> {
        self.blocks.iter().filter(|block| !block.successful)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    ValidateMemoryLayout,
    StartBlock,
    CheckIfFirstBlockAccidentallyErased,
    CheckIfFlashRequired,
    StartProgrammingBlock,
    EraseFlash,
    VerifyErase,
    RequestDownload,
    TransferDataToFailTransfer,
    TransferData,
    ExitTransfer,
    ExitPreviousFailedTransfer,
    ValidateFlashedData,
    FinishedBlock,
}

/// Erases and downloads every block of the external flash.
///
/// Communication errors are recoverable: once confirmed the operation
/// disconnects and waits for the connection to come back, resuming an
/// interrupted transfer where it stopped.
#[derive(Debug)]
pub struct WriteExternalFlash {
    preamble: Preamble,
    settings: WriteFlashSettings,
    state: WriteState,
    blocks: Vec<FlashBlock>,
    current: usize,
    max_block_size: u8,
    /// The erase mode has been checked to only erase the targeted sector
    validated_erase_mode: bool,
    previous_download_incomplete: bool,
    transfer_to_resume: Option<TransferData>,
    waiting_to_reconnect: bool,
    asked_about_communication_error: bool,
    validated_bytes: u32,
    total_bytes: u32,
}

impl WriteExternalFlash {
    /// `blocks` are programmed in order, one image per sector.
    pub fn new(session: &SessionSettings, settings: WriteFlashSettings, blocks: Vec<MemoryImage>) -> Self {
        let total_bytes = blocks.iter().map(MemoryImage::size).sum();
        Self {
            preamble: Preamble::new(
                PreambleSettings::session(DiagnosticSession::Programming, session)
                    .with_timing(session)
                    .with_security(session),
            ),
            settings,
            state: WriteState::ValidateMemoryLayout,
            blocks: blocks
                .into_iter()
                .map(|image| FlashBlock::new(image, settings.check_if_write_required))
                .collect(),
            current: 0,
            max_block_size: 0,
            validated_erase_mode: false,
            previous_download_incomplete: false,
            transfer_to_resume: None,
            waiting_to_reconnect: false,
            asked_about_communication_error: false,
            validated_bytes: 0,
            total_bytes,
        }
    }

    /// Splits a whole flash image along the sectors of `layout`
    pub fn layout(
        session: &SessionSettings,
        settings: WriteFlashSettings,
        layout: &MemoryLayout,
        data: &[u8],
    ) -> Result<Self, crate::Error> {
        Ok(Self::new(session, settings, layout.split(data)?))
    }

    pub fn report(&self) -> FlashReport {
        FlashReport {
            blocks: self.blocks.clone(),
            erased_entire_flash: self.settings.erase_entire_flash_at_once,
        }
    }

    fn block(&self) -> &FlashBlock {
        &self.blocks[self.current]
    }

    fn block_mut(&mut self) -> &mut FlashBlock {
        &mut self.blocks[self.current]
    }

    fn last_block_end(&self) -> u32 {
        self.blocks.last().map_or(0, |block| block.image.end())
    }

    /// Moves on to the first incomplete block. Finishing a block out of
    /// order programs the last block again so it is written last.
    fn select_block(&mut self) -> bool {
        if let Some(index) = self.blocks.iter().position(|block| !block.complete) {
            self.current = index;
            return true;
        }
        let last = self.blocks.len() - 1;
        if self.current != last {
            debug!("finished out of order, programming the last block again");
            self.current = last;
            let block = self.block_mut();
            block.complete = false;
            block.flashing_required = true;
            return true;
        }
        false
    }

    fn restart_erasing_entire_flash(&mut self) {
        info!("restarting flash programming and erasing the entire flash at once");
        self.settings.erase_entire_flash_at_once = true;
        self.settings.check_if_write_required = false;
        self.settings.only_write_non_matching = false;
        for block in &mut self.blocks {
            block.reset(false);
        }
        self.current = 0;
        self.validated_bytes = 0;
        self.validated_erase_mode = true;
        self.transfer_to_resume = None;
        self.state = WriteState::StartBlock;
    }

    /// Asks once whether to wait for the connection to come back.
    fn communication_error(&mut self, cx: &mut Context<'_>) {
        if self.asked_about_communication_error || self.waiting_to_reconnect {
            return;
        }
        self.asked_about_communication_error = true;
        warn!(block = self.current, state = ?self.state, "communication error while writing flash");

        let answer = cx.ask(
            "Communication Error",
            "Communication with the ECU failed while writing flash memory. \
             Reconnect and continue where writing stopped? Cancelling leaves the ECU unprogrammed.",
            PromptKind::OkCancel,
        );
        if answer != PromptAnswer::Ok {
            return;
        }
        self.waiting_to_reconnect = true;
        if self.state != WriteState::ValidateMemoryLayout {
            self.state = if self.transfer_to_resume.is_some() {
                WriteState::TransferData
            } else {
                WriteState::StartProgrammingBlock
            };
        }
        if cx.link.is_connection_open() {
            cx.link.disconnect();
        }
    }

    fn enter(&mut self, state: WriteState) -> Step {
        self.state = state;
        let block = &self.blocks[self.current];
        let blank = || vec![BLANK; block.image.data.len()];
        let action: AnyAction = match state {
            WriteState::ValidateMemoryLayout => {
                ValidateStartAndEnd::new(self.blocks[0].image.start, self.last_block_end()).into()
            }
            WriteState::CheckIfFirstBlockAccidentallyErased => {
                let first = &self.blocks[0].image;
                ValidateFlashChecksum::new(first.start, &vec![BLANK; first.data.len()]).into()
            }
            WriteState::CheckIfFlashRequired | WriteState::ValidateFlashedData => {
                ValidateFlashChecksum::new(block.image.start, &block.image.data).into()
            }
            WriteState::VerifyErase => ValidateFlashChecksum::new(block.image.start, &blank()).into(),
            WriteState::EraseFlash => {
                if self.settings.erase_entire_flash_at_once {
                    EraseFlash::entire().into()
                } else {
                    EraseFlash::range(block.image.start, block.image.size()).into()
                }
            }
            WriteState::RequestDownload => {
                RequestTransfer::download(block.image.start, block.image.size()).into()
            }
            WriteState::TransferDataToFailTransfer => {
                // more than was requested so the ECU rejects the transfer
                let length = self.total_bytes + self.total_bytes / 16;
                TransferData::download(DEFAULT_MAX_BLOCK_SIZE, vec![BLANK; length as usize]).into()
            }
            WriteState::TransferData => match self.transfer_to_resume.take() {
                Some(mut transfer) => {
                    info!(
                        block = self.current,
                        transferred = transfer.transferred(),
                        "resuming interrupted transfer"
                    );
                    transfer.resume(self.max_block_size);
                    transfer.into()
                }
                None => TransferData::download(self.max_block_size, block.image.data.clone()).into(),
            },
            WriteState::ExitTransfer | WriteState::ExitPreviousFailedTransfer => {
                RequestTransferExit::default().into()
            }
            WriteState::StartBlock | WriteState::StartProgrammingBlock | WriteState::FinishedBlock => {
                return Step::Wait;
            }
        };
        Step::Run(action)
    }

    fn start_block(&mut self) -> WriteState {
        let block = self.block_mut();
        block.attempts += 1;
        let (attempts, required) = (block.attempts, block.flashing_required);
        info!(
            block = self.current,
            attempt = attempts,
            "writing flash {:#08x} to {:#08x}",
            self.block().image.start,
            self.block().image.end()
        );
        if required {
            WriteState::StartProgrammingBlock
        } else {
            WriteState::CheckIfFlashRequired
        }
    }

    fn start_programming(&mut self) -> WriteState {
        if self.settings.erase_entire_flash_at_once && self.current != 0 {
            WriteState::RequestDownload
        } else {
            WriteState::EraseFlash
        }
    }

    /// Retries or gives up on an incomplete block. Completing an erased
    /// block checks once that the erase left the first block alone.
    fn finish_block(&mut self) {
        let current = self.current;
        let block = self.block_mut();
        if !block.complete {
            if block.attempts <= MAX_FLASH_BLOCK_RETRIES {
                debug!(block = current, attempts = block.attempts, "retrying block");
            } else {
                warn!(block = current, "giving up on block after repeated failures");
                block.complete = true;
            }
        }
        let block = self.block();
        let (complete, size, erased) = (block.complete, block.image.size(), block.erased);
        if !complete {
            return;
        }
        self.validated_bytes += size;
        if !self.settings.erase_entire_flash_at_once
            && !self.validated_erase_mode
            && erased
            && self.current != 0
        {
            self.state = WriteState::CheckIfFirstBlockAccidentallyErased;
        }
    }

    fn ask_sector_erase_failed(&mut self, cx: &mut Context<'_>) -> Option<WriteState> {
        let answer = cx.ask(
            "Sector Erase Failed",
            "The ECU refused to erase a single sector because it holds persistent data. \
             Erase the entire flash instead? Choosing No skips this sector.",
            PromptKind::YesNoCancel,
        );
        match answer {
            PromptAnswer::Yes | PromptAnswer::Ok => {
                self.restart_erasing_entire_flash();
                Some(WriteState::StartBlock)
            }
            PromptAnswer::No => {
                warn!(block = self.current, "skipping sector that could not be erased");
                self.block_mut().complete = true;
                Some(WriteState::FinishedBlock)
            }
            PromptAnswer::Cancel => None,
        }
    }

    /// Handles an action of the block sequence, returning the state to
    /// enter next or `None` if the operation failed.
    fn block_completed(
        &mut self,
        cx: &mut Context<'_>,
        action: AnyAction,
        report: ActionReport,
    ) -> Option<WriteState> {
        let completed = report.completed_without_communication_error;
        match (self.state, action) {
            (WriteState::ValidateMemoryLayout, AnyAction::ValidateStartAndEnd(validate)) => {
                (completed && confirm_layout(cx, validate.result(), "writing"))
                    .then_some(WriteState::StartBlock)
            }
            (WriteState::CheckIfFirstBlockAccidentallyErased, AnyAction::ValidateFlashChecksum(validate)) => {
                self.validated_erase_mode = true;
                if report.success && !validate.is_correct() {
                    debug!("first block survived the sector erase");
                    Some(WriteState::StartBlock)
                } else if report.success || completed {
                    warn!("sector erase also erased the first block");
                    self.restart_erasing_entire_flash();
                    Some(WriteState::StartBlock)
                } else {
                    None
                }
            }
            (WriteState::CheckIfFlashRequired, AnyAction::ValidateFlashChecksum(validate)) => {
                if report.success && validate.is_correct() && self.settings.only_write_non_matching {
                    debug!(block = self.current, "block already matches, skipping write");
                    let block = self.block_mut();
                    block.complete = true;
                    block.successful = true;
                    Some(WriteState::FinishedBlock)
                } else if report.success || completed {
                    self.block_mut().flashing_required = true;
                    Some(self.start_programming())
                } else {
                    None
                }
            }
            (WriteState::EraseFlash, AnyAction::EraseFlash(erase)) => {
                if report.success {
                    let block = self.block_mut();
                    block.erased = true;
                    block.bytes_flashed = 0;
                    Some(WriteState::RequestDownload)
                } else if !completed || erase.is_entire() {
                    None
                } else if erase.failed_because_of_persistent_data() {
                    self.ask_sector_erase_failed(cx)
                } else {
                    debug!(block = self.current, "erase failed, checking whether the sector is blank");
                    Some(WriteState::VerifyErase)
                }
            }
            (WriteState::VerifyErase, AnyAction::ValidateFlashChecksum(validate)) => {
                if report.success && !validate.is_correct() {
                    warn!(block = self.current, "sector isn't blank after a failed erase");
                }
                self.block_mut().erased = true;
                Some(WriteState::RequestDownload)
            }
            (WriteState::RequestDownload, AnyAction::RequestTransfer(request)) => {
                if report.success {
                    self.max_block_size = request.max_block_size();
                    Some(WriteState::TransferData)
                } else if completed && request.failed_because_of_previous_incomplete_download() {
                    warn!("ECU is still waiting on an earlier download, failing it first");
                    self.previous_download_incomplete = true;
                    Some(WriteState::TransferDataToFailTransfer)
                } else {
                    None
                }
            }
            (WriteState::TransferDataToFailTransfer, AnyAction::TransferData(_)) => {
                completed.then_some(WriteState::ExitPreviousFailedTransfer)
            }
            (WriteState::TransferData, AnyAction::TransferData(transfer)) => {
                self.block_mut().bytes_flashed = transfer.transferred();
                if completed {
                    Some(WriteState::ExitTransfer)
                } else {
                    self.transfer_to_resume = Some(transfer);
                    None
                }
            }
            (WriteState::ExitTransfer, _) => {
                if report.success {
                    self.block_mut().successful = true;
                    if self.settings.verify {
                        Some(WriteState::ValidateFlashedData)
                    } else {
                        self.block_mut().complete = true;
                        Some(WriteState::FinishedBlock)
                    }
                } else if completed {
                    Some(WriteState::TransferDataToFailTransfer)
                } else {
                    None
                }
            }
            (WriteState::ExitPreviousFailedTransfer, _) => {
                if !completed {
                    None
                } else if self.previous_download_incomplete {
                    self.previous_download_incomplete = false;
                    Some(WriteState::StartBlock)
                } else {
                    let answer = cx.ask(
                        "Flash Programming Sector Failed",
                        "The ECU did not accept the data written to this sector. Try programming it again?",
                        PromptKind::OkCancel,
                    );
                    (answer == PromptAnswer::Ok).then_some(WriteState::StartProgrammingBlock)
                }
            }
            (WriteState::ValidateFlashedData, AnyAction::ValidateFlashChecksum(validate)) => {
                let current = self.current;
                let block = self.block_mut();
                if report.success && !validate.is_correct() {
                    warn!(block = current, attempt = block.attempts, "written data doesn't match");
                    block.successful = false;
                } else {
                    if !report.success {
                        warn!(block = current, "unable to verify written data, assuming it is correct");
                    }
                    block.complete = true;
                }
                Some(WriteState::FinishedBlock)
            }
            _ => report.success.then_some(self.state),
        }
    }
}

impl Operation for WriteExternalFlash {
    fn name(&self) -> &'static str {
        "WriteExternalFlash"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if self.blocks.is_empty() {
            warn!("no flash blocks to write");
            return Step::Finished(false);
        }
        if self.waiting_to_reconnect {
            if !cx.link.is_connected() {
                return Step::Reconnect;
            }
            info!("reconnected, continuing to write flash");
            self.waiting_to_reconnect = false;
            self.asked_about_communication_error = false;
            self.preamble.reset();
        }
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }

        if matches!(self.state, WriteState::StartBlock | WriteState::FinishedBlock) {
            if self.state == WriteState::FinishedBlock {
                self.finish_block();
                if self.state != WriteState::FinishedBlock {
                    return self.enter(self.state);
                }
            }
            if !self.select_block() {
                let report = self.report();
                let failed = report.failed_blocks().count();
                if failed > 0 {
                    warn!(failed, "finished writing flash with failed blocks");
                } else {
                    info!("finished writing flash");
                }
                cx.link.disconnect();
                return Step::Finished(true);
            }
            self.state = self.start_block();
        }
        if self.state == WriteState::StartProgrammingBlock {
            self.state = self.start_programming();
        }
        self.enter(self.state)
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        let success = if self.preamble.is_running() {
            self.preamble.completed(cx, &action, report)
        } else {
            match self.block_completed(cx, action, report) {
                Some(state) => {
                    self.state = state;
                    true
                }
                None => false,
            }
        };
        if !success && !report.completed_without_communication_error {
            self.communication_error(cx);
        }
        if !success && !self.waiting_to_reconnect {
            warn!(block = self.current, state = ?self.state, "flash write failed");
        }
        success || self.waiting_to_reconnect
    }

    fn connection_changed(&mut self, cx: &mut Context<'_>, status: ConnectionStatus) -> bool {
        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::CommunicationTerminated => {
                self.communication_error(cx);
                self.waiting_to_reconnect
            }
            _ => true,
        }
    }

    fn progress(&self, running: Option<&AnyAction>) -> Option<f32> {
        if self.total_bytes == 0 {
            return None;
        }
        let transferred = match (self.state, running) {
            (WriteState::TransferData, Some(AnyAction::TransferData(transfer))) => {
                transfer.transferred() as u32
            }
            _ => 0,
        };
        Some((self.validated_bytes + transferred) as f32 / self.total_bytes as f32)
    }

    fn into_output(self: Box<Self>) -> OperationOutput {
        OperationOutput::Flashed(self.report())
    }
}
