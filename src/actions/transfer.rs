//! Block transfers with RequestUpload/RequestDownload, TransferData and
//! RequestTransferExit.

use tracing::{debug, info, warn};

use super::{Action, ActionCore};
use crate::bcb::{self, Cipher};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response, is_positive_response_to, negative_response_to},
};

/// Largest message the ECU accepts before it tells us otherwise
pub const DEFAULT_MAX_BLOCK_SIZE: u8 = 254;
/// RoutineNotComplete answers tolerated for one TransferData message
const ROUTINE_NOT_COMPLETE_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// ECU to tester
    Upload,
    /// Tester to ECU
    Download,
}

impl TransferDirection {
    fn service(self) -> ServiceId {
        match self {
            TransferDirection::Upload => ServiceId::RequestUpload,
            TransferDirection::Download => ServiceId::RequestDownload,
        }
    }

    fn request(self, address: u32, size: u32, format: u8) -> Request {
        match self {
            TransferDirection::Upload => Request::RequestUpload {
                address,
                size,
                format,
            },
            TransferDirection::Download => Request::RequestDownload {
                address,
                size,
                format,
            },
        }
    }
}

/// Opens an upload or download of `size` bytes at `address`.
#[derive(Debug)]
pub struct RequestTransfer {
    core: ActionCore,
    direction: TransferDirection,
    address: u32,
    size: u32,
    format: u8,
    max_block_size: u8,
    previous_download_incomplete: bool,
}

impl RequestTransfer {
    pub fn new(
        direction: TransferDirection,
        address: u32,
        size: u32,
        compression: CompressionFormat,
        encryption: EncryptionFormat,
    ) -> Self {
        debug_assert!(address % 2 == 0 && size % 2 == 0);
        Self {
            core: ActionCore::default(),
            direction,
            address,
            size,
            format: data_format_byte(compression, encryption),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            previous_download_incomplete: false,
        }
    }

    pub fn upload(address: u32, size: u32) -> Self {
        Self::new(
            TransferDirection::Upload,
            address,
            size,
            CompressionFormat::Uncompressed,
            EncryptionFormat::Unencrypted,
        )
    }

    /// Compressed and encrypted the way the ECU flash loader expects
    pub fn download(address: u32, size: u32) -> Self {
        Self::new(
            TransferDirection::Download,
            address,
            size,
            CompressionFormat::Bosch,
            EncryptionFormat::Bosch,
        )
    }

    /// Largest TransferData message the ECU accepts, valid after success
    pub fn max_block_size(&self) -> u8 {
        self.max_block_size
    }

    /// The ECU is still waiting for the rest of an earlier download
    pub fn failed_because_of_previous_incomplete_download(&self) -> bool {
        self.previous_download_incomplete
    }
}

impl Action for RequestTransfer {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        match self.direction {
            TransferDirection::Upload => "RequestUpload",
            TransferDirection::Download => "RequestDownload",
        }
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.previous_download_incomplete = false;
        debug!(
            "{} {:#08x} to {:#08x}",
            self.name(),
            self.address,
            (self.address + self.size).saturating_sub(1)
        );
        self.core.send(
            link,
            self.direction.request(self.address, self.size, self.format),
        );
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        let service = self.direction.service();
        if is_positive_response_to(service, message) {
            match message.data.first() {
                Some(max_block_size) => {
                    self.max_block_size = *max_block_size;
                    debug!(max_block_size, "{} accepted", self.name());
                    self.core.complete(true);
                }
                None => self.core.complete(false),
            }
            true
        } else if let Some(negative) = negative_response_to(service, message) {
            debug!("{} refused, {negative}", self.name());
            if self.direction == TransferDirection::Download
                && negative.response_code() == Some(ResponseCode::RoutineNotComplete)
            {
                self.previous_download_incomplete = true;
            }
            self.core.complete(false);
            true
        } else {
            false
        }
    }
}

/// Moves a buffer to or from the ECU once a transfer is open.
///
/// The encryption key position is only committed once the ECU accepted a
/// message, so a retried message is encrypted exactly like the first try.
#[derive(Debug)]
pub struct TransferData {
    core: ActionCore,
    direction: TransferDirection,
    compression: CompressionFormat,
    /// Without the service id
    max_payload: usize,
    data: Vec<u8>,
    index: usize,
    cipher: Cipher,
    pending_cipher: Cipher,
    /// Uncompressed bytes covered by the outstanding message
    pending_bytes: usize,
    retries: u32,
    resume: bool,
}

impl TransferData {
    pub fn new(
        direction: TransferDirection,
        compression: CompressionFormat,
        encryption: EncryptionFormat,
        max_block_size: u8,
        data: Vec<u8>,
    ) -> Self {
        let cipher = Cipher::new(encryption == EncryptionFormat::Bosch);
        Self {
            core: ActionCore::default(),
            direction,
            compression,
            max_payload: (max_block_size as usize).saturating_sub(1).max(1),
            data,
            index: 0,
            cipher,
            pending_cipher: cipher,
            pending_bytes: 0,
            retries: 0,
            resume: false,
        }
    }

    /// Download in the format opened by [`RequestTransfer::download`]
    pub fn download(max_block_size: u8, data: Vec<u8>) -> Self {
        Self::new(
            TransferDirection::Download,
            CompressionFormat::Bosch,
            EncryptionFormat::Bosch,
            max_block_size,
            data,
        )
    }

    /// Upload of `size` bytes in the format opened by [`RequestTransfer::upload`]
    pub fn upload(max_block_size: u8, size: u32) -> Self {
        Self::new(
            TransferDirection::Upload,
            CompressionFormat::Uncompressed,
            EncryptionFormat::Unencrypted,
            max_block_size,
            vec![0; size as usize],
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Bytes moved so far
    pub fn transferred(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Makes the next start continue where the transfer stopped.
    pub fn resume(&mut self, max_block_size: u8) {
        self.resume = true;
        self.max_payload = (max_block_size as usize).saturating_sub(1).max(1);
        self.core.reset();
    }

    /// Sends the message for the bytes at the current index, returns false
    /// when there is nothing left to send.
    fn send_next(&mut self, link: &mut dyn Link) -> bool {
        if self.index >= self.data.len() {
            return false;
        }
        self.pending_cipher = self.cipher;

        let message = match self.direction {
            TransferDirection::Upload => {
                self.pending_bytes = 0;
                Vec::new()
            }
            TransferDirection::Download => match self.next_download_message() {
                Some(message) => message,
                None => return false,
            },
        };
        self.core.send(link, Request::TransferData(message));
        true
    }

    fn next_download_message(&mut self) -> Option<Vec<u8>> {
        let remaining = &self.data[self.index..];
        match self.compression {
            CompressionFormat::Uncompressed => {
                let size = self.max_payload.min(remaining.len());
                let mut message = remaining[..size].to_vec();
                self.pending_cipher.apply(&mut message);
                self.pending_bytes = size;
                Some(message)
            }
            CompressionFormat::Bosch => {
                match bcb::encrypt_and_compress(
                    self.max_payload,
                    remaining,
                    &mut self.pending_cipher,
                    self.index == 0,
                ) {
                    Ok((consumed, message)) if consumed > 0 => {
                        self.pending_bytes = consumed;
                        Some(message)
                    }
                    Ok(_) => {
                        warn!(
                            max_payload = self.max_payload,
                            "block size too small to compress any data"
                        );
                        None
                    }
                    Err(e) => {
                        warn!("failed to compress transfer data: {e}");
                        None
                    }
                }
            }
        }
    }

    /// Copies an upload response into the buffer, returns the bytes received.
    fn receive_upload(&mut self, data: &[u8]) -> usize {
        let mut data = data.to_vec();
        self.pending_cipher = self.cipher;
        self.pending_cipher.apply(&mut data);

        let size = data.len().min(self.data.len() - self.index);
        if size < data.len() {
            warn!(
                extra = data.len() - size,
                "ECU sent more data than requested, dropping the excess"
            );
        }
        self.data[self.index..self.index + size].copy_from_slice(&data[..size]);
        size
    }

    fn accept(&mut self, link: &mut dyn Link, bytes: usize) {
        self.index += bytes;
        self.cipher = self.pending_cipher;
        self.retries = 0;
        if !self.send_next(link) {
            debug!(bytes = self.index, "transfer complete");
            self.core.complete(true);
        }
    }
}

impl Action for TransferData {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "TransferData"
    }

    fn start(&mut self, link: &mut dyn Link) {
        if self.resume {
            self.resume = false;
            info!(at = self.index, of = self.data.len(), "resuming transfer");
        } else {
            self.index = 0;
            self.cipher.reset();
        }
        self.retries = 0;
        if !self.send_next(link) {
            self.core.complete(self.index >= self.data.len());
        }
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::TransferData, message) {
            match self.direction {
                TransferDirection::Download => {
                    let bytes = self.pending_bytes;
                    self.accept(link, bytes);
                }
                TransferDirection::Upload => {
                    let bytes = self.receive_upload(&message.data);
                    if bytes == 0 {
                        debug!("upload response carried no data");
                        return false;
                    }
                    self.accept(link, bytes);
                }
            }
            true
        } else if let Some(negative) = negative_response_to(ServiceId::TransferData, message) {
            if negative.response_code() == Some(ResponseCode::RoutineNotComplete)
                && self.retries < ROUTINE_NOT_COMPLETE_RETRIES
            {
                self.retries += 1;
                debug!(retry = self.retries, "resending transfer data");
                if !self.send_next(link) {
                    self.core.complete(true);
                }
                return true;
            }
            false
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestTransferExit {
    core: ActionCore,
}

impl Action for RequestTransferExit {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "RequestTransferExit"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.core.send(link, Request::RequestTransferExit);
    }

    fn handle_message(&mut self, _link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::RequestTransferExit, message) {
            self.core.complete(true);
            return true;
        }
        false
    }
}

/// What the ECU thinks of an address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutValidation {
    Running,
    Valid,
    StartInvalid,
    EndInvalid,
    /// Memory exists below the start
    StartIsntLowest,
    /// Memory exists past the end
    EndIsntHighest,
    #[default]
    DidNotComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Range,
    BeforeStart,
    AfterEnd,
}

/// Checks a range is exactly the memory the ECU will transfer.
///
/// The range must be accepted, while growing it by one word in front or
/// behind must be refused. Uploads are used to probe since an opened
/// download can't be closed without sending all of its data.
#[derive(Debug)]
pub struct ValidateStartAndEnd {
    core: ActionCore,
    start: u32,
    end: u32,
    probe: Probe,
    result: LayoutValidation,
}

impl ValidateStartAndEnd {
    /// `end` is exclusive
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(end > start);
        Self {
            core: ActionCore::default(),
            start,
            end,
            probe: Probe::Range,
            result: LayoutValidation::DidNotComplete,
        }
    }

    pub fn result(&self) -> LayoutValidation {
        self.result
    }

    fn send_probe(&mut self, link: &mut dyn Link) {
        let size = self.end - self.start;
        let (address, size) = match self.probe {
            Probe::Range => (self.start, size),
            Probe::BeforeStart => (self.start - 2, size + 2),
            Probe::AfterEnd => (self.start, size + 2),
        };
        self.core.send(
            link,
            Request::RequestUpload {
                address,
                size,
                format: data_format_byte(
                    CompressionFormat::Uncompressed,
                    EncryptionFormat::Unencrypted,
                ),
            },
        );
    }

    /// Advances the probes, `refusal` is the response code of a failed probe.
    fn probe_answered(&mut self, refusal: Option<u8>) {
        use ResponseCode::*;
        let code = refusal.map(ResponseCode::from_repr);
        let bad_address = matches!(code, Some(Some(CanNotUploadFromAddress | CanNotDownloadToAddress)));
        let bad_size = matches!(
            code,
            Some(Some(CanNotUploadNumberOfBytes | CanNotDownloadNumberOfBytes))
        );

        match (self.probe, refusal) {
            (Probe::Range, None) => {
                self.probe = if self.start >= 2 {
                    Probe::BeforeStart
                } else {
                    Probe::AfterEnd
                };
            }
            (Probe::Range, Some(_)) if bad_address => self.result = LayoutValidation::StartInvalid,
            (Probe::Range, Some(_)) if bad_size => self.result = LayoutValidation::EndInvalid,
            (Probe::BeforeStart, None) => self.result = LayoutValidation::StartIsntLowest,
            (Probe::BeforeStart, Some(_)) if bad_address => self.probe = Probe::AfterEnd,
            (Probe::AfterEnd, None) => self.result = LayoutValidation::EndIsntHighest,
            (Probe::AfterEnd, Some(_)) if bad_address || bad_size => {
                self.result = LayoutValidation::Valid
            }
            _ => self.result = LayoutValidation::DidNotComplete,
        }
    }
}

impl Action for ValidateStartAndEnd {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ValidateStartAndEnd"
    }

    fn start(&mut self, link: &mut dyn Link) {
        info!(
            "validating memory starts at {:#08x} and ends at {:#08x}",
            self.start, self.end
        );
        self.probe = Probe::Range;
        self.result = LayoutValidation::Running;
        self.send_probe(link);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        let service = ServiceId::RequestUpload;
        let refusal = if is_positive_response(service as u8, message) {
            None
        } else if let Some(negative) = negative_response_to(service, message) {
            Some(negative)
        } else {
            return false;
        };

        let refused_outright = refusal.is_some_and(|negative| {
            matches!(
                negative.response_code(),
                Some(
                    ResponseCode::ServiceNotSupported
                        | ResponseCode::NoProgram
                        | ResponseCode::GeneralReject
                        | ResponseCode::SecurityAccessDenied
                        | ResponseCode::ConditionsNotCorrect
                        | ResponseCode::RoutineNotComplete
                )
            )
        });
        if refused_outright {
            debug!("upload probe refused outright");
            self.result = LayoutValidation::DidNotComplete;
            self.core.complete(false);
            return true;
        }

        self.probe_answered(refusal.map(|negative| negative.code));
        if self.result == LayoutValidation::Running {
            self.send_probe(link);
        } else {
            debug!(result = ?self.result, "layout validated");
            self.core
                .complete(self.result != LayoutValidation::DidNotComplete);
        }
        true
    }
}
