use tracing::debug;

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
};
use crate::memory::MemoryImage;

/// Address and size bytes of a memory request
const ADDRESS_AND_SIZE_LENGTH: u8 = 4;

/// Empty replies in a row before a read is given up
const MAX_EMPTY_REPLIES: u32 = 3;

/// Called after every block read, returning false stops the read early.
pub type ReadCallback = Box<dyn FnMut(&MemoryImage, usize) -> bool + Send>;

fn next_block_size(max_block_size: u8, remaining: usize) -> u8 {
    let max = max_block_size.saturating_sub(ADDRESS_AND_SIZE_LENGTH).max(1);
    remaining.min(max as usize) as u8
}

/// Reads a range of memory with ReadMemoryByAddress.
pub struct ReadMemory {
    core: ActionCore,
    image: MemoryImage,
    read: usize,
    max_block_size: u8,
    keep_reading: Option<ReadCallback>,
    failure_code: Option<u8>,
    empty_replies: u32,
}

impl ReadMemory {
    pub fn new(start: u32, size: u32, max_block_size: u8) -> Self {
        Self {
            core: ActionCore::default(),
            image: MemoryImage::zeroed(start, size),
            read: 0,
            max_block_size,
            keep_reading: None,
            failure_code: None,
            empty_replies: 0,
        }
    }

    /// Sets a callback that sees the image and the bytes read so far.
    pub fn with_callback(mut self, keep_reading: ReadCallback) -> Self {
        self.keep_reading = Some(keep_reading);
        self
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    pub fn into_image(self) -> MemoryImage {
        self.image
    }

    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Response code of the negative response that ended the read
    pub fn failure_code(&self) -> Option<u8> {
        self.failure_code
    }

    fn request_next(&mut self, link: &mut dyn Link) {
        let size = next_block_size(self.max_block_size, self.image.data.len() - self.read);
        if size == 0 {
            self.core.complete(true);
            return;
        }
        self.core.send(
            link,
            Request::ReadMemoryByAddress {
                address: self.image.start + self.read as u32,
                size,
            },
        );
    }
}

impl std::fmt::Debug for ReadMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadMemory")
            .field("start", &format_args!("{:#08x}", self.image.start))
            .field("size", &self.image.data.len())
            .field("read", &self.read)
            .finish()
    }
}

impl Action for ReadMemory {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "ReadMemory"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.read = 0;
        self.failure_code = None;
        self.empty_replies = 0;
        self.request_next(link);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::ReadMemoryByAddress, message) {
            let size = message.data.len().min(self.image.data.len() - self.read);
            if size == 0 && self.read < self.image.data.len() {
                self.empty_replies += 1;
                if self.empty_replies > MAX_EMPTY_REPLIES {
                    debug!(read = self.read, "ECU keeps answering reads without data");
                    self.core.complete(false);
                } else {
                    self.request_next(link);
                }
                return true;
            }
            self.empty_replies = 0;
            self.image.data[self.read..self.read + size].copy_from_slice(&message.data[..size]);
            self.read += size;

            let keep_reading = match &mut self.keep_reading {
                Some(callback) => callback(&self.image, self.read),
                None => true,
            };
            if keep_reading {
                self.request_next(link);
            } else {
                self.core.complete(keep_reading || self.read > 0);
            }
            true
        } else {
            if let Some(negative) = negative_response_to(ServiceId::ReadMemoryByAddress, message) {
                debug!(
                    address = format_args!("{:#08x}", self.image.start as usize + self.read),
                    "read failed, {negative}"
                );
                self.failure_code = Some(negative.code);
            }
            false
        }
    }
}

/// Writes a buffer with WriteMemoryByAddress.
#[derive(Debug)]
pub struct WriteMemory {
    core: ActionCore,
    start: u32,
    data: Vec<u8>,
    written: usize,
    block_size: u8,
    max_block_size: u8,
}

impl WriteMemory {
    pub fn new(start: u32, data: Vec<u8>, max_block_size: u8) -> Self {
        Self {
            core: ActionCore::default(),
            start,
            data,
            written: 0,
            block_size: 0,
            max_block_size,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn request_next(&mut self, link: &mut dyn Link) {
        self.block_size = next_block_size(self.max_block_size, self.data.len() - self.written);
        if self.block_size == 0 {
            self.core.complete(true);
            return;
        }
        let block = &self.data[self.written..self.written + self.block_size as usize];
        self.core.send(
            link,
            Request::WriteMemoryByAddress {
                address: self.start + self.written as u32,
                data: block.to_vec(),
            },
        );
    }
}

impl Action for WriteMemory {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "WriteMemory"
    }

    fn start(&mut self, link: &mut dyn Link) {
        self.written = 0;
        self.request_next(link);
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::WriteMemoryByAddress, message) {
            self.written += self.block_size as usize;
            self.request_next(link);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::super::{dispatch, start, test_link::*};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_in_blocks() {
        let mut link = TestLink::default();
        let mut action = ReadMemory::new(0x380000, 0x8000, 254);
        start(&mut action, &mut link);

        let mut requests = 0;
        while !action.core().is_complete() {
            let (service, data) = link.last_request();
            assert_eq!(service, 0x23);
            requests += 1;
            dispatch(&mut action, &mut link, &response(0x63, &vec![0xA5; data[3] as usize]));
        }

        assert!(action.core().success());
        assert_eq!(requests, 0x8000usize.div_ceil(250));
        assert_eq!(link.sent.len(), requests);
        assert_eq!(action.image().data.len(), 0x8000);
        assert!(action.image().data.iter().all(|b| *b == 0xA5));
        assert_eq!(link.requests()[1].1[..4], [0x38, 0x00, 0xFA, 250]);
    }

    #[test]
    fn callback_stops_read() {
        let mut link = TestLink::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut action = ReadMemory::new(0x380000, 1000, 254).with_callback(Box::new(
            move |_, read| {
                counted.fetch_add(1, Ordering::Relaxed);
                read < 500
            },
        ));
        start(&mut action, &mut link);
        for _ in 0..2 {
            dispatch(&mut action, &mut link, &response(0x63, &[0; 250]));
        }
        assert!(action.core().success());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(action.bytes_read(), 500);
    }

    #[test]
    fn empty_reply_is_requested_again() {
        let mut link = TestLink::default();
        let mut action = ReadMemory::new(0x380000, 16, 254);
        start(&mut action, &mut link);

        dispatch(&mut action, &mut link, &response(0x63, &[]));
        assert!(!action.core().is_complete());
        assert_eq!(action.bytes_read(), 0);
        assert_eq!(link.requests().len(), 2);
        assert_eq!(link.last_request(), (0x23, vec![0x38, 0x00, 0x00, 16]));

        dispatch(&mut action, &mut link, &response(0x63, &[0x5A; 16]));
        assert!(action.core().success());
        assert_eq!(action.image().data, vec![0x5A; 16]);
    }

    #[test]
    fn endless_empty_replies_fail_the_read() {
        let mut link = TestLink::default();
        let mut action = ReadMemory::new(0x380000, 16, 254);
        start(&mut action, &mut link);
        while !action.core().is_complete() {
            dispatch(&mut action, &mut link, &response(0x63, &[]));
        }
        assert!(!action.core().success());
        assert_eq!(action.bytes_read(), 0);
        assert_eq!(link.requests().len(), 4);
    }

    #[test]
    fn read_failure_keeps_code() {
        let mut link = TestLink::default();
        let mut action = ReadMemory::new(0x380000, 16, 254);
        start(&mut action, &mut link);
        dispatch(
            &mut action,
            &mut link,
            &negative(ServiceId::ReadMemoryByAddress, ResponseCode::RequestOutOfRange),
        );
        assert!(!action.core().success());
        assert_eq!(action.failure_code(), Some(0x31));
    }

    #[test]
    fn writes_in_blocks() {
        let mut link = TestLink::default();
        let data: Vec<u8> = (0..20).collect();
        let mut action = WriteMemory::new(0x380000, data, 12);
        start(&mut action, &mut link);
        while !action.core().is_complete() {
            dispatch(&mut action, &mut link, &response(0x7D, &[]));
        }
        assert!(action.core().success());
        assert_eq!(
            link.requests(),
            vec![
                (0x3D, vec![0x38, 0x00, 0x00, 8, 0, 1, 2, 3, 4, 5, 6, 7]),
                (0x3D, vec![0x38, 0x00, 0x08, 8, 8, 9, 10, 11, 12, 13, 14, 15]),
                (0x3D, vec![0x38, 0x00, 0x10, 4, 16, 17, 18, 19]),
            ]
        );
    }
}
