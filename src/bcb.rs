//! Bosch BCB type 1 compression with a rotating XOR cipher.
//!
//! ME7 uses "GEHEIM" (secret in German) as the encryption key, see
//! http://nefariousmotorsports.com/forum/index.php?topic=23501.msg169475#msg169475
//!
//! Compressed data is a list of blocks, each starting with a big endian 16
//! bit header. The top two bits give the block type and the other 14 bits a
//! byte count. A raw block is followed by `count` bytes of data, a repeating
//! block by the single byte that is repeated `count` times. Only immediately
//! repeating words are compressed, there is no dictionary like in LZSS.
//!
//! The first data transfer of a download starts with `0x1A 0x01`, sent in the
//! clear before the encrypted blocks.

use std::io::Write;

use crate::Error;

/// Key of the Bosch XOR cipher
pub const BOSCH_KEY: &[u8] = b"GEHEIM";
/// Prefix of the first TransferData message of a compressed download
pub const FIRST_BLOCK_HEADER: [u8; 2] = [0x1A, 0x01];

/// Largest block a repeat may cover, 0x2000 is refused by the ECU
const MAX_REPEATS: usize = 0x1000;
/// Repeats shorter than this are cheaper as raw data
const MIN_REPEATS: usize = 4;
const BLOCK_HEADER_SIZE: usize = 2;
const COUNT_MASK: u16 = 0x3FFF;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    NoRepeats = 0,
    Repeating = 1,
    RepeatingAlso = 2,
    Unknown = 3,
}

impl RepeatMode {
    fn from_header(header: u16) -> Self {
        match header >> 14 {
            0 => RepeatMode::NoRepeats,
            1 => RepeatMode::Repeating,
            2 => RepeatMode::RepeatingAlso,
            _ => RepeatMode::Unknown,
        }
    }

    fn header(self, count: usize) -> [u8; 2] {
        ((self as u16) << 14 | (COUNT_MASK & count as u16)).to_be_bytes()
    }
}

/// Position in the rotating key, carried between messages of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cipher {
    enabled: bool,
    index: usize,
}

impl Cipher {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, index: 0 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Back to the start of the key
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Encrypts or decrypts `data` in place, the operation is its own inverse
    pub fn apply(&mut self, data: &mut [u8]) {
        if self.enabled {
            encrypt_data(BOSCH_KEY, data, &mut self.index);
        }
    }
}

/// XORs `data` in place with `key`, starting at byte `key_index` of the key.
pub fn encrypt_data(key: &[u8], data: &mut [u8], key_index: &mut usize) {
    if key.is_empty() {
        return;
    }
    for b in data.iter_mut() {
        if *key_index >= key.len() {
            *key_index = 0;
        }
        *b ^= key[*key_index];
        *key_index += 1;
    }
    *key_index %= key.len();
}

/// Builds the data section of a compressed `TransferData` message.
///
/// Compresses as much of `data` as fits in `max_len` bytes and encrypts the
/// blocks with `cipher`. With `is_first` the two byte download header is put
/// in front, unencrypted. Returns how much of `data` was consumed along with
/// the message data.
pub fn encrypt_and_compress(
    max_len: usize,
    data: &[u8],
    cipher: &mut Cipher,
    is_first: bool,
) -> Result<(usize, Vec<u8>), Error> {
    let prefix: &[u8] = if is_first { &FIRST_BLOCK_HEADER } else { &[] };
    let max_len = max_len.saturating_sub(prefix.len());

    let (consumed, mut compressed) = create_bcb_data(data, max_len)?;
    cipher.apply(&mut compressed);

    let mut message = prefix.to_vec();
    message.append(&mut compressed);
    Ok((consumed, message))
}

/// Compresses the front of `data` into at most `max_len` bytes.
///
/// Returns the number of uncompressed bytes consumed and the blocks.
pub fn create_bcb_data(data: &[u8], max_len: usize) -> Result<(usize, Vec<u8>), Error> {
    let mut consumed = 0;
    let mut compressed = Vec::new();

    while max_len.saturating_sub(compressed.len()) > MIN_REPEATS && consumed < data.len() {
        let taken = next_bcb_block(
            max_len - compressed.len(),
            data,
            consumed,
            &mut compressed,
        )?;
        if taken == 0 {
            break;
        }
        consumed += taken;
    }

    Ok((consumed, compressed))
}

/// Writes the next block of `data` starting at `start` to `compressed`.
///
/// The block, header included, is never longer than `max_len`. Returns the
/// number of uncompressed bytes the block covers.
pub fn next_bcb_block<W: Write>(
    max_len: usize,
    data: &[u8],
    start: usize,
    compressed: &mut W,
) -> Result<usize, Error> {
    if start >= data.len() || max_len <= BLOCK_HEADER_SIZE {
        return Ok(0);
    }

    let remaining = data.len() - start;
    let max_data_bytes = (max_len - BLOCK_HEADER_SIZE).min(remaining);
    let end_without_repeats = start + max_data_bytes;

    let mut repeat = None;

    // repeats are searched for word by word
    let mut x = start;
    while x + 1 < end_without_repeats {
        if data[x] == data[x + 1] {
            let max_repeat_end = (x + MAX_REPEATS).min(data.len());
            let mut end = None;
            for y in (x + 1)..max_repeat_end {
                if data[y] != data[x] {
                    break;
                }
                let at_word_end = (y - start) % 2 == 1;
                if at_word_end && (end.is_some() || y - x + 1 >= MIN_REPEATS) {
                    end = Some(y);
                }
            }
            if let Some(end) = end {
                repeat = Some((x, end));
                break;
            }
        }
        x += 2;
    }

    match repeat {
        Some((repeat_start, repeat_end)) if repeat_start == start => {
            let count = repeat_end - repeat_start + 1;
            compressed.write_all(&RepeatMode::Repeating.header(count))?;
            compressed.write_all(&[data[repeat_start]])?;
            Ok(count)
        }
        _ => {
            let count = match repeat {
                Some((repeat_start, _)) => repeat_start - start,
                // an odd trailing byte still has to go somewhere
                None if max_data_bytes == 1 && remaining == 1 => 1,
                None => max_data_bytes - max_data_bytes % 2,
            };
            if count == 0 {
                return Ok(0);
            }
            compressed.write_all(&RepeatMode::NoRepeats.header(count))?;
            compressed.write_all(&data[start..start + count])?;
            Ok(count)
        }
    }
}

/// Expands decrypted BCB blocks back into the data they describe.
pub fn decompress(mut compressed: &[u8]) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();

    while !compressed.is_empty() {
        let [high, low, rest @ ..] = compressed else {
            return Err(Error::Compression("truncated block header"));
        };
        let header = u16::from_be_bytes([*high, *low]);
        let count = (header & COUNT_MASK) as usize;

        match RepeatMode::from_header(header) {
            RepeatMode::NoRepeats => {
                if rest.len() < count {
                    return Err(Error::Compression("raw block is longer than the data"));
                }
                data.extend_from_slice(&rest[..count]);
                compressed = &rest[count..];
            }
            RepeatMode::Repeating | RepeatMode::RepeatingAlso => {
                let Some((byte, rest)) = rest.split_first() else {
                    return Err(Error::Compression("repeat block is missing its byte"));
                };
                data.resize(data.len() + count, *byte);
                compressed = rest;
            }
            RepeatMode::Unknown => return Err(Error::Compression("unknown block type")),
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn repeated_words_become_one_block() {
        let data = [0xFF; 16];
        let (consumed, compressed) = create_bcb_data(&data, 100).unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(compressed, vec![0x40, 0x10, 0xFF]);
    }

    #[test]
    fn raw_data_stops_before_a_repeat() {
        let mut data = vec![0x01, 0x02, 0x03, 0x04];
        data.extend([0xAA; 8]);
        data.extend([0x05, 0x06]);

        let (consumed, compressed) = create_bcb_data(&data, 100).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(
            compressed,
            vec![
                0x00, 0x04, 0x01, 0x02, 0x03, 0x04, // raw
                0x40, 0x08, 0xAA, // repeat
                0x00, 0x02, 0x05, 0x06, // raw
            ]
        );
    }

    #[test]
    fn blocks_respect_max_len_from_any_offset() {
        let data: Vec<u8> = (0..200u8).collect();
        let (consumed, compressed) = create_bcb_data(&data[50..], 20).unwrap();
        assert!(compressed.len() <= 20);
        assert_eq!(consumed, 18);
        assert_eq!(&compressed[2..], &data[50..68]);
    }

    #[test]
    fn short_repeats_stay_raw() {
        let data = [0x11, 0x11, 0x22, 0x33];
        let (_, compressed) = create_bcb_data(&data, 100).unwrap();
        assert_eq!(compressed, vec![0x00, 0x04, 0x11, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn odd_trailing_byte_is_sent() {
        let data = [0x01, 0x02, 0x03];
        let (consumed, compressed) = create_bcb_data(&data, 100).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn cipher_rotates_through_key() {
        let mut data = [0u8; 8];
        let mut cipher = Cipher::new(true);
        cipher.apply(&mut data[..4]);
        cipher.apply(&mut data[4..]);
        assert_eq!(&data, b"GEHEIMGE");
        assert_eq!(cipher.index(), 2);

        let mut disabled = Cipher::new(false);
        let mut clear = [1, 2, 3];
        disabled.apply(&mut clear);
        assert_eq!(clear, [1, 2, 3]);
    }

    #[test]
    fn first_message_header_is_not_encrypted() {
        let data = [0x00; 8];
        let mut cipher = Cipher::new(true);
        let (consumed, message) = encrypt_and_compress(30, &data, &mut cipher, true).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(&message[..2], &FIRST_BLOCK_HEADER);

        let mut blocks = message[2..].to_vec();
        Cipher::new(true).apply(&mut blocks);
        assert_eq!(decompress(&blocks).unwrap(), data);
    }

    #[test]
    fn compressing_a_sector_restores_it() {
        let mut sector = vec![0xFF; 0x400];
        sector[0x100..0x180].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        sector[0x200..0x210].fill(0x00);

        let mut cipher = Cipher::new(true);
        let mut decoder = Cipher::new(true);
        let mut restored = Vec::new();
        let mut offset = 0;
        while offset < sector.len() {
            let (consumed, mut message) =
                encrypt_and_compress(253, &sector[offset..], &mut cipher, false).unwrap();
            assert!(consumed > 0 && message.len() <= 253);
            decoder.apply(&mut message);
            restored.extend(decompress(&message).unwrap());
            offset += consumed;
        }
        assert_eq!(restored, sector);
    }

    #[test]
    fn decompress_rejects_truncated_blocks() {
        assert!(decompress(&[0x00]).is_err());
        assert!(decompress(&[0x00, 0x04, 0x01]).is_err());
        assert!(decompress(&[0x40, 0x04]).is_err());
    }
}
