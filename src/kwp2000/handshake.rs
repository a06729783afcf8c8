//! Connection establishment on the K-line.
//!
//! Slow init sends the ECU address at 5 baud by holding the line low with
//! the break signal, then reads the sync byte and key bytes. Fast init pulls
//! the line low for 25ms and high for 25ms before the StartCommunication
//! request is transmitted by the interface.
//!
//! Everything in here runs with the transport locked and cannot be
//! interrupted, the ECU gives up on the handshake if any window is missed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::constants::{baud, key_byte};
use super::timing::{Stopwatch, idle_for, offset_duration, spin_for, spin_until};
use crate::k_line::KLine;

const PRIMARY_SLOW_INIT_BAUD_RATE: u32 = baud::B10400;
const SECONDARY_SLOW_INIT_BAUD_RATE: u32 = baud::B9600;
const SYNC_BYTE: u8 = 0x55;
const FIVE_BAUD_BIT_TIME: Duration = Duration::from_millis(200);
const FAST_INIT_PULSE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    /// Bus idle time before any init, VW needs 2.6 seconds between inits
    pub idle_before_init_ms: u64,
    /// Added to every 200ms five baud bit, may be negative
    pub five_baud_bit_time_offset_ms: f64,
    /// Added to both fast init pulses, may be negative
    pub fast_init_low_high_offset_ms: f64,
    /// EDC15 ECUs take longer than W1 max to send the sync byte
    pub sync_byte_timeout_ms: u64,
    /// W2 max and W3 max
    pub key_byte_timeout_ms: u64,
    /// W4 min
    pub key_byte_complement_delay_ms: u64,
    /// Timeout for echoes and the address complement
    pub echo_timeout_ms: u64,
    pub time_between_slow_inits_ms: u64,
    pub kwp1281: Kwp1281Timing,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            idle_before_init_ms: 2600,
            five_baud_bit_time_offset_ms: -0.6,
            fast_init_low_high_offset_ms: 0.0,
            sync_byte_timeout_ms: 500,
            key_byte_timeout_ms: 20,
            key_byte_complement_delay_ms: 25,
            echo_timeout_ms: 50,
            time_between_slow_inits_ms: 1500,
            kwp1281: Kwp1281Timing::default(),
        }
    }
}

impl HandshakeSettings {
    pub fn five_baud_bit_time(&self) -> Duration {
        offset_duration(FIVE_BAUD_BIT_TIME, self.five_baud_bit_time_offset_ms)
    }

    pub fn fast_init_pulse(&self) -> Duration {
        offset_duration(FAST_INIT_PULSE, self.fast_init_low_high_offset_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Kwp1281Timing {
    pub byte_complement_delay_ms: u64,
    pub response_delay_ms: u64,
    pub next_byte_delay_ms: u64,
    pub ecu_response_timeout_ms: u64,
}

impl Default for Kwp1281Timing {
    fn default() -> Self {
        Self {
            byte_complement_delay_ms: 2,
            response_delay_ms: 25,
            next_byte_delay_ms: 1,
            ecu_response_timeout_ms: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBytes {
    pub first: u8,
    pub second: u8,
}

impl Default for KeyBytes {
    fn default() -> Self {
        Self {
            first: key_byte::DEFAULT_KEY_BYTE_1,
            second: key_byte::KWP2000_KEY_BYTE_2,
        }
    }
}

impl KeyBytes {
    /// Drops the parity bit, key bytes are 7 data bits with parity
    pub fn masked(self) -> Self {
        Self {
            first: self.first & 0x7F,
            second: self.second & 0x7F,
        }
    }

    pub fn is_kwp1281(self) -> bool {
        self.first == key_byte::KWP1281_KEY_BYTE_1 && self.second == key_byte::KWP1281_KEY_BYTE_2
    }

    pub fn is_valid_kwp2000(self, check_parity: bool) -> bool {
        is_key_byte_1_valid_kwp2000(self.first, check_parity)
            && is_key_byte_2_valid_kwp2000(self.second, check_parity)
    }
}

fn has_odd_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 1
}

pub fn is_key_byte_1_valid_kwp2000(key_byte_1: u8, check_parity: bool) -> bool {
    let timing = key_byte::EXTENDED_TIMING | key_byte::NORMAL_TIMING;
    let addressing = key_byte::TARGET_SOURCE_IN_HEADER | key_byte::ONE_BYTE_HEADER;

    (!check_parity || has_odd_parity(key_byte_1))
        && key_byte_1 & key_byte::ALWAYS_ONE != 0
        && key_byte_1 & timing != timing
        && key_byte_1 & addressing != 0
}

pub fn is_key_byte_2_valid_kwp2000(key_byte_2: u8, check_parity: bool) -> bool {
    !check_parity || has_odd_parity(key_byte_2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowInitResult {
    /// Masked key bytes
    pub key_bytes: KeyBytes,
    pub baud_rate: u32,
}

/// Bit bangs `address` at 5 baud using the break signal.
///
/// Returns the number of low to high transitions, each of which leaves a
/// garbage byte in the receive buffer.
pub fn send_five_baud_address<K: KLine>(
    line: &mut K,
    address: u8,
    data_bits: u32,
    parity: Parity,
    bit_time: Duration,
) -> Result<usize, K::Error> {
    debug!(address = format_args!("{address:#04x}"), "sending slow init address byte");

    let mut transitions = 0;
    let mut low = true;
    let mut bit_end = Instant::now() + bit_time;

    // start bit
    line.set_low()?;
    spin_until(bit_end);

    let mut level = |line: &mut K, high: bool, low: &mut bool| -> Result<(), K::Error> {
        if high && *low {
            line.set_high()?;
            transitions += 1;
        } else if !high && !*low {
            line.set_low()?;
        }
        *low = !high;
        Ok(())
    };

    let mut high_bits = 0;
    for bit in 0..data_bits {
        let high = address & (1 << bit) != 0;
        if high {
            high_bits += 1;
        }
        level(line, high, &mut low)?;
        bit_end += bit_time;
        spin_until(bit_end);
    }

    let parity_bit = match parity {
        Parity::None => None,
        Parity::Even => Some(high_bits % 2 != 0),
        Parity::Odd => Some(high_bits % 2 == 0),
    };
    if let Some(high) = parity_bit {
        level(line, high, &mut low)?;
        bit_end += bit_time;
        spin_until(bit_end);
    }

    // stop bit, left high for the ECU to answer
    level(line, true, &mut low)?;

    Ok(transitions)
}

/// Runs a complete slow init at `address`.
///
/// Returns `None` when the ECU did not complete the handshake. The caller is
/// responsible for purging the transport afterwards.
pub fn slow_init<K: KLine>(
    line: &mut K,
    settings: &HandshakeSettings,
    address: u8,
    parity: Parity,
    consume_echo: bool,
) -> Result<Option<SlowInitResult>, K::Error> {
    let mut baud_rate = PRIMARY_SLOW_INIT_BAUD_RATE;
    line.set_baud_rate(baud_rate)?;
    line.purge()?;

    let ignore = send_five_baud_address(line, address, 7, parity, settings.five_baud_bit_time())?;

    let mut sync = vec![0u8; 1 + ignore];
    let read = line.read_bytes(&mut sync, Duration::from_millis(settings.sync_byte_timeout_ms))?;
    let mut watch = Stopwatch::default();
    watch.start();

    if read <= ignore || sync[ignore] != SYNC_BYTE {
        baud_rate = SECONDARY_SLOW_INIT_BAUD_RATE;
        if read > ignore {
            debug!(sync = format_args!("{:#04x}", sync[ignore]), "read incorrect sync byte, guessing baud rate is {baud_rate}");
        } else {
            debug!(read, "failed to read sync byte, guessing baud rate is {baud_rate}");
        }
        line.set_baud_rate(baud_rate)?;
    }

    let mut key_bytes = Vec::with_capacity(2);
    let mut timeout = settings.key_byte_timeout_ms;
    let last_chance_timeout = timeout * 2;
    let mut to_read = 2;
    let mut buf = [0u8; 2];
    loop {
        let last_read_time = watch.elapsed_ms();
        let read = line.read_bytes(&mut buf[..to_read], Duration::from_millis(1))?;
        if read > 0 {
            watch.restart();
            if key_bytes.is_empty() {
                timeout = settings.key_byte_timeout_ms;
                to_read = 1;
            }
            key_bytes.extend_from_slice(&buf[..read]);
        }

        let keep_reading = last_read_time < timeout
            || (key_bytes.len() < 2 && last_read_time < last_chance_timeout);
        if !keep_reading {
            break;
        }
    }

    if key_bytes.len() < 2 {
        debug!(read = key_bytes.len(), "not enough key bytes");
        return Ok(None);
    }

    let complement = !key_bytes[key_bytes.len() - 1];
    let complement_delay = Duration::from_millis(settings.key_byte_complement_delay_ms);
    spin_for(complement_delay.saturating_sub(watch.elapsed()));

    if !line.write_byte(complement)? {
        debug!("failed to write key byte complement");
        return Ok(None);
    }

    let echo_timeout = Duration::from_millis(settings.echo_timeout_ms);
    if consume_echo {
        match line.read_byte(echo_timeout)? {
            Some(echo) if echo == complement => {}
            Some(_) => {
                debug!("key byte complement echo didn't match");
                return Ok(None);
            }
            None => {
                debug!("failed to read echo of key byte complement");
                return Ok(None);
            }
        }
    }

    let key_bytes = KeyBytes {
        first: key_bytes[0],
        second: key_bytes[1],
    }
    .masked();

    // a KWP2000 session answers with the address complement
    if key_bytes.is_valid_kwp2000(false) && line.read_byte(echo_timeout)? != Some(!address) {
        debug!("failed to read address complement");
        return Ok(None);
    }

    Ok(Some(SlowInitResult {
        key_bytes,
        baud_rate,
    }))
}

/// Releases the line, waits the bus idle time and sends the 25ms low and
/// 25ms high wake up pattern.
pub fn fast_init_pulse<K: KLine>(line: &mut K, settings: &HandshakeSettings) -> Result<(), K::Error> {
    line.set_high()?;
    idle_for(Duration::from_millis(settings.idle_before_init_ms));

    let pulse = settings.fast_init_pulse();
    let low_end = Instant::now() + pulse;
    line.set_low()?;
    spin_until(low_end);

    let high_end = low_end + pulse;
    line.set_high()?;
    spin_until(high_end);
    Ok(())
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kwp1281Title {
    EndCommunication = 0x06,
    Acknowledge = 0x09,
    AsciiData = 0xF6,
}

const KWP1281_BLOCK_END: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Kwp1281Block {
    counter: u8,
    title: u8,
    data: Vec<u8>,
}

/// Byte level KWP1281 exchange where every byte but the block end is
/// acknowledged with its complement.
struct Kwp1281<'a, K: KLine> {
    line: &'a mut K,
    timing: &'a Kwp1281Timing,
    timeout: Duration,
    consume_echo: bool,
}

impl<K: KLine> Kwp1281<'_, K> {
    fn read_byte(&mut self, send_complement: bool) -> Result<Option<u8>, K::Error> {
        let Some(byte) = self.line.read_byte(self.timeout)? else {
            debug!("failed to read KWP1281 byte");
            return Ok(None);
        };

        if send_complement {
            spin_for(Duration::from_millis(self.timing.byte_complement_delay_ms));
            let complement = !byte;
            if !self.line.write_byte(complement)? {
                debug!("failed to write KWP1281 byte complement");
                return Ok(None);
            }
            if self.consume_echo && self.line.read_byte(self.timeout)? != Some(complement) {
                debug!("failed to read KWP1281 byte complement echo");
                return Ok(None);
            }
        }

        Ok(Some(byte))
    }

    fn send_byte(&mut self, byte: u8, require_complement: bool) -> Result<bool, K::Error> {
        spin_for(Duration::from_millis(self.timing.next_byte_delay_ms));
        if !self.line.write_byte(byte)? {
            debug!("failed to write KWP1281 byte");
            return Ok(false);
        }
        if self.consume_echo && self.line.read_byte(self.timeout)? != Some(byte) {
            debug!("failed to read KWP1281 byte echo");
            return Ok(false);
        }
        if require_complement && self.line.read_byte(self.timeout)? != Some(!byte) {
            debug!("failed to read KWP1281 byte complement");
            return Ok(false);
        }
        Ok(true)
    }

    fn read_block(&mut self) -> Result<Option<Kwp1281Block>, K::Error> {
        let Some(length) = self.read_byte(true)? else {
            return Ok(None);
        };
        let Some(counter) = self.read_byte(true)? else {
            return Ok(None);
        };
        let Some(title) = self.read_byte(true)? else {
            return Ok(None);
        };

        let mut data = Vec::with_capacity(length.saturating_sub(3) as usize);
        for _ in 0..length.saturating_sub(3) {
            match self.read_byte(true)? {
                Some(byte) => data.push(byte),
                None => return Ok(None),
            }
        }

        if self.read_byte(false)? != Some(KWP1281_BLOCK_END) {
            debug!("final byte of KWP1281 block was not the block end byte");
            return Ok(None);
        }

        debug!(counter, title = format_args!("{title:#04x}"), ?data, "KWP1281 read block");
        Ok(Some(Kwp1281Block { counter, title, data }))
    }

    fn send_block(&mut self, block: &Kwp1281Block) -> Result<bool, K::Error> {
        let length = 3 + block.data.len() as u8;
        for byte in [length, block.counter, block.title]
            .into_iter()
            .chain(block.data.iter().copied())
        {
            if !self.send_byte(byte, true)? {
                return Ok(false);
            }
        }
        self.send_byte(KWP1281_BLOCK_END, false)
    }
}

/// Reads the identification blocks of a legacy KWP1281 session and ends it.
///
/// Returns the ASCII identification text when the session ended cleanly.
pub fn kwp1281_short_session<K: KLine>(
    line: &mut K,
    settings: &HandshakeSettings,
    consume_echo: bool,
) -> Result<Option<String>, K::Error> {
    let mut session = Kwp1281 {
        line,
        timing: &settings.kwp1281,
        timeout: Duration::from_millis(settings.kwp1281.ecu_response_timeout_ms),
        consume_echo,
    };
    let mut text = String::new();

    loop {
        let Some(block) = session.read_block()? else {
            warn!("failed to read KWP1281 connect info");
            return Ok(None);
        };

        spin_for(Duration::from_millis(settings.kwp1281.response_delay_ms));

        if block.title == Kwp1281Title::Acknowledge as u8 {
            let end = Kwp1281Block {
                counter: block.counter.wrapping_add(1),
                title: Kwp1281Title::EndCommunication as u8,
                data: Vec::new(),
            };
            if !session.send_block(&end)? {
                debug!("failed to send end block");
                return Ok(None);
            }
            break;
        }

        let ack = Kwp1281Block {
            counter: block.counter.wrapping_add(1),
            title: Kwp1281Title::Acknowledge as u8,
            data: Vec::new(),
        };
        if !session.send_block(&ack)? {
            debug!("failed to send acknowledgement block");
            return Ok(None);
        }

        if block.title == Kwp1281Title::AsciiData as u8 {
            text.extend(block.data.iter().map(|b| *b as char));
        }
    }

    info!("KWP1281 connect info: {text}");
    Ok(Some(text))
}
