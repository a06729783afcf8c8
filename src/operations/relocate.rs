//! Moves the ECU's KWP2000 message handling tables into external RAM so
//! extra services can be added without touching the ROM.
//!
//! The ECU dispatches a request through an index table, mapping service ids
//! to function table slots, and a table of function pointers. Both are
//! copied into free RAM together with a redirect function that hands every
//! service not handled by an injected function back to the original tables.
//! The ECU's live table pointers are switched over last.

use tracing::{debug, info, warn};

use super::{Context, Operation, Preamble, PreambleSettings, SessionSettings, Step};
use crate::{
    Error,
    actions::{ActionReport, AnyAction, ReadMemory, WriteMemory, transfer::DEFAULT_MAX_BLOCK_SIZE},
    kwp2000::constants::DiagnosticSession,
    operations::sequential::{EXTERNAL_RAM_SIZE, EXTERNAL_RAM_START},
};

/// Two words holding the KWP2000 header decoder of either boot ROM version
const BOOT_ROM_SIGNATURE_ADDRESS: u32 = 0xE1B0;

/// Header decoder address of 05.xx boot ROMs, found at 0xE1B2
const BOOT_ROM_05_SIGNATURE: u16 = 0x2B86;
/// Header decoder addresses of 06.xx boot ROMs, found at 0xE1B0
const BOOT_ROM_06_SIGNATURES: [u16; 2] = [0x0260, 0x3D62];

/// Enabled service bit field, one bit per index table entry
const ENABLED_SERVICES_LENGTH: u32 = 16;
const INDEX_TABLE_LENGTH: usize = 128;

/// Marks the start of data injected by an earlier relocation, followed by
/// the size of the data between it and [`INJECTED_END_MARKER`]
pub const INJECTED_START_MARKER: u16 = 0xDEAD;
pub const INJECTED_END_MARKER: u16 = 0xBEEF;

/// Offsets of the words in the redirect function patched with the original
/// table locations, and the values they hold before patching
const REDIRECT_SERVICE_ID: (usize, u16) = (0x06, 0xDEAD);
const REDIRECT_INDEX_TABLE_PAGE: (usize, u16) = (0x12, 0x03EF);
const REDIRECT_INDEX_TABLE_ADDRESS: (usize, u16) = (0x16, 0xDEAD);
const REDIRECT_FUNCTION_TABLE_ADDRESS: (usize, u16) = (0x1E, 0xDEAD);
const REDIRECT_FUNCTION_TABLE_PAGE: (usize, u16) = (0x22, 0x03EF);

/// Words in injected functions replaced with ECU addresses
mod placeholder {
    pub const FIRST_DATA_BYTE: u16 = 0x1112;
    pub const DATA_LENGTH: u16 = 0x3334;
    pub const BUFFER_ADDRESS: u16 = 0x5556;
    pub const BUFFER_SEGMENT: u16 = 0x6666;
    pub const SERVICE_ID: u16 = 0x7778;
    pub const COMMUNICATION_FLAGS: u16 = 0x8888;
}

/// Service handlers data logging injects, define first since it owns the
/// variable buffer the read handler uses
pub const DEFINE_VARIABLES_SERVICE: u8 = 0xB7;
pub const READ_VARIABLES_SERVICE: u8 = 0xB8;
/// Size of the define handler at the start of the data logging functions
const DEFINE_FUNCTION_LENGTH: usize = 0x7C;
/// Variable buffer size the data logging functions were built for
const VARIABLE_BUFFER_LENGTH: u32 = 257;
/// `rets`, the last instruction of the define handler
const RETURN_INSTRUCTION: [u8; 2] = [0xDB, 0x00];

fn read_word(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn write_word(data: &mut [u8], offset: usize, word: u16) {
    data[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
}

fn align(address: u32) -> u32 {
    address + address % 2
}

/// Splits a 24 bit address into the page and in page address the ECU keeps
/// its table pointers as.
fn to_page_address(address: u32) -> (u16, u16) {
    (((address >> 14) & 0x3FF) as u16, (address & 0x3FFF) as u16)
}

fn from_page_address(page: u16, address: u16) -> u32 {
    (page as u32) << 14 | address as u32
}

/// RAM locations of the boot ROM's message handling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRom {
    pub version: &'static str,
    pub communication_flags: u16,
    pub data_length: u16,
    pub first_data_byte: u16,
    pub service_id: u16,
    pub enabled_services: u32,
    pub table_pointers: u32,
}

impl BootRom {
    pub const V05: BootRom = BootRom {
        version: "05.xx",
        communication_flags: 0xE074,
        data_length: 0xE1CA,
        first_data_byte: 0xE1CE,
        service_id: 0xE1D0,
        enabled_services: 0xE210,
        table_pointers: 0xE228,
    };

    pub const V06: BootRom = BootRom {
        version: "06.xx",
        communication_flags: 0xE074,
        data_length: 0xE1C8,
        first_data_byte: 0xE1CC,
        service_id: 0xE1CE,
        enabled_services: 0xE20E,
        table_pointers: 0xE226,
    };

    /// Identifies the boot ROM from the words at [`BOOT_ROM_SIGNATURE_ADDRESS`].
    pub fn identify(signature: &[u8]) -> Option<BootRom> {
        if read_word(signature, 2) == Some(BOOT_ROM_05_SIGNATURE) {
            Some(Self::V05)
        } else if read_word(signature, 0).is_some_and(|word| BOOT_ROM_06_SIGNATURES.contains(&word)) {
            Some(Self::V06)
        } else {
            None
        }
    }
}

/// A service handler to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedFunction {
    pub service: u8,
    /// Zeroed scratch space placed in front of the code
    pub buffer_length: u32,
    pub code: Vec<u8>,
}

/// ECU machine code written along with the relocated tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelocationPayload {
    redirect: Vec<u8>,
    functions: Vec<RelocatedFunction>,
}

impl RelocationPayload {
    /// `redirect` must hold the words patched with the original tables.
    pub fn new(redirect: Vec<u8>, functions: Vec<RelocatedFunction>) -> Result<Self, Error> {
        for (offset, marker) in [
            REDIRECT_SERVICE_ID,
            REDIRECT_INDEX_TABLE_PAGE,
            REDIRECT_INDEX_TABLE_ADDRESS,
            REDIRECT_FUNCTION_TABLE_ADDRESS,
            REDIRECT_FUNCTION_TABLE_PAGE,
        ] {
            if read_word(&redirect, offset) != Some(marker) {
                return Err(Error::InvalidPayload(format!(
                    "redirect function lacks {marker:#06x} at {offset:#x}"
                )));
            }
        }
        if functions.len() >= INDEX_TABLE_LENGTH {
            return Err(Error::InvalidPayload("too many functions".into()));
        }
        Ok(Self { redirect, functions })
    }

    /// The define and read variable handlers, stored back to back in
    /// `functions`.
    pub fn data_logging(redirect: Vec<u8>, functions: &[u8]) -> Result<Self, Error> {
        if functions.len() <= DEFINE_FUNCTION_LENGTH
            || functions[DEFINE_FUNCTION_LENGTH - 2..DEFINE_FUNCTION_LENGTH] != RETURN_INSTRUCTION
        {
            return Err(Error::InvalidPayload(
                "data logging functions don't start with the define handler".into(),
            ));
        }
        let (define, read) = functions.split_at(DEFINE_FUNCTION_LENGTH);
        Self::new(
            redirect,
            vec![
                RelocatedFunction {
                    service: DEFINE_VARIABLES_SERVICE,
                    buffer_length: VARIABLE_BUFFER_LENGTH,
                    code: define.to_vec(),
                },
                RelocatedFunction {
                    service: READ_VARIABLES_SERVICE,
                    buffer_length: 0,
                    code: read.to_vec(),
                },
            ],
        )
    }

    pub fn functions(&self) -> &[RelocatedFunction] {
        &self.functions
    }
}

/// Where the relocated tables ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedTables {
    /// Everything written to RAM, between the injection markers
    pub data: Vec<u8>,
    pub index_table: u32,
    pub function_table: u32,
}

/// Original tables and boot ROM the relocation works against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalTables {
    pub boot_rom: BootRom,
    pub index_table: u32,
    pub function_table: u32,
}

impl OriginalTables {
    /// Parses the four words at the boot ROM's table pointers
    pub fn from_pointers(boot_rom: BootRom, pointers: &[u8]) -> Option<Self> {
        let word = |index: usize| read_word(pointers, index * 2);
        Some(Self {
            boot_rom,
            function_table: from_page_address(word(1)?, word(0)?),
            index_table: from_page_address(word(3)?, word(2)?),
        })
    }

    /// Tables already living in external RAM were relocated before
    pub fn is_relocated(&self) -> bool {
        let ram = EXTERNAL_RAM_START..EXTERNAL_RAM_START + EXTERNAL_RAM_SIZE;
        ram.contains(&self.function_table) && ram.contains(&self.index_table)
    }
}

/// Builds the injected block for `target`, enabling the injected services
/// in `enabled_services`.
pub fn relocate_tables(
    payload: &RelocationPayload,
    original: &OriginalTables,
    target: u32,
    enabled_services: &mut [u8],
) -> RelocatedTables {
    debug_assert!(target % 2 == 0);
    let rom = &original.boot_rom;

    // every service goes to slot 0, the redirect function, unless injected
    let mut index_table = [0u8; INDEX_TABLE_LENGTH];
    for (slot, function) in payload.functions.iter().enumerate() {
        let entry = (((function.service & 0x80) >> 1) | (function.service & 0x3F)) as usize;
        index_table[entry] = slot as u8 + 1;
        if let Some(enabled) = enabled_services.get_mut((entry >> 3) & 0x1F) {
            *enabled |= 1 << (entry & 7);
        }
    }
    let slots = payload.functions.len() as u8 + 1;

    // marker and size words come first
    let index_table_address = target + 4;
    let function_table_address = align(index_table_address + 2 + INDEX_TABLE_LENGTH as u32);
    let redirect_address = align(function_table_address + slots as u32 * 4);
    let functions_address = align(redirect_address + payload.redirect.len() as u32);

    let mut function_table = vec![0u8; slots as usize * 4];
    for slot in function_table.chunks_exact_mut(4) {
        slot.copy_from_slice(&redirect_address.to_le_bytes());
    }

    let mut redirect = payload.redirect.clone();
    let (index_page, index_address) = to_page_address(original.index_table);
    let (function_page, function_address) = to_page_address(original.function_table);
    write_word(&mut redirect, REDIRECT_SERVICE_ID.0, rom.service_id);
    write_word(&mut redirect, REDIRECT_INDEX_TABLE_PAGE.0, index_page);
    write_word(&mut redirect, REDIRECT_INDEX_TABLE_ADDRESS.0, index_address);
    write_word(&mut redirect, REDIRECT_FUNCTION_TABLE_PAGE.0, function_page);
    write_word(&mut redirect, REDIRECT_FUNCTION_TABLE_ADDRESS.0, function_address);

    // the first buffer is the one the handlers share
    let mut address = functions_address;
    let mut buffer_address = None;
    let mut blocks = Vec::new();
    for (slot, function) in payload.functions.iter().enumerate() {
        if function.buffer_length > 0 && buffer_address.is_none() {
            buffer_address = Some(address);
        }
        let entry_offset = align(function.buffer_length);
        let entry = address + entry_offset;
        function_table[(slot + 1) * 4..(slot + 2) * 4].copy_from_slice(&entry.to_le_bytes());

        let mut block = vec![0u8; entry_offset as usize];
        block.extend_from_slice(&function.code);
        blocks.push((address, block, entry_offset as usize));
        address = align(address + (entry_offset + function.code.len() as u32));
    }
    let buffer_address = buffer_address.unwrap_or(functions_address);
    for (_, block, code_offset) in &mut blocks {
        let mut offset = *code_offset;
        while offset + 1 < block.len() {
            let replacement = match read_word(block, offset) {
                Some(placeholder::FIRST_DATA_BYTE) => Some(rom.first_data_byte),
                Some(placeholder::DATA_LENGTH) => Some(rom.data_length),
                Some(placeholder::BUFFER_ADDRESS) => Some(buffer_address as u16),
                Some(placeholder::BUFFER_SEGMENT) => Some(((buffer_address >> 16) & 0xFF) as u16),
                Some(placeholder::SERVICE_ID) => Some(rom.service_id),
                Some(placeholder::COMMUNICATION_FLAGS) => Some(rom.communication_flags),
                _ => None,
            };
            if let Some(word) = replacement {
                write_word(block, offset, word);
            }
            offset += 2;
        }
    }

    let length = (address - target + 2) as usize;
    let mut data = vec![0u8; length];
    write_word(&mut data, 0, INJECTED_START_MARKER);
    write_word(&mut data, 2, (length - 6) as u16);
    data[4..4 + INDEX_TABLE_LENGTH].copy_from_slice(&index_table);
    data[4 + INDEX_TABLE_LENGTH] = slots;
    data[5 + INDEX_TABLE_LENGTH] = slots;
    let place = |data: &mut Vec<u8>, at: u32, bytes: &[u8]| {
        let offset = (at - target) as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    };
    place(&mut data, function_table_address, &function_table);
    place(&mut data, redirect_address, &redirect);
    for (at, block, _) in &blocks {
        place(&mut data, *at, block);
    }
    write_word(&mut data, length - 2, INJECTED_END_MARKER);

    RelocatedTables {
        data,
        index_table: index_table_address,
        function_table: function_table_address,
    }
}

/// The table pointer words pointing the ECU at `tables`
pub fn table_pointers(tables: &RelocatedTables) -> Vec<u8> {
    let (function_page, function_address) = to_page_address(tables.function_table);
    let (index_page, index_address) = to_page_address(tables.index_table);
    [function_address, function_page, index_address, index_page]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

/// Longest run of RAM that is zero or holds earlier injected data, as
/// offset and length into `data`.
pub fn find_free_ram(data: &[u8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    while start < data.len() {
        let mut end = start;
        while end < data.len() {
            if data[end] == 0 {
                end += 1;
                continue;
            }
            let injected_end = (read_word(data, end) == Some(INJECTED_START_MARKER))
                .then(|| read_word(data, end + 2))
                .flatten()
                .map(|size| end + 4 + size as usize)
                .filter(|marker| read_word(data, *marker) == Some(INJECTED_END_MARKER));
            match injected_end {
                Some(marker) => end = marker + 2,
                None => break,
            }
        }
        let length = end - start;
        if length > 0 && best.is_none_or(|(_, longest)| length > longest) {
            best = Some((start, length));
        }
        start = end + 1;
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocateState {
    IdentifyBootRom,
    ReadTablePointers,
    ReadEnabledServices,
    LocateFreeRam,
    WriteTables,
    WriteEnabledServices,
    ChangeTablePointers,
    Finished,
}

/// Injects the payload's service handlers into the ECU's message handling.
#[derive(Debug)]
pub struct RelocateMessageHandlingTable {
    preamble: Preamble,
    payload: RelocationPayload,
    state: RelocateState,
    boot_rom: Option<BootRom>,
    original: Option<OriginalTables>,
    enabled_services: Vec<u8>,
    /// Start and length of the free RAM found
    free_ram: Option<(u32, u32)>,
    tables: Option<RelocatedTables>,
}

impl RelocateMessageHandlingTable {
    pub fn new(session: &SessionSettings, payload: RelocationPayload) -> Self {
        Self {
            preamble: Preamble::new(PreambleSettings::session(DiagnosticSession::Development, session)),
            payload,
            state: RelocateState::IdentifyBootRom,
            boot_rom: None,
            original: None,
            enabled_services: Vec::new(),
            free_ram: None,
            tables: None,
        }
    }

    /// Bytes of free RAM needed, one more in case the free RAM starts odd
    fn required_ram(&self, original: &OriginalTables) -> u32 {
        let mut enabled = self.enabled_services.clone();
        relocate_tables(&self.payload, original, 0, &mut enabled).data.len() as u32 + 1
    }

    fn write_tables(&mut self) -> Step {
        let (Some(original), Some((start, length))) = (self.original, self.free_ram) else {
            return Step::Finished(false);
        };
        let target = align(start);
        let tables = relocate_tables(&self.payload, &original, target, &mut self.enabled_services);
        if tables.data.len() as u32 > length - (target - start) {
            warn!(
                needed = tables.data.len(),
                free = length,
                "not enough free RAM for the relocated message handling tables"
            );
            return Step::Finished(false);
        }
        info!(
            "writing relocated message handling tables to {target:#08x}, {:#x} bytes",
            tables.data.len()
        );
        let write = WriteMemory::new(target, tables.data.clone(), DEFAULT_MAX_BLOCK_SIZE);
        self.tables = Some(tables);
        Step::Run(write.into())
    }

    fn state_completed(&mut self, action: AnyAction) -> Option<RelocateState> {
        use RelocateState::*;
        match (self.state, action) {
            (IdentifyBootRom, AnyAction::ReadMemory(read)) => {
                let boot_rom = BootRom::identify(&read.image().data);
                if boot_rom.is_none() {
                    warn!(signature = ?read.image().data, "unable to identify the boot ROM version");
                }
                self.boot_rom = boot_rom;
                debug!(version = boot_rom?.version, "identified boot ROM");
                Some(ReadTablePointers)
            }
            (ReadTablePointers, AnyAction::ReadMemory(read)) => {
                let original = OriginalTables::from_pointers(self.boot_rom?, &read.image().data)?;
                debug!(
                    "message handling tables at {:#08x} and {:#08x}",
                    original.index_table, original.function_table
                );
                self.original = Some(original);
                if original.is_relocated() {
                    info!("message handling tables are already relocated");
                    Some(Finished)
                } else {
                    Some(ReadEnabledServices)
                }
            }
            (ReadEnabledServices, AnyAction::ReadMemory(read)) => {
                self.enabled_services = read.into_image().data;
                Some(LocateFreeRam)
            }
            (LocateFreeRam, AnyAction::ReadMemory(read)) => {
                let image = read.image();
                let (offset, length) = find_free_ram(&image.data[..read.bytes_read()])?;
                let start = image.start + offset as u32;
                info!("found {length:#x} bytes of free RAM at {start:#08x}");
                self.free_ram = Some((start, length as u32));
                Some(WriteTables)
            }
            (WriteTables, AnyAction::WriteMemory(_)) => Some(WriteEnabledServices),
            (WriteEnabledServices, AnyAction::WriteMemory(_)) => Some(ChangeTablePointers),
            (ChangeTablePointers, AnyAction::WriteMemory(_)) => {
                info!("message handling tables relocated");
                Some(Finished)
            }
            _ => None,
        }
    }
}

impl Operation for RelocateMessageHandlingTable {
    fn name(&self) -> &'static str {
        "RelocateMessageHandlingTable"
    }

    fn next(&mut self, cx: &mut Context<'_>) -> Step {
        if let Some(action) = self.preamble.next(cx.link) {
            return Step::Run(action);
        }
        let action: AnyAction = match self.state {
            RelocateState::IdentifyBootRom => {
                info!("locating KWP2000 message handling in the ECU");
                ReadMemory::new(BOOT_ROM_SIGNATURE_ADDRESS, 4, DEFAULT_MAX_BLOCK_SIZE).into()
            }
            RelocateState::ReadTablePointers => match self.boot_rom {
                Some(rom) => ReadMemory::new(rom.table_pointers, 8, DEFAULT_MAX_BLOCK_SIZE).into(),
                None => return Step::Finished(false),
            },
            RelocateState::ReadEnabledServices => match self.boot_rom {
                Some(rom) => {
                    ReadMemory::new(rom.enabled_services, ENABLED_SERVICES_LENGTH, DEFAULT_MAX_BLOCK_SIZE)
                        .into()
                }
                None => return Step::Finished(false),
            },
            RelocateState::LocateFreeRam => {
                let Some(original) = self.original else {
                    return Step::Finished(false);
                };
                let required = self.required_ram(&original) as usize;
                info!(required, "looking for free RAM");
                ReadMemory::new(EXTERNAL_RAM_START, EXTERNAL_RAM_SIZE, DEFAULT_MAX_BLOCK_SIZE)
                    .with_callback(Box::new(move |image, read| {
                        find_free_ram(&image.data[..read]).is_none_or(|(_, length)| length < required)
                    }))
                    .into()
            }
            RelocateState::WriteTables => return self.write_tables(),
            RelocateState::WriteEnabledServices => match self.boot_rom {
                Some(rom) => {
                    WriteMemory::new(rom.enabled_services, self.enabled_services.clone(), DEFAULT_MAX_BLOCK_SIZE)
                        .into()
                }
                None => return Step::Finished(false),
            },
            RelocateState::ChangeTablePointers => match (self.boot_rom, &self.tables) {
                (Some(rom), Some(tables)) => {
                    WriteMemory::new(rom.table_pointers, table_pointers(tables), DEFAULT_MAX_BLOCK_SIZE)
                        .into()
                }
                _ => return Step::Finished(false),
            },
            RelocateState::Finished => return Step::Finished(true),
        };
        Step::Run(action)
    }

    fn completed(&mut self, cx: &mut Context<'_>, action: AnyAction, report: ActionReport) -> bool {
        if self.preamble.is_running() {
            return self.preamble.completed(cx, &action, report);
        }
        if !report.success {
            warn!(state = ?self.state, "relocating message handling tables failed");
            return false;
        }
        match self.state_completed(action) {
            Some(state) => {
                self.state = state;
                true
            }
            None => {
                warn!(state = ?self.state, "relocating message handling tables failed");
                false
            }
        }
    }
}
