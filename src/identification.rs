//! Decoding of ReadECUIdentification data.
//!
//! The scaling table (option 0x81) describes how the value of every other
//! option is laid out. Each record is `[size, option, scaling bytes...]` and
//! the table ends with 0xFF. A scaling byte holds the type in the high and
//! the byte count in the low nibble.

use std::{collections::BTreeMap, fmt};

use strum::{Display, FromRepr};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
pub enum IdentificationOption {
    EcuIdentificationDataTable = 0x80,
    EcuIdentificationScalingTable = 0x81,
    VehicleManufacturerSpecific = 0x86,
    VehicleManufacturerSparePartNumber = 0x87,
    VehicleManufacturerEcuSoftwareNumber = 0x88,
    VehicleManufacturerEcuSoftwareVersionNumber = 0x89,
    SystemSupplier = 0x8A,
    EcuManufacturingDate = 0x8B,
    EcuSerialNumber = 0x8C,
    VehicleIdentificationNumber = 0x90,
    VehicleManufacturerEcuHardwareNumber = 0x91,
    SystemSupplierEcuHardwareNumber = 0x92,
    SystemSupplierEcuHardwareVersionNumber = 0x93,
    SystemSupplierEcuSoftwareNumber = 0x94,
    SystemSupplierEcuSoftwareVersionNumber = 0x95,
    ExhaustRegulationOrTypeApprovalNumber = 0x96,
    SystemNameOrEngineType = 0x97,
    RepairShopCodeOrTesterSerialNumber = 0x98,
    ProgrammingDate = 0x99,
    CalibrationRepairShopCodeOrEquipmentSerialNumber = 0x9A,
    CalibrationDate = 0x9B,
    /// Flash status on ME7
    CalibrationEquipmentSoftwareNumber = 0x9C,
    EcuInstallationDate = 0x9D,
}

pub const SCALING_TABLE_OPTION: u8 = IdentificationOption::EcuIdentificationScalingTable as u8;
pub const DATA_TABLE_OPTION: u8 = IdentificationOption::EcuIdentificationDataTable as u8;
pub const FLASH_STATUS_OPTION: u8 = IdentificationOption::CalibrationEquipmentSoftwareNumber as u8;

const END_OF_TABLE: u8 = 0xFF;

/// Readable name of an identification option
pub fn option_name(option: u8) -> String {
    match IdentificationOption::from_repr(option) {
        Some(known) => known.to_string(),
        None => format!("{option:#04x}"),
    }
}

pub mod flash_consistency {
    pub const CANNOT_BE_PROGRAMMED: u8 = 0x01;
    /// Last flash failed because of a communication error
    pub const COMMUNICATION_ERROR: u8 = 0x02;
    /// An erase failed because persistent data could not be copied
    pub const FLASH_DEFECT: u8 = 0x04;
    pub const EEPROM_ERROR: u8 = 0x08;
    /// Set while flashing, cleared by disconnecting after a complete flash
    pub const INCONSISTENT: u8 = 0x80;
}

const PRECONDITION_DESCRIPTIONS: [&str; 8] = [
    "Engine is running",
    "Immobilizer not authenticated",
    "Security lockout countdown is running",
    "Unknown precondition 3",
    "Unknown precondition 4",
    "Unknown precondition 5",
    "Unknown precondition 6",
    "Unknown precondition 7",
];

/// Contents of the flash status identification option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlashStatus {
    pub consistency: u8,
    pub attempts: u8,
    pub successful_attempts: u8,
    /// Bit field of programming session preconditions that are not met
    pub preconditions: u8,
}

impl FlashStatus {
    pub const LENGTH: usize = 4;

    /// Missing trailing bytes read as zero
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let byte = |index: usize| bytes.get(index).copied().unwrap_or(0);
        Self {
            consistency: byte(0),
            attempts: byte(1),
            successful_attempts: byte(2),
            preconditions: byte(3),
        }
    }

    pub fn preconditions_met(&self) -> bool {
        self.preconditions == 0
    }

    /// Descriptions of every precondition that is not met
    pub fn failed_preconditions(&self) -> Vec<&'static str> {
        PRECONDITION_DESCRIPTIONS
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.preconditions & (1 << bit) != 0)
            .map(|(_, description)| *description)
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency & flash_consistency::INCONSISTENT == 0
    }
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "consistency {:#04x}, {} of {} flash attempts successful",
            self.consistency, self.successful_attempts, self.attempts
        )?;
        for reason in self.failed_preconditions() {
            write!(f, ", {reason}")?;
        }
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
pub enum ScalingType {
    UnsignedNumeric = 0,
    SignedNumeric = 1,
    BitMappedWithoutMask = 2,
    BitMappedWithMask = 3,
    BinaryCodedDecimal = 4,
    StateEncoded = 5,
    Ascii = 6,
    SignedFloatingPoint = 7,
    Packet = 8,
    Formula = 9,
    UnitFormula = 10,
    UnsignedNumericWithIndication = 11,
    VehicleManufacturerSpecific1 = 12,
    VehicleManufacturerSpecific2 = 13,
    VehicleManufacturerSpecific3 = 14,
    Reserved = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingEntry {
    pub kind: ScalingType,
    pub size: u8,
}

impl ScalingEntry {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            kind: ScalingType::from_repr(byte >> 4).unwrap_or(ScalingType::Reserved),
            size: byte & 0x0F,
        }
    }

    /// Formats the value at `offset` in `data`, `?` when it can't be decoded.
    pub fn format(&self, data: &[u8], offset: usize) -> String {
        let size = self.size as usize;
        if size == 0 || data.len() < offset + size {
            return "?".into();
        }
        let bytes = &data[offset..offset + size];

        match self.kind {
            ScalingType::UnsignedNumeric => {
                let value = bytes.iter().fold(0u128, |value, b| value << 8 | *b as u128);
                format!("0x{value:0width$X}", width = size * 2)
            }
            ScalingType::SignedNumeric => match *bytes {
                [a] => (a as i8).to_string(),
                [a, b] => i16::from_le_bytes([a, b]).to_string(),
                [a, b, c, d] => i32::from_le_bytes([a, b, c, d]).to_string(),
                [a, b, c, d, e, f, g, h] => i64::from_le_bytes([a, b, c, d, e, f, g, h]).to_string(),
                _ => "?".into(),
            },
            ScalingType::BinaryCodedDecimal => bytes
                .iter()
                .map(|b| format!("{}{}", (b >> 4).min(9), (b & 0x0F).min(9)))
                .collect(),
            ScalingType::StateEncoded => bytes[0].to_string(),
            ScalingType::Ascii => {
                // only the first byte decides whether the value is blank
                if bytes[0] == 0 {
                    String::new()
                } else {
                    bytes.iter().map(|b| *b as char).collect()
                }
            }
            ScalingType::SignedFloatingPoint => match *bytes {
                [a, b, c, d] => f32::from_le_bytes([a, b, c, d]).to_string(),
                [a, b, c, d, e, f, g, h] => f64::from_le_bytes([a, b, c, d, e, f, g, h]).to_string(),
                _ => "?".into(),
            },
            _ => "?".into(),
        }
    }
}

/// Scaling of one identification option.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScalingRecord {
    pub option: u8,
    pub entries: Vec<ScalingEntry>,
}

impl ScalingRecord {
    pub fn from_bytes(record: &[u8]) -> Self {
        match record {
            [size, option, scaling @ ..] if *size != END_OF_TABLE => Self {
                option: *option,
                entries: scaling.iter().map(|b| ScalingEntry::from_byte(*b)).collect(),
            },
            _ => Self::default(),
        }
    }

    /// One string per entry, each consuming its size in bytes of `data`
    pub fn format_values(&self, data: &[u8]) -> Vec<String> {
        let mut offset = 0;
        self.entries
            .iter()
            .map(|entry| {
                let value = entry.format(data, offset);
                offset += entry.size as usize;
                value
            })
            .collect()
    }

    pub fn format(&self, data: &[u8]) -> String {
        self.format_values(data).join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScalingTable {
    data: Vec<u8>,
    records: Vec<ScalingRecord>,
}

impl ScalingTable {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut records = Vec::new();
        let mut offset = 0;
        while let Some(size) = data.get(offset).map(|s| *s as usize) {
            if size == END_OF_TABLE as usize || size == 0 || offset + size > data.len() {
                break;
            }
            if size >= 2 {
                records.push(ScalingRecord::from_bytes(&data[offset..offset + size]));
            }
            offset += size;
        }

        Self {
            data: data.to_vec(),
            records,
        }
    }

    pub fn records(&self) -> &[ScalingRecord] {
        &self.records
    }

    /// Options the table has a record for, in table order
    pub fn options(&self) -> Vec<u8> {
        self.records.iter().map(|r| r.option).collect()
    }

    /// The record describing `option`.
    ///
    /// The data table is described by the whole scaling table read as one
    /// record.
    pub fn record(&self, option: u8) -> Option<ScalingRecord> {
        if self.records.is_empty() {
            return None;
        }
        if option == DATA_TABLE_OPTION {
            return Some(ScalingRecord::from_bytes(&self.data));
        }
        self.records.iter().find(|r| r.option == option).cloned()
    }
}

/// Everything read by a full identification pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentificationInfo {
    pub scaling_table: ScalingTable,
    pub values: BTreeMap<u8, Vec<u8>>,
}

impl IdentificationInfo {
    pub fn value(&self, option: u8) -> Option<String> {
        let data = self.values.get(&option)?;
        Some(self.scaling_table.record(option)?.format(data))
    }

    pub fn flash_status(&self) -> Option<FlashStatus> {
        self.values
            .get(&FLASH_STATUS_OPTION)
            .filter(|data| data.len() >= FlashStatus::LENGTH)
            .map(|data| FlashStatus::from_bytes(data))
    }
}

impl fmt::Display for IdentificationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for option in self.values.keys() {
            if let Some(value) = self.value(*option) {
                writeln!(f, "{}: {value}", option_name(*option))?;
            }
        }
        Ok(())
    }
}
