//! SDM72D register catalog
//!
//! Register ids follow the meter documentation and are 1-based; the Modbus
//! wire address is always `id - 1`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the first two words of a register are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterType {
    /// IEEE-754 single precision, big-endian
    #[serde(rename = "float")]
    Float32BE,
    /// Two's-complement 32-bit integer, big-endian
    #[serde(rename = "int")]
    Int32BE,
}

/// Modbus register class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterClass {
    Holding,
    Input,
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterClass::Holding => f.write_str("holding"),
            RegisterClass::Input => f.write_str("input"),
        }
    }
}

/// A catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// 1-based id as listed in the meter documentation
    pub id: u16,
    /// Display name
    pub name: &'static str,
    /// Decode type
    pub register_type: RegisterType,
    /// Number of 16-bit words to read
    pub word_length: u16,
}

impl Register {
    pub const DEFAULT_WORD_LENGTH: u16 = 2;

    pub const fn float(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            register_type: RegisterType::Float32BE,
            word_length: Self::DEFAULT_WORD_LENGTH,
        }
    }

    pub const fn int(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            register_type: RegisterType::Int32BE,
            word_length: Self::DEFAULT_WORD_LENGTH,
        }
    }

    /// 0-based Modbus address
    pub const fn address(&self) -> u16 {
        self.id - 1
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

/// SDM72D holding registers
pub const HOLDING_REGISTERS: &[Register] = &[
    Register::float(13, "Pulse 1 Width"),
    Register::float(19, "Parity / Stop"),
    Register::float(21, "Modbus Address"),
    Register::float(23, "Pulse 1 Rate"),
    Register::float(25, "Password"),
    Register::float(29, "Network Baud Rate"),
    Register::float(59, "Time for scrolling display"),
    Register::float(61, "Time of back light"),
];

/// SDM72D input registers
pub const INPUT_REGISTERS: &[Register] = &[
    Register::float(53, "Total system power"),
    Register::float(73, "Import Wh since last reset"),
    Register::float(75, "Export Wh since last reset"),
    Register::float(343, "Total kwh"),
    Register::float(385, "Settable total kWh"),
    Register::float(389, "Settable import kWh"),
    Register::float(391, "Settable export kWh"),
    Register::float(1281, "Import power"),
    Register::float(1283, "Export power"),
];

/// Returns the catalog for a register class
pub fn catalog(class: RegisterClass) -> &'static [Register] {
    match class {
        RegisterClass::Holding => HOLDING_REGISTERS,
        RegisterClass::Input => INPUT_REGISTERS,
    }
}

/// Find a register by id or exact name.
///
/// A query that parses as a non-zero number matches by id, anything else
/// matches by name.
pub fn find_register(catalog: &'static [Register], query: &str) -> Option<&'static Register> {
    match query.trim().parse::<u16>() {
        Ok(id) if id != 0 => catalog.iter().find(|r| r.id == id),
        _ => catalog.iter().find(|r| r.name == query),
    }
}

/// Resolve a list of filter arguments against the input catalog, keeping the
/// order they were supplied in.
pub fn resolve_registers(
    catalog: &'static [Register],
    queries: &[String],
) -> Result<Vec<&'static Register>, crate::config::ConfigError> {
    queries
        .iter()
        .map(|q| {
            find_register(catalog, q)
                .ok_or_else(|| crate::config::ConfigError::UnknownRegister(q.clone()))
        })
        .collect()
}
