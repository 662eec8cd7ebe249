//! MeterBridge - SDM72D meter reader and Modbus TCP gateway
//!
//! Reads an energy meter over Modbus RTU or TCP, either once to print a
//! snapshot or continuously as a gateway serialising TCP clients onto the
//! single physical link.

pub mod bridge;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod modbus;
pub mod registers;
