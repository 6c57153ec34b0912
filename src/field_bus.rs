//! Field-Bus Adapter: named register read/write over Modbus-TCP.
//!
//! Callers address registers by name, never by address; this module owns
//! the name→address resolution, 16-bit sign extension, PV-register
//! filtering, and routing every write through the [`WriteGuard`].

use crate::error::{EdgeError, Result};
use crate::logging::get_unit_logger;
use crate::registers::{RegisterMap, RegisterType};
use crate::write_guard::WriteGuard;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Async Modbus-TCP adapter scoped to one battery/inverter unit.
pub struct FieldBusAdapter {
    consus_id: String,
    addr: SocketAddr,
    unit_id: u8,
    register_map: RegisterMap,
    client: Option<tokio_modbus::client::Context>,
    logger: crate::logging::StructuredLogger,
}

impl FieldBusAdapter {
    /// Create a new adapter. Connection is established lazily on first use.
    pub fn new(consus_id: impl Into<String>, addr: SocketAddr, unit_id: u8, register_map: RegisterMap) -> Self {
        let consus_id = consus_id.into();
        let logger = get_unit_logger("field_bus", &consus_id);
        Self {
            consus_id,
            addr,
            unit_id,
            register_map,
            client: None,
            logger,
        }
    }

    /// Establish the TCP connection if not already connected. Idempotent.
    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        self.logger.info(&format!("connecting to {}", self.addr));
        match timeout(CONNECT_TIMEOUT, tcp::connect(self.addr)).await {
            Ok(Ok(ctx)) => {
                self.client = Some(ctx);
                self.logger.info("connected");
                Ok(())
            }
            Ok(Err(e)) => {
                let msg = format!("failed to connect to {}: {e}", self.addr);
                self.logger.error(&msg);
                Err(EdgeError::field_bus(msg))
            }
            Err(_) => {
                self.logger.error("connection timed out");
                Err(EdgeError::timeout("field-bus connect"))
            }
        }
    }

    /// Tear down the connection. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.client = None;
    }

    /// Whether the adapter currently holds an open connection.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Read a single named register, applying 16-bit sign extension when
    /// the register definition says so.
    pub async fn read(&mut self, name: &str) -> Result<i32> {
        let reg = self
            .register_map
            .get(name)
            .ok_or_else(|| EdgeError::field_bus(format!("unknown register: {name}")))?
            .clone();

        self.connect().await?;
        let unit_id = self.unit_id;
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| EdgeError::field_bus("not connected"))?;
        client.set_slave(Slave(unit_id));

        let request = client.read_holding_registers(reg.address, 1);
        let raw = match timeout(OPERATION_TIMEOUT, request).await {
            Ok(Ok(Ok(regs))) => regs[0],
            Ok(Ok(Err(e))) => {
                return Err(EdgeError::field_bus(format!("read error at {}: {e}", reg.address)));
            }
            Ok(Err(e)) => return Err(EdgeError::field_bus(format!("read failed at {}: {e}", reg.address))),
            Err(_) => return Err(EdgeError::timeout(format!("read timeout at {}", reg.address))),
        };

        Ok(sign_extend(raw, reg.signed))
    }

    /// Write a value to a named register, through the write guard. Only
    /// `int16`/`uint16` registers may be written.
    pub async fn write(&mut self, name: &str, value: i32) -> Result<bool> {
        let reg = self
            .register_map
            .get(name)
            .ok_or_else(|| EdgeError::field_bus(format!("unknown register: {name}")))?
            .clone();

        if !reg.reg_type.is_writable_word() {
            return Err(EdgeError::field_bus(format!(
                "unsupported register type for write: {:?} at {}",
                reg.reg_type, reg.address
            )));
        }

        self.connect().await?;
        let address = reg.address;
        let unit_id = self.unit_id;
        let raw = value as u16;
        let consus_id = self.consus_id.clone();
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| EdgeError::field_bus("not connected"))?;

        // The write guard's lock is held across the actual network write,
        // making it the single serialization point for writes across units.
        let outcome = WriteGuard::attempt(address, value, || async {
            client.set_slave(Slave(unit_id));
            match timeout(OPERATION_TIMEOUT, client.write_single_register(address, raw)).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(EdgeError::field_bus(format!("write error at {address}: {e}"))),
                Ok(Err(e)) => Err(EdgeError::field_bus(format!("write failed at {address}: {e}"))),
                Err(_) => Err(EdgeError::timeout(format!("write timeout at {address}"))),
            }
        })
        .await?;

        if outcome.was_accepted() {
            self.logger
                .debug(&format!("[{consus_id}] wrote {value} to {name} (addr {address})"));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Bulk-read every register in the map, returning ∅ for individual read
    /// failures and continuing. PV-related registers are skipped when
    /// `include_pv` is false.
    pub async fn read_all(&mut self, include_pv: bool) -> HashMap<String, Option<i32>> {
        let mut values = HashMap::new();
        let names: Vec<String> = self
            .register_map
            .read_registers
            .iter()
            .map(|r| r.name.clone())
            .collect();

        for name in names {
            if !include_pv && RegisterMap::is_pv_register(&name) {
                continue;
            }
            match self.read(&name).await {
                Ok(v) => {
                    values.insert(name, Some(v));
                }
                Err(e) => {
                    self.logger.warn(&format!("skipped {name}: {e}"));
                    values.insert(name, None);
                }
            }
        }
        values
    }
}

fn sign_extend(raw: u16, signed: bool) -> i32 {
    if signed && raw > 0x7FFF {
        i32::from(raw) - 0x1_0000
    } else {
        i32::from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(sign_extend(100, true), 100);
        assert_eq!(sign_extend(100, false), 100);
    }

    #[test]
    fn test_sign_extend_negative() {
        // 0xFFFF as a signed int16 is -1
        assert_eq!(sign_extend(0xFFFF, true), -1);
        // unsigned interpretation keeps the full positive value
        assert_eq!(sign_extend(0xFFFF, false), 65535);
    }

    #[test]
    fn test_sign_extend_boundary() {
        assert_eq!(sign_extend(0x7FFF, true), 32767);
        assert_eq!(sign_extend(0x8000, true), -32768);
    }
}
