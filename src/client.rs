//! C3: typed Modbus operations layered over the transceiver, with the per-function
//! count limits enforced before the bus is ever touched.

use std::sync::Arc;

use crate::codec::{pack_bits, unpack_bits};
use crate::error::BusError;
use crate::transceiver::Transceiver;

const MAX_BIT_READ: u16 = 2000;
const MAX_REGISTER_READ: u16 = 125;
const MAX_COIL_WRITE: usize = 1968;
const MAX_REGISTER_WRITE: usize = 123;

pub struct Client {
    transceiver: Arc<Transceiver>,
}

impl Client {
    pub fn new(transceiver: Arc<Transceiver>) -> Self {
        Self { transceiver }
    }

    pub async fn read_coils(&self, unit_id: u8, addr: u16, count: u16) -> Result<Vec<bool>, BusError> {
        self.read_bits(unit_id, 1, addr, count).await
    }

    pub async fn read_discrete_inputs(&self, unit_id: u8, addr: u16, count: u16) -> Result<Vec<bool>, BusError> {
        self.read_bits(unit_id, 2, addr, count).await
    }

    async fn read_bits(&self, unit_id: u8, function: u8, addr: u16, count: u16) -> Result<Vec<bool>, BusError> {
        if !(1..=MAX_BIT_READ).contains(&count) {
            return Err(BusError::IllegalDataValue);
        }
        let payload = request_payload(addr, count);
        let response = self.transceiver.transact(unit_id, function, &payload).await?;
        Ok(unpack_bits(&response[1..], count))
    }

    pub async fn read_holding_registers(&self, unit_id: u8, addr: u16, count: u16) -> Result<Vec<u16>, BusError> {
        self.read_registers(unit_id, 3, addr, count).await
    }

    pub async fn read_input_registers(&self, unit_id: u8, addr: u16, count: u16) -> Result<Vec<u16>, BusError> {
        self.read_registers(unit_id, 4, addr, count).await
    }

    async fn read_registers(&self, unit_id: u8, function: u8, addr: u16, count: u16) -> Result<Vec<u16>, BusError> {
        if !(1..=MAX_REGISTER_READ).contains(&count) {
            return Err(BusError::IllegalDataValue);
        }
        let payload = request_payload(addr, count);
        let response = self.transceiver.transact(unit_id, function, &payload).await?;
        Ok(response[1..]
            .chunks_exact(2)
            .take(count as usize)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect())
    }

    pub async fn write_single_coil(&self, unit_id: u8, addr: u16, value: bool) -> Result<(), BusError> {
        let word: u16 = if value { 0xFF00 } else { 0x0000 };
        let mut payload = addr.to_be_bytes().to_vec();
        payload.extend_from_slice(&word.to_be_bytes());
        self.transceiver.transact(unit_id, 5, &payload).await?;
        Ok(())
    }

    pub async fn write_single_register(&self, unit_id: u8, addr: u16, value: u16) -> Result<(), BusError> {
        let mut payload = addr.to_be_bytes().to_vec();
        payload.extend_from_slice(&value.to_be_bytes());
        self.transceiver.transact(unit_id, 6, &payload).await?;
        Ok(())
    }

    pub async fn write_multiple_coils(&self, unit_id: u8, addr: u16, values: &[bool]) -> Result<(), BusError> {
        if !(1..=MAX_COIL_WRITE).contains(&values.len()) {
            return Err(BusError::IllegalDataValue);
        }
        let packed = pack_bits(values);
        let mut payload = addr.to_be_bytes().to_vec();
        payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
        payload.push(packed.len() as u8);
        payload.extend_from_slice(&packed);
        self.transceiver.transact(unit_id, 15, &payload).await?;
        Ok(())
    }

    pub async fn write_multiple_registers(&self, unit_id: u8, addr: u16, values: &[u16]) -> Result<(), BusError> {
        if !(1..=MAX_REGISTER_WRITE).contains(&values.len()) {
            return Err(BusError::IllegalDataValue);
        }
        let mut payload = addr.to_be_bytes().to_vec();
        payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
        payload.push((values.len() * 2) as u8);
        for v in values {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        self.transceiver.transact(unit_id, 16, &payload).await?;
        Ok(())
    }
}

fn request_payload(addr: u16, count: u16) -> [u8; 4] {
    let mut payload = [0u8; 4];
    payload[0..2].copy_from_slice(&addr.to_be_bytes());
    payload[2..4].copy_from_slice(&count.to_be_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_is_addr_then_count_big_endian() {
        assert_eq!(request_payload(0x0010, 0x0009), [0x00, 0x10, 0x00, 0x09]);
    }

    #[test]
    fn limits_match_spec_table() {
        assert_eq!(MAX_BIT_READ, 2000);
        assert_eq!(MAX_REGISTER_READ, 125);
        assert_eq!(MAX_COIL_WRITE, 1968);
        assert_eq!(MAX_REGISTER_WRITE, 123);
    }
}
