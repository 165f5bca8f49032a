//! C4: Modbus TCP listener on port 502. One task per connection; MBAP framing in,
//! MBAP framing out, PDU dispatched straight to the shared [`Client`].

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::client::Client;
use crate::codec::{pack_bits, unpack_bits};
use crate::error::BusError;

const BACKLOG_HINT: &str = "accept loop has no explicit backlog knob under tokio; OS default applies";

pub async fn serve(listener: TcpListener, client: Arc<Client>) {
    log::debug!("{BACKLOG_HINT}");
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("modbus TCP accept failed: {e}");
                continue;
            }
        };
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client).await {
                log::debug!("modbus TCP connection from {peer} closed: {e}");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, client: Arc<Client>) -> std::io::Result<()> {
    loop {
        let mut mbap = [0u8; 7];
        socket.read_exact(&mut mbap).await?;

        let txid = u16::from_be_bytes([mbap[0], mbap[1]]);
        let protocol_id = u16::from_be_bytes([mbap[2], mbap[3]]);
        let length = u16::from_be_bytes([mbap[4], mbap[5]]);
        let unit_id = mbap[6];

        if protocol_id != 0 {
            return Ok(());
        }
        if length == 0 {
            return Ok(());
        }

        let mut pdu = vec![0u8; (length - 1) as usize];
        socket.read_exact(&mut pdu).await?;

        let response_pdu = dispatch(&client, unit_id, &pdu).await;

        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&txid.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(unit_id);
        response.extend_from_slice(&response_pdu);

        socket.write_all(&response).await?;
    }
}

async fn dispatch(client: &Client, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let Some(&function) = pdu.first() else {
        return vec![0x80, 0x03];
    };
    match function {
        1 => read_bits(client, unit_id, pdu, 1).await,
        2 => read_bits(client, unit_id, pdu, 2).await,
        3 => read_registers(client, unit_id, pdu, 3).await,
        4 => read_registers(client, unit_id, pdu, 4).await,
        5 => write_single_coil(client, unit_id, pdu).await,
        6 => write_single_register(client, unit_id, pdu).await,
        15 => write_multiple_coils(client, unit_id, pdu).await,
        16 => write_multiple_registers(client, unit_id, pdu).await,
        _ => vec![function | 0x80, 0x01],
    }
}

fn bus_error_pdu(function: u8, err: BusError) -> Vec<u8> {
    match err {
        BusError::Exception(code) => vec![function | 0x80, code],
        BusError::IllegalDataValue => vec![function | 0x80, 0x03],
        BusError::Timeout | BusError::CrcMismatch | BusError::FramingError => vec![function | 0x80, 0x04],
    }
}

async fn read_bits(client: &Client, unit_id: u8, pdu: &[u8], function: u8) -> Vec<u8> {
    if pdu.len() < 5 {
        return vec![function | 0x80, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
    let result = if function == 1 {
        client.read_coils(unit_id, addr, count).await
    } else {
        client.read_discrete_inputs(unit_id, addr, count).await
    };
    match result {
        Ok(bits) => {
            let packed = pack_bits(&bits);
            let mut out = vec![function, packed.len() as u8];
            out.extend(packed);
            out
        }
        Err(e) => bus_error_pdu(function, e),
    }
}

async fn read_registers(client: &Client, unit_id: u8, pdu: &[u8], function: u8) -> Vec<u8> {
    if pdu.len() < 5 {
        return vec![function | 0x80, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
    let result = if function == 3 {
        client.read_holding_registers(unit_id, addr, count).await
    } else {
        client.read_input_registers(unit_id, addr, count).await
    };
    match result {
        Ok(words) => {
            let mut out = vec![function, (words.len() * 2) as u8];
            for w in words {
                out.extend_from_slice(&w.to_be_bytes());
            }
            out
        }
        Err(e) => bus_error_pdu(function, e),
    }
}

async fn write_single_coil(client: &Client, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    if pdu.len() < 5 {
        return vec![0x85, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let value = u16::from_be_bytes([pdu[3], pdu[4]]) == 0xFF00;
    match client.write_single_coil(unit_id, addr, value).await {
        Ok(()) => pdu[..5].to_vec(),
        Err(e) => bus_error_pdu(5, e),
    }
}

async fn write_single_register(client: &Client, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    if pdu.len() < 5 {
        return vec![0x86, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let value = u16::from_be_bytes([pdu[3], pdu[4]]);
    match client.write_single_register(unit_id, addr, value).await {
        Ok(()) => pdu[..5].to_vec(),
        Err(e) => bus_error_pdu(6, e),
    }
}

async fn write_multiple_coils(client: &Client, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    if pdu.len() < 6 {
        return vec![0x8F, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
    let byte_count = pdu[5] as usize;
    if pdu.len() < 6 + byte_count {
        return vec![0x8F, 0x03];
    }
    let values = unpack_bits(&pdu[6..6 + byte_count], count);
    match client.write_multiple_coils(unit_id, addr, &values).await {
        Ok(()) => {
            let mut out = vec![15];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        Err(e) => bus_error_pdu(15, e),
    }
}

async fn write_multiple_registers(client: &Client, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    if pdu.len() < 6 {
        return vec![0x90, 0x03];
    }
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
    let byte_count = pdu[5] as usize;
    if pdu.len() < 6 + byte_count || byte_count != count as usize * 2 {
        return vec![0x90, 0x03];
    }
    let values: Vec<u16> = pdu[6..6 + byte_count]
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect();
    match client.write_multiple_registers(unit_id, addr, &values).await {
        Ok(()) => {
            let mut out = vec![16];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        Err(e) => bus_error_pdu(16, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_function_is_illegal_function() {
        // Scenario 3: txid 0x00F3, unit 1, function 0x17.
        let err = bus_error_pdu(0x17, BusError::Exception(0x01));
        assert_eq!(err, vec![0x97, 0x01]);
    }

    #[test]
    fn bus_timeout_maps_to_device_failure() {
        assert_eq!(bus_error_pdu(0x03, BusError::Timeout), vec![0x83, 0x04]);
        assert_eq!(bus_error_pdu(0x03, BusError::CrcMismatch), vec![0x83, 0x04]);
        assert_eq!(bus_error_pdu(0x03, BusError::FramingError), vec![0x83, 0x04]);
    }

    #[test]
    fn illegal_data_value_maps_to_0x03() {
        assert_eq!(bus_error_pdu(0x01, BusError::IllegalDataValue), vec![0x81, 0x03]);
    }

    #[test]
    fn device_exception_code_is_preserved() {
        assert_eq!(bus_error_pdu(0x03, BusError::Exception(0x02)), vec![0x83, 0x02]);
    }
}
