//! C5: a minimal HTTP/1.1 server exposing `/api/<op>` as JSON over the shared [`Client`].
//!
//! Requests are parsed by hand (request line + header terminator only, body ignored) in
//! the same spirit as C4's manual MBAP parsing — no `axum`, no router crate, because the
//! whole surface is eight fixed routes plus a static page.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::client::Client;
use crate::error::BusError;

const INDEX_HTML: &str = include_str!("index.html");
const MAX_HEADER_BYTES: usize = 8192;

pub async fn serve(listener: TcpListener, client: Arc<Client>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("HTTP accept failed: {e}");
                continue;
            }
        };
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client).await {
                log::debug!("HTTP connection from {peer} closed: {e}");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, client: Arc<Client>) -> std::io::Result<()> {
    let head = match read_headers(&mut socket).await? {
        Some(head) => head,
        None => return Ok(()),
    };
    let Some(request_line) = head.lines().next() else {
        return Ok(());
    };
    let response = match parse_request_line(request_line) {
        Some((method, target)) if method == "GET" => route(target, &client).await,
        Some(_) => not_found(),
        None => return Ok(()),
    };
    socket.write_all(&response).await
}

async fn read_headers(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(512);
    let mut scratch = [0u8; 512];
    loop {
        let n = socket.read(&mut scratch).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&scratch[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            buf.truncate(pos);
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `METHOD SP PATH SP VERSION`; anything else is malformed.
fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.trim_end_matches('\r').split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    parts.next()?; // HTTP version, unchecked
    Some((method, target))
}

async fn route(target: &str, client: &Client) -> Vec<u8> {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let params = parse_query(query);
    match path {
        "/" => html_response(200, "OK", INDEX_HTML),
        "/api/read_coils" => read_bits_route(client, &params, BitOp::Coils).await,
        "/api/read_discrete" => read_bits_route(client, &params, BitOp::Discrete).await,
        "/api/read_holding" => read_registers_route(client, &params, RegisterOp::Holding).await,
        "/api/read_input" => read_registers_route(client, &params, RegisterOp::Input).await,
        "/api/write_coil" => write_coil_route(client, &params).await,
        "/api/write_single" => write_single_register_route(client, &params).await,
        "/api/write_coils" => write_coils_route(client, &params).await,
        "/api/write_multiple" => write_registers_route(client, &params).await,
        p if p.starts_with("/api/") => json_response(500, "Internal Server Error", &json!({"success": false, "error": "Unknown API endpoint"})),
        _ => not_found(),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(value);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct InputError(String);

fn parse_slave_id(params: &HashMap<String, String>) -> Result<u8, InputError> {
    let raw = params.get("slave_id").ok_or_else(|| InputError("missing slave_id".into()))?;
    let value: u32 = raw.trim().parse().map_err(|_| InputError("invalid slave_id".into()))?;
    if (1..=247).contains(&value) {
        Ok(value as u8)
    } else {
        Err(InputError("slave_id out of range".into()))
    }
}

fn parse_start_addr(params: &HashMap<String, String>) -> Result<u16, InputError> {
    let raw = params.get("start_addr").ok_or_else(|| InputError("missing start_addr".into()))?;
    raw.trim().parse().map_err(|_| InputError("invalid start_addr".into()))
}

fn parse_count(params: &HashMap<String, String>) -> Result<u16, InputError> {
    let raw = params.get("count").ok_or_else(|| InputError("missing count".into()))?;
    let value: u32 = raw.trim().parse().map_err(|_| InputError("invalid count".into()))?;
    if (1..=125).contains(&value) {
        Ok(value as u16)
    } else {
        Err(InputError("count out of range".into()))
    }
}

fn parse_register_value(params: &HashMap<String, String>) -> Result<u16, InputError> {
    let raw = params.get("value").ok_or_else(|| InputError("missing value".into()))?;
    let value: u32 = raw.trim().parse().map_err(|_| InputError("invalid value".into()))?;
    if value <= 0xFFFF {
        Ok(value as u16)
    } else {
        Err(InputError("value out of range".into()))
    }
}

/// `1, true, on, yes` (case-insensitive) are ON; everything else is OFF.
fn parse_coil_value(params: &HashMap<String, String>) -> Result<bool, InputError> {
    let raw = params.get("value").ok_or_else(|| InputError("missing value".into()))?;
    let lower = raw.trim().to_ascii_lowercase();
    Ok(matches!(lower.as_str(), "1" | "true" | "on" | "yes"))
}

fn parse_bool_list(raw: &str) -> Result<Vec<bool>, InputError> {
    raw.split(',')
        .map(|item| {
            let lower = item.trim().to_ascii_lowercase();
            match lower.as_str() {
                "1" | "true" | "on" | "yes" => Ok(true),
                "0" | "false" | "off" | "no" => Ok(false),
                other => other.parse::<u32>().map(|n| n != 0).map_err(|_| InputError(format!("invalid boolean in values: {other}"))),
            }
        })
        .collect()
}

fn parse_u16_list(raw: &str) -> Result<Vec<u16>, InputError> {
    raw.split(',')
        .map(|item| item.trim().parse::<u16>().map_err(|_| InputError(format!("invalid number in values: {}", item.trim()))))
        .collect()
}

enum BitOp {
    Coils,
    Discrete,
}

enum RegisterOp {
    Holding,
    Input,
}

async fn read_bits_route(client: &Client, params: &HashMap<String, String>, op: BitOp) -> Vec<u8> {
    let (slave_id, start_addr, count) = match (parse_slave_id(params), parse_start_addr(params), parse_count(params)) {
        (Ok(s), Ok(a), Ok(c)) => (s, a, c),
        (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => return input_error(e),
    };
    let result = match op {
        BitOp::Coils => client.read_coils(slave_id, start_addr, count).await,
        BitOp::Discrete => client.read_discrete_inputs(slave_id, start_addr, count).await,
    };
    match result {
        Ok(bits) => json_response(200, "OK", &json!({"success": true, "data": bits})),
        Err(e) => bus_error_response(e),
    }
}

async fn read_registers_route(client: &Client, params: &HashMap<String, String>, op: RegisterOp) -> Vec<u8> {
    let (slave_id, start_addr, count) = match (parse_slave_id(params), parse_start_addr(params), parse_count(params)) {
        (Ok(s), Ok(a), Ok(c)) => (s, a, c),
        (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => return input_error(e),
    };
    let result = match op {
        RegisterOp::Holding => client.read_holding_registers(slave_id, start_addr, count).await,
        RegisterOp::Input => client.read_input_registers(slave_id, start_addr, count).await,
    };
    match result {
        Ok(words) => json_response(200, "OK", &json!({"success": true, "data": words})),
        Err(e) => bus_error_response(e),
    }
}

async fn write_coil_route(client: &Client, params: &HashMap<String, String>) -> Vec<u8> {
    let (slave_id, start_addr, value) = match (parse_slave_id(params), parse_start_addr(params), parse_coil_value(params)) {
        (Ok(s), Ok(a), Ok(v)) => (s, a, v),
        (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => return input_error(e),
    };
    match client.write_single_coil(slave_id, start_addr, value).await {
        Ok(()) => json_response(200, "OK", &json!({"success": true, "message": "Coil written successfully"})),
        Err(e) => bus_error_response(e),
    }
}

async fn write_single_register_route(client: &Client, params: &HashMap<String, String>) -> Vec<u8> {
    let (slave_id, start_addr, value) = match (parse_slave_id(params), parse_start_addr(params), parse_register_value(params)) {
        (Ok(s), Ok(a), Ok(v)) => (s, a, v),
        (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => return input_error(e),
    };
    match client.write_single_register(slave_id, start_addr, value).await {
        Ok(()) => json_response(200, "OK", &json!({"success": true, "message": "Register written successfully"})),
        Err(e) => bus_error_response(e),
    }
}

async fn write_coils_route(client: &Client, params: &HashMap<String, String>) -> Vec<u8> {
    let slave_id = match parse_slave_id(params) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let start_addr = match parse_start_addr(params) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let values = match params.get("values").ok_or_else(|| InputError("missing values".into())).and_then(|raw| parse_bool_list(raw)) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let count = values.len();
    match client.write_multiple_coils(slave_id, start_addr, &values).await {
        Ok(()) => json_response(200, "OK", &json!({"success": true, "message": format!("Written {count} coils successfully")})),
        Err(BusError::IllegalDataValue) => input_error(InputError("values length out of range".into())),
        Err(e) => bus_error_response(e),
    }
}

async fn write_registers_route(client: &Client, params: &HashMap<String, String>) -> Vec<u8> {
    let slave_id = match parse_slave_id(params) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let start_addr = match parse_start_addr(params) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let values = match params.get("values").ok_or_else(|| InputError("missing values".into())).and_then(|raw| parse_u16_list(raw)) {
        Ok(v) => v,
        Err(e) => return input_error(e),
    };
    let count = values.len();
    match client.write_multiple_registers(slave_id, start_addr, &values).await {
        Ok(()) => json_response(200, "OK", &json!({"success": true, "message": format!("Written {count} registers successfully")})),
        Err(BusError::IllegalDataValue) => input_error(InputError("values length out of range".into())),
        Err(e) => bus_error_response(e),
    }
}

fn bus_error_response(err: BusError) -> Vec<u8> {
    match err {
        BusError::Timeout | BusError::CrcMismatch | BusError::FramingError => {
            json_response(200, "OK", &json!({"success": false, "error": "Communication timeout"}))
        }
        BusError::Exception(code) => json_response(200, "OK", &json!({"success": false, "error": format!("Modbus error: {code}")})),
        BusError::IllegalDataValue => input_error(InputError("illegal data value".into())),
    }
}

fn input_error(err: InputError) -> Vec<u8> {
    json_response(400, "Bad Request", &json!({"success": false, "error": err.0}))
}

fn json_response(status: u16, reason: &str, body: &Value) -> Vec<u8> {
    let encoded = body.to_string();
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{encoded}",
        encoded.len()
    )
    .into_bytes()
}

fn html_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn not_found() -> Vec<u8> {
    html_response(404, "Not Found", "<html><body>404 Not Found</body></html>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_handles_hex_escapes_and_plus() {
        assert_eq!(percent_decode("a%2Cb+c"), "a,b c");
    }

    #[test]
    fn parse_request_line_splits_three_fields() {
        assert_eq!(parse_request_line("GET /api/read_holding?slave_id=1 HTTP/1.1"), Some(("GET", "/api/read_holding?slave_id=1")));
        assert_eq!(parse_request_line("GET /"), None);
    }

    #[test]
    fn coil_value_parses_truthy_tokens_case_insensitively() {
        let mut params = HashMap::new();
        for token in ["1", "TRUE", "On", "yes"] {
            params.insert("value".to_string(), token.to_string());
            assert!(parse_coil_value(&params).unwrap());
        }
        params.insert("value".to_string(), "0".to_string());
        assert!(!parse_coil_value(&params).unwrap());
    }

    #[test]
    fn slave_id_out_of_range_is_rejected() {
        let mut params = HashMap::new();
        params.insert("slave_id".to_string(), "0".to_string());
        assert!(parse_slave_id(&params).is_err());
        params.insert("slave_id".to_string(), "248".to_string());
        assert!(parse_slave_id(&params).is_err());
        params.insert("slave_id".to_string(), "247".to_string());
        assert!(parse_slave_id(&params).is_ok());
    }

    #[test]
    fn bool_list_parses_mixed_tokens() {
        assert_eq!(parse_bool_list("1,0,1,1,0,0,0,0,1").unwrap(), vec![true, false, true, true, false, false, false, false, true]);
    }

    #[test]
    fn unknown_api_path_is_500() {
        let response = String::from_utf8(json_response(500, "Internal Server Error", &json!({"success": false, "error": "Unknown API endpoint"}))).unwrap();
        assert!(response.starts_with("HTTP/1.1 500"));
        assert!(response.contains("Unknown API endpoint"));
    }
}
