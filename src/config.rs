//! C6 ambient config layer: startup parameters read from the command line with a
//! `clap` builder (the same style this codebase uses for its other binaries), rather
//! than the compiled-in constants the original firmware used.

use std::time::Duration;

use clap::{Arg, Command};

use crate::transceiver::TransceiverConfig;

pub struct Config {
    pub serial_path: String,
    pub baud_rate: u32,
    pub tcp_port: u16,
    pub http_port: u16,
    pub response_timeout: Duration,
    pub drain_delay: Duration,
    pub direction_guard: Duration,
}

impl Config {
    pub fn parse() -> Self {
        let matches = Command::new("modbus-gateway")
            .about("Bridges a Modbus RTU bus to Modbus TCP and an HTTP/JSON control API")
            .arg(
                Arg::new("serial")
                    .long("serial")
                    .value_name("PATH")
                    .help("serial device, e.g. /dev/ttyUSB0")
                    .default_value("/dev/ttyUSB0"),
            )
            .arg(
                Arg::new("baud")
                    .long("baud")
                    .value_name("BPS")
                    .help("UART baud rate")
                    .default_value("9600"),
            )
            .arg(
                Arg::new("tcp-port")
                    .long("tcp-port")
                    .value_name("PORT")
                    .help("Modbus TCP listen port")
                    .default_value("502"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP/JSON listen port")
                    .default_value("80"),
            )
            .arg(
                Arg::new("response-timeout-ms")
                    .long("response-timeout-ms")
                    .value_name("MS")
                    .help("RTU transaction deadline")
                    .default_value("1000"),
            )
            .arg(
                Arg::new("drain-delay-ms")
                    .long("drain-delay-ms")
                    .value_name("MS")
                    .help("delay after write before de-asserting DE")
                    .default_value("10"),
            )
            .arg(
                Arg::new("direction-guard-ms")
                    .long("direction-guard-ms")
                    .value_name("MS")
                    .help("settle time around each DE transition")
                    .default_value("1"),
            )
            .get_matches();

        let parse_u64 = |name: &str| -> u64 { matches.get_one::<String>(name).unwrap().parse().unwrap_or_else(|_| panic!("invalid --{name}")) };

        Self {
            serial_path: matches.get_one::<String>("serial").unwrap().clone(),
            baud_rate: parse_u64("baud") as u32,
            tcp_port: parse_u64("tcp-port") as u16,
            http_port: parse_u64("http-port") as u16,
            response_timeout: Duration::from_millis(parse_u64("response-timeout-ms")),
            drain_delay: Duration::from_millis(parse_u64("drain-delay-ms")),
            direction_guard: Duration::from_millis(parse_u64("direction-guard-ms")),
        }
    }

    pub fn transceiver_config(&self) -> TransceiverConfig {
        TransceiverConfig {
            response_timeout: self.response_timeout,
            drain_delay: self.drain_delay,
            direction_guard: self.direction_guard,
        }
    }
}
