//! Simulated LED device for the SimpleMQ LED demo.
//!
//! The device announces four virtual LEDs on the broker and lets any number
//! of browser windows toggle them. Device capabilities travel as JSON on the
//! topic `/m2m/led/device`, browsers announce themselves on
//! `/m2m/led/display`, and LED commands arrive as two byte messages
//! addressed to the client's ephemeral topic ID.
//!
//! Run against a local broker:
//!
//! ```text
//! cargo run -- http://localhost/smq.lsp
//! ```

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use libsmq::client::{Buffers, Client, Event, Options, TopicAck};
use libsmq::error::Error;
use libsmq::transport::{Connection, TcpConnector};
use serde::Serialize;

const DEFAULT_URL: &str = "http://localhost/smq.lsp";
const DEVICE_NAME: &str = "Simulated device";

/// The fixed LED fixture of the simulated board. IDs are 1-based on the wire.
const LED_FIXTURE: [(&str, &str); 4] = [
    ("Power", "red"),
    ("Link", "yellow"),
    ("Status", "green"),
    ("Activity", "blue"),
];

#[derive(Serialize)]
struct Led {
    id: u8,
    name: &'static str,
    color: &'static str,
    on: bool,
}

#[derive(Serialize)]
struct DeviceInfo<'a> {
    ipaddr: &'a str,
    devname: &'static str,
    leds: [Led; 4],
}

/// In-memory stand-in for real LED hardware.
struct Board {
    leds: [bool; 4],
}

impl Board {
    fn new() -> Self {
        Board {
            leds: [false; LED_FIXTURE.len()],
        }
    }

    /// Sets an LED and reports the change on stdout. Returns false for IDs
    /// outside the fixture.
    fn set_led(&mut self, id: u8, on: bool) -> bool {
        let Some(slot) = usize::from(id)
            .checked_sub(1)
            .and_then(|ix| self.leds.get_mut(ix))
        else {
            return false;
        };
        *slot = on;
        let (name, _) = LED_FIXTURE[usize::from(id) - 1];
        println!("LED {id} ({name}) {}", if on { "on" } else { "off" });
        true
    }

    fn device_info<'a>(&self, ipaddr: &'a str) -> DeviceInfo<'a> {
        DeviceInfo {
            ipaddr,
            devname: DEVICE_NAME,
            leds: std::array::from_fn(|ix| {
                let (name, color) = LED_FIXTURE[ix];
                Led {
                    id: (ix + 1) as u8,
                    name,
                    color,
                    on: self.leds[ix],
                }
            }),
        }
    }
}

/// Publishes the board capabilities as JSON, the shape the browser UI
/// expects on `/m2m/led/device`.
fn send_device_info<C: Connection>(
    client: &mut Client<'_, C>,
    board: &Board,
    ipaddr: &str,
    tid: u32,
    subtid: u32,
) -> Result<(), Error> {
    let mut json = [0u8; 512];
    let len = serde_json_core::to_slice(&board.device_info(ipaddr), &mut json)
        .map_err(|_| Error::BufferOverflow)?;
    client.publish(&json[..len], tid, subtid)
}

/// Unwraps an accepted topic ack or reports why the broker said no.
fn topic_id(ack: &TopicAck<'_>, name: &str) -> Option<u32> {
    if ack.accepted {
        Some(ack.tid)
    } else {
        eprintln!(
            "Broker denied {name}: {}",
            String::from_utf8_lossy(ack.detail)
        );
        None
    }
}

/// Runs one broker session. Returns Ok on an orderly shutdown, an error when
/// the caller may want to reconnect.
fn run(url: &str) -> Result<(), Error> {
    let mut buf = [0u8; 1024];
    let mut connector = TcpConnector;
    let mut client = Client::init(&mut connector, url, Buffers::shared(&mut buf), Options::default())?;

    // The greeting carries our address as the broker sees it. The browser UI
    // shows it in the device tab.
    let ipaddr = client.broker_view_addr().to_owned();
    let uid = format!("rust-led-{:08x}", std::process::id());
    client.connect(uid.as_bytes(), None, Some(DEVICE_NAME.as_bytes()))?;
    println!("Connected to {url} as {uid} (broker sees {ipaddr})");

    client.create("/m2m/led/device")?;
    client.create_sub("devinfo")?;
    client.create_sub("led")?;
    client.subscribe("/m2m/led/display")?;

    let mut board = Board::new();
    let mut display_tid = 0u32;
    let mut device_tid = 0u32;
    let mut led_subtid = 0u32;
    let mut devinfo_subtid = 0u32;

    loop {
        let event = match client.get_message() {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => return Err(err),
        };
        match event {
            Event::SubAck(ack) => {
                let Some(tid) = topic_id(&ack, "/m2m/led/display") else {
                    return Ok(());
                };
                display_tid = tid;
            }
            Event::CreateAck(ack) => {
                let Some(tid) = topic_id(&ack, "/m2m/led/device") else {
                    return Ok(());
                };
                device_tid = tid;
                // Watch the subscriber count so we can log connected browsers.
                client.observe(device_tid)?;
            }
            Event::CreateSubAck(ack) => {
                let is_led = ack.detail == b"led";
                let Some(tid) = topic_id(&ack, "subtopic") else {
                    return Ok(());
                };
                if is_led {
                    led_subtid = tid;
                } else {
                    devinfo_subtid = tid;
                    // Acks arrive in request order, so the device topic ID is
                    // already known here. Announce the board to everyone.
                    send_device_info(&mut client, &board, &ipaddr, device_tid, devinfo_subtid)?;
                }
            }
            Event::SubChange { tid, subscribers } => {
                if tid == device_tid {
                    println!("Connected browsers: {subscribers}");
                }
            }
            Event::Publish(msg) => {
                let tid = msg.tid;
                let ptid = msg.ptid;
                let mut cmd = [0u8; 2];
                let have = msg.payload.len().min(cmd.len());
                cmd[..have].copy_from_slice(&msg.payload[..have]);
                if tid == display_tid {
                    // A new browser said hello. Send the capabilities to its
                    // ephemeral ID only.
                    send_device_info(&mut client, &board, &ipaddr, ptid, devinfo_subtid)?;
                } else if tid == client.client_tid() {
                    if have < 2 || !board.set_led(cmd[0], cmd[1] != 0) {
                        eprintln!("Peer {ptid:#x} sent an invalid LED command");
                        continue;
                    }
                    // Mirror the change to every display unit.
                    client.publish(&cmd, device_tid, led_subtid)?;
                } else {
                    eprintln!("Message on unknown topic {tid:#x}");
                }
            }
            Event::Disconnect { reason } => {
                if reason.is_empty() {
                    println!("Broker closed the session");
                } else {
                    println!(
                        "Broker closed the session: {}",
                        String::from_utf8_lossy(reason)
                    );
                }
                return Ok(());
            }
        }
    }
}

fn main() -> ExitCode {
    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_URL.to_owned());
    loop {
        match run(&url) {
            Ok(()) => return ExitCode::SUCCESS,
            Err(err @ (Error::BufferOverflow | Error::InvalidUrl | Error::ConnectionRefused(_))) => {
                eprintln!("Fatal: {err:?}");
                return ExitCode::FAILURE;
            }
            Err(err) => {
                eprintln!("Session ended: {err:?}, reconnecting in 3s");
                thread::sleep(Duration::from_secs(3));
            }
        }
    }
}
