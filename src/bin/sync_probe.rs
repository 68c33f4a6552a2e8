//! Bench tool for the WLED sync path: sends notifier packets at a bridge
//! without needing a real WLED instance.
//!
//! Usage:
//!     sync_probe <host:port> set <brightness> <r> <g> <b>
//!     sync_probe <host:port> off
//!     sync_probe <host:port> sweep [interval_ms]

use std::net::UdpSocket;
use std::time::Duration;

const NOTIFIER_DISCRIMINANT: u8 = 0;
const SWEEP_STEPS: u16 = 60;

fn packet(brightness: u8, r: u8, g: u8, b: u8) -> [u8; 6] {
    // byte 1 is the notifier's "seconds valid" field; the bridge ignores it
    [NOTIFIER_DISCRIMINANT, 2, brightness, r, g, b]
}

fn main() {
    if let Err(err) = run() {
        eprintln!("sync_probe: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let target = args.next().ok_or("missing target host:port")?;
    let command = args.next().ok_or("missing command (set|off|sweep)")?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(&target)?;

    match command.as_str() {
        "set" => {
            let mut next = || -> Result<u8, Box<dyn std::error::Error>> {
                Ok(args.next().ok_or("set needs <brightness> <r> <g> <b>")?.parse()?)
            };
            let brightness = next()?;
            let (r, g, b) = (next()?, next()?, next()?);
            socket.send(&packet(brightness, r, g, b))?;
            println!("sent bri={brightness} rgb=[{r},{g},{b}] to {target}");
        }
        "off" => {
            socket.send(&packet(0, 0, 0, 0))?;
            println!("sent off to {target}");
        }
        "sweep" => {
            let interval_ms: u64 = match args.next() {
                Some(raw) => raw.parse()?,
                None => 50,
            };
            // walk the hue wheel; rapid-fire packets exercise the bridge's
            // color debounce
            for step in 0..SWEEP_STEPS {
                let (r, g, b) = hue((f64::from(step)) / f64::from(SWEEP_STEPS));
                socket.send(&packet(255, r, g, b))?;
                std::thread::sleep(Duration::from_millis(interval_ms));
            }
            socket.send(&packet(0, 0, 0, 0))?;
            println!("swept {SWEEP_STEPS} colors at {interval_ms}ms to {target}");
        }
        other => return Err(format!("unknown command: {other}").into()),
    }

    Ok(())
}

fn hue(position: f64) -> (u8, u8, u8) {
    let sector = (position * 6.0) % 6.0;
    let ramp = (255.0 * sector.fract()) as u8;
    match sector as u32 {
        0 => (255, ramp, 0),
        1 => (255 - ramp, 255, 0),
        2 => (0, 255, ramp),
        3 => (0, 255 - ramp, 255),
        4 => (ramp, 0, 255),
        _ => (255, 0, 255 - ramp),
    }
}
