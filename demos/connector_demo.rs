// ABOUTME: Demo application connecting to an IEC 60870-5-104 peer and sending one ASDU
// ABOUTME: Shows the bare connect/send/drain/receive/close usage of the public API

use argh::FromArgs;
use bytes::Bytes;
use iec104_apci::ConnectionConfig;
use std::error::Error;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Connects to a server, sends one ASDU, and prints whatever comes back.
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable verbose logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the hostname or IP address of the server (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the port to connect to (default: 2404)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// hex-encoded ASDU payload to send (default: a single 0x00 byte)
    #[argh(option, short = 'm')]
    payload: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::TRACE } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| "localhost".to_owned());
    let port = cli_args.port.unwrap_or(2404);
    let payload = match cli_args.payload {
        Some(hex) => decode_hex(&hex)?,
        None => vec![0x00],
    };

    println!("Connecting to {host}:{port}");
    let mut conn = iec104_apci::connect(format!("{host}:{port}"), ConnectionConfig::default()).await?;
    println!("Handshake complete");

    conn.send(Bytes::from(payload))?;
    conn.drain().await?;
    println!("ASDU sent and flushed");

    match tokio::time::timeout(Duration::from_secs(5), conn.receive()).await {
        Ok(Ok(asdu)) => println!("Received {} bytes: {asdu:?}", asdu.len()),
        Ok(Err(err)) => eprintln!("Connection closed before a reply arrived: {err}"),
        Err(_) => println!("No reply within 5s"),
    }

    conn.close();
    Ok(())
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err("hex payload must have an even number of digits".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(Into::into))
        .collect()
}
