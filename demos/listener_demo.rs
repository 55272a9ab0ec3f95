// ABOUTME: Demo application binding a listener and echoing every received ASDU back
// ABOUTME: Shows Listener::bind/accept paired with per-connection tasks

use argh::FromArgs;
use iec104_apci::ConnectionConfig;
use std::error::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Binds a socket and echoes every ASDU it receives back to the sender.
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable verbose logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the address to bind (default: 0.0.0.0:2404)
    #[argh(option)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::TRACE } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let bind_addr = cli_args.bind.unwrap_or_else(|| "0.0.0.0:2404".to_owned());
    let listener = iec104_apci::Listener::bind(&bind_addr, ConnectionConfig::default()).await?;
    println!("Listening on {}", listener.local_addr()?);

    loop {
        let (mut conn, peer) = listener.accept().await?;
        println!("Accepted connection from {peer}");

        tokio::spawn(async move {
            loop {
                match conn.receive().await {
                    Ok(asdu) => {
                        println!("Echoing {} bytes from {peer}", asdu.len());
                        if conn.send(asdu).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        println!("Connection to {peer} closed");
                        break;
                    }
                }
            }
        });
    }
}
