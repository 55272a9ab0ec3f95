// ABOUTME: Dials a peer and performs the STARTDT handshake before handing back a Connection
// ABOUTME: Tolerates S/I-frames and TESTFR_ACT/CON arriving while STARTDT_CON is awaited

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::apdu::{self, Apdu, UFunction};
use crate::config::ConnectionConfig;
use crate::connection::{read_one_apdu, Connection};
use crate::error::ConnectionError;

/// Dials `addr`, writes `STARTDT_ACT`, and waits (bounded by
/// `config.response_timeout`) for `STARTDT_CON`. Any S-frame, I-frame, or
/// `TESTFR_ACT`/`TESTFR_CON` U-frame seen in the meantime is discarded
/// (`TESTFR_ACT` is still answered with `TESTFR_CON`, since a compliant peer
/// may run its own test cycle concurrently with the handshake). The returned
/// `Connection` starts in the always-enabled state.
pub async fn connect<A: ToSocketAddrs>(addr: A, config: ConnectionConfig) -> Result<Connection, ConnectionError> {
    config.validate()?;

    let mut socket = TcpStream::connect(addr).await?;
    let _ = socket.set_nodelay(true);

    let startdt_act = apdu::encode(&Apdu::U(UFunction::StartDtAct));
    socket.write_all(&startdt_act).await?;
    socket.flush().await?;

    let mut buffer = BytesMut::with_capacity(256);
    tokio::time::timeout(
        config.response_timeout,
        wait_for_startdt_con(&mut socket, &mut buffer),
    )
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)??;

    Ok(Connection::new(socket, true, config))
}

async fn wait_for_startdt_con(socket: &mut TcpStream, buffer: &mut BytesMut) -> Result<(), ConnectionError> {
    loop {
        match read_one_apdu(socket, buffer).await? {
            Some(Apdu::U(UFunction::StartDtCon)) => return Ok(()),
            Some(Apdu::U(UFunction::TestFrAct)) => {
                let testfr_con = apdu::encode(&Apdu::U(UFunction::TestFrCon));
                socket.write_all(&testfr_con).await?;
                socket.flush().await?;
            }
            Some(other) => {
                debug!(?other, "discarding frame received before STARTDT_CON");
            }
            None => {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection during handshake",
                )));
            }
        }
    }
}
