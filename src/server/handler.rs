use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ErrorReason, FrameIo, Request, Response, MAX_PAYLOAD_LEN};
use crate::server::barrier::Draw;
use crate::server::lottery::Lottery;
use crate::Error;

// Header, length field and the largest payload a peer may declare.
const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + 4;

/// Serves exactly one request on `stream`, then drops it.
///
/// Every failure ends here: decode and store errors become an ERROR frame,
/// transport errors are logged and the connection is abandoned.
pub(crate) async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    lottery: Arc<Lottery>,
    shutdown: CancellationToken,
    io_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut io = FrameIo::new(stream, io_timeout);

    // Nothing has been asked yet, so a pending shutdown can turn this peer
    // away. Once the header is in, the request runs to completion.
    let header = tokio::select! {
        header = io.read_header() => Some(header),
        _ = shutdown.cancelled() => None,
    };
    let header = match header {
        Some(Ok(header)) => header,
        Some(Err(err)) => {
            warn!("action: receive_message | result: fail | ip: {} | error: {}", peer.ip(), err);
            return;
        }
        None => {
            debug!("action: receive_message | result: rejected | ip: {} | reason: shutdown", peer.ip());
            respond(&mut io, peer, Response::error(ErrorReason::ServerClosing)).await;
            return;
        }
    };

    let request = match io.read_request(header).await {
        Ok(request) => request,
        Err(err) => {
            warn!(
                "action: receive_message | result: fail | ip: {} | agency: {} | error: {}",
                peer.ip(),
                header.agency,
                err
            );
            let Some(reason) = ErrorReason::for_error(&err) else {
                return;
            };
            respond(&mut io, peer, Response::error(reason)).await;
            // Unread inbound bytes would make the close reset the connection
            // under the reply, so take what the peer still sends.
            let pending = match err {
                Error::PayloadTooLarge { declared } => declared,
                _ => MAX_FRAME_LEN,
            };
            match io.discard(pending).await {
                Ok(drained) => debug!(
                    "action: drain_request | result: success | ip: {} | bytes: {}",
                    peer.ip(),
                    drained
                ),
                Err(err) => debug!(
                    "action: drain_request | result: fail | ip: {} | error: {}",
                    peer.ip(),
                    err
                ),
            }
            return;
        }
    };

    if let Some(response) = dispatch(request, peer, lottery).await {
        respond(&mut io, peer, response).await;
    }
}

async fn dispatch(request: Request, peer: SocketAddr, lottery: Arc<Lottery>) -> Option<Response> {
    match request {
        Request::Bets { agency, bets } => {
            let stored = tokio::task::spawn_blocking(move || lottery.submit(agency, &bets)).await;
            let response = match stored {
                Ok(Ok(count)) => {
                    info!("action: store_bets | result: success | agency: {} | count: {}", agency, count);
                    Response::stored(count)
                }
                Ok(Err(err)) => {
                    warn!("action: store_bets | result: fail | agency: {} | error: {}", agency, err);
                    Response::error(ErrorReason::for_error(&err).unwrap_or(ErrorReason::StoreFailure))
                }
                Err(join_err) => {
                    warn!("action: store_bets | result: fail | agency: {} | error: {}", agency, join_err);
                    Response::error(ErrorReason::StoreFailure)
                }
            };
            Some(response)
        }
        Request::Finish { agency } => {
            match lottery.finish(agency) {
                Ok(true) => info!(
                    "action: finish | result: success | agency: {} | finished: {}/{}",
                    agency,
                    lottery.barrier().finished_count(),
                    lottery.barrier().total()
                ),
                Ok(false) => debug!("action: finish | result: duplicate | agency: {}", agency),
                Err(err) => warn!(
                    "action: finish | result: fail | ip: {} | agency: {} | error: {}",
                    peer.ip(),
                    agency,
                    err
                ),
            }
            None
        }
        Request::AskWinners { agency } => {
            let draw = tokio::task::spawn_blocking({
                let lottery = Arc::clone(&lottery);
                move || lottery.winners(agency)
            })
            .await;
            let response = match draw {
                Ok(Ok(Draw::NotReady)) => {
                    debug!("action: ask_winners | result: not_ready | agency: {}", agency);
                    Response::error(ErrorReason::LotteryNotDone)
                }
                Ok(Ok(Draw::Winners(documents))) => {
                    info!(
                        "action: ask_winners | result: success | agency: {} | winners: {}",
                        agency,
                        documents.len()
                    );
                    Response::winners(&documents)
                }
                Ok(Err(err)) => {
                    warn!("action: ask_winners | result: fail | agency: {} | error: {}", agency, err);
                    Response::error(ErrorReason::for_error(&err).unwrap_or(ErrorReason::StoreFailure))
                }
                Err(join_err) => {
                    warn!("action: ask_winners | result: fail | agency: {} | error: {}", agency, join_err);
                    Response::error(ErrorReason::StoreFailure)
                }
            };
            Some(response)
        }
    }
}

async fn respond<S>(io: &mut FrameIo<S>, peer: SocketAddr, response: Response)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sent = match io.send_response(&response).await {
        Err(Error::PayloadTooLarge { declared }) => {
            warn!(
                "action: send_response | result: fail | ip: {} | error: response of {} bytes exceeds frame limit",
                peer.ip(),
                declared
            );
            io.send_response(&Response::error(ErrorReason::MessageTooLong))
                .await
        }
        other => other,
    };
    match sent {
        Ok(()) => {
            let _ = io.shutdown().await;
        }
        Err(err) => warn!("action: send_response | result: fail | ip: {} | error: {}", peer.ip(), err),
    }
}
