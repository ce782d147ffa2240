use std::fmt;
use std::future::Future;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bet::Bet;
use crate::config::ClientConfig;
use crate::protocol::{decode_count, decode_winners, ErrorReason, FrameIo, Request, Response};
use crate::Error;

/// Consecutive failed attempts tolerated before the session gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Chunk size after an oversize reply: `floor(chunk * 0.95)`, computed
/// without overflowing for any `usize`.
fn shrink(chunk_size: usize) -> usize {
    chunk_size - chunk_size.div_ceil(20)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SendingBets,
    SendingFinish,
    AskingWinners,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SendingBets => "send_bets",
            Stage::SendingFinish => "send_finish",
            Stage::AskingWinners => "ask_winners",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("gave up at {stage} after {failures} consecutive failures")]
    RetriesExhausted { stage: Stage, failures: u32 },
    #[error("could not encode request: {0}")]
    Encode(#[from] Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every bet was acknowledged and the draw was revealed.
    Completed { winners: Vec<String> },
    /// Shutdown was requested before the session could finish.
    Cancelled,
    /// The server refused the winners query for a reason other than the
    /// lottery still being open.
    WinnersRejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub chunk_size: usize,
    pub bets_sent: usize,
    pub failures: u32,
}

enum Flow {
    Continue,
    Cancelled,
}

/// Drives one agency through submit, finish, and winners polling.
///
/// Each request uses its own connection, and at most one is open at a time.
/// Cancelling the token drops the open connection and every loop exits at
/// its next check.
pub struct AgencySession {
    config: ClientConfig,
    cancel: CancellationToken,
    state: SessionState,
}

impl AgencySession {
    pub fn new(config: ClientConfig, cancel: CancellationToken) -> crate::Result<Self> {
        config.validate()?;
        let state = SessionState {
            chunk_size: config.chunk_size,
            bets_sent: 0,
            failures: 0,
        };
        Ok(Self {
            config,
            cancel,
            state,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn run(&mut self, bets: &[Bet]) -> Result<SessionOutcome, SessionError> {
        if let Flow::Cancelled = self.send_bets(bets).await? {
            return Ok(SessionOutcome::Cancelled);
        }
        if let Flow::Cancelled = self.send_finish().await? {
            return Ok(SessionOutcome::Cancelled);
        }
        self.poll_winners().await
    }

    async fn send_bets(&mut self, bets: &[Bet]) -> Result<Flow, SessionError> {
        while self.state.bets_sent < bets.len() {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let start = self.state.bets_sent;
            let end = bets.len().min(start.saturating_add(self.state.chunk_size));
            let request = Request::Bets {
                agency: self.config.agency,
                bets: bets[start..end].to_vec(),
            };

            let frame = match request.encode() {
                Ok(frame) => frame,
                Err(Error::PayloadTooLarge { declared }) => {
                    debug!(
                        "action: send_bets | result: oversize | client_id: {} | bytes: {}",
                        self.config.agency, declared
                    );
                    if let Flow::Cancelled = self.handle_oversize().await? {
                        return Ok(Flow::Cancelled);
                    }
                    continue;
                }
                Err(err) => {
                    if let Flow::Cancelled = self.record_failure(Stage::SendingBets, &err).await? {
                        return Ok(Flow::Cancelled);
                    }
                    continue;
                }
            };

            let Some(reply) = self.cancellable(self.exchange(&frame)).await else {
                return Ok(Flow::Cancelled);
            };
            let flow = match reply {
                Ok(Response::Success(payload)) => match decode_count(&payload) {
                    Ok(stored) => {
                        info!(
                            "action: send_bets | result: success | client_id: {} | stored: {} | sent: {}/{}",
                            self.config.agency,
                            stored,
                            end,
                            bets.len()
                        );
                        self.state.bets_sent = end;
                        self.state.failures = 0;
                        Flow::Continue
                    }
                    Err(err) => self.record_failure(Stage::SendingBets, &err).await?,
                },
                Ok(response) if response.reason() == Some(ErrorReason::MessageTooLong) => {
                    self.handle_oversize().await?
                }
                Ok(Response::Error(reason)) => {
                    self.record_failure(Stage::SendingBets, &reason).await?
                }
                Err(err) => self.record_failure(Stage::SendingBets, &err).await?,
            };
            if let Flow::Cancelled = flow {
                return Ok(Flow::Cancelled);
            }
        }
        Ok(Flow::Continue)
    }

    async fn send_finish(&mut self) -> Result<Flow, SessionError> {
        let frame = Request::Finish {
            agency: self.config.agency,
        }
        .encode()?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let Some(sent) = self.cancellable(self.notify(&frame)).await else {
                return Ok(Flow::Cancelled);
            };
            match sent {
                Ok(()) => {
                    info!("action: send_finish | result: success | client_id: {}", self.config.agency);
                    self.state.failures = 0;
                    return Ok(Flow::Continue);
                }
                Err(err) => {
                    if let Flow::Cancelled = self.record_failure(Stage::SendingFinish, &err).await? {
                        return Ok(Flow::Cancelled);
                    }
                }
            }
        }
    }

    async fn poll_winners(&mut self) -> Result<SessionOutcome, SessionError> {
        let frame = Request::AskWinners {
            agency: self.config.agency,
        }
        .encode()?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionOutcome::Cancelled);
            }
            let Some(reply) = self.cancellable(self.exchange(&frame)).await else {
                return Ok(SessionOutcome::Cancelled);
            };
            let flow = match reply {
                Ok(Response::Success(payload)) => match decode_winners(&payload) {
                    Ok(winners) => {
                        info!(
                            "action: ask_winners | result: success | client_id: {} | winners: {}",
                            self.config.agency,
                            winners.len()
                        );
                        return Ok(SessionOutcome::Completed { winners });
                    }
                    Err(err) => self.record_failure(Stage::AskingWinners, &err).await?,
                },
                Ok(response) if response.reason() == Some(ErrorReason::LotteryNotDone) => {
                    debug!(
                        "action: ask_winners | result: not_ready | client_id: {}",
                        self.config.agency
                    );
                    self.state.failures = 0;
                    match self.cancellable(tokio::time::sleep(self.config.poll_delay)).await {
                        Some(()) => Flow::Continue,
                        None => Flow::Cancelled,
                    }
                }
                Ok(Response::Error(reason)) => {
                    error!(
                        "action: ask_winners | result: fail | client_id: {} | error: {}",
                        self.config.agency, reason
                    );
                    return Ok(SessionOutcome::WinnersRejected { reason });
                }
                Err(err) => self.record_failure(Stage::AskingWinners, &err).await?,
            };
            if let Flow::Cancelled = flow {
                return Ok(SessionOutcome::Cancelled);
            }
        }
    }

    /// Shrinks the chunk for the next attempt. A single bet that is still
    /// too large cannot shrink and counts as a failure instead.
    async fn handle_oversize(&mut self) -> Result<Flow, SessionError> {
        let shrunk = shrink(self.state.chunk_size);
        if shrunk == 0 {
            return self
                .record_failure(Stage::SendingBets, &ErrorReason::MessageTooLong)
                .await;
        }
        warn!(
            "action: send_bets | result: oversize | client_id: {} | chunk_size: {} -> {}",
            self.config.agency, self.state.chunk_size, shrunk
        );
        self.state.chunk_size = shrunk;
        Ok(Flow::Continue)
    }

    async fn record_failure(
        &mut self,
        stage: Stage,
        cause: &(dyn fmt::Display + Sync),
    ) -> Result<Flow, SessionError> {
        self.state.failures += 1;
        let failures = self.state.failures;
        warn!(
            "action: {} | result: fail | client_id: {} | attempt: {}/{} | error: {}",
            stage, self.config.agency, failures, MAX_CONSECUTIVE_FAILURES, cause
        );
        if failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "action: {} | result: abort | client_id: {} | failures: {}",
                stage, self.config.agency, failures
            );
            return Err(SessionError::RetriesExhausted { stage, failures });
        }
        let backoff = self.config.retry_backoff * failures;
        match self.cancellable(tokio::time::sleep(backoff)).await {
            Some(()) => Ok(Flow::Continue),
            None => Ok(Flow::Cancelled),
        }
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            value = fut => Some(value),
        }
    }

    async fn connect(&self) -> crate::Result<FrameIo<TcpStream>> {
        let timeout = self.config.io_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.config.server_address))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(FrameIo::new(stream, timeout))
    }

    /// One request, one response, one connection.
    async fn exchange(&self, frame: &[u8]) -> crate::Result<Response> {
        let mut io = self.connect().await?;
        io.write_frame(frame).await?;
        io.read_response().await
    }

    /// Sends a frame that gets no reply and closes the connection.
    async fn notify(&self, frame: &[u8]) -> crate::Result<()> {
        let mut io = self.connect().await?;
        io.write_frame(frame).await?;
        io.shutdown().await
    }
}
