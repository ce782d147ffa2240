use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lottery::protocol::{
    decode_count, decode_winners, encode_bets, ErrorReason, FrameIo, MessageType, Request, Response,
};
use lottery::{Bet, BetStore, Lottery, Server, ServerConfig, WinningNumber};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);
const WINNER: &str = "7574";

struct Harness {
    addr: SocketAddr,
    shutdown: CancellationToken,
    lottery: Arc<Lottery>,
    task: JoinHandle<lottery::Result<()>>,
}

async fn start(dir: &Path, agencies: u8, max_workers: usize) -> Harness {
    let mut config = ServerConfig::new("127.0.0.1:0", dir.join("bets.csv"), agencies);
    config.max_workers = max_workers;
    config.io_timeout = TIMEOUT;
    let store = BetStore::open(&config.store_path).expect("store open");
    let lottery = Lottery::new(store, agencies, WinningNumber::default());
    let server = Server::bind(&config, lottery).await.expect("bind");
    Harness {
        addr: server.local_addr().expect("local addr"),
        shutdown: server.shutdown_token(),
        lottery: server.lottery(),
        task: tokio::spawn(server.run()),
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("server drained in time")
            .expect("server task")
            .expect("server run");
    }

    fn stored(&self) -> usize {
        self.lottery.store().len().expect("store len")
    }
}

fn bet(agency: u8, document: &str, number: &str) -> Bet {
    Bet::new(agency, "Valentina", "Suarez", document, "1995-07-21", number).expect("bet")
}

async fn connect(addr: SocketAddr) -> FrameIo<TcpStream> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    FrameIo::new(stream, TIMEOUT)
}

async fn exchange(addr: SocketAddr, request: &Request) -> Response {
    let mut io = connect(addr).await;
    io.send_request(request).await.expect("send request");
    io.read_response().await.expect("read response")
}

async fn exchange_raw(addr: SocketAddr, frame: &[u8]) -> Response {
    let mut io = connect(addr).await;
    io.write_frame(frame).await.expect("send frame");
    io.read_response().await.expect("read response")
}

async fn submit(addr: SocketAddr, agency: u8, bets: Vec<Bet>) -> Response {
    exchange(addr, &Request::Bets { agency, bets }).await
}

/// Sends FINISH and waits until the server has dropped the connection, which
/// happens only after the barrier was updated.
async fn finish(addr: SocketAddr, agency: u8) {
    let frame = Request::Finish { agency }.encode().expect("encode");
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&frame).await.expect("send finish");
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("finish acknowledged by close")
        .expect("read to end");
    assert!(rest.is_empty(), "FINISH must not get a reply frame");
}

async fn ask_winners(addr: SocketAddr, agency: u8) -> Response {
    exchange(addr, &Request::AskWinners { agency }).await
}

fn success_payload(response: Response) -> Vec<u8> {
    match response {
        Response::Success(payload) => payload,
        Response::Error(reason) => panic!("expected success, got error: {reason}"),
    }
}

#[tokio::test]
async fn winners_are_hidden_until_every_agency_finishes() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 3, 4).await;

    let reply = submit(
        server.addr,
        1,
        vec![bet(1, "111", WINNER), bet(1, "112", "1"), bet(1, "113", WINNER)],
    )
    .await;
    assert_eq!(decode_count(&success_payload(reply)).expect("count"), 3);
    let reply = submit(server.addr, 2, vec![bet(2, "211", WINNER)]).await;
    assert_eq!(decode_count(&success_payload(reply)).expect("count"), 1);

    finish(server.addr, 1).await;
    finish(server.addr, 2).await;
    let reply = ask_winners(server.addr, 1).await;
    assert_eq!(reply.reason(), Some(ErrorReason::LotteryNotDone));

    finish(server.addr, 3).await;
    let winners = decode_winners(&success_payload(ask_winners(server.addr, 1).await)).expect("winners");
    assert_eq!(winners, vec!["111".to_string(), "113".to_string()]);

    // Finished agencies cannot move the draw.
    let reply = submit(server.addr, 1, vec![bet(1, "114", WINNER)]).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));
    let again = decode_winners(&success_payload(ask_winners(server.addr, 1).await)).expect("winners");
    assert_eq!(again, winners);

    let agency_two = decode_winners(&success_payload(ask_winners(server.addr, 2).await)).expect("winners");
    assert_eq!(agency_two, vec!["211".to_string()]);
    assert_eq!(server.stored(), 4);

    server.stop().await;
}

#[tokio::test]
async fn agency_without_winners_gets_empty_success() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 1, 2).await;

    submit(server.addr, 1, vec![bet(1, "1", "10"), bet(1, "2", "20")]).await;
    finish(server.addr, 1).await;

    let payload = success_payload(ask_winners(server.addr, 1).await);
    assert!(payload.is_empty());
    assert!(decode_winners(&payload).expect("winners").is_empty());

    server.stop().await;
}

#[tokio::test]
async fn oversize_declaration_is_rejected_regardless_of_payload() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 2, 2).await;

    // A perfectly valid batch, just declared too long.
    let valid = encode_bets(&[bet(1, "1", WINNER)]).expect("encode");
    let mut payload = valid.clone();
    payload.resize(9000, b'x');
    for body in [payload, vec![0u8; 9000]] {
        let mut frame = vec![MessageType::Bets.as_u8(), 1];
        frame.extend_from_slice(&9000u16.to_le_bytes());
        frame.extend_from_slice(&body);
        let reply = exchange_raw(server.addr, &frame).await;
        assert_eq!(reply.reason(), Some(ErrorReason::MessageTooLong));
    }
    assert_eq!(server.stored(), 0);

    // The limit itself is accepted.
    let mut frame = vec![MessageType::Bets.as_u8(), 1];
    let mut at_limit = valid;
    at_limit.extend(std::iter::repeat(b'y').take(8190 - at_limit.len()));
    frame.extend_from_slice(&(at_limit.len() as u16).to_le_bytes());
    frame.extend_from_slice(&at_limit);
    let reply = exchange_raw(server.addr, &frame).await;
    assert_eq!(decode_count(&success_payload(reply)).expect("count"), 1);

    server.stop().await;
}

#[tokio::test]
async fn malformed_batch_leaves_store_untouched() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 2, 2).await;

    submit(server.addr, 1, vec![bet(1, "1", "10")]).await;
    assert_eq!(server.stored(), 1);

    let good = encode_bets(&[bet(1, "2", "20")]).expect("encode");
    let mut payload = good.clone();
    payload.push(b'\n');
    payload.extend_from_slice(b"Ana\0Diaz\030904465\01999-03-17");
    let mut frame = vec![MessageType::Bets.as_u8(), 1];
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);

    let reply = exchange_raw(server.addr, &frame).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));
    assert_eq!(server.stored(), 1);

    server.stop().await;
}

#[tokio::test]
async fn unknown_type_and_agency_get_generic_error() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 2, 2).await;

    let reply = exchange_raw(server.addr, &[3, 1]).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));

    let reply = submit(server.addr, 7, vec![bet(7, "1", "10")]).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));
    let reply = ask_winners(server.addr, 0).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));

    finish(server.addr, 9).await;
    assert_eq!(server.lottery.barrier().finished_count(), 0);
    assert_eq!(server.stored(), 0);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_agencies_store_every_record() {
    const AGENCIES: u8 = 6;
    const BATCHES: usize = 8;
    const BATCH_LEN: usize = 30;

    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), AGENCIES, 3).await;
    let addr = server.addr;

    let clients: Vec<_> = (1..=AGENCIES)
        .map(|agency| {
            tokio::spawn(async move {
                let mut acknowledged = 0;
                for batch in 0..BATCHES {
                    let bets = (0..BATCH_LEN)
                        .map(|i| bet(agency, &format!("{agency}{batch:02}{i:02}"), "5"))
                        .collect();
                    let reply = submit(addr, agency, bets).await;
                    acknowledged += decode_count(&success_payload(reply)).expect("count");
                }
                acknowledged
            })
        })
        .collect();

    for client in clients {
        assert_eq!(client.await.expect("client task"), BATCHES * BATCH_LEN);
    }

    let stored = server.lottery.store().load_all().expect("load");
    assert_eq!(stored.len(), AGENCIES as usize * BATCHES * BATCH_LEN);
    for agency in 1..=AGENCIES {
        assert_eq!(
            stored.iter().filter(|b| b.agency == agency).count(),
            BATCHES * BATCH_LEN
        );
    }

    server.stop().await;
}

#[tokio::test]
async fn saturated_pool_defers_new_connections() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 1, 1).await;

    // Occupy the only worker with a half-sent batch.
    let frame = Request::Bets {
        agency: 1,
        bets: vec![bet(1, "1", "10")],
    }
    .encode()
    .expect("encode");
    let (head, tail) = frame.split_at(5);
    let mut slow = TcpStream::connect(server.addr).await.expect("connect");
    slow.write_all(head).await.expect("write head");

    // Queued behind it: no reply while the worker is busy.
    let mut waiting = connect(server.addr).await;
    waiting
        .send_request(&Request::AskWinners { agency: 1 })
        .await
        .expect("send ask");
    let mut probe = [0u8; 1];
    let early = tokio::time::timeout(
        Duration::from_millis(300),
        waiting.get_ref().peek(&mut probe),
    )
    .await;
    assert!(early.is_err(), "second connection was served while the pool was full");

    slow.write_all(tail).await.expect("write tail");
    let mut slow_io = FrameIo::new(slow, TIMEOUT);
    let reply = slow_io.read_response().await.expect("slow reply");
    assert_eq!(decode_count(&success_payload(reply)).expect("count"), 1);

    let reply = waiting.read_response().await.expect("deferred reply");
    assert_eq!(reply.reason(), Some(ErrorReason::LotteryNotDone));

    server.stop().await;
}

#[tokio::test]
async fn shutdown_drains_in_flight_requests() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 1, 2).await;

    let frame = Request::Bets {
        agency: 1,
        bets: vec![bet(1, "1", "10"), bet(1, "2", "20")],
    }
    .encode()
    .expect("encode");
    let (head, tail) = frame.split_at(6);
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");
    stream.write_all(head).await.expect("write head");
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.task.is_finished(), "server exited with a request in flight");
    assert!(TcpStream::connect(server.addr).await.is_err(), "listener still open");

    stream.write_all(tail).await.expect("write tail");
    let mut io = FrameIo::new(stream, TIMEOUT);
    let reply = io.read_response().await.expect("reply");
    assert_eq!(decode_count(&success_payload(reply)).expect("count"), 2);
    assert_eq!(server.stored(), 2);

    server.stop().await;
}

#[tokio::test]
async fn idle_connection_is_turned_away_on_shutdown() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 1, 2).await;

    let mut idle = connect(server.addr).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.shutdown.cancel();

    let reply = idle.read_response().await.expect("closing reply");
    assert_eq!(reply.reason(), Some(ErrorReason::ServerClosing));

    server.stop().await;
}

#[tokio::test]
async fn rejected_request_with_trailing_bytes_still_gets_its_reply() {
    let dir = tempdir().expect("tempdir");
    let server = start(dir.path(), 1, 2).await;

    // Unknown type: the server cannot know how much follows the header.
    let mut frame = vec![3, 1];
    frame.extend(std::iter::repeat(b'z').take(6000));
    for _ in 0..5 {
        let reply = exchange_raw(server.addr, &frame).await;
        assert_eq!(reply.reason(), Some(ErrorReason::Malformed));
    }

    // Malformed payload followed by bytes beyond the declared length.
    let mut frame = vec![MessageType::Bets.as_u8(), 1];
    frame.extend_from_slice(&3u16.to_le_bytes());
    frame.extend_from_slice(b"abc");
    frame.extend(std::iter::repeat(b'z').take(4000));
    let reply = exchange_raw(server.addr, &frame).await;
    assert_eq!(reply.reason(), Some(ErrorReason::Malformed));
    assert_eq!(server.stored(), 0);

    server.stop().await;
}

#[tokio::test]
async fn oversized_worker_pool_is_refused_at_bind() {
    let dir = tempdir().expect("tempdir");
    let mut config = ServerConfig::new("127.0.0.1:0", dir.path().join("bets.csv"), 1);
    config.max_workers = tokio::sync::Semaphore::MAX_PERMITS + 1;
    let store = BetStore::open(&config.store_path).expect("store open");
    let state = Lottery::new(store, 1, WinningNumber::default());
    assert!(matches!(
        Server::bind(&config, state).await,
        Err(lottery::Error::InvalidConfig(_))
    ));
}
