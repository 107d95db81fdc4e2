//! Line transport for peer connections.
//!
//! [`spawn_peer`] takes any bidirectional byte stream (a TCP socket, or an
//! in-memory duplex in tests), frames it into lines, registers the
//! connection and starts three tasks on it: the read loop that feeds the
//! protocol machine, the write loop that drains the outbound channel, and the
//! heartbeat loop. All three stop on the connection's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use courier_core::WireMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use super::connection::{Direction, OutboundMessage, PeerHandle};
use crate::cluster::failure_detector::ProbeVerdict;
use crate::cluster::state::{ClusterChange, ClusterState};
use crate::cluster::types::CloseReason;

/// Registers a connection over `io` and starts its tasks.
///
/// Dialed connections still need [`ClusterState::open_session`]; accepted
/// ones wait for the peer to speak first.
pub fn spawn_peer<S>(
    io: S,
    address: impl Into<String>,
    direction: Direction,
    cluster: Arc<ClusterState>,
) -> Arc<PeerHandle>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, rx) = cluster.registry().register(
        address,
        direction,
        cluster.new_machine(),
        cluster.connection_config(),
    );
    info!(connection = %handle.id, address = %handle.address, ?direction, "peer connected");
    cluster.emit(ClusterChange::PeerConnected {
        connection: handle.id,
        address: handle.address.clone(),
    });

    let (reader, writer) = tokio::io::split(io);
    let lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(cluster.connection_config().max_line_length),
    );
    let sink = FramedWrite::new(writer, LinesCodec::new());

    tokio::spawn(write_loop(sink, rx, Arc::clone(&handle)));
    tokio::spawn(read_loop(lines, Arc::clone(&handle), Arc::clone(&cluster)));
    tokio::spawn(heartbeat_loop(Arc::clone(&handle), cluster));
    handle
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    handle: Arc<PeerHandle>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            () = handle.cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        match next {
            Some(OutboundMessage::Line(message)) => {
                trace!(connection = %handle.id, %message, "send");
                if let Err(e) = sink.send(message.to_string()).await {
                    warn!(connection = %handle.id, error = %e, "write failed");
                    break;
                }
            }
            Some(OutboundMessage::Close) | None => break,
        }
    }
    if let Err(e) = SinkExt::<String>::close(&mut sink).await {
        debug!(connection = %handle.id, error = %e, "error closing peer stream");
    }
    // stops the read and heartbeat loops too
    handle.cancel.cancel();
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

enum ReadOutcome {
    Line(String),
    BidTimeout,
    Closed,
    Failed(LinesCodecError),
}

async fn next_line<R>(lines: &mut R, deadline: Option<Duration>) -> ReadOutcome
where
    R: futures_util::Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    let next = match deadline {
        Some(limit) => match tokio::time::timeout(limit, lines.next()).await {
            Ok(next) => next,
            Err(_) => return ReadOutcome::BidTimeout,
        },
        None => lines.next().await,
    };
    match next {
        Some(Ok(line)) => ReadOutcome::Line(line),
        Some(Err(e)) => ReadOutcome::Failed(e),
        None => ReadOutcome::Closed,
    }
}

async fn read_loop<R>(
    mut lines: FramedRead<R, LinesCodec>,
    handle: Arc<PeerHandle>,
    cluster: Arc<ClusterState>,
) where
    R: AsyncRead + Unpin,
{
    let bid_timeout = cluster.config().bid_timeout;
    let reason = loop {
        let deadline = handle
            .machine
            .lock()
            .await
            .awaiting_bid()
            .then_some(bid_timeout);

        let outcome = tokio::select! {
            () = handle.cancel.cancelled() => break CloseReason::Transport,
            () = handle.rearm.notified() => continue,
            outcome = next_line(&mut lines, deadline) => outcome,
        };

        match outcome {
            ReadOutcome::Line(line) => {
                handle
                    .heartbeat
                    .lock()
                    .record_activity(tokio::time::Instant::now());
                if line.trim().is_empty() {
                    continue;
                }
                trace!(connection = %handle.id, %line, "receive");
                match WireMessage::parse(&line) {
                    Ok(message) => {
                        cluster
                            .drive(&handle, move |machine, store| machine.handle(message, store))
                            .await;
                    }
                    Err(e) => {
                        warn!(connection = %handle.id, error = %e, "unparseable line");
                        cluster
                            .drive(&handle, move |machine, _| machine.reject(&line))
                            .await;
                    }
                }
            }
            ReadOutcome::BidTimeout => {
                warn!(connection = %handle.id, "bid reply timed out");
                cluster
                    .drive(&handle, |machine, store| machine.expire_bids(store))
                    .await;
            }
            ReadOutcome::Closed => {
                debug!(connection = %handle.id, "peer closed the stream");
                break CloseReason::Transport;
            }
            ReadOutcome::Failed(e) => {
                warn!(connection = %handle.id, error = %e, "read failed");
                break CloseReason::Transport;
            }
        }
    };
    cluster.close_peer(&handle, reason);
}

// ---------------------------------------------------------------------------
// Heartbeat loop
// ---------------------------------------------------------------------------

/// Probes the peer whenever it has been silent for a full heartbeat interval,
/// or immediately when woken through the handle's probe notifier. An
/// unanswered probe closes the connection as dead.
async fn heartbeat_loop(handle: Arc<PeerHandle>, cluster: Arc<ClusterState>) {
    let interval = cluster.config().heartbeat_interval;
    let timeout = cluster.config().heartbeat_timeout;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let forced = tokio::select! {
            () = handle.cancel.cancelled() => return,
            _ = ticker.tick() => false,
            () = handle.probe.notified() => true,
        };

        let probe = {
            let now = tokio::time::Instant::now();
            let mut heartbeat = handle.heartbeat.lock();
            if forced {
                heartbeat.begin_probe(now);
                true
            } else {
                heartbeat.begin_probe_if_idle(now, interval)
            }
        };
        if !probe {
            continue;
        }

        debug!(connection = %handle.id, forced, "sending heartbeat probe");
        if let Err(e) = handle.send(WireMessage::HeartBeatStart).await {
            warn!(connection = %handle.id, error = %e, "failed to send heartbeat probe");
            cluster.close_peer(&handle, CloseReason::Transport);
            return;
        }

        tokio::select! {
            () = handle.cancel.cancelled() => return,
            () = tokio::time::sleep(timeout) => {}
        }

        let verdict = handle.heartbeat.lock().probe_met();
        if verdict == ProbeVerdict::Dead {
            warn!(connection = %handle.id, node = ?handle.partner(), "heartbeat timed out");
            cluster.close_peer(&handle, CloseReason::HeartbeatTimeout);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use uuid::Uuid;

    use super::*;
    use crate::cluster::types::ConnectionState;
    use crate::config::{ClusterConfig, ConnectionConfig, StorageConfig};
    use crate::storage::MessageLog;

    fn cluster_in(dir: &TempDir, config: ClusterConfig) -> Arc<ClusterState> {
        let store = Arc::new(MessageLog::open(&StorageConfig {
            message_log: dir.path().join("messages.log"),
            owner_log: dir.path().join("owners.log"),
            ..StorageConfig::default()
        }));
        let (state, _changes) =
            ClusterState::new(Uuid::new_v4(), config, ConnectionConfig::default(), store);
        Arc::new(state)
    }

    #[tokio::test]
    async fn answers_start_and_heartbeat_over_a_stream() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir, ClusterConfig::default());
        let (ours, theirs) = tokio::io::duplex(4096);
        let handle = spawn_peer(ours, "duplex", Direction::Inbound, Arc::clone(&cluster));

        let (read, mut write) = tokio::io::split(theirs);
        let mut replies = BufReader::new(read).lines();
        let remote = Uuid::new_v4();

        write.write_all(format!("START {remote}\n").as_bytes()).await.unwrap();
        let line = replies.next_line().await.unwrap().unwrap();
        assert_eq!(line, format!("START {}", cluster.local()));

        write.write_all(b"heart beat start\n").await.unwrap();
        assert_eq!(replies.next_line().await.unwrap().unwrap(), "HEART BEAT");
        assert_eq!(handle.partner(), Some(remote));
        assert_eq!(handle.state(), ConnectionState::General);

        write.write_all(b"WHAT IS THIS\n").await.unwrap();
        assert_eq!(replies.next_line().await.unwrap().unwrap(), "ERROR");
    }

    #[tokio::test]
    async fn eof_deregisters_without_declaring_death() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir, ClusterConfig::default());
        let (ours, theirs) = tokio::io::duplex(4096);
        let handle = spawn_peer(ours, "duplex", Direction::Inbound, Arc::clone(&cluster));

        let (read, mut write) = tokio::io::split(theirs);
        let mut replies = BufReader::new(read).lines();
        let remote = Uuid::new_v4();
        write.write_all(format!("START {remote}\n").as_bytes()).await.unwrap();
        replies.next_line().await.unwrap();

        drop(write);
        drop(replies);
        handle.cancel.cancelled().await;
        tokio::task::yield_now().await;

        assert!(!cluster.is_dead(remote));
        assert!(!handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_declared_dead() {
        let dir = TempDir::new().unwrap();
        let config = ClusterConfig {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(50),
            ..ClusterConfig::default()
        };
        let cluster = cluster_in(&dir, config);
        let (ours, theirs) = tokio::io::duplex(4096);
        let handle = spawn_peer(ours, "duplex", Direction::Inbound, Arc::clone(&cluster));

        let (read, mut write) = tokio::io::split(theirs);
        let mut replies = BufReader::new(read).lines();
        let remote = Uuid::new_v4();
        write.write_all(format!("START {remote}\n").as_bytes()).await.unwrap();
        replies.next_line().await.unwrap();

        // never answer the probe
        assert_eq!(replies.next_line().await.unwrap().unwrap(), "HEART BEAT START");
        handle.cancel.cancelled().await;
        tokio::task::yield_now().await;

        assert!(cluster.is_dead(remote));
        assert_eq!(cluster.registry().count(), 0);
    }
}
