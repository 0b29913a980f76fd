use crate::agent::{AgentAction, ProbeAgent};
use crate::firewall::FirewallProvider;
use crate::metrics::MetricsSource;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use prts_core::wire::{decode_envelope, encode_envelope, MAX_PUSH_FRAME_BYTES, WS_PATH};
use prts_core::{Envelope, NodeCommand};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const OUTBOUND_QUEUE: usize = 32;

/// Why a connected session ended. Every variant is terminal for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Command(NodeCommand),
    Interrupted,
}

impl SessionEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionEnd::Disconnected => 1,
            SessionEnd::Command(_) | SessionEnd::Interrupted => 0,
        }
    }
}

/// Accepts `host:port` or a full `ws://` / `wss://` URL.
pub fn hub_url(addr: &str) -> Result<Url, url::ParseError> {
    let addr = addr.trim();
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        let mut url = Url::parse(addr)?;
        if url.path() == "/" || url.path().is_empty() {
            url.set_path(WS_PATH);
        }
        return Ok(url);
    }
    Url::parse(&format!("ws://{addr}{WS_PATH}"))
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}

/// Dials the hub up to `attempts` times, doubling the pause between tries.
pub async fn connect_with_backoff(url: &Url, attempts: u32) -> Option<HubStream> {
    let mut backoff = Duration::from_secs(1);
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(event = "hub_connected", url = %url, attempt);
                return Some(ws);
            }
            Err(err) => {
                warn!(event = "hub_connect_error", url = %url, attempt, error = %err);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }
    None
}

async fn send_envelope<T>(ws: &mut T, envelope: &Envelope) -> Result<(), WsError>
where
    T: Sink<Message, Error = WsError> + Unpin,
{
    match encode_envelope(envelope) {
        Ok(text) => ws.send(Message::Text(text)).await,
        Err(err) => {
            warn!(event = "frame_encode_error", kind = %envelope.kind(), error = %err);
            Ok(())
        }
    }
}

/// Reports every `interval` and serves inbound envelopes until the connection
/// drops, a STOP/RESTART arrives, or `shutdown` resolves.
///
/// Reporting, inbound handling and socket writes run as separate activities, so a
/// slow provider call never holds back the periodic report. Both producers feed one
/// outbound queue, which keeps frames in send order.
pub async fn run_session<T, P, S, F>(
    ws: T,
    agent: &ProbeAgent<P, S>,
    interval: Duration,
    shutdown: F,
) -> SessionEnd
where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    P: FirewallProvider,
    S: MetricsSource,
    F: Future<Output = ()>,
{
    let (mut sink, mut stream): (SplitSink<T, Message>, SplitStream<T>) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);

    let end = tokio::select! {
        end = report_loop(agent, interval, &out_tx) => end,
        end = read_loop(&mut stream, agent, &out_tx) => end,
        end = write_loop(&mut sink, &mut out_rx) => end,
        _ = shutdown => SessionEnd::Interrupted,
    };

    match end {
        SessionEnd::Interrupted => {
            info!(event = "probe_interrupt");
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if sink.send(close).await.is_ok() {
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    while let Some(Ok(_)) = stream.next().await {}
                })
                .await;
            }
        }
        SessionEnd::Command(command) => {
            info!(event = "probe_exit", command = %command);
            let _ = sink.close().await;
        }
        SessionEnd::Disconnected => {}
    }
    end
}

async fn report_loop<P, S>(
    agent: &ProbeAgent<P, S>,
    interval: Duration,
    out_tx: &mpsc::Sender<Envelope>,
) -> SessionEnd
where
    P: FirewallProvider,
    S: MetricsSource,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = agent.report().await;
        if let Envelope::NodeReport(status) = &report {
            debug!(event = "status_report", load = status.load, uptime = %status.uptime);
        }
        if out_tx.send(report).await.is_err() {
            return SessionEnd::Disconnected;
        }
    }
}

async fn read_loop<R, P, S>(
    stream: &mut R,
    agent: &ProbeAgent<P, S>,
    out_tx: &mpsc::Sender<Envelope>,
) -> SessionEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    P: FirewallProvider,
    S: MetricsSource,
{
    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                warn!(event = "hub_closed", frame = ?frame);
                return SessionEnd::Disconnected;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(event = "hub_read_error", error = %err);
                return SessionEnd::Disconnected;
            }
            None => {
                warn!(event = "hub_closed");
                return SessionEnd::Disconnected;
            }
        };
        let envelope = match decode_envelope(text.as_bytes(), MAX_PUSH_FRAME_BYTES) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "frame_dropped", error = %err);
                continue;
            }
        };
        match agent.handle(envelope).await {
            AgentAction::None => {}
            AgentAction::Reply(reply) => {
                if out_tx.send(reply).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            AgentAction::Exit(command) => return SessionEnd::Command(command),
        }
    }
}

async fn write_loop<W>(sink: &mut W, out_rx: &mut mpsc::Receiver<Envelope>) -> SessionEnd
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(envelope) = out_rx.recv().await {
        if let Err(err) = send_envelope(sink, &envelope).await {
            warn!(event = "hub_write_error", error = %err);
            return SessionEnd::Disconnected;
        }
    }
    SessionEnd::Disconnected
}
