// Transport collaborators: frame egress and operator control ingress
//
// One datagram per packed track frame, one datagram per operator command.
// Fragmentation and reassembly are out of scope; frames larger than a
// datagram are the deployment's problem to size away (bound the point
// capacity accordingly).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::service::ManagementService;

/// Wire egress hook consumed by the dispatcher. Failures are the
/// implementation's to log; they never propagate into store mutations.
pub trait TrackOutput: Send {
    /// A packed track frame (header + points, the `pack` layout).
    fn emit(&mut self, track_id: u32, frame: &[u8]);
}

/// Fans emitted frames into a broadcast channel so any number of forwarders
/// (UDP, test probes) can subscribe.
pub struct ChannelOutput {
    tx: broadcast::Sender<Vec<u8>>,
}

impl ChannelOutput {
    pub fn new(tx: broadcast::Sender<Vec<u8>>) -> Self {
        ChannelOutput { tx }
    }
}

impl TrackOutput for ChannelOutput {
    fn emit(&mut self, track_id: u32, frame: &[u8]) {
        // Send fails only when nobody is subscribed; that is not an error
        if self.tx.send(frame.to_vec()).is_err() {
            debug!(track_id, "no frame subscribers");
        }
    }
}

/// Forward frames from a broadcast subscription to `target` over UDP.
/// Runs until the channel closes.
pub async fn run_udp_output(target: String, mut rx: broadcast::Receiver<Vec<u8>>) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            error!("UDP output failed to bind: {}", e);
            return;
        }
    };
    info!("UDP track output to {}", target);
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, &target).await {
                    warn!("UDP output send to {} failed: {}", target, e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "UDP output lagged behind the dispatcher");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("UDP track output stopped");
}

/// Operator command parsed from a control datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Merge { source: u32, target: u32 },
    ClearAll,
}

/// Fixed control frame: u32 op, u32 a, u32 b (little-endian).
pub const CONTROL_FRAME_LEN: usize = 12;
const CONTROL_OP_MERGE: u32 = 1;
const CONTROL_OP_CLEAR_ALL: u32 = 2;

/// Parse one operator datagram. Returns None on bad length or unknown op.
pub fn parse_control_frame(data: &[u8]) -> Option<ControlCommand> {
    if data.len() != CONTROL_FRAME_LEN {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
    match word(0) {
        CONTROL_OP_MERGE => Some(ControlCommand::Merge {
            source: word(1),
            target: word(2),
        }),
        CONTROL_OP_CLEAR_ALL => Some(ControlCommand::ClearAll),
        _ => None,
    }
}

/// Encode an operator datagram; the inverse of [`parse_control_frame`].
pub fn control_frame(cmd: ControlCommand) -> [u8; CONTROL_FRAME_LEN] {
    let (op, a, b) = match cmd {
        ControlCommand::Merge { source, target } => (CONTROL_OP_MERGE, source, target),
        ControlCommand::ClearAll => (CONTROL_OP_CLEAR_ALL, 0, 0),
    };
    let mut buf = [0u8; CONTROL_FRAME_LEN];
    buf[0..4].copy_from_slice(&op.to_le_bytes());
    buf[4..8].copy_from_slice(&a.to_le_bytes());
    buf[8..12].copy_from_slice(&b.to_le_bytes());
    buf
}

/// UDP listener for operator control datagrams (merge, clear-all).
pub struct ControlServer {
    socket: Arc<UdpSocket>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ControlServer {
    /// Bind `addr` and start forwarding parsed commands into the service.
    pub async fn start(addr: SocketAddr, service: Arc<ManagementService>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let server = ControlServer {
            socket: socket.clone(),
            shutdown_tx,
        };

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((size, peer)) => {
                                Self::process_datagram(&buf[..size], peer, &service).await;
                            }
                            Err(e) => {
                                error!("control receive error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("control server shutting down");
                        break;
                    }
                }
            }
        });

        info!("control server listening on {}", addr);
        Ok(server)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn process_datagram(data: &[u8], peer: SocketAddr, service: &Arc<ManagementService>) {
        let Some(cmd) = parse_control_frame(data) else {
            warn!(len = data.len(), %peer, "ignoring malformed control datagram");
            return;
        };
        debug!(?cmd, %peer, "control command");
        let result = match cmd {
            ControlCommand::Merge { source, target } => service.merge_command(source, target),
            ControlCommand::ClearAll => service.clear_all_command(),
        };
        if let Err(e) = result {
            warn!(?cmd, %peer, "control command rejected: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_roundtrip() {
        let merge = ControlCommand::Merge {
            source: 3,
            target: 9,
        };
        assert_eq!(parse_control_frame(&control_frame(merge)), Some(merge));
        assert_eq!(
            parse_control_frame(&control_frame(ControlCommand::ClearAll)),
            Some(ControlCommand::ClearAll)
        );
    }

    #[test]
    fn test_control_frame_rejects_garbage() {
        // Wrong length
        assert_eq!(parse_control_frame(&[0u8; 11]), None);
        assert_eq!(parse_control_frame(&[0u8; 13]), None);
        // Unknown opcode
        let mut frame = control_frame(ControlCommand::ClearAll);
        frame[0] = 0xFF;
        assert_eq!(parse_control_frame(&frame), None);
    }

    #[tokio::test]
    async fn test_channel_output_fans_out() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut output = ChannelOutput::new(tx);
        output.emit(1, &[0xAA, 0xBB]);
        assert_eq!(rx.recv().await.unwrap(), vec![0xAA, 0xBB]);
    }
}
