//! Lossy datagram transport for cluster control messages.
//!
//! One bound UDP socket per node, owned by the gossip component; only the
//! membership receive loop reads it. Frames carry a protocol version byte and
//! a crc32 checksum ahead of the bincode-encoded envelope. Packets never
//! exceed the configured cap; oversized sync payloads are split into smaller
//! record batches instead of fragmenting.

use crate::consensus::log::LogEntry;
use crate::consensus::proposal::Proposal;
use crate::error::{ClusterError, Result};
use crate::membership::record::GossipRecord;
use crate::node::{NodeDescriptor, NodeId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::warn;

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame prefix: version byte + crc32 checksum.
const FRAME_HEADER_LEN: usize = 5;

/// Control message vocabulary.
///
/// Membership kinds are handled by the gossip receive path; consensus kinds
/// are forwarded to the consensus engine's inbox. The closed enum keeps the
/// receive path a single exhaustive match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Sender wants to join; receiver replies with a full sync
    Join {
        node: NodeDescriptor,
        incarnation: u64,
    },

    /// Sender is leaving gracefully
    Leave,

    /// Liveness claim for a node
    Alive {
        node: NodeDescriptor,
        incarnation: u64,
    },

    /// Accusation that `target` is unreachable
    Suspect {
        target: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    /// Declaration that `target` is dead
    Dead {
        target: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    /// Batch of gossip records for state convergence
    Sync { records: Vec<GossipRecord> },

    /// Periodic liveness beacon
    Heartbeat { incarnation: u64 },

    /// Candidate requests a vote
    RequestVote {
        term: u64,
        candidate: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },

    /// Reply to a vote request
    VoteReply { term: u64, granted: bool },

    /// Leader ships entries (heartbeat when empty)
    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },

    /// Reply to an append-entries round
    AppendReply {
        term: u64,
        success: bool,
        match_index: u64,
    },

    /// Leader broadcasts a proposal for voting
    ProposeChange { proposal: Proposal },

    /// Vote on a broadcast proposal
    ProposalVote { proposal_id: String, accept: bool },
}

impl Payload {
    /// Message kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Join { .. } => "join",
            Payload::Leave => "leave",
            Payload::Alive { .. } => "alive",
            Payload::Suspect { .. } => "suspect",
            Payload::Dead { .. } => "dead",
            Payload::Sync { .. } => "sync",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::RequestVote { .. } => "request-vote",
            Payload::VoteReply { .. } => "vote-reply",
            Payload::AppendEntries { .. } => "append-entries",
            Payload::AppendReply { .. } => "append-reply",
            Payload::ProposeChange { .. } => "propose-change",
            Payload::ProposalVote { .. } => "proposal-vote",
        }
    }

    /// Check whether this kind is consumed by the consensus engine.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            Payload::RequestVote { .. }
                | Payload::VoteReply { .. }
                | Payload::AppendEntries { .. }
                | Payload::AppendReply { .. }
                | Payload::ProposeChange { .. }
                | Payload::ProposalVote { .. }
        )
    }
}

/// Self-describing record framing one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Originating node
    pub sender: NodeId,

    /// Generation timestamp, micros since epoch
    pub timestamp: i64,

    /// Random message id for tracing duplicates
    pub message_id: u32,

    /// The message itself
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload from `sender`, stamping time and a random id.
    pub fn new(sender: NodeId, payload: Payload) -> Self {
        Self {
            sender,
            timestamp: Utc::now().timestamp_micros(),
            message_id: OsRng.next_u32(),
            payload,
        }
    }
}

/// UDP transport bound to the gossip listen address.
pub struct GossipTransport {
    socket: UdpSocket,
    local: NodeId,
    max_packet: usize,
}

impl GossipTransport {
    /// Bind the gossip socket.
    pub async fn bind(addr: SocketAddr, local: NodeId, max_packet: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            local,
            max_packet,
        })
    }

    /// The address the socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Encode a payload into a single frame, enforcing the packet cap.
    pub fn encode(&self, payload: Payload) -> Result<Bytes> {
        let envelope = Envelope::new(self.local.clone(), payload);
        let body = bincode::serialize(&envelope)?;

        let size = FRAME_HEADER_LEN + body.len();
        if size > self.max_packet {
            return Err(ClusterError::PacketTooLarge {
                size,
                max: self.max_packet,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(crc32fast::hash(&body));
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode one frame into an envelope.
    pub fn decode(data: &[u8]) -> Result<Envelope> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ClusterError::InvalidMessage("short frame".to_string()));
        }

        let mut buf = data;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ClusterError::InvalidMessage(format!(
                "unsupported protocol version: {}",
                version
            )));
        }

        let checksum = buf.get_u32();
        if crc32fast::hash(buf) != checksum {
            return Err(ClusterError::ChecksumMismatch);
        }

        Ok(bincode::deserialize(buf)?)
    }

    /// Send one payload to `addr`, returning the bytes put on the wire.
    pub async fn send(&self, addr: SocketAddr, payload: Payload) -> Result<usize> {
        let frame = self.encode(payload)?;
        Ok(self.socket.send_to(&frame, addr).await?)
    }

    /// Send a full-membership sync, splitting the record set into batches
    /// that fit the packet cap. A single record that cannot fit on its own
    /// is dropped with a warning rather than fragmented.
    pub async fn send_sync(&self, addr: SocketAddr, records: Vec<GossipRecord>) -> Result<usize> {
        let mut sent = 0;
        let mut pending = records;

        while !pending.is_empty() {
            let mut batch_len = pending.len();
            loop {
                let batch = pending[..batch_len].to_vec();
                match self.encode(Payload::Sync { records: batch }) {
                    Ok(frame) => {
                        sent += self.socket.send_to(&frame, addr).await?;
                        pending.drain(..batch_len);
                        break;
                    }
                    Err(ClusterError::PacketTooLarge { .. }) if batch_len > 1 => {
                        batch_len /= 2;
                    }
                    Err(ClusterError::PacketTooLarge { size, max }) => {
                        warn!(size, max, "sync record exceeds packet cap, dropping");
                        pending.remove(0);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(sent)
    }

    /// Receive one datagram. Blocks until a frame arrives.
    pub async fn recv(&self) -> Result<(Envelope, SocketAddr, usize)> {
        let mut buf = vec![0u8; 65536];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        let envelope = Self::decode(&buf[..len])?;
        Ok((envelope, addr, len))
    }
}
