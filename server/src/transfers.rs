use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::{Device, FileMeta, Transfer, TransferStatus};
use crate::relay::messages::ServerFrame;

pub const MAX_MEMORY: u64 = 500 * 1024 * 1024;
pub const WARNING_THRESHOLD: u64 = 400 * 1024 * 1024;
pub const MAX_CONCURRENT_TRANSFERS: usize = 5;
/// Emergency cleanup never keeps more than this many transfers alive.
const EMERGENCY_KEEP_RECENT: usize = 5;
/// Warning-level sweeps drop transfers older than this.
const WARNING_SWEEP_AGE_MINS: i64 = 5;

/// A frame addressed to a device id. Engine methods gather these; the
/// caller sends them after every lock is released.
pub type Outbound = (String, ServerFrame);

/// Result of a chunk ingest. `close_idle` asks the caller to also close
/// channels with stale inbound activity (set during emergency cleanup).
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub outbound: Vec<Outbound>,
    pub close_idle: bool,
}

struct Inner {
    transfers: HashMap<String, Transfer>,
    memory_in_flight: u64,
}

/// The per-transfer state machine plus the memory/concurrency governor.
///
/// All methods return the frames to deliver rather than sending them, so
/// no lock is ever held across a channel write.
pub struct TransferEngine {
    inner: RwLock<Inner>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                transfers: HashMap::new(),
                memory_in_flight: 0,
            }),
        }
    }

    /// Register an offer from `from` to `target`. The caller has already
    /// validated that both exist, share a room, and that the target is
    /// online.
    pub async fn offer(
        &self,
        from: &Device,
        target: &Device,
        files: Vec<FileMeta>,
        proposed_id: Option<String>,
    ) -> Result<Vec<Outbound>, RelayError> {
        if files.is_empty() {
            return Err(RelayError::AssemblyFailed);
        }
        let mut inner = self.inner.write().await;

        let active = inner
            .transfers
            .values()
            .filter(|t| !t.status.is_terminal())
            .count();
        if active >= MAX_CONCURRENT_TRANSFERS {
            return Err(RelayError::MemoryExhausted);
        }

        // Caller-proposed ids are untrusted: collisions with an active
        // transfer are rejected rather than silently rebound.
        let id = match proposed_id {
            Some(proposed) => {
                if inner
                    .transfers
                    .get(&proposed)
                    .is_some_and(|t| !t.status.is_terminal())
                {
                    return Err(RelayError::TransferAlreadyActive);
                }
                proposed
            }
            None => Uuid::new_v4().to_string(),
        };

        let total_size = files[0].size;
        let transfer = Transfer {
            id: id.clone(),
            from_device_id: from.id.clone(),
            target_device_id: target.id.clone(),
            files: files.clone(),
            status: TransferStatus::Pending,
            total_size,
            total_chunks: None,
            chunks: Vec::new(),
            accounted: 0,
            created: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        inner.transfers.insert(id.clone(), transfer);
        info!(transfer_id = %id, from = %from.id, target = %target.id, total_size, "transfer offered");

        Ok(vec![
            (
                target.id.clone(),
                ServerFrame::IncomingFile {
                    transfer_id: id.clone(),
                    from_device_id: from.id.clone(),
                    from_name: from.display_name().to_string(),
                    files,
                    total_size,
                },
            ),
            (
                from.id.clone(),
                ServerFrame::TransferStarted {
                    transfer_id: id,
                    target_device_id: target.id.clone(),
                },
            ),
        ])
    }

    /// Receiver accepted; relay the decision to the sender.
    pub async fn accept(&self, transfer_id: &str, by: &str) -> Vec<Outbound> {
        let mut inner = self.inner.write().await;
        let Some(transfer) = inner.transfers.get_mut(transfer_id) else {
            debug!(transfer_id, "accept for unknown transfer dropped");
            return Vec::new();
        };
        if transfer.target_device_id != by || transfer.status != TransferStatus::Pending {
            return Vec::new();
        }
        transfer.status = TransferStatus::Accepted;
        vec![(
            transfer.from_device_id.clone(),
            ServerFrame::TransferAccepted {
                transfer_id: transfer_id.to_string(),
            },
        )]
    }

    /// Receiver rejected; relay to the sender and erase the transfer.
    pub async fn reject(&self, transfer_id: &str, by: &str) -> Vec<Outbound> {
        let mut inner = self.inner.write().await;
        let sender = match inner.transfers.get(transfer_id) {
            Some(t) if t.target_device_id == by && !t.status.is_terminal() => {
                t.from_device_id.clone()
            }
            _ => return Vec::new(),
        };
        finish(&mut inner, transfer_id, TransferStatus::Rejected);
        inner.transfers.remove(transfer_id);
        vec![(
            sender,
            ServerFrame::TransferRejected {
                transfer_id: transfer_id.to_string(),
            },
        )]
    }

    /// Ingest one indexed chunk from the sender. Handles buffer
    /// allocation, progress feedback, completion assembly, and the
    /// governor's pressure responses.
    pub async fn add_chunk(
        &self,
        transfer_id: &str,
        from: &str,
        index: u32,
        declared_total: u32,
        data: &str,
        file_size: Option<u64>,
    ) -> ChunkOutcome {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let mut outcome = ChunkOutcome::default();

        let (sender, receiver) = match inner.transfers.get(transfer_id) {
            None => {
                // Never allocate retroactively for ids we do not know.
                debug!(transfer_id, "chunk for unknown transfer dropped");
                return outcome;
            }
            Some(t) if t.from_device_id != from => {
                debug!(transfer_id, from, "chunk from non-sender dropped");
                return outcome;
            }
            Some(t)
                if !matches!(
                    t.status,
                    TransferStatus::Accepted | TransferStatus::Streaming
                ) =>
            {
                debug!(transfer_id, status = ?t.status, "chunk outside streaming window dropped");
                return outcome;
            }
            Some(t) => (t.from_device_id.clone(), t.target_device_id.clone()),
        };

        // First chunk fixes totalChunks and charges the governor with the
        // advertised size.
        let mut charge = 0;
        {
            let transfer = inner.transfers.get_mut(transfer_id).expect("present");
            if transfer.total_chunks.is_none() && declared_total > 0 {
                transfer.total_chunks = Some(declared_total);
                transfer.chunks = vec![None; declared_total as usize];
                transfer.status = TransferStatus::Streaming;
                transfer.started_at = Some(Utc::now());
                if transfer.total_size == 0 {
                    transfer.total_size = file_size.unwrap_or(0);
                }
                transfer.accounted = transfer.total_size;
                charge = transfer.accounted;
            }
        }
        inner.memory_in_flight += charge;

        let total = inner
            .transfers
            .get(transfer_id)
            .and_then(|t| t.total_chunks)
            .unwrap_or(0);
        if declared_total != total || index >= total || total == 0 {
            warn!(transfer_id, declared_total, total, index, "chunk protocol violation");
            outcome.outbound = self.error_both_locked(inner, transfer_id);
            return outcome;
        }

        let bytes = match decode_chunk(data) {
            Ok(bytes) => bytes,
            Err(()) => {
                warn!(transfer_id, index, "chunk payload not decodable");
                outcome.outbound = self.error_both_locked(inner, transfer_id);
                return outcome;
            }
        };

        let (received, completion) = {
            let transfer = inner.transfers.get_mut(transfer_id).expect("present");
            transfer.chunks[index as usize] = Some(bytes);
            let received = transfer.received_chunks();
            if received == total {
                let assembled: Vec<u8> = transfer
                    .chunks
                    .iter()
                    .flatten()
                    .flatten()
                    .copied()
                    .collect();
                let meta = transfer.primary_file().cloned();
                (received, Some((assembled, meta)))
            } else {
                (received, None)
            }
        };

        outcome.outbound.push((
            sender.clone(),
            ServerFrame::UploadProgress {
                transfer_id: transfer_id.to_string(),
                received_chunks: received,
                total_chunks: total,
                percent: received * 100 / total,
            },
        ));

        if let Some((assembled, meta)) = completion {
            let meta = meta.unwrap_or(FileMeta {
                name: String::new(),
                size: 0,
                mime_type: String::new(),
            });
            outcome.outbound.push((
                receiver,
                ServerFrame::FileComplete {
                    transfer_id: transfer_id.to_string(),
                    file_name: meta.name,
                    file_type: meta.mime_type,
                    file_size: meta.size,
                    file_data: Some(BASE64.encode(&assembled)),
                },
            ));
            outcome.outbound.push((
                sender,
                ServerFrame::TransferComplete {
                    transfer_id: transfer_id.to_string(),
                },
            ));
            finish(inner, transfer_id, TransferStatus::Completed);
            info!(transfer_id, "transfer completed");
        } else if inner.memory_in_flight > MAX_MEMORY {
            outcome.outbound.extend(emergency_cleanup(inner));
            outcome.close_idle = true;
        } else if inner.memory_in_flight > WARNING_THRESHOLD {
            outcome.outbound.extend(warning_sweep(inner));
        }

        outcome
    }

    /// Error a transfer toward both parties (protocol violation path).
    fn error_both_locked(&self, inner: &mut Inner, transfer_id: &str) -> Vec<Outbound> {
        let parties = inner
            .transfers
            .get(transfer_id)
            .map(|t| (t.from_device_id.clone(), t.target_device_id.clone()));
        finish(inner, transfer_id, TransferStatus::Errored);
        match parties {
            Some((from, target)) => {
                let frame = |to: String| {
                    (
                        to,
                        ServerFrame::TransferError {
                            transfer_id: Some(transfer_id.to_string()),
                            message: RelayError::AssemblyFailed.to_string(),
                        },
                    )
                };
                vec![frame(from), frame(target)]
            }
            None => Vec::new(),
        }
    }

    /// Re-emit still-buffered chunks the receiver reported missing.
    /// Indices no longer buffered are silently dropped.
    pub async fn resend_missing(
        &self,
        transfer_id: &str,
        by: &str,
        indices: &[u32],
    ) -> Vec<Outbound> {
        let inner = self.inner.read().await;
        let Some(transfer) = inner.transfers.get(transfer_id) else {
            return Vec::new();
        };
        if transfer.target_device_id != by {
            return Vec::new();
        }
        let Some(total) = transfer.total_chunks else {
            return Vec::new();
        };
        indices
            .iter()
            .filter(|&&i| i < total)
            .filter_map(|&i| {
                transfer.chunks[i as usize].as_ref().map(|bytes| {
                    (
                        by.to_string(),
                        ServerFrame::FileChunk {
                            transfer_id: transfer_id.to_string(),
                            chunk_index: i,
                            total_chunks: total,
                            data: BASE64.encode(bytes),
                        },
                    )
                })
            })
            .collect()
    }

    /// Receiver-reported reassembly progress, relayed to the sender.
    pub async fn relay_progress(&self, transfer_id: &str, by: &str, progress: f64) -> Vec<Outbound> {
        let inner = self.inner.read().await;
        let Some(transfer) = inner.transfers.get(transfer_id) else {
            return Vec::new();
        };
        if transfer.target_device_id != by {
            return Vec::new();
        }
        vec![(
            transfer.from_device_id.clone(),
            ServerFrame::TransferProgress {
                transfer_id: transfer_id.to_string(),
                progress,
            },
        )]
    }

    /// Either party signals the transfer is done: release buffers and let
    /// the counterpart know.
    pub async fn complete_signal(&self, transfer_id: &str, by: &str) -> Vec<Outbound> {
        let mut inner = self.inner.write().await;
        let (counterpart, meta) = match inner.transfers.get(transfer_id) {
            Some(t) if !t.status.is_terminal() => {
                let counterpart = if t.from_device_id == by {
                    t.target_device_id.clone()
                } else if t.target_device_id == by {
                    t.from_device_id.clone()
                } else {
                    return Vec::new();
                };
                (counterpart, t.primary_file().cloned())
            }
            _ => return Vec::new(),
        };
        finish(&mut inner, transfer_id, TransferStatus::Completed);
        let meta = meta.unwrap_or(FileMeta {
            name: String::new(),
            size: 0,
            mime_type: String::new(),
        });
        vec![(
            counterpart,
            ServerFrame::FileComplete {
                transfer_id: transfer_id.to_string(),
                file_name: meta.name,
                file_type: meta.mime_type,
                file_size: meta.size,
                file_data: None,
            },
        )]
    }

    /// Abort: free buffers, drop the record, tell the counterpart.
    pub async fn cancel(&self, transfer_id: &str, by: &str) -> Vec<Outbound> {
        let mut inner = self.inner.write().await;
        let (terminal, from, target) = match inner.transfers.get(transfer_id) {
            None => return Vec::new(),
            Some(t) => (
                t.status.is_terminal(),
                t.from_device_id.clone(),
                t.target_device_id.clone(),
            ),
        };
        if terminal {
            inner.transfers.remove(transfer_id);
            return Vec::new();
        }
        let counterpart = if from == by {
            Some(target)
        } else if target == by {
            Some(from)
        } else {
            None
        };
        finish(&mut inner, transfer_id, TransferStatus::Cancelled);
        inner.transfers.remove(transfer_id);
        info!(transfer_id, by, "transfer cancelled");
        counterpart
            .map(|peer| {
                vec![(
                    peer,
                    ServerFrame::TransferError {
                        transfer_id: Some(transfer_id.to_string()),
                        message: "Cancelled".to_string(),
                    },
                )]
            })
            .unwrap_or_default()
    }

    /// Sender/target/status triple for router-level checks.
    pub async fn meta(&self, transfer_id: &str) -> Option<(String, String, TransferStatus)> {
        let inner = self.inner.read().await;
        inner.transfers.get(transfer_id).map(|t| {
            (
                t.from_device_id.clone(),
                t.target_device_id.clone(),
                t.status,
            )
        })
    }

    /// A device vanished: error every live transfer it was part of. The
    /// surviving party hears `TargetOffline` (its receiver left) or
    /// `SenderUnavailable` (its sender left).
    pub async fn fail_for_device(&self, device_id: &str) -> Vec<Outbound> {
        let mut inner = self.inner.write().await;
        let involved: Vec<(String, String, bool)> = inner
            .transfers
            .values()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| t.from_device_id == device_id || t.target_device_id == device_id)
            .map(|t| {
                let sender_left = t.from_device_id == device_id;
                let survivor = if sender_left {
                    t.target_device_id.clone()
                } else {
                    t.from_device_id.clone()
                };
                (t.id.clone(), survivor, sender_left)
            })
            .collect();

        let mut outbound = Vec::new();
        for (id, survivor, sender_left) in involved {
            let error = if sender_left {
                RelayError::SenderUnavailable
            } else {
                RelayError::TargetOffline
            };
            outbound.push((
                survivor,
                ServerFrame::TransferError {
                    transfer_id: Some(id.clone()),
                    message: error.to_string(),
                },
            ));
            finish(&mut inner, &id, TransferStatus::Errored);
        }
        outbound
    }

    /// Janitor path: error live transfers older than `age` and free their
    /// buffers; terminal records past the same age are dropped.
    pub async fn expire_older_than(&self, age: Duration) -> Vec<Outbound> {
        let cutoff = Utc::now() - age;
        let mut inner = self.inner.write().await;
        let stale: Vec<(String, String, bool)> = inner
            .transfers
            .values()
            .filter(|t| t.created < cutoff)
            .map(|t| (t.id.clone(), t.from_device_id.clone(), t.status.is_terminal()))
            .collect();

        let mut outbound = Vec::new();
        for (id, sender, was_terminal) in stale {
            if !was_terminal {
                outbound.push((
                    sender,
                    ServerFrame::TransferError {
                        transfer_id: Some(id.clone()),
                        message: RelayError::MemoryExhausted.to_string(),
                    },
                ));
                finish(&mut inner, &id, TransferStatus::Errored);
            }
            inner.transfers.remove(&id);
            debug!(transfer_id = %id, "expired transfer removed");
        }
        outbound
    }

    /// HTTP force-release: free buffers and drop the record regardless of
    /// state. Returns false for unknown ids.
    pub async fn force_release(&self, transfer_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.transfers.contains_key(transfer_id) {
            return false;
        }
        finish(&mut inner, transfer_id, TransferStatus::Cancelled);
        inner.transfers.remove(transfer_id);
        true
    }

    pub async fn memory_in_flight(&self) -> u64 {
        self.inner.read().await.memory_in_flight
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .transfers
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.transfers.len()
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal transition: flips status, frees buffers, and settles the
/// governor balance. Re-entrant calls are no-ops, so the deduction happens
/// exactly once per transfer.
fn finish(inner: &mut Inner, transfer_id: &str, status: TransferStatus) {
    let Some(transfer) = inner.transfers.get_mut(transfer_id) else {
        return;
    };
    if transfer.status.is_terminal() {
        return;
    }
    transfer.status = status;
    transfer.ended_at = Some(Utc::now());
    transfer.chunks = Vec::new();
    let accounted = std::mem::take(&mut transfer.accounted);
    inner.memory_in_flight = inner.memory_in_flight.saturating_sub(accounted);
}

/// Over the hard cap: keep the newest transfers (at most
/// `EMERGENCY_KEEP_RECENT`, and only while their combined charge fits the
/// budget), error out everything older.
fn emergency_cleanup(inner: &mut Inner) -> Vec<Outbound> {
    let mut live: Vec<(String, DateTime<Utc>, u64, String)> = inner
        .transfers
        .values()
        .filter(|t| !t.status.is_terminal() && t.accounted > 0)
        .map(|t| (t.id.clone(), t.created, t.accounted, t.from_device_id.clone()))
        .collect();
    live.sort_by(|a, b| (&b.1, &b.0).cmp(&(&a.1, &a.0)));

    let mut kept_bytes: u64 = 0;
    let mut victims = Vec::new();
    for (rank, (id, _, accounted, sender)) in live.into_iter().enumerate() {
        if rank < EMERGENCY_KEEP_RECENT && kept_bytes + accounted <= MAX_MEMORY {
            kept_bytes += accounted;
        } else {
            victims.push((id, sender));
        }
    }

    warn!(victims = victims.len(), kept_bytes, "emergency memory cleanup");
    let mut outbound = Vec::new();
    for (id, sender) in victims {
        outbound.push((
            sender,
            ServerFrame::TransferError {
                transfer_id: Some(id.clone()),
                message: RelayError::MemoryExhausted.to_string(),
            },
        ));
        finish(inner, &id, TransferStatus::Errored);
    }
    outbound
}

/// Over the warning threshold: drop live transfers older than five
/// minutes.
fn warning_sweep(inner: &mut Inner) -> Vec<Outbound> {
    let cutoff = Utc::now() - Duration::minutes(WARNING_SWEEP_AGE_MINS);
    let stale: Vec<(String, String)> = inner
        .transfers
        .values()
        .filter(|t| !t.status.is_terminal() && t.created < cutoff)
        .map(|t| (t.id.clone(), t.from_device_id.clone()))
        .collect();

    let mut outbound = Vec::new();
    for (id, sender) in stale {
        debug!(transfer_id = %id, "warning sweep dropped stale transfer");
        outbound.push((
            sender,
            ServerFrame::TransferError {
                transfer_id: Some(id.clone()),
                message: RelayError::MemoryExhausted.to_string(),
            },
        ));
        finish(inner, &id, TransferStatus::Errored);
    }
    outbound
}

/// Normalize a chunk payload to bytes: strip any data-URL prefix through
/// the comma, drop characters outside the base64 alphabet, then decode.
fn decode_chunk(data: &str) -> Result<Vec<u8>, ()> {
    let body = match data.find(',') {
        Some(pos) => &data[pos + 1..],
        None => data,
    };
    let clean: String = body
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();
    BASE64.decode(clean.as_bytes()).map_err(|_| ())
}
