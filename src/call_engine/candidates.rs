//! Candidate Buffer - ICE Candidates vor der Remote Description
//!
//! Candidates können vor dem Offer/Answer eintreffen. Sie werden gepuffert
//! und nach erfolgreichem Setzen der Remote Description in Ankunftsreihenfolge
//! angewendet. Ab dann gehen neue Candidates direkt an den [`CandidateApplier`].

use super::connection::ConnectionCore;
use crate::signaling::IceCandidate;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: Vec<IceCandidate>,
    remote_ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nimmt einen empfangenen Candidate an. Gibt ihn zurück, wenn er sofort
    /// angewendet werden darf, sonst wird er gepuffert.
    pub fn receive(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            return Some(candidate);
        }
        self.queue.push(candidate);
        None
    }

    /// Remote Description ist gesetzt; liefert den Puffer in Ankunftsreihenfolge
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.queue)
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Verwirft alles (Session-Ende)
    pub fn clear(&mut self) {
        self.queue.clear();
        self.remote_ready = false;
    }
}

// ============================================================================
// CANDIDATE APPLIER
// ============================================================================

/// Wendet Candidates strikt sequentiell auf die Connection Core an
pub struct CandidateApplier {
    tx: mpsc::UnboundedSender<IceCandidate>,
    task: JoinHandle<()>,
}

impl CandidateApplier {
    pub fn spawn(core: Arc<dyn ConnectionCore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidate>();

        let task = tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                if let Err(e) = core.add_remote_candidate(candidate).await {
                    // Ein einzelner ungültiger Candidate ist kein Grund abzubrechen
                    tracing::warn!("Failed to add ICE candidate: {}", e);
                }
            }
        });

        Self { tx, task }
    }

    pub fn apply(&self, candidate: IceCandidate) {
        if self.tx.send(candidate).is_err() {
            tracing::debug!("Candidate applier already stopped");
        }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
