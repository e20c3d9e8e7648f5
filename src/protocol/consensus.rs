//! Quorum-based consensus over proposals.
//!
//! Simple-majority quorum is `⌊n/2⌋+1`; Byzantine quorum is `2f+1` with
//! `f = ⌊(n-1)/3⌋`, where `n` counts this node plus its peers.

use crate::error::FabricError;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Consensus flavour, which fixes the quorum formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    SimpleMajority,
    Byzantine,
}

/// A value proposed for agreement.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: String,
    pub proposer: String,
    pub value: Value,
}

/// One node's vote on a proposal.
#[derive(Debug, Clone)]
pub struct Vote {
    pub voter: String,
    pub proposal_id: String,
    pub accept: bool,
    pub reason: Option<String>,
}

#[derive(Default)]
struct ConsensusState {
    proposals: HashMap<String, Proposal>,
    votes: HashMap<String, Vec<Vote>>,
}

/// A participant in a consensus group.
pub struct ConsensusNode {
    node_id: String,
    kind: ConsensusKind,
    peers: Mutex<BTreeSet<String>>,
    state: Mutex<ConsensusState>,
    sequence: AtomicU64,
}

impl ConsensusNode {
    pub fn new(node_id: impl Into<String>, kind: ConsensusKind) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            peers: Mutex::new(BTreeSet::new()),
            state: Mutex::new(ConsensusState::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn add_peer(&self, peer: impl Into<String>) {
        self.peers.lock().await.insert(peer.into());
    }

    pub async fn remove_peer(&self, peer: &str) {
        self.peers.lock().await.remove(peer);
    }

    /// Required accept-votes for a proposal to be decided.
    pub async fn quorum_size(&self) -> usize {
        let total = self.peers.lock().await.len() + 1; // include self
        match self.kind {
            ConsensusKind::SimpleMajority => total / 2 + 1,
            ConsensusKind::Byzantine => {
                let f = (total - 1) / 3;
                2 * f + 1
            }
        }
    }

    /// Propose a value. The proposer records its own accept vote.
    pub async fn propose(&self, value: Value) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", self.node_id, seq);

        {
            let mut state = self.state.lock().await;
            state.proposals.insert(
                id.clone(),
                Proposal { id: id.clone(), proposer: self.node_id.clone(), value },
            );
            state.votes.insert(id.clone(), Vec::new());
        }

        // The proposer backs its own proposal.
        self.vote(&id, true, Some("proposer".into()))
            .await
            .unwrap_or_else(|_| unreachable!("proposal was just inserted"));
        debug!(proposal = %id, "proposed value");
        id
    }

    /// Record a vote from this node on a proposal.
    pub async fn vote(
        &self,
        proposal_id: &str,
        accept: bool,
        reason: Option<String>,
    ) -> Result<(), FabricError> {
        self.record_vote(self.node_id.clone(), proposal_id, accept, reason).await
    }

    /// Record a vote on behalf of a named voter (e.g. relayed from a peer).
    pub async fn record_vote(
        &self,
        voter: String,
        proposal_id: &str,
        accept: bool,
        reason: Option<String>,
    ) -> Result<(), FabricError> {
        let mut state = self.state.lock().await;
        if !state.proposals.contains_key(proposal_id) {
            return Err(FabricError::NotFound(format!("proposal {proposal_id}")));
        }
        state.votes.entry(proposal_id.to_string()).or_default().push(Vote {
            voter,
            proposal_id: proposal_id.to_string(),
            accept,
            reason,
        });
        Ok(())
    }

    /// The agreed value once accept-votes reach quorum, else `None`.
    pub async fn consensus(&self, proposal_id: &str) -> Option<Value> {
        let quorum = self.quorum_size().await;
        let state = self.state.lock().await;
        let accepts = state
            .votes
            .get(proposal_id)
            .map(|votes| votes.iter().filter(|v| v.accept).count())
            .unwrap_or(0);
        if accepts >= quorum {
            state.proposals.get(proposal_id).map(|p| p.value.clone())
        } else {
            None
        }
    }

    /// Votes recorded for a proposal (diagnostics/tests).
    pub async fn votes(&self, proposal_id: &str) -> Vec<Vote> {
        self.state.lock().await.votes.get(proposal_id).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for ConsensusNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusNode")
            .field("node_id", &self.node_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn majority_quorum_formula() {
        let node = ConsensusNode::new("n1", ConsensusKind::SimpleMajority);
        assert_eq!(node.quorum_size().await, 1); // just self

        for peer in ["n2", "n3", "n4"] {
            node.add_peer(peer).await;
        }
        assert_eq!(node.quorum_size().await, 3); // 4 nodes -> 3
    }

    #[tokio::test]
    async fn byzantine_quorum_formula() {
        let node = ConsensusNode::new("n1", ConsensusKind::Byzantine);
        for i in 2..=4 {
            node.add_peer(format!("n{i}")).await;
        }
        // n=4 -> f=1 -> quorum 3
        assert_eq!(node.quorum_size().await, 3);

        for i in 5..=7 {
            node.add_peer(format!("n{i}")).await;
        }
        // n=7 -> f=2 -> quorum 5
        assert_eq!(node.quorum_size().await, 5);
    }

    #[tokio::test]
    async fn consensus_reached_at_quorum() {
        let node = ConsensusNode::new("n1", ConsensusKind::SimpleMajority);
        node.add_peer("n2").await;
        node.add_peer("n3").await;

        let id = node.propose(json!({"plan": "ship"})).await;
        // Proposer's auto-vote alone is below the quorum of 2.
        assert!(node.consensus(&id).await.is_none());

        node.record_vote("n2".into(), &id, true, None).await.unwrap();
        assert_eq!(node.consensus(&id).await.unwrap(), json!({"plan": "ship"}));
    }

    #[tokio::test]
    async fn rejections_do_not_count() {
        let node = ConsensusNode::new("n1", ConsensusKind::SimpleMajority);
        node.add_peer("n2").await;
        node.add_peer("n3").await;

        let id = node.propose(json!(1)).await;
        node.record_vote("n2".into(), &id, false, Some("disagree".into())).await.unwrap();
        node.record_vote("n3".into(), &id, false, None).await.unwrap();
        assert!(node.consensus(&id).await.is_none());
        assert_eq!(node.votes(&id).await.len(), 3);
    }

    #[tokio::test]
    async fn voting_on_unknown_proposal_fails() {
        let node = ConsensusNode::new("n1", ConsensusKind::SimpleMajority);
        let err = node.vote("ghost", true, None).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
    }
}
