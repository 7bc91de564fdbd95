use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, Sender},
};

use lbft_rs::{messages::ConsensusMessage, types::ChainID, Broadcast};
use rand::seq::SliceRandom;

/// Rewrites a replica's outbound messages before they reach its peers.
pub(crate) type Tamper = fn(ConsensusMessage) -> ConsensusMessage;

/// A mock network stub which passes encoded consensus messages between threads using channels.
///
/// A [`Broadcast`] is delivered to every replica of the chain it is addressed to, the sender included,
/// in a random order.
pub(crate) struct NetworkStub {
    chains: HashMap<ChainID, Vec<Sender<Vec<u8>>>>,
    inbox: Receiver<Vec<u8>>,
    tamper: Option<Tamper>,
}

impl NetworkStub {
    /// Make this replica rewrite every message it sends with `tamper`.
    pub(crate) fn tampered(mut self, tamper: Tamper) -> NetworkStub {
        self.tamper = Some(tamper);
        self
    }

    pub(crate) fn split(self) -> (Receiver<Vec<u8>>, NetworkSender) {
        (
            self.inbox,
            NetworkSender {
                chains: self.chains,
                tamper: self.tamper,
            },
        )
    }
}

/// The sending half of a [`NetworkStub`].
pub(crate) struct NetworkSender {
    chains: HashMap<ChainID, Vec<Sender<Vec<u8>>>>,
    tamper: Option<Tamper>,
}

impl NetworkSender {
    pub(crate) fn send(&self, broadcast: Broadcast) {
        let payload = match self.tamper {
            Some(tamper) => match ConsensusMessage::decode(&broadcast.payload) {
                Ok(msg) => tamper(msg).encode(),
                Err(_) => broadcast.payload,
            },
            None => broadcast.payload,
        };

        let Some(peers) = self.chains.get(&broadcast.to) else {
            return;
        };
        let mut peers: Vec<&Sender<Vec<u8>>> = peers.iter().collect();
        peers.shuffle(&mut rand::thread_rng());
        for peer in peers {
            let _ = peer.send(payload.clone());
        }
    }
}

/// Create one stub per entry of `replicas`, each entry naming the chain the replica belongs to.
pub(crate) fn mock_network<'a>(replicas: impl Iterator<Item = &'a ChainID>) -> Vec<NetworkStub> {
    let mut chains: HashMap<ChainID, Vec<Sender<Vec<u8>>>> = HashMap::new();
    let inboxes: Vec<Receiver<Vec<u8>>> = replicas
        .map(|chain| {
            let (sender, receiver) = mpsc::channel();
            chains.entry(chain.clone()).or_default().push(sender);
            receiver
        })
        .collect();

    inboxes
        .into_iter()
        .map(|inbox| NetworkStub {
            chains: chains.clone(),
            inbox,
            tamper: None,
        })
        .collect()
}
