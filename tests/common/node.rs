use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use lbft_rs::{
    config::Options,
    events::{CommittedEvent, DeliverEvent, InstallPrimaryEvent},
    types::{ChainID, ReplicaID, SeqNo},
    CommittedTxs, Consenter, Lbft, LbftSpec,
};

use crate::common::{
    logging::log_with_context,
    mem_pool::{MemPool, TransferTx},
    network::NetworkStub,
};

/// Things the Nodes will have in common:
/// - Options from [`test_options`], unless a test overrides them.
///
/// Things that they will differ in:
/// - Chain and id.
/// - Transaction pool.
/// - Network stub.
pub(crate) struct Node {
    id: ReplicaID,
    chain: ChainID,
    mem_pool: MemPool,
    committed: Arc<Mutex<Vec<CommittedTxs<TransferTx>>>>,
    lbft: Arc<Lbft<MemPool>>,
}

/// Options shared by every test node: short timers, and no empty blocks.
pub(crate) fn test_options(chain: ChainID, id: ReplicaID) -> Options {
    Options::builder()
        .chain(chain)
        .id(id)
        .block_interval(Duration::from_millis(1000))
        .block_timeout(Duration::from_millis(800))
        .block_delay(Duration::from_secs(600))
        .view_change(Duration::from_millis(1000))
        .resend_view_change(Duration::from_millis(500))
        .view_change_period(Duration::from_secs(2))
        .null_request(Duration::from_millis(300))
        .log_events(false)
        .build()
}

impl Node {
    pub(crate) fn new(chain: ChainID, id: ReplicaID, network: NetworkStub) -> Node {
        Node::with_options(test_options(chain, id), network)
    }

    pub(crate) fn with_options(options: Options, network: NetworkStub) -> Node {
        let mem_pool = MemPool::new();
        let (chain, id) = (options.chain.clone(), options.id.clone());

        let lbft = LbftSpec::builder()
            .options(options)
            .stack(mem_pool.clone())
            .on_install_primary(install_primary_handler(id.clone()))
            .on_committed(committed_handler(id.clone()))
            .on_deliver(deliver_handler(id.clone()))
            .build()
            .start()
            .unwrap();
        let lbft = Arc::new(lbft);

        let (inbox, network) = network.split();
        let outbound = lbft.broadcast_consensus_channel().unwrap();
        thread::spawn(move || {
            for broadcast in outbound {
                network.send(broadcast);
            }
        });
        start_polling(Arc::downgrade(&lbft), inbox);

        let committed = Arc::new(Mutex::new(Vec::new()));
        let committed_txs = lbft.committed_txs_channel().unwrap();
        let sink = committed.clone();
        thread::spawn(move || {
            for committed_txs in committed_txs {
                sink.lock().unwrap().push(committed_txs);
            }
        });

        lbft.start();

        Node {
            id,
            chain,
            mem_pool,
            committed,
            lbft,
        }
    }

    pub(crate) fn id(&self) -> &ReplicaID {
        &self.id
    }

    pub(crate) fn chain(&self) -> &ChainID {
        &self.chain
    }

    pub(crate) fn submit_transactions(&self, txs: Vec<TransferTx>) {
        self.mem_pool.submit(txs);
    }

    pub(crate) fn primary(&self) -> Option<ReplicaID> {
        self.lbft.primary()
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.lbft.is_primary()
    }

    /// Sequence numbers delivered to block production so far, in delivery order.
    pub(crate) fn delivered_seq_nos(&self) -> Vec<SeqNo> {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .flat_map(|committed_txs| committed_txs.seq_nos.iter().copied())
            .collect()
    }

    /// Transactions delivered to block production so far, in delivery order.
    pub(crate) fn delivered_txs(&self) -> Vec<TransferTx> {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .flat_map(|committed_txs| committed_txs.transactions.iter().cloned())
            .collect()
    }

    pub(crate) fn verify_seq_no(&self) -> SeqNo {
        self.lbft.verify_seq_no()
    }

    pub(crate) fn exec_seq_no(&self) -> SeqNo {
        self.lbft.exec_seq_no()
    }

    /// Stop the replica's loops. It stays connected to the network, but neither sends nor
    /// processes messages.
    pub(crate) fn stop(&self) {
        self.lbft.stop();
    }
}

fn start_polling(lbft: Weak<Lbft<MemPool>>, inbox: Receiver<Vec<u8>>) {
    thread::spawn(move || loop {
        match inbox.recv_timeout(Duration::from_millis(50)) {
            Ok(payload) => match lbft.upgrade() {
                Some(lbft) => {
                    let _ = lbft.recv_consensus(&payload);
                }
                None => return,
            },
            Err(RecvTimeoutError::Timeout) => {
                if lbft.strong_count() == 0 {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    });
}

fn install_primary_handler(id: ReplicaID) -> impl Fn(&InstallPrimaryEvent) + Send + 'static {
    move |install_primary_event: &InstallPrimaryEvent| {
        log_with_context(
            &id,
            &format!(
                "Installed {} as primary at height {}",
                install_primary_event.primary, install_primary_event.h
            ),
        )
    }
}

fn committed_handler(id: ReplicaID) -> impl Fn(&CommittedEvent) + Send + 'static {
    move |committed_event: &CommittedEvent| {
        log_with_context(
            &id,
            &format!(
                "Committed {} at seq_no {}",
                committed_event.name, committed_event.seq_no
            ),
        )
    }
}

fn deliver_handler(id: ReplicaID) -> impl Fn(&DeliverEvent) + Send + 'static {
    move |deliver_event: &DeliverEvent| {
        log_with_context(
            &id,
            &format!(
                "Delivered {} transactions at seq_nos {:?}",
                deliver_event.transactions, deliver_event.seq_nos
            ),
        )
    }
}
