/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, start, and stop an lbft replica.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](LbftSpec),
//! - The function to [start](LbftSpec::start) an [`Lbft`] given its specification,
//! - The [`Consenter`] trait, through which the node's transport and block-production layers talk
//!   to the replica.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let options = Options::builder()
//!     .chain("0".into())
//!     .id("replica-0".into())
//!     .build();
//!
//! let lbft = LbftSpec::builder()
//!     .options(options)
//!     .stack(mem_pool)
//!     .on_deliver(deliver_handler)
//!     .build()
//!     .start()?;
//!
//! let outbound = lbft.broadcast_consensus_channel().unwrap();
//! let committed = lbft.committed_txs_channel().unwrap();
//! lbft.start();
//! ```
//!
//! [`LbftSpec::start`] validates the options and wires the replica up, but does not run it. The
//! engine loops run between [`Consenter::start`] and [`Consenter::stop`], which may be called any
//! number of times. Dropping the [`Lbft`] stops it for good.
//!
//! ## Transport
//!
//! lbft does not open connections. Every outbound message is a [`Broadcast`] on the channel
//! returned by [`broadcast_consensus_channel`](Consenter::broadcast_consensus_channel), which the
//! transport must deliver to every replica of `Broadcast::to`, including the sender itself. Inbound
//! payloads are handed back through [`recv_consensus`](Consenter::recv_consensus).
//!
//! ## Supervision
//!
//! When the engine reaches a state it cannot safely continue from (see [`FatalError`]) it stops its
//! loops and reports the error on [`fatal_error_channel`](Lbft::fatal_error_channel). The supervisor
//! decides whether to restart the replica with [`Consenter::start`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::config::{ConfigError, Options};
use crate::engine::checkpoint::Aggregator;
use crate::engine::dispatch::Dispatcher;
use crate::engine::proposer::Proposer;
use crate::engine::{AggregateInput, CommittedTxs, DispatchInput, Engine, EngineOutputs, FatalError};
use crate::event_bus::*;
use crate::events::*;
use crate::messages::{Broadcast, ConsensusMessage, WireError};
use crate::stack::Stack;
use crate::types::{ReplicaID, SeqNo};

/// The interface between an lbft replica and the node it runs in.
pub trait Consenter {
    type Tx;

    /// Start the engine loops. Calling `start` on a running replica does nothing.
    fn start(&self);

    /// Stop the engine loops and every running instance. Calling `stop` on a stopped replica does
    /// nothing.
    fn stop(&self);

    /// Hand an encoded consensus message received from the transport to the replica.
    fn recv_consensus(&self, payload: &[u8]) -> Result<(), WireError>;

    /// Take the receiving end of the outbound message channel. Returns `None` after the first call.
    fn broadcast_consensus_channel(&self) -> Option<Receiver<Broadcast>>;

    /// Take the receiving end of the committed transactions channel. Returns `None` after the first
    /// call.
    fn committed_txs_channel(&self) -> Option<Receiver<CommittedTxs<Self::Tx>>>;
}

/// Stores the options, the transaction pool, and the event handlers required to start an [`Lbft`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [LbftSpec]. On the builder call the following methods to construct a valid [LbftSpec].

    Required:
    - `.options(...)`
    - `.stack(...)`

    Optional:
    - `.on_propose(...)`
    - `.on_receive_pre_prepare(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_pass_prepare(...)`
    - `.on_pass_commit(...)`
    - `.on_committed(...)`
    - `.on_deliver(...)`
    - `.on_fetch_committed(...)`
    - `.on_view_change_vote(...)`
    - `.on_install_primary(...)`
    - `.on_instance_timeout(...)`
"))]
pub struct LbftSpec<S: Stack> {
    // Required parameters
    #[builder(setter(doc = "Set the replica's [options](Options). Required."))]
    options: Options,
    #[builder(setter(doc = "Set the transaction pool the replica orders transactions from. The argument must implement the [Stack](crate::stack::Stack) trait. Required."))]
    stack: S,

    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica, as primary, proposes a batch. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrePrepareEvent>),
    doc = "Register a handler closure to be invoked after an instance receives a PrePrepare. Optional."))]
    on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica sends a Prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica sends a Commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&PassPrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PassPrepareEvent>),
    doc = "Register a handler closure to be invoked after an instance collects a Prepare quorum. Optional."))]
    on_pass_prepare: Option<HandlerPtr<PassPrepareEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&PassCommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PassCommitEvent>),
    doc = "Register a handler closure to be invoked after an instance collects a Commit quorum. Optional."))]
    on_pass_commit: Option<HandlerPtr<PassCommitEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&CommittedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommittedEvent>),
    doc = "Register a handler closure to be invoked after an instance commits its batch. Optional."))]
    on_committed: Option<HandlerPtr<CommittedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&DeliverEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeliverEvent>),
    doc = "Register a handler closure to be invoked after committed batches are delivered to block production. Optional."))]
    on_deliver: Option<HandlerPtr<DeliverEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&FetchCommittedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FetchCommittedEvent>),
    doc = "Register a handler closure to be invoked after the replica asks its peers for a missing batch. Optional."))]
    on_fetch_committed: Option<HandlerPtr<FetchCommittedEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica casts a view change vote. Optional."))]
    on_view_change_vote: Option<HandlerPtr<ViewChangeVoteEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&InstallPrimaryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InstallPrimaryEvent>),
    doc = "Register a handler closure to be invoked after the replica installs a new primary. Optional."))]
    on_install_primary: Option<HandlerPtr<InstallPrimaryEvent>>,

    #[builder(default, setter(transform = |handler: impl Fn(&InstanceTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InstanceTimeoutEvent>),
    doc = "Register a handler closure to be invoked after an instance times out. Optional."))]
    on_instance_timeout: Option<HandlerPtr<InstanceTimeoutEvent>>,
}

impl<S: Stack> LbftSpec<S> {
    /// Validate the options and wire up the replica. The returned [`Lbft`] is stopped; call
    /// [`Consenter::start`] to run it.
    pub fn start(self) -> Result<Lbft<S>, ConfigError> {
        let options = self.options.validate()?;

        let event_handlers = EventHandlers::new(
            options.log_events,
            UserHandlers {
                on_propose: self.on_propose,
                on_receive_pre_prepare: self.on_receive_pre_prepare,
                on_prepare: self.on_prepare,
                on_commit: self.on_commit,
                on_pass_prepare: self.on_pass_prepare,
                on_pass_commit: self.on_pass_commit,
                on_committed: self.on_committed,
                on_deliver: self.on_deliver,
                on_fetch_committed: self.on_fetch_committed,
                on_view_change_vote: self.on_view_change_vote,
                on_install_primary: self.on_install_primary,
                on_instance_timeout: self.on_instance_timeout,
            },
        );

        let (event_publisher, event_bus, event_bus_shutdown) = if !event_handlers.is_empty() {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus =
                start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
            (Some(event_publisher), Some(event_bus), Some(event_bus_shutdown))
        } else {
            (None, None, None)
        };

        let (broadcasts, broadcasts_receiver) = mpsc::channel();
        let (committed_txs, committed_txs_receiver) = mpsc::channel();
        let (fatal_errors, fatal_errors_receiver) = mpsc::channel();
        let outputs = EngineOutputs {
            broadcasts,
            committed_txs,
            fatal_errors,
        };

        log::info!(
            "replica {} of chain {}: n = {}, q = {}, k = {}",
            options.id,
            options.chain,
            options.n,
            options.q,
            options.k
        );
        let (engine, dispatch_inbox, aggregate_inbox) =
            Engine::new(options, self.stack, outputs, event_publisher);

        Ok(Lbft {
            engine,
            loops: Mutex::new(Some(Loops::Idle {
                dispatch_inbox,
                aggregate_inbox,
            })),
            broadcasts: Mutex::new(Some(broadcasts_receiver)),
            committed_txs: Mutex::new(Some(committed_txs_receiver)),
            fatal_errors: Mutex::new(Some(fatal_errors_receiver)),
            event_bus,
            event_bus_shutdown,
        })
    }
}

enum Loops {
    Idle {
        dispatch_inbox: Receiver<DispatchInput>,
        aggregate_inbox: Receiver<AggregateInput>,
    },
    Running {
        dispatcher: JoinHandle<Receiver<DispatchInput>>,
        dispatcher_shutdown: Sender<()>,
        proposer: JoinHandle<()>,
        proposer_shutdown: Sender<()>,
        aggregator: JoinHandle<Receiver<AggregateInput>>,
        aggregator_shutdown: Sender<()>,
    },
}

/// A handle to the background threads of an lbft replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Lbft<S: Stack> {
    engine: Arc<Engine<S>>,
    // None only if a loop thread panicked, after which the replica cannot be restarted.
    loops: Mutex<Option<Loops>>,
    broadcasts: Mutex<Option<Receiver<Broadcast>>>,
    committed_txs: Mutex<Option<Receiver<CommittedTxs<S::Tx>>>>,
    fatal_errors: Mutex<Option<Receiver<FatalError>>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<S: Stack> Lbft<S> {
    /// Take the receiving end of the fatal error channel. Returns `None` after the first call.
    pub fn fatal_error_channel(&self) -> Option<Receiver<FatalError>> {
        self.fatal_errors.lock().unwrap().take()
    }

    /// The primary this replica currently follows, if any.
    pub fn primary(&self) -> Option<ReplicaID> {
        self.engine.primary()
    }

    pub fn is_primary(&self) -> bool {
        self.engine.is_primary()
    }

    /// Highest sequence number known to be committed on the local chain.
    pub fn last_seq_no(&self) -> SeqNo {
        self.engine.counters.last_seq_no()
    }

    /// Highest sequence number whose batch this replica re-validated. Never behind
    /// [`exec_seq_no`](Self::exec_seq_no) while the primary is stable.
    pub fn verify_seq_no(&self) -> SeqNo {
        self.engine.counters.verify_seq_no()
    }

    /// Highest sequence number delivered to block production.
    pub fn exec_seq_no(&self) -> SeqNo {
        self.engine.counters.exec_seq_no()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.loops.lock().unwrap(), Some(Loops::Running { .. }))
    }
}

impl<S: Stack> Consenter for Lbft<S> {
    type Tx = S::Tx;

    fn start(&self) {
        let mut loops = self.loops.lock().unwrap();
        let (dispatch_inbox, aggregate_inbox) = match loops.take() {
            Some(Loops::Idle {
                dispatch_inbox,
                aggregate_inbox,
            }) => (dispatch_inbox, aggregate_inbox),
            other => {
                if other.is_none() {
                    log::error!("replica {} cannot be restarted", self.engine.me());
                }
                *loops = other;
                return;
            }
        };

        self.engine.resume();
        log::info!("starting replica {}", self.engine.me());

        let (dispatcher_shutdown, dispatcher_shutdown_receiver) = mpsc::channel();
        let (proposer_shutdown, proposer_shutdown_receiver) = mpsc::channel();
        let (aggregator_shutdown, aggregator_shutdown_receiver) = mpsc::channel();

        let aggregator =
            Aggregator::new(self.engine.clone(), aggregate_inbox, aggregator_shutdown_receiver)
                .start();
        let dispatcher =
            Dispatcher::new(self.engine.clone(), dispatch_inbox, dispatcher_shutdown_receiver)
                .start();
        let proposer = Proposer::new(self.engine.clone(), proposer_shutdown_receiver).start();

        *loops = Some(Loops::Running {
            dispatcher,
            dispatcher_shutdown,
            proposer,
            proposer_shutdown,
            aggregator,
            aggregator_shutdown,
        });
    }

    fn stop(&self) {
        let mut loops = self.loops.lock().unwrap();
        let Some(Loops::Running {
            dispatcher,
            dispatcher_shutdown,
            proposer,
            proposer_shutdown,
            aggregator,
            aggregator_shutdown,
        }) = loops.take()
        else {
            return;
        };
        log::info!("stopping replica {}", self.engine.me());

        // A loop that halted on a fatal error has already dropped its shutdown receiver.
        let _ = proposer_shutdown.send(());
        let _ = dispatcher_shutdown.send(());
        let _ = aggregator_shutdown.send(());

        // Wake instances waiting for their turn so that they observe the stop.
        self.engine.pre_prepare_gate.close();
        self.engine.commit_gate.close();
        self.engine.stop_instances();

        let proposer = proposer.join();
        let dispatcher = dispatcher.join();
        let aggregator = aggregator.join();
        match (proposer, dispatcher, aggregator) {
            (Ok(()), Ok(dispatch_inbox), Ok(aggregate_inbox)) => {
                *loops = Some(Loops::Idle {
                    dispatch_inbox,
                    aggregate_inbox,
                })
            }
            _ => log::error!("an engine loop of replica {} panicked", self.engine.me()),
        }
    }

    fn recv_consensus(&self, payload: &[u8]) -> Result<(), WireError> {
        let msg = ConsensusMessage::decode(payload)?;
        self.engine.dispatch(DispatchInput::Message(msg));
        Ok(())
    }

    fn broadcast_consensus_channel(&self) -> Option<Receiver<Broadcast>> {
        self.broadcasts.lock().unwrap().take()
    }

    fn committed_txs_channel(&self) -> Option<Receiver<CommittedTxs<S::Tx>>> {
        self.committed_txs.lock().unwrap().take()
    }
}

impl<S: Stack> Drop for Lbft<S> {
    fn drop(&mut self) {
        self.stop();
        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
