//! Drives channels of one participant: opening, off-chain updates and
//! closing, moving messages between the [ActiveChannel]s, the wire and the
//! ledger.
//!
//! Incoming envelopes are passed to [Client::receive]. Proposals for known
//! channels are answered right away, everything else goes through the
//! [Relay] to whoever waits for it. Envelopes for channels that are still
//! being opened stay in the relay until the channel is known. For channels
//! nobody opens yet, only a bounded number of initial-state signatures is
//! kept. Answers nobody waits for are dropped.

use crate::{
    abiencode::types::{Address, Hash},
    adjudicator::{Adjudicator, AdjudicatorError},
    channel::{
        ActiveChannel, Allocation, AgreedUponChannel, ApplyError, BuildError, NotAParticipant,
        Params, PartIdx, ProposeUpdateError, SignError, SignedState, State,
    },
    config::ClientConfig,
    funder::{Funder, FundingError, FundingReq},
    ledger::{Ledger, LedgerError},
    messages::{ChannelUpdateRejected, Envelope, ParticipantMessage},
    sig::Account,
    wire::{MessageBus, PredicateId, Relay, Subscription, WireError},
};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt::Debug, sync::Arc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Decides on valid update proposals of other participants.
pub trait UpdateHandler: Debug + Send + Sync {
    /// Return `Err(reason)` to reject `proposed`.
    fn handle_update(
        &self,
        current: &State,
        proposed: &State,
        actor: PartIdx,
    ) -> Result<(), String>;
}

/// Accepts every valid proposal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl UpdateHandler for AcceptAll {
    fn handle_update(&self, _: &State, _: &State, _: PartIdx) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("channel {0:?} is already open")]
    AlreadyOpen(Hash),
    #[error("{0}")]
    NotAParticipant(#[from] NotAParticipant),
    #[error("{0}")]
    Sign(#[from] SignError),
    #[error("{0}")]
    Build(#[from] BuildError),
    #[error("participants {missing:?} did not sign the initial state in time")]
    TimedOut { missing: Vec<PartIdx> },
    #[error("{0}")]
    Wire(#[from] WireError),
    #[error("funding failed: {0}")]
    Funding(#[from] FundingError),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{0}")]
    Propose(#[from] ProposeUpdateError),
    #[error("update rejected: {reason}")]
    Rejected { reason: String },
    #[error("participants {missing:?} did not answer in time")]
    TimedOut { missing: Vec<PartIdx> },
    #[error("{0}")]
    Apply(#[from] ApplyError),
    #[error("{0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("{0}")]
    Update(#[from] UpdateError),
    #[error("{0}")]
    Adjudicator(#[from] AdjudicatorError),
    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug)]
struct Inner {
    account: Arc<dyn Account>,
    bus: Arc<dyn MessageBus>,
    ledger: Arc<dyn Ledger>,
    handler: Arc<dyn UpdateHandler>,
    config: ClientConfig,
    funder: Funder,
    adjudicator: Adjudicator,
    relay: Relay,
    channels: Mutex<HashMap<Hash, Arc<Mutex<ActiveChannel>>>>,
    // Per open channel: acknowledgements that overtook their proposal.
    early_acks: Mutex<HashMap<Hash, PredicateId>>,
}

/// Cloning yields another handle to the same client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

const MAX_EARLY_SIGNATURES: usize = 256;

fn is_initial_signature(e: &Envelope) -> bool {
    matches!(&e.msg, ParticipantMessage::ChannelUpdateAccepted(m) if m.version == 0)
}

/// Whether `e` answers the proposal of `version` in `channel`.
fn is_response(e: &Envelope, channel: Hash, version: u64) -> bool {
    match &e.msg {
        ParticipantMessage::ChannelUpdateAccepted(m) => m.channel == channel && m.version == version,
        ParticipantMessage::ChannelUpdateRejected(m) => m.channel == channel && m.version == version,
        _ => false,
    }
}

impl Client {
    pub fn new(
        account: Arc<dyn Account>,
        bus: Arc<dyn MessageBus>,
        ledger: Arc<dyn Ledger>,
        handler: Arc<dyn UpdateHandler>,
        config: ClientConfig,
    ) -> Self {
        let relay = Relay::new();
        // Peers may sign the initial state before we start opening.
        relay.cache(Arc::new(is_initial_signature));
        Client {
            inner: Arc::new(Inner {
                funder: Funder::new(ledger.clone(), &config),
                adjudicator: Adjudicator::new(ledger.clone(), account.clone(), &config),
                account,
                bus,
                ledger,
                handler,
                config,
                relay,
                channels: Mutex::new(HashMap::new()),
                early_acks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.account.address()
    }

    /// Register the assets this client deposits here before opening
    /// channels.
    pub fn funder(&self) -> &Funder {
        &self.inner.funder
    }

    pub fn adjudicator(&self) -> &Adjudicator {
        &self.inner.adjudicator
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn channel(&self, id: Hash) -> Option<ChannelHandle> {
        let channel = self.inner.channels.lock().get(&id).cloned()?;
        Some(ChannelHandle {
            client: self.clone(),
            id,
            channel,
        })
    }

    /// Agree on the initial state with all participants, fund our share and
    /// wait until everyone funded. All participants call this with the same
    /// arguments.
    #[instrument(skip_all, fields(channel = ?params.channel_id()))]
    pub async fn open_channel(
        &self,
        params: Params,
        alloc: Allocation,
    ) -> Result<ChannelHandle, OpenError> {
        let id = params.channel_id();
        if self.inner.channels.lock().contains_key(&id) {
            return Err(OpenError::AlreadyOpen(id));
        }

        let opening = Opening::new(&self.inner.relay, id);
        let init_state = State::new(&params, alloc);
        let mut agreed =
            AgreedUponChannel::new(self.inner.account.clone(), params.clone(), init_state)?;
        let part_idx = agreed.part_idx();

        let mut sub = self.inner.relay.subscribe(move |e| {
            matches!(&e.msg, ParticipantMessage::ChannelUpdateAccepted(m) if m.channel == id && m.version == 0)
        });
        let acc = agreed.sign()?;
        self.send_to_others(&params, part_idx, ParticipantMessage::ChannelUpdateAccepted(acc))?;

        let deadline = Instant::now() + self.inner.config.response_timeout;
        while !agreed.missing_signatures().is_empty() {
            let env = match sub.next(deadline).await {
                Some(env) => env,
                None => {
                    return Err(OpenError::TimedOut {
                        missing: agreed.missing_signatures(),
                    })
                }
            };
            if let ParticipantMessage::ChannelUpdateAccepted(m) = env.msg {
                if let Err(e) = agreed.add_signature(&m) {
                    warn!(sender = ?env.sender, error = %e, "invalid signature on initial state");
                }
            }
        }
        drop(sub);
        let signed = agreed.build()?;
        debug!("initial state signed");

        let req = FundingReq {
            params,
            state: signed.state.clone(),
            part_idx,
        };
        let deadline = Instant::now() + self.inner.config.funding_timeout;
        self.inner.funder.fund(&req, deadline).await?;

        let channel = Arc::new(Mutex::new(ActiveChannel::new(
            self.inner.account.clone(),
            part_idx,
            signed,
        )));
        info!(part_idx, "channel open");
        self.activate(id, channel.clone(), opening);

        Ok(ChannelHandle {
            client: self.clone(),
            id,
            channel,
        })
    }

    /// Make `channel` known and handle the envelopes that arrived while it
    /// was being opened, in arrival order.
    fn activate(&self, id: Hash, channel: Arc<Mutex<ActiveChannel>>, opening: Opening) {
        self.inner.channels.lock().insert(id, channel);
        let acks = self.inner.relay.cache(Arc::new(move |e: &Envelope| {
            matches!(&e.msg, ParticipantMessage::ChannelUpdateAccepted(m) if m.channel == id)
        }));
        if let Some(old) = self.inner.early_acks.lock().insert(id, acks) {
            self.inner.relay.release(old);
        }
        for env in opening.finish() {
            self.receive(env);
        }
    }

    /// Entry point for every envelope from the wire.
    pub fn receive(&self, env: Envelope) {
        if env.recipient != self.address() {
            warn!(recipient = ?env.recipient, "envelope for somebody else");
            return;
        }
        let id = env.msg.channel_id();
        let channel = self.inner.channels.lock().get(&id).cloned();
        let channel = match channel {
            Some(channel) => channel,
            None => return self.retain_early(env),
        };
        if env.msg.is_proposal() {
            return self.handle_proposal(&channel, env);
        }

        let version = env.msg.version();
        let (current, from_participant) = {
            let ch = channel.lock();
            (ch.version(), ch.params().index_of(&env.sender).is_some())
        };
        if !from_participant {
            warn!(channel = ?id, sender = ?env.sender, "answer from a non-participant");
            return;
        }
        if version <= current {
            debug!(channel = ?id, version, "dropped stale response");
            return;
        }
        if let ParticipantMessage::ChannelUpdateAccepted(_) = &env.msg {
            if version != current + 1 {
                debug!(channel = ?id, version, "dropped acknowledgement of a future version");
                return;
            }
            // At most one waiting acknowledgement per sender.
            let sender = env.sender;
            self.inner.relay.drain(|e| {
                e.sender == sender
                    && matches!(&e.msg, ParticipantMessage::ChannelUpdateAccepted(m) if m.channel == id)
            });
        }
        if !self.inner.relay.put(env) {
            debug!(channel = ?id, version, "dropped answer nobody waits for");
        }
    }

    /// Cache an envelope for a channel that is not open (yet). It is only
    /// kept if the channel is being opened or it is a signature on an
    /// initial state.
    fn retain_early(&self, env: Envelope) {
        let id = env.msg.channel_id();
        let relay = &self.inner.relay;
        if is_initial_signature(&env) {
            let sender = env.sender;
            relay.drain(|e| is_initial_signature(e) && e.sender == sender && e.msg.channel_id() == id);
            if relay.count(is_initial_signature) >= MAX_EARLY_SIGNATURES {
                warn!(channel = ?id, "too many initial-state signatures cached");
                return;
            }
        }
        if !relay.put(env) {
            debug!(channel = ?id, "dropped envelope for unknown channel");
        }
    }

    fn handle_proposal(&self, channel: &Arc<Mutex<ActiveChannel>>, env: Envelope) {
        let version = env.msg.version();
        let (proposed, actor) = match &env.msg {
            ParticipantMessage::ChannelUpdate(m) => (m.state.clone(), m.actor_idx),
            ParticipantMessage::VirtualChannelFundingProposal(m) => {
                (m.update.state.clone(), m.update.actor_idx)
            }
            ParticipantMessage::VirtualChannelSettlementProposal(m) => {
                (m.update.state.clone(), m.update.actor_idx)
            }
            _ => return,
        };

        let mut replies = vec![];
        let mut collect = false;
        let (id, params, part_idx) = {
            let mut ch = channel.lock();
            let id = ch.channel_id();
            let params = ch.params().clone();
            let part_idx = ch.part_idx();

            let res = match env.msg {
                ParticipantMessage::ChannelUpdate(m) => ch.handle_update(m),
                ParticipantMessage::VirtualChannelFundingProposal(m) => {
                    ch.handle_sub_channel_funding(m)
                }
                ParticipantMessage::VirtualChannelSettlementProposal(m) => {
                    ch.handle_sub_channel_settlement(m)
                }
                _ => return,
            };

            match res {
                Err(e) => {
                    debug!(channel = ?id, version, error = %e, "invalid proposal");
                    // Our own pending update (if any) stays untouched.
                    replies.push((
                        env.sender,
                        ParticipantMessage::ChannelUpdateRejected(ChannelUpdateRejected {
                            channel: id,
                            version,
                            reason: e.to_string(),
                        }),
                    ));
                }
                Ok(()) => {
                    let decision = self.inner.handler.handle_update(ch.state(), &proposed, actor);
                    let reply = match decision {
                        Err(reason) => ch
                            .reject(&reason)
                            .map(ParticipantMessage::ChannelUpdateRejected),
                        Ok(()) => ch.accept().map(ParticipantMessage::ChannelUpdateAccepted),
                    };
                    match reply {
                        Ok(msg) => {
                            for (idx, p) in params.participants.iter().enumerate() {
                                if idx != part_idx {
                                    replies.push((*p, msg.clone()));
                                }
                            }
                        }
                        Err(e) => warn!(channel = ?id, error = %e, "cannot answer proposal"),
                    }
                    if ch.pending().is_some() {
                        if ch.missing_signatures().is_empty() {
                            if let Err(e) = ch.apply() {
                                warn!(channel = ?id, error = %e, "applying update failed");
                            }
                        } else {
                            collect = true;
                        }
                    }
                }
            }
            (id, params, part_idx)
        };

        // Subscribe before answering so no answer of the other responders
        // slips through.
        let sub = collect.then(|| {
            self.inner
                .relay
                .subscribe(move |e| is_response(e, id, version))
                .discard_unread()
        });
        for (recipient, msg) in replies {
            let env = Envelope {
                sender: self.address(),
                recipient,
                msg,
            };
            if let Err(e) = self.inner.bus.send(env) {
                warn!(channel = ?id, error = %e, "sending answer failed");
            }
        }

        if let Some(sub) = sub {
            self.spawn_collector(channel.clone(), sub, id, version, params.num_parts());
        }
    }

    /// With more than two participants, the answers of the other
    /// responders are collected in the background.
    fn spawn_collector(
        &self,
        channel: Arc<Mutex<ActiveChannel>>,
        mut sub: Subscription,
        id: Hash,
        version: u64,
        participants: usize,
    ) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(channel = ?id, "no runtime to collect signatures on");
                channel.lock().abort();
                return;
            }
        };
        debug!(
            channel = ?id,
            version,
            participants,
            "collecting signatures"
        );
        let client = self.clone();
        let deadline = Instant::now() + self.inner.config.response_timeout;
        runtime.spawn(async move {
            if let Err(e) = client.collect(&channel, &mut sub, deadline).await {
                warn!(channel = ?id, version, error = %e, "update failed");
            }
        });
    }

    /// Feed the answers arriving on `sub` into `channel` until all
    /// signatures are present, the update is rejected or `deadline` passes.
    async fn collect(
        &self,
        channel: &Mutex<ActiveChannel>,
        sub: &mut Subscription,
        deadline: Instant,
    ) -> Result<(), UpdateError> {
        loop {
            let missing = channel.lock().missing_signatures();
            if missing.is_empty() {
                let mut ch = channel.lock();
                ch.apply()?;
                return Ok(());
            }

            let env = match sub.next(deadline).await {
                Some(env) => env,
                None => {
                    channel.lock().abort();
                    return Err(UpdateError::TimedOut { missing });
                }
            };

            let mut ch = channel.lock();
            let sender = ch.params().index_of(&env.sender);
            match (env.msg, sender) {
                (ParticipantMessage::ChannelUpdateAccepted(acc), Some(idx)) => {
                    if let Err(e) = ch.handle_accepted(idx, &acc) {
                        warn!(sender = idx, error = %e, "invalid acknowledgement");
                    }
                }
                (ParticipantMessage::ChannelUpdateRejected(rej), Some(_)) => {
                    if ch.handle_rejected(&rej) {
                        return Err(UpdateError::Rejected { reason: rej.reason });
                    }
                }
                (_, _) => warn!(sender = ?env.sender, "unexpected answer"),
            }
        }
    }

    fn send_to_others(
        &self,
        params: &Params,
        part_idx: PartIdx,
        msg: ParticipantMessage,
    ) -> Result<(), WireError> {
        for (idx, recipient) in params.participants.iter().enumerate() {
            if idx == part_idx {
                continue;
            }
            self.inner.bus.send(Envelope {
                sender: self.address(),
                recipient: *recipient,
                msg: msg.clone(),
            })?;
        }
        Ok(())
    }

    /// Drop all cached envelopes and stop caching new ones.
    pub fn shutdown(&self) {
        self.inner.relay.flush();
        info!("client shut down");
    }
}

/// Keeps the envelopes of a channel while it is being opened. Dropping it
/// without [Opening::finish] discards them.
#[derive(Debug)]
struct Opening {
    relay: Relay,
    id: Hash,
    pred: PredicateId,
    done: bool,
}

impl Opening {
    fn new(relay: &Relay, id: Hash) -> Self {
        let pred = relay.cache(Arc::new(move |e: &Envelope| e.msg.channel_id() == id));
        Opening {
            relay: relay.clone(),
            id,
            pred,
            done: false,
        }
    }

    /// Stop caching and hand out what was cached.
    fn finish(mut self) -> Vec<Envelope> {
        self.done = true;
        self.take()
    }

    fn take(&self) -> Vec<Envelope> {
        self.relay.release(self.pred);
        let id = self.id;
        self.relay.drain(move |e| e.msg.channel_id() == id)
    }
}

impl Drop for Opening {
    fn drop(&mut self) {
        if !self.done {
            let dropped = self.take();
            debug!(channel = ?self.id, count = dropped.len(), "opening abandoned");
        }
    }
}

/// Handle to an open channel of a [Client].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    client: Client,
    id: Hash,
    channel: Arc<Mutex<ActiveChannel>>,
}

impl ChannelHandle {
    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn state(&self) -> State {
        self.channel.lock().state().clone()
    }

    pub fn signed_state(&self) -> SignedState {
        self.channel.lock().signed_state().clone()
    }

    pub fn version(&self) -> u64 {
        self.channel.lock().version()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.lock().is_closed()
    }

    /// Propose `new_state` and wait until all participants signed it.
    #[instrument(skip_all, fields(channel = ?self.id, version = new_state.version()))]
    pub async fn update(&self, new_state: State) -> Result<(), UpdateError> {
        self.run_update(|ch| ch.propose(new_state).map(ParticipantMessage::ChannelUpdate))
            .await
    }

    /// Propose the current state with the version bumped and `f` applied.
    pub async fn update_by<F>(&self, f: F) -> Result<(), UpdateError>
    where
        F: FnOnce(&mut State) + Send,
    {
        let mut new_state = self.channel.lock().next_state();
        f(&mut new_state);
        self.update(new_state).await
    }

    /// Lock funds of the parent channel for the sub-channel `initial`.
    pub async fn fund_sub_channel(
        &self,
        new_state: State,
        initial: SignedState,
        index_map: Vec<u16>,
    ) -> Result<(), UpdateError> {
        self.run_update(|ch| {
            ch.propose_sub_channel_funding(new_state, initial, index_map)
                .map(ParticipantMessage::VirtualChannelFundingProposal)
        })
        .await
    }

    /// Release the funds locked for the finalized sub-channel `final_state`.
    pub async fn settle_sub_channel(
        &self,
        new_state: State,
        final_state: SignedState,
    ) -> Result<(), UpdateError> {
        self.run_update(|ch| {
            ch.propose_sub_channel_settlement(new_state, final_state)
                .map(ParticipantMessage::VirtualChannelSettlementProposal)
        })
        .await
    }

    async fn run_update<F>(&self, propose: F) -> Result<(), UpdateError>
    where
        F: FnOnce(&mut ActiveChannel) -> Result<ParticipantMessage, ProposeUpdateError> + Send,
    {
        let (msg, params, part_idx) = {
            let mut ch = self.channel.lock();
            let msg = propose(&mut *ch)?;
            (msg, ch.params().clone(), ch.part_idx())
        };
        let id = self.id;
        let version = msg.version();
        let mut sub = self
            .client
            .inner
            .relay
            .subscribe(move |e| is_response(e, id, version))
            .discard_unread();

        if let Err(e) = self.client.send_to_others(&params, part_idx, msg) {
            self.channel.lock().abort();
            return Err(e.into());
        }
        let deadline = Instant::now() + self.client.inner.config.response_timeout;
        self.client.collect(&self.channel, &mut sub, deadline).await
    }

    /// Cooperatively close: agree on a final state, conclude it on the
    /// ledger and withdraw our share to `receiver`.
    #[instrument(skip_all, fields(channel = ?self.id))]
    pub async fn close(&self, receiver: Address) -> Result<(), CloseError> {
        self.run_update(|ch| ch.close_normal().map(ParticipantMessage::ChannelUpdate))
            .await?;
        self.settle(receiver).await
    }

    /// Register our latest state on the ledger, e.g. because a peer stopped
    /// answering. Refutes a lower registered version.
    #[instrument(skip_all, fields(channel = ?self.id))]
    pub async fn force_close(&self) -> Result<(), CloseError> {
        let signed = self.signed_state();
        self.client.inner.adjudicator.register(&signed).await?;
        Ok(())
    }

    /// Wait until the challenge window of the registered state elapsed.
    pub async fn wait_for_timeout(&self, deadline: Instant) -> Result<(), CloseError> {
        self.client
            .inner
            .adjudicator
            .wait_for_timeout(self.id, deadline)
            .await?;
        Ok(())
    }

    /// Conclude the channel and withdraw our share to `receiver`.
    ///
    /// A non-final state is registered first (if it is not already) and can
    /// only be concluded after its challenge window.
    #[instrument(skip_all, fields(channel = ?self.id))]
    pub async fn settle(&self, receiver: Address) -> Result<(), CloseError> {
        let (signed, part_idx) = {
            let ch = self.channel.lock();
            (ch.signed_state().clone(), ch.part_idx())
        };
        let adjudicator = &self.client.inner.adjudicator;

        if !signed.state.is_final {
            match adjudicator.register(&signed).await {
                // A peer registered a newer state, that one is concluded.
                Ok(_)
                | Err(AdjudicatorError::Superseded { .. })
                | Err(AdjudicatorError::AlreadyConcluded(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        adjudicator.conclude(&signed).await?;

        let record = self
            .client
            .inner
            .ledger
            .dispute(self.id)
            .await?
            .ok_or(AdjudicatorError::NotRegistered)?;
        let has_funds = record
            .state
            .state
            .outcome
            .balances
            .get(part_idx)
            .map_or(false, |b| b.iter().any(|v| !v.is_zero()));
        if has_funds {
            adjudicator.withdraw(self.id, part_idx, receiver).await?;
        }

        info!(version = record.version(), "channel settled");
        self.channel.lock().settle(record.state);
        Ok(())
    }
}
