#![allow(dead_code)]

use parking_lot::Mutex;
use perun_channel::{
    channel::{Allocation, Asset, Params},
    funder::NativeDepositor,
    ledger::SimulatedLedger,
    sig::Signer,
    wire::{decode_envelope, BytesBus, ProtoBufEncodingLayer, WireError},
    AcceptAll, Address, ChannelHandle, Client, ClientConfig, U256,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

pub const CHALLENGE_DURATION: u64 = 60;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-process byte transport: frames are decoded and handed to the
/// recipient's client right away.
#[derive(Debug, Default)]
pub struct Network {
    clients: Mutex<HashMap<Address, Client>>,
}

#[derive(Debug)]
pub struct Link(Arc<Network>);

impl BytesBus for Link {
    fn send(&self, recipient: Address, msg: &[u8]) -> Result<(), WireError> {
        let env = decode_envelope(msg)?;
        let client = self.0.clients.lock().get(&recipient).cloned();
        let client = client.ok_or(WireError::Unreachable(recipient))?;
        client.receive(env);
        Ok(())
    }
}

pub struct World {
    pub ledger: Arc<SimulatedLedger>,
    pub asset: Asset,
    pub clients: Vec<Client>,
    pub params: Params,
}

impl World {
    /// One client per entry of `funds`, each minted its amount of a single
    /// native asset.
    pub fn new(seed: u64, funds: &[u64]) -> Self {
        init_tracing();
        let mut rng = StdRng::seed_from_u64(seed);
        let ledger = Arc::new(SimulatedLedger::new());
        let network = Arc::new(Network::default());
        let asset = Asset::new(1.into(), Address([0xaa; 20]));
        let config = ClientConfig {
            response_timeout: Duration::from_millis(500),
            funding_timeout: Duration::from_secs(1),
            ..ClientConfig::default()
        };

        let clients: Vec<Client> = funds
            .iter()
            .map(|amount| {
                let signer = Signer::new(&mut rng);
                let addr = signer.address();
                let bus = ProtoBufEncodingLayer {
                    bus: Link(network.clone()),
                };
                let client = Client::new(
                    Arc::new(signer),
                    Arc::new(bus),
                    ledger.clone(),
                    Arc::new(AcceptAll),
                    config.clone(),
                );
                ledger.mint(&asset, addr, (*amount).into());
                client
                    .funder()
                    .register_asset(asset, Arc::new(NativeDepositor), addr);
                network.clients.lock().insert(addr, client.clone());
                client
            })
            .collect();

        let params = Params::new_ledger(
            CHALLENGE_DURATION,
            U256::from(seed),
            clients.iter().map(Client::address).collect(),
        );
        World {
            ledger,
            asset,
            clients,
            params,
        }
    }

    pub fn alloc(&self, balances: &[u64]) -> Allocation {
        Allocation::new(
            vec![self.asset],
            balances.iter().map(|b| vec![U256::from(*b)]).collect(),
        )
        .unwrap()
    }

    /// Every client opens the channel concurrently.
    pub async fn open(&self, balances: &[u64]) -> Vec<ChannelHandle> {
        let alloc = self.alloc(balances);
        let tasks: Vec<_> = self
            .clients
            .iter()
            .map(|c| {
                let (c, params, alloc) = (c.clone(), self.params.clone(), alloc.clone());
                tokio::spawn(async move { c.open_channel(params, alloc).await })
            })
            .collect();
        let mut handles = vec![];
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        handles
    }
}

/// Poll until `cond` holds, panicking after a second.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
