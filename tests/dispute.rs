mod common;

use common::{World, CHALLENGE_DURATION};
use perun_channel::{
    adjudicator::{AdjudicatorError, DisputePhase},
    channel::funding_id,
    ledger::{ChannelPhase, Ledger},
    Address, U256,
};

#[tokio::test]
async fn payments_then_forced_settlement() {
    let w = World::new(1, &[100, 0]);
    let chans = w.open(&[100, 0]).await;
    let (a, b) = (&chans[0], &chans[1]);

    for _ in 0..5 {
        a.update_by(|s| s.outcome.transfer(0, 0, 1, 20.into()).unwrap())
            .await
            .unwrap();
    }
    assert_eq!(b.version(), 5);
    assert_eq!(b.state().outcome.balances, vec![vec![U256::zero()], vec![100.into()]]);

    // a stops responding, b enforces the latest state.
    b.force_close().await.unwrap();
    let record = w.ledger.dispute(b.id()).await.unwrap().unwrap();
    assert_eq!(record.version(), 5);
    assert_eq!(record.phase, ChannelPhase::Dispute);

    let receiver = Address([0xbb; 20]);
    assert!(matches!(
        b.settle(receiver).await,
        Err(perun_channel::client::CloseError::Adjudicator(
            AdjudicatorError::ChallengeWindowOpen { .. }
        ))
    ));

    w.ledger.advance_time(CHALLENGE_DURATION);
    b.settle(receiver).await.unwrap();
    assert!(b.is_closed());
    assert_eq!(w.ledger.balance(&w.asset, receiver).await.unwrap(), 100.into());

    for p in &w.params.participants {
        let fid = funding_id(b.id(), *p);
        assert_eq!(w.ledger.holdings(&w.asset, fid).await.unwrap(), U256::zero());
    }

    let adj = w.clients[0].adjudicator();
    assert!(matches!(
        adj.withdraw(a.id(), 0, Address([0xaa; 20])).await,
        Err(AdjudicatorError::NothingToWithdraw(0))
    ));
    assert_eq!(adj.phase(a.id(), 1).await.unwrap(), DisputePhase::Withdrawn);

    // Settling the empty side only closes the channel locally.
    a.settle(Address([0xaa; 20])).await.unwrap();
    assert!(a.is_closed());
}

#[tokio::test]
async fn stale_registration_is_refuted() {
    let w = World::new(2, &[100, 0]);
    let chans = w.open(&[100, 0]).await;
    let (a, b) = (&chans[0], &chans[1]);

    let stale = a.signed_state();
    a.update_by(|s| s.outcome.transfer(0, 0, 1, 30.into()).unwrap())
        .await
        .unwrap();

    // a tries to settle on the version that still gives it everything.
    w.clients[0].adjudicator().register(&stale).await.unwrap();
    assert_eq!(
        w.clients[1].adjudicator().phase(b.id(), 1).await.unwrap(),
        DisputePhase::Registered
    );

    b.force_close().await.unwrap();
    let record = w.ledger.dispute(b.id()).await.unwrap().unwrap();
    assert_eq!(record.version(), 1);
    assert_eq!(record.refutations, 1);

    // The stale state cannot come back.
    assert!(matches!(
        w.clients[0].adjudicator().register(&stale).await,
        Err(AdjudicatorError::Superseded { registered: 1, ours: 0 })
    ));

    w.ledger.advance_time(CHALLENGE_DURATION);
    let (ra, rb) = (Address([0xa1; 20]), Address([0xb1; 20]));
    b.settle(rb).await.unwrap();
    a.settle(ra).await.unwrap();
    assert_eq!(w.ledger.balance(&w.asset, ra).await.unwrap(), 70.into());
    assert_eq!(w.ledger.balance(&w.asset, rb).await.unwrap(), 30.into());
}
