mod common;

use common::*;
use skein::SubscribeOptions;

async fn round_trip(input: &'static [u8]) -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();

    let mut sub = nc.subscribe(&subj, SubscribeOptions::default().with_max(1))?;
    nc.publish(&subj, input)?;
    nc.flush().await?;

    let msg = within(sub.next()).await?.ok_or_else(|| anyhow::anyhow!("no message"))?;
    assert_eq!(&msg.payload[..], input);
    assert!(within(sub.next()).await?.is_none(), "max 1 closes the subscription");

    nc.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn invalid_2_octet() -> anyhow::Result<()> {
    round_trip(&[0xc3, 0x28]).await
}

#[tokio::test]
async fn invalid_sequence_identifier() -> anyhow::Result<()> {
    round_trip(&[0xa0, 0xa1]).await
}

#[tokio::test]
async fn invalid_3_octet() -> anyhow::Result<()> {
    round_trip(&[0xe2, 0x28, 0xa1]).await
}

#[tokio::test]
async fn invalid_4_octet() -> anyhow::Result<()> {
    round_trip(&[0xf0, 0x90, 0x28, 0xbc]).await
}

#[tokio::test]
async fn embedded_nulls() -> anyhow::Result<()> {
    round_trip(&[0x00, 0xf0, 0x00, 0x28, 0x00, 0x00, 0xf0, 0x9f, 0x92, 0xa9, 0x00]).await
}

#[tokio::test]
async fn random_payloads_survive_intact() -> anyhow::Result<()> {
    let server = start_broker().await?;
    let nc = connect(&server).await?;
    let subj = subject();
    let mut sub = nc.subscribe(&subj, SubscribeOptions::default())?;

    let mut sent = Vec::new();
    for _ in 0..50 {
        let len = fastrand::usize(0..4096);
        let payload: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..)).take(len).collect();
        nc.publish(&subj, payload.clone())?;
        sent.push(payload);
    }
    nc.flush().await?;

    for want in sent {
        let msg = within(sub.next()).await?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(msg.payload, want);
    }
    nc.close().await;
    server.shutdown().await
}
