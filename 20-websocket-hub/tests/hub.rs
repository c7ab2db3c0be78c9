use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use websocket_hub::{
    hub::{HubConfig, HubHandle},
    message::Envelope,
    server::Server,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, config);
        let addr = server.local_addr()?;
        let hub = server.hub();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            hub,
            shutdown,
            task,
        })
    }

    async fn connect(&self) -> Result<Client> {
        let (client, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .context("websocket handshake failed")?;
        Ok(client)
    }

    /// Waits until exactly `n` clients are live and returns their ids.
    async fn wait_for_members(&self, n: usize) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
        loop {
            let live = self.hub.connected().await?;
            if live.len() == n {
                return Ok(live);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("expected {n} live clients, found {}", live.len()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn next_envelope(client: &mut Client) -> Result<Envelope> {
    loop {
        let frame = timeout(READ_TIMEOUT, client.next())
            .await
            .context("timed out waiting for frame")?
            .context("server closed the stream")??;
        match frame {
            Message::Text(text) => return Ok(Envelope::decode(&text)?),
            Message::Close(_) => return Err(anyhow!("server sent close")),
            _ => continue,
        }
    }
}

async fn send_text(client: &mut Client, text: &str) -> Result<()> {
    client.send(Message::Text(text.into())).await?;
    Ok(())
}

#[tokio::test]
async fn clients_see_joins_chat_and_departures() -> Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut alice = server.connect().await?;
    let alice_id = server.wait_for_members(1).await?.remove(0);

    let mut bob = server.connect().await?;
    let bob_id = server
        .wait_for_members(2)
        .await?
        .into_iter()
        .find(|id| *id != alice_id)
        .context("bob should be live")?;

    // Alice hears about Bob; Bob is not told about himself.
    assert_eq!(next_envelope(&mut alice).await?, Envelope::joined(&bob_id));

    send_text(&mut alice, "hello").await?;
    assert_eq!(
        next_envelope(&mut bob).await?,
        Envelope::new(&alice_id, "hello")
    );
    assert_eq!(
        next_envelope(&mut alice).await?,
        Envelope::new(&alice_id, "hello")
    );

    alice.close(None).await?;
    assert_eq!(next_envelope(&mut bob).await?, Envelope::left(&alice_id));
    assert_eq!(server.wait_for_members(1).await?, vec![bob_id.clone()]);

    // The departure is announced once, and Alice is gone from later fan-outs.
    send_text(&mut bob, "anyone?").await?;
    assert_eq!(
        next_envelope(&mut bob).await?,
        Envelope::new(&bob_id, "anyone?")
    );

    bob.close(None).await?;
    server.wait_for_members(0).await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn every_client_receives_messages_in_order() -> Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut sender = server.connect().await?;
    let sender_id = server.wait_for_members(1).await?.remove(0);
    let mut first = server.connect().await?;
    server.wait_for_members(2).await?;
    let mut second = server.connect().await?;
    server.wait_for_members(3).await?;

    // Drain the join notices so only chat traffic remains.
    next_envelope(&mut sender).await?;
    next_envelope(&mut sender).await?;
    next_envelope(&mut first).await?;

    for n in 0..5 {
        send_text(&mut sender, &format!("message {n}")).await?;
    }

    for client in [&mut sender, &mut first, &mut second] {
        for n in 0..5 {
            assert_eq!(
                next_envelope(client).await?,
                Envelope::new(&sender_id, format!("message {n}"))
            );
        }
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn dropped_transport_is_unregistered() -> Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let watcher = server.connect().await?;
    let watcher_id = server.wait_for_members(1).await?.remove(0);
    let leaver = server.connect().await?;
    server.wait_for_members(2).await?;

    // Drop the socket without a close handshake.
    drop(leaver);

    assert_eq!(server.wait_for_members(1).await?, vec![watcher_id]);

    drop(watcher);
    server.stop().await;
    Ok(())
}
