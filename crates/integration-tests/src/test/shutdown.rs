use crate::harness::{builder, test_config, TestClient, TestServer};
use k9::assert_equal;
use smtp_server::ServerError;
use std::time::Duration;

#[tokio::test]
async fn waits_for_transactions_in_flight() -> anyhow::Result<()> {
    let server = TestServer::start(builder(test_config())).await?;
    let mut client = server.greeted_client().await?;
    client.ehlo().await?;
    assert_equal!(client.command("MAIL FROM:<sender@example.com>").await?.code, 250);

    let stopping = tokio::spawn({
        let server = server.server.clone();
        async move { server.shutdown(true).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stopping.is_finished());
    assert!(server.server.is_shutting_down());
    // The listener is gone, so nobody new gets in
    assert!(TestClient::connect(server.addr).await.is_err());

    // The existing client is served to completion
    assert_equal!(client.command("RCPT TO:<rcpt@example.com>").await?.code, 250);
    assert_equal!(client.command("DATA").await?.code, 354);
    client.send_raw("hello\r\n.\r\n").await?;
    assert_equal!(client.read_response().await?.code, 250);
    client.command("QUIT").await?;
    drop(client);

    tokio::time::timeout(Duration::from_secs(10), stopping).await???;
    assert_equal!(server.server.messages_accepted(), 1);
    assert_equal!(server.server.active_transactions(), 0);
    server.stop().await
}

#[tokio::test]
async fn wait_requires_shutdown() -> anyhow::Result<()> {
    let server = TestServer::start(builder(test_config())).await?;
    assert!(matches!(
        server.server.wait().await,
        Err(ServerError::NotShuttingDown)
    ));

    let other = server.server.clone();
    server.stop().await?;

    other.wait().await?;
    assert!(matches!(
        other.listen_and_serve("127.0.0.1:0").await,
        Err(ServerError::Closed)
    ));
    Ok(())
}

#[tokio::test]
async fn counters() -> anyhow::Result<()> {
    let server = TestServer::start(builder(test_config())).await?;
    let mut client = server.greeted_client().await?;
    client.ehlo().await?;
    let response = client
        .send_message("sender@example.com", "rcpt@example.com", "hello\r\n")
        .await?;
    assert_equal!(response.code, 250);
    client.command("QUIT").await?;
    assert_equal!(client.read_to_close().await?, "");
    server.server.shutdown(true).await?;

    assert_equal!(server.server.transactions_total(), 1);
    assert_equal!(server.server.messages_accepted(), 1);
    assert_equal!(server.server.active_transactions(), 0);
    assert!(server.server.bytes_read() > 0);
    assert!(server.server.bytes_written() > 0);

    let text = server.server.render_metrics()?;
    assert!(text.contains("smtp_messages_accepted_total 1"), "{text}");
    server.stop().await
}
