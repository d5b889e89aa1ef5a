use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use args::Framing;
use host::HostSession;
use services::TrackerServices;
use ticker::Ticker;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    api::port::{JsonLinesPort, MessagePort, NativeMessagingPort},
    config::Config,
    fs::instance::InstanceLock,
    utils::clock::DefaultClock,
};

pub mod args;
pub mod collection;
pub mod host;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod ticker;

/// Represents the starting point for the daemon. The host is on the other side of
/// stdin/stdout, so nothing else may write to stdout.
pub async fn start_daemon(app_dir: PathBuf, config: Config, framing: Framing) -> Result<()> {
    let _instance = InstanceLock::try_acquire(&app_dir)?
        .ok_or_else(|| anyhow!("Another daemon is already running in {app_dir:?}"))?;

    let services = Arc::new(TrackerServices::open(&app_dir, config, Arc::new(DefaultClock)).await?);

    let port: Box<dyn MessagePort> = match framing {
        Framing::Native => Box::new(NativeMessagingPort::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
        )),
        Framing::Lines => Box::new(JsonLinesPort::new(tokio::io::stdin(), tokio::io::stdout())),
    };

    run_daemon(services, port, CancellationToken::new()).await
}

pub async fn run_daemon(
    services: Arc<TrackerServices>,
    port: Box<dyn MessagePort>,
    shutdown_token: CancellationToken,
) -> Result<()> {
    info!("Daemon started");
    services.monitor.resume().await;

    let reconnected = Arc::new(Notify::new());
    let ticker = Ticker::new(services.clone(), shutdown_token.clone(), reconnected.clone());
    let host = HostSession::new(port, services.clone(), shutdown_token.clone(), reconnected);

    let (_, ticker_result, host_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token),
        ticker.run(),
        host.run(),
    );

    services.monitor.suspend().await;

    if let Err(ticker_result) = ticker_result {
        error!("Ticker got an error {:?}", ticker_result);
    }

    if let Err(host_result) = host_result {
        error!("Host session got an error {:?}", host_result);
    }

    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod daemon_tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::{json, Value};
    use tokio::io::{
        duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        api::port::JsonLinesPort,
        config::Config,
        daemon::{
            run_daemon,
            services::TrackerServices,
            storage::kv::{KeyValueStore, MemoryKeyValueStore},
        },
        sync::{
            queue::QUEUE_KEY,
            remote::{MemoryDocumentStore, RemoteDocumentStore},
        },
        utils::{
            clock::{
                testing::{ManualClock, TEST_START_DATE},
                Clock,
            },
            logging::TEST_LOGGING,
        },
    };

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        next_id: u64,
    }

    impl Client {
        async fn request(
            &mut self,
            writer: &mut (impl AsyncWriteExt + Unpin),
            request: Value,
        ) -> Result<Value> {
            self.next_id += 1;
            let message = json!({"kind": "request", "id": self.next_id, "request": request});
            writer.write_all(format!("{message}\n").as_bytes()).await?;
            let line = self.lines.next_line().await?.unwrap();
            let reply: Value = serde_json::from_str(&line)?;
            assert_eq!(reply["id"], self.next_id);
            Ok(reply["response"].clone())
        }
    }

    async fn send(writer: &mut (impl AsyncWriteExt + Unpin), message: Value) -> Result<()> {
        writer.write_all(format!("{message}\n").as_bytes()).await?;
        Ok(())
    }

    /// Drives a whole session through the line protocol, the same way an extension would.
    #[tokio::test]
    async fn smoke_test_daemon() -> Result<()> {
        *TEST_LOGGING;
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let services = Arc::new(
            TrackerServices::build(
                Arc::new(MemoryKeyValueStore::new()) as Arc<dyn KeyValueStore>,
                Some(remote.clone() as Arc<dyn RemoteDocumentStore>),
                Config::default(),
                Arc::new(clock.clone()) as Arc<dyn Clock>,
            )
            .await?,
        );

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut writer) = tokio::io::split(client);
        let mut client = Client {
            lines: BufReader::new(client_read).lines(),
            next_id: 0,
        };
        let shutdown = CancellationToken::new();

        let (daemon_result, script_result) = tokio::join!(
            run_daemon(
                services.clone(),
                Box::new(JsonLinesPort::new(server_read, server_write)),
                shutdown.clone(),
            ),
            async {
                send(&mut writer, json!({
                    "kind": "snapshot",
                    "windows": [{"id": 1, "focused": true, "type": "normal", "state": "normal"}],
                    "tabs": [
                        {"id": 1, "windowId": 1, "url": "https://a.com/", "active": true},
                        {"id": 2, "windowId": 1, "url": "https://www.b.com/x", "active": false},
                    ],
                }))
                .await?;
                let exclusions = client.request(&mut writer, json!({"type": "GET_EXCLUSIONS"})).await?;
                assert_eq!(exclusions["data"]["exclusions"], json!([]));

                clock.set_ms(10_000);
                send(&mut writer, json!({
                    "kind": "event",
                    "event": {"kind": "tabActivated", "tabId": 2, "windowId": 1},
                }))
                .await?;
                send(&mut writer, "not even json".into()).await?;
                client.request(&mut writer, json!({"type": "GET_EXCLUSIONS"})).await?;

                clock.set_ms(25_000);
                let today = client.request(&mut writer, json!({"type": "GET_TODAY_USAGE"})).await?;
                assert_eq!(today["status"], "ok");
                assert_eq!(today["data"]["totalMs"], 25_000);
                assert_eq!(today["data"]["websites"][0]["domain"], "b.com");
                assert_eq!(today["data"]["websites"][0]["visitCount"], 1);
                assert_eq!(today["data"]["websites"][1]["visitCount"], 0);

                let range = client
                    .request(
                        &mut writer,
                        json!({
                            "type": "GET_RANGE_USAGE",
                            "startDate": "2018-07-04",
                            "endDate": "2018-07-01",
                        }),
                    )
                    .await?;
                assert_eq!(range["code"], "INVALID_ARGUMENT");

                let sync = client.request(&mut writer, json!({"type": "SYNC_NOW"})).await?;
                assert_eq!(sync["data"]["devices"], 1);
                assert_eq!(remote.len().await, 1);

                // Offline pushes wait in the queue until connectivity comes back.
                let queue = services.sync.as_ref().unwrap().queue();
                send(&mut writer, json!({"kind": "connectivity", "online": false})).await?;
                let sync = client.request(&mut writer, json!({"type": "SYNC_NOW"})).await?;
                assert_eq!(sync["data"]["pushed"], "queued");
                assert_eq!(queue.len().await?, 1);

                send(&mut writer, json!({"kind": "connectivity", "online": true})).await?;
                for _ in 0..50 {
                    if queue.len().await? == 0 {
                        break;
                    }
                    client.request(&mut writer, json!({"type": "GET_EXCLUSIONS"})).await?;
                }
                assert_eq!(queue.len().await?, 0);
                assert_eq!(services.store.kv().get(QUEUE_KEY).await?, None);
                assert_eq!(remote.len().await, 1);

                clock.set_ms(30_000);
                writer.shutdown().await?;
                anyhow::Ok(())
            }
        );
        daemon_result?;
        script_result?;

        assert!(shutdown.is_cancelled());
        assert!(services.monitor.current().await.is_none());
        let bucket = services
            .ledger
            .bucket(TEST_START_DATE.date())
            .await?;
        assert_eq!(bucket.total_ms_all, 30_000);
        Ok(())
    }
}
