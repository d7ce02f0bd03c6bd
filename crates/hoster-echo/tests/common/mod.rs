#![allow(dead_code)]

use hoster::{DialOptions, Error, Host, HostConfig};
use hoster_echo::proto::echo_service_client::EchoServiceClient;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

/// Message length above the 4 MiB default caps.
pub const LARGE_MESSAGE_LENGTH: usize = 5_000_000;

pub fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// RPC and gateway addresses on free local ports.
pub fn local_config() -> HostConfig {
    HostConfig {
        rpc_address: Some(free_address()),
        http_address: Some(free_address()),
        ..HostConfig::default()
    }
}

pub async fn wait_for_port(address: &str) {
    for _ in 0..100 {
        if TcpStream::connect(address).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing is listening on {address}");
}

/// A host serving in the background. Dropping it stops every endpoint.
pub struct RunningHost {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl RunningHost {
    /// Stops the host and returns what `listen_and_serve_with_shutdown`
    /// returned.
    pub async fn stop(mut self) -> Result<(), Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.take().unwrap().await.unwrap()
    }
}

impl Drop for RunningHost {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Starts `host` and waits until every address in `ready` accepts
/// connections.
pub async fn start(host: Host, ready: &[&str]) -> RunningHost {
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(host.listen_and_serve_with_shutdown(async move {
        let _ = stopped.await;
    }));
    for address in ready {
        wait_for_port(address).await;
    }
    RunningHost {
        stop: Some(stop),
        task: Some(task),
    }
}

/// Echo host with both the RPC endpoint and the gateway.
pub async fn start_echo(config: HostConfig) -> RunningHost {
    let rpc = config.rpc_address.clone().unwrap();
    let http = config.http_address.clone().unwrap();
    let host = Host::builder(config)
        .server_builder(hoster_echo::register_server)
        .gateway_builder(hoster_echo::register_gateway)
        .build();
    start(host, &[&rpc, &http]).await
}

pub async fn rpc_client(address: &str) -> EchoServiceClient<Channel> {
    EchoServiceClient::connect(format!("http://{address}"))
        .await
        .unwrap()
        .max_decoding_message_size(usize::MAX)
}

pub struct Certificates {
    pub dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Self-signed `localhost` certificate and key in a temporary directory.
pub fn self_signed() -> Certificates {
    let dir = TempDir::new().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.path().join("server.crt");
    let key = dir.path().join("server.key");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    Certificates { dir, cert, key }
}

/// A TLS client that accepts any server certificate.
pub fn insecure_tls_client(address: &str) -> EchoServiceClient<Channel> {
    let credentials = hoster::tls::resolve_client_credentials(true, &[]).unwrap();
    let channel = DialOptions::secure(credentials).channel(address).unwrap();
    EchoServiceClient::new(channel).max_decoding_message_size(usize::MAX)
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}
