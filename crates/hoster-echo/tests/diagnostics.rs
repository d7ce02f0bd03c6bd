mod common;

use common::{free_address, start};
use hoster::{Error, Host, HostConfig};
use reqwest::StatusCode;
use serde_json::Value;

fn diagnostics_only(address: &str) -> Host {
    Host::builder(HostConfig {
        enable_diagnostics: true,
        diagnostics_address: Some(address.to_string()),
        ..HostConfig::default()
    })
    .build()
}

#[tokio::test]
async fn debug_vars_and_pprof_are_served() {
    let address = free_address();
    let host = start(diagnostics_only(&address), &[&address]).await;

    let response = reqwest::get(format!("http://{address}/debug/vars"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let vars: Value = response.json().await.unwrap();
    assert!(vars["cmdline"].is_array());
    assert!(vars["uptime_seconds"].is_u64());
    assert!(vars["counters"].is_object());

    for path in ["/debug/pprof", "/debug/pprof/", "/debug/pprof/runtime"] {
        let response = reqwest::get(format!("http://{address}{path}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        assert!(!response.text().await.unwrap().is_empty(), "{path}");
    }

    host.stop().await.unwrap();
}

#[tokio::test]
async fn counters_reflect_traffic_on_other_endpoints() {
    let debug = free_address();
    let config = HostConfig {
        enable_diagnostics: true,
        diagnostics_address: Some(debug.clone()),
        ..common::local_config()
    };
    let rpc = config.rpc_address.clone().unwrap();
    let http = config.http_address.clone().unwrap();
    let host = Host::builder(config)
        .server_builder(hoster_echo::register_server)
        .gateway_builder(hoster_echo::register_gateway)
        .build();
    let host = start(host, &[&rpc, &http, &debug]).await;

    let response = reqwest::get(format!("http://{http}/v1/echo?value=count"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let vars: Value = reqwest::get(format!("http://{debug}/debug/vars"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(vars["counters"]["gateway.requests"].as_u64().unwrap() >= 1);
    assert!(vars["counters"]["rpc.calls"].as_u64().unwrap() >= 1);

    host.stop().await.unwrap();
}

#[tokio::test]
async fn taken_port_is_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let err = diagnostics_only(&address)
        .listen_and_serve()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BindFailure { .. }), "{err}");
}
