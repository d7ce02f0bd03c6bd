//! REST routes forwarding to `echo.v1.EchoService`.
//!
//! | route | RPC |
//! |---|---|
//! | `GET /v1/echo?value=` | `Echo` |
//! | `GET /v1/large?length=` | `Large` |
//! | `POST /v1/send` (JSON body) | `Send` |

use crate::proto::{
    EchoResponse, LargeRequest, SendRequest, SendResponse,
    echo_service_client::EchoServiceClient,
};
use axum::Json;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::routing::{get, post};
use hoster::{BoxError, DialOptions, GatewayContext, GatewayError, GatewayMux};
use tonic::transport::Channel;

type Client = EchoServiceClient<Channel>;

/// Gateway builder: registers the echo routes, dialing the RPC endpoint at
/// `endpoint`.
pub fn register_gateway(
    _ctx: &GatewayContext,
    mux: &mut GatewayMux,
    endpoint: &str,
    opts: &DialOptions,
) -> Result<(), BoxError> {
    let client = EchoServiceClient::new(opts.channel(endpoint)?)
        .max_decoding_message_size(opts.max_receive_bytes())
        .max_encoding_message_size(opts.max_send_bytes());

    mux.route("/v1/echo", get(echo).with_state(client.clone()))
        .route("/v1/large", get(large).with_state(client.clone()))
        .route(
            "/v1/send",
            post(send)
                .layer(DefaultBodyLimit::disable())
                .with_state(client),
        );
    Ok(())
}

async fn echo(
    State(mut client): State<Client>,
    Query(request): Query<SendRequest>,
) -> Result<Json<EchoResponse>, GatewayError> {
    let response = client.echo(request).await?;
    Ok(Json(response.into_inner()))
}

async fn large(
    State(mut client): State<Client>,
    Query(request): Query<LargeRequest>,
) -> Result<Json<EchoResponse>, GatewayError> {
    let response = client.large(request).await?;
    Ok(Json(response.into_inner()))
}

async fn send(
    State(mut client): State<Client>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, GatewayError> {
    let response = client.send(request).await?;
    Ok(Json(response.into_inner()))
}
