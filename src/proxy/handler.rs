//! Downstream request handling
//!
//! Routes every request handed over by an inbound, dials the chosen server,
//! optionally intercepts TLS, pumps the traffic and reports the record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{JunctionError, Result};
use crate::models::{General, Protocol, Record, RecordOutcome, Request, Server};
use crate::proxy::conn::{next_conn_id, Connection};
use crate::proxy::inbound::{ClientSide, Downstream, InboundHandler};
use crate::proxy::mitm::MitmInterceptor;
use crate::proxy::outbound::DialRegistry;
use crate::proxy::pump::TransportPump;
use crate::proxy::resolver::Router;
use crate::services::RecordRegistry;

/// Capacity of the capture channel when dumping is allowed
const CAPTURE_CHANNEL_SIZE: usize = 1024;

/// Runtime toggles of the request path
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub connect_timeout: Duration,
    pub mitm_timeout: Duration,
    pub allow_mitm: bool,
    pub allow_dump: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            mitm_timeout: Duration::from_secs(10),
            allow_mitm: false,
            allow_dump: false,
        }
    }
}

impl ProxyOptions {
    pub fn new(config: &ProxyServerConfig, general: &General) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            mitm_timeout: Duration::from_secs(config.mitm_timeout),
            allow_mitm: general.allow_mitm,
            allow_dump: general.allow_dump,
        }
    }

    /// Interception needs both toggles
    pub fn mitm_enabled(&self) -> bool {
        self.allow_mitm && self.allow_dump
    }
}

pub struct DownstreamHandler {
    router: Arc<Router>,
    dialers: Arc<DialRegistry>,
    records: RecordRegistry,
    pump: TransportPump,
    mitm: Option<Arc<MitmInterceptor>>,
    options: ProxyOptions,
}

impl DownstreamHandler {
    pub fn new(
        router: Arc<Router>,
        dialers: Arc<DialRegistry>,
        records: RecordRegistry,
        options: ProxyOptions,
    ) -> Self {
        let pump = if options.allow_dump {
            TransportPump::with_capture(CAPTURE_CHANNEL_SIZE)
        } else {
            TransportPump::new()
        };

        Self {
            router,
            dialers,
            records,
            pump,
            mitm: None,
            options,
        }
    }

    pub fn with_mitm(mut self, interceptor: Arc<MitmInterceptor>) -> Self {
        if !self.options.mitm_enabled() {
            warn!("Interceptor configured but allow_mitm/allow_dump are not both set; TLS stays opaque");
        }
        self.mitm = Some(interceptor);
        self
    }

    pub fn pump(&self) -> &TransportPump {
        &self.pump
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    async fn dial(&self, server: &Server, request: &Request) -> Result<Connection> {
        tokio::time::timeout(self.options.connect_timeout, self.dialers.dial(server, request))
            .await
            .map_err(|_| JunctionError::DialTimeout {
                server: server.name.clone(),
                timeout_ms: self.options.connect_timeout.as_millis() as u64,
            })?
    }

    /// Interception applies to CONNECT tunnels of https requests only
    fn interceptor_for(&self, request: &Request) -> Option<&MitmInterceptor> {
        if !self.options.mitm_enabled() || request.protocol() != Protocol::Https {
            return None;
        }
        self.mitm.as_deref()
    }
}

/// Tell a plain-HTTP client why its request failed, or drop a tunnel
async fn reject_client(client: ClientSide, error: &JunctionError) {
    match client {
        ClientSide::Replay(mut replay) => {
            let status = error.status_code();
            let version = replay
                .request()
                .map(|r| r.version_str())
                .unwrap_or("HTTP/1.1");
            let response = format!(
                "{} {} {}\r\nContent-Length: 0\r\n\r\n",
                version,
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error")
            );
            {
                let mut writer = replay.writer().await;
                let _ = writer.write_all(response.as_bytes()).await;
                let _ = writer.flush().await;
            }
            replay.close();
        }
        ClientSide::Tunnel(mut conn) => {
            let _ = conn.close().await;
        }
    }
}

#[async_trait]
impl InboundHandler for DownstreamHandler {
    #[instrument(skip_all, fields(conn_id = downstream.client.id(), target = %downstream.request.host_port()))]
    async fn handle(&self, downstream: Downstream) {
        let Downstream { request, client } = downstream;

        let (request, route) = match self.router.route(request) {
            Ok(routed) => routed,
            Err(e) => {
                warn!("Routing failed: {}", e);
                reject_client(client, &e).await;
                return;
            }
        };
        debug!(rule = %route.rule, server = %route.server.name, "Request routed");

        let upstream = match self.dial(&route.server, &request).await {
            Ok(conn) => conn,
            Err(JunctionError::Rejected) => {
                debug!(rule = %route.rule, "Request rejected");
                reject_client(client, &JunctionError::Rejected).await;
                return;
            }
            Err(e) => {
                warn!(server = %route.server.name, "Dial failed: {}", e);
                // Pipelined requests share the client id
                let id = next_conn_id();
                self.records.open(Record::active(
                    id,
                    request.protocol(),
                    &route.server.name,
                    &route.target,
                    request.uri(),
                    &route.rule,
                ));
                self.records.finish(id, RecordOutcome::error(e.to_string()));
                reject_client(client, &e).await;
                return;
            }
        };

        let record_id = upstream.id();
        self.records.open(Record::active(
            record_id,
            request.protocol(),
            &route.server.name,
            &route.target,
            request.uri(),
            &route.rule,
        ));
        upstream.set_protocol(request.protocol());
        upstream.set_request(request.clone());

        let (client, upstream, mitm_engaged) = match (self.interceptor_for(&request), client) {
            (Some(interceptor), ClientSide::Tunnel(tunnel)) => {
                match interceptor.intercept(tunnel, upstream, request.domain()).await {
                    Ok((client, upstream)) => (ClientSide::Tunnel(client), upstream, true),
                    Err(e) => {
                        // Both halves were consumed by the failed handshake
                        warn!("Interception failed: {}", e);
                        self.records.finish(record_id, RecordOutcome::error(e.to_string()));
                        return;
                    }
                }
            }
            (_, client) => (client, upstream, false),
        };

        let mode = self.pump.mode_for(request.protocol(), mitm_engaged);
        let outcome = self.pump.pump(client, upstream, mode).await;
        if outcome.is_ok() {
            info!(
                server = %route.server.name,
                sent = outcome.sent,
                received = outcome.received,
                "Connection finished"
            );
        }
        self.records.finish(record_id, outcome.into_record_outcome());
    }
}
