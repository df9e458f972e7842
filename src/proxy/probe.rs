//! Latency probing for `rtt` groups
//!
//! Each group with probe settings gets a background task that measures every
//! member on its interval and swaps the results into the group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use http::header::{HOST, USER_AGENT};
use http::Method;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{JunctionError, Result};
use crate::models::{Protocol, Request};
use crate::proxy::group::{ProbeSettings, ServerGroup};
use crate::proxy::mitm::webpki_client_config;
use crate::proxy::outbound::DialRegistry;
use crate::proxy::resolver::Resolver;

const DEFAULT_CONCURRENCY: usize = 8;

pub struct LatencyProber {
    resolver: Arc<Resolver>,
    dialers: Arc<DialRegistry>,
    tls: Arc<ClientConfig>,
    concurrency: usize,
}

impl LatencyProber {
    pub fn new(resolver: Arc<Resolver>, dialers: Arc<DialRegistry>) -> Result<Self> {
        Ok(Self {
            resolver,
            dialers,
            tls: webpki_client_config()?,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = config;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Spawn one probing task per group that has probe settings
    pub fn spawn_all(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.resolver
            .groups()
            .into_iter()
            .filter(|group| group.probe_settings().is_some())
            .map(|group| {
                let prober = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { prober.run_group(group, shutdown).await })
            })
            .collect()
    }

    #[instrument(skip_all, fields(group = %group.name()))]
    pub async fn run_group(&self, group: Arc<dyn ServerGroup>, mut shutdown: watch::Receiver<bool>) {
        let Some(settings) = group.probe_settings().cloned() else {
            return;
        };
        info!(
            "Probing {} members every {}s via {}",
            group.members().len(),
            settings.interval.as_secs(),
            settings.url
        );

        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_group(group.as_ref(), &settings).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every member once and publish the results
    pub async fn probe_group(&self, group: &dyn ServerGroup, settings: &ProbeSettings) {
        let results = futures::stream::iter(group.members().to_vec())
            .map(|member| async move {
                let latency = match self.probe_member(&member, settings).await {
                    Ok(elapsed) => Some(elapsed),
                    Err(e) => {
                        debug!(member = %member, "Probe failed: {}", e);
                        None
                    }
                };
                (member, latency)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let reachable = results.iter().filter(|(_, l)| l.is_some()).count();
        for (member, latency) in results {
            group.update_latency(&member, latency);
        }

        if reachable == 0 {
            warn!("No member of group {} answered the probe", group.name());
        } else {
            debug!(
                "Probe round complete: {}/{} reachable, current pick {:?}",
                reachable,
                group.members().len(),
                group.pick().ok()
            );
        }
    }

    /// Time from dialing `member` until the probe response head arrives
    pub async fn probe_member(&self, member: &str, settings: &ProbeSettings) -> Result<Duration> {
        let server = self.resolver.resolve(member)?;
        let url = &settings.url;
        let host = url
            .host_str()
            .ok_or_else(|| JunctionError::InvalidConfig(format!("probe url {} has no host", url)))?;
        let https = url.scheme() == "https";
        let protocol = if https { Protocol::Https } else { Protocol::Http };
        let request = Request::new(protocol, host, url.port_or_known_default(), url.as_str(), 0);

        let started = Instant::now();
        timeout(settings.timeout, async {
            let conn = self.dialers.dial(&server, &request).await?;
            if https {
                let name = ServerName::try_from(host.to_string()).map_err(|e| {
                    JunctionError::InvalidConfig(format!("invalid probe host {}: {}", host, e))
                })?;
                let tls = TlsConnector::from(self.tls.clone())
                    .connect(name, conn)
                    .await
                    .map_err(|e| JunctionError::Transport(format!("probe TLS failed: {}", e)))?;
                send_head(tls, url).await
            } else {
                send_head(conn, url).await
            }
        })
        .await
        .map_err(|_| JunctionError::Timeout("latency probe"))??;

        Ok(started.elapsed())
    }
}

async fn send_head<S>(stream: S, url: &Url) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection ended: {}", e);
        }
    });

    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let authority = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    let request = http::Request::builder()
        .method(Method::HEAD)
        .uri(path)
        .header(HOST, authority)
        .header(USER_AGENT, concat!("junction/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| JunctionError::Http(format!("failed to build probe request: {}", e)))?;

    let response = sender.send_request(request).await;
    driver.abort();
    let response = response?;
    debug!(status = response.status().as_u16(), "Probe answered");
    Ok(())
}
