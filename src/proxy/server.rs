//! Proxy server assembly
//!
//! Builds the routing graph, dialers, interceptor and listeners from a
//! profile and runs every listener until shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{JunctionError, Result};
use crate::models::Profile;
use crate::proxy::group::GroupRegistry;
use crate::proxy::handler::{DownstreamHandler, ProxyOptions};
use crate::proxy::inbound::{Inbound, InboundHandler, InboundRegistry};
use crate::proxy::mitm::{CertificateAuthority, MitmInterceptor};
use crate::proxy::outbound::DialRegistry;
use crate::proxy::probe::LatencyProber;
use crate::proxy::resolver::Router;
use crate::services::RecordRegistry;

/// Proxy server
pub struct ProxyServer {
    inbounds: Vec<Box<dyn Inbound>>,
    router: Arc<Router>,
    dialers: Arc<DialRegistry>,
    handler: Arc<DownstreamHandler>,
}

impl ProxyServer {
    /// Build the server from a loaded profile.
    ///
    /// Every configuration error (unknown types, dangling rule targets,
    /// cycles, bad auth params, CA files) surfaces here rather than per request.
    pub fn build(
        profile: &Profile,
        config: &ProxyServerConfig,
        records: RecordRegistry,
    ) -> Result<Self> {
        let dialers = Arc::new(DialRegistry::default());
        let router = Arc::new(Router::from_profile(
            profile,
            &GroupRegistry::default(),
            &dialers,
        )?);

        let options = ProxyOptions::new(config, &profile.general);
        let mut handler =
            DownstreamHandler::new(router.clone(), dialers.clone(), records, options.clone());
        if options.mitm_enabled() {
            let ca = Arc::new(CertificateAuthority::from_config(&profile.mitm)?);
            let interceptor = MitmInterceptor::with_webpki_roots(ca, options.mitm_timeout)?;
            handler = handler.with_mitm(Arc::new(interceptor));
            info!("TLS interception enabled");
        } else if profile.general.allow_mitm {
            warn!("allow_mitm has no effect without allow_dump");
        }

        let registry = InboundRegistry::default();
        let inbounds = profile
            .listener
            .iter()
            .map(|listener| registry.build(listener))
            .collect::<Result<Vec<_>>>()?;
        if inbounds.is_empty() {
            return Err(JunctionError::InvalidConfig(
                "profile has no listeners".to_string(),
            ));
        }

        Ok(Self {
            inbounds,
            router,
            dialers,
            handler: Arc::new(handler),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn handler(&self) -> &Arc<DownstreamHandler> {
        &self.handler
    }

    /// Prober sharing this server's routing graph and dialers
    pub fn latency_prober(&self) -> Result<LatencyProber> {
        LatencyProber::new(self.router.resolver().clone(), self.dialers.clone())
    }

    /// Run every listener until shutdown
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let handler: Arc<dyn InboundHandler> = self.handler;
        let mut listeners = JoinSet::new();

        for inbound in self.inbounds {
            info!("Starting {} listener on {}", inbound.typ(), inbound.addr());
            let addr = inbound.addr().to_string();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            listeners.spawn(async move { (addr, inbound.serve(handler, shutdown).await) });
        }

        let mut first_error = None;
        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((addr, Err(e))) => {
                    error!("Listener on {} failed: {}", addr, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Listener task failed: {}", e);
                    first_error.get_or_insert(JunctionError::Internal(e.to_string()));
                }
            }
        }

        info!("Proxy server stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
