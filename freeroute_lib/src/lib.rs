use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod api;
pub mod config;
pub mod dns;
pub mod events;
pub mod lists;
pub mod logging;
pub mod net;
pub mod route;
pub mod router;
pub mod scheduler;

use config::Config;
use dns::proxy::DnsProxy;
use dns::resolver::UpstreamResolver;
use events::EventBus;
use lists::registry::ListRegistry;
use route::manager::RouteManager;
use router::Router;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("dns error: {0}")]
    Dns(String),
    #[error("route error: {0}")]
    Route(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Start-up options for the freeroute service.
pub struct Options {
    pub config_path: Option<PathBuf>,
}

/// Handle returned by [`start`], used to trigger a graceful shutdown.
pub struct RuntimeHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl RuntimeHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Builds every component described in SPEC_FULL.md and wires the
/// resolve -> classify -> route pipeline together, then returns a handle
/// the caller can use to wait for or trigger shutdown.
pub async fn start(opts: Options) -> Result<RuntimeHandle> {
    let cfg = Config::load(opts.config_path.as_deref())
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    cfg.validate().map_err(Error::InvalidConfig)?;

    let token = CancellationToken::new();

    let event_bus = Arc::new(EventBus::new());

    let registry = Arc::new(Mutex::new(ListRegistry::from_config(&cfg).await?));

    let route_manager = Arc::new(RouteManager::new(
        cfg.networking.tunnels.clone(),
        cfg.ip_route_command.clone(),
    ));
    route_manager.reconcile().await;

    let router = Arc::new(Router::new(
        route_manager.clone(),
        cfg.networking.tunnels.clone(),
    ));

    let resolver = UpstreamResolver::new()
        .await
        .map_err(|e| Error::Dns(e.to_string()))?;

    let proxy = DnsProxy::new(cfg.networking.dns_port, resolver)
        .await
        .map_err(|e| Error::Dns(e.to_string()))?;

    // periodic tasks
    let reconcile_token = token.child_token();
    let reconcile_rm = route_manager.clone();
    tokio::spawn(scheduler::every(
        std::time::Duration::from_secs(60),
        reconcile_token,
        move || {
            let rm = reconcile_rm.clone();
            Box::pin(async move {
                rm.reconcile().await;
            })
        },
    ));

    let flush_token = token.child_token();
    let flush_registry = registry.clone();
    tokio::spawn(scheduler::every(
        std::time::Duration::from_secs(cfg.manual_domain_list_save_interval_sec),
        flush_token,
        move || {
            let registry = flush_registry.clone();
            Box::pin(async move {
                registry.lock().await.flush_dirty_persistent().await;
            })
        },
    ));

    for spec in cfg.external_domain_lists.iter().cloned() {
        let refresh_token = token.child_token();
        let refresh_registry = registry.clone();
        let interval = std::time::Duration::from_secs(spec.update_interval_hours * 3600);
        tokio::spawn(scheduler::every(interval, refresh_token, move || {
            let registry = refresh_registry.clone();
            let spec = spec.clone();
            Box::pin(async move {
                registry.lock().await.refresh_external(&spec).await;
            })
        }));
    }

    let proxy_registry = registry.clone();
    let proxy_router = router.clone();
    let proxy_event_bus = event_bus.clone();
    let proxy_token = token.child_token();
    let dns_task = tokio::spawn(async move {
        proxy
            .run(proxy_token, move |remote, domain, ips| {
                let registry = proxy_registry.clone();
                let router = proxy_router.clone();
                let event_bus = proxy_event_bus.clone();
                Box::pin(async move {
                    let (list_name, ips) = {
                        let reg = registry.lock().await;
                        let matched = reg.classify(&domain, &ips).await;
                        (matched.map(|s| s.name.clone()), ips)
                    };
                    event_bus.publish(events::ResolveEvent::new(
                        remote,
                        domain.clone(),
                        ips.clone(),
                        list_name.clone(),
                    ));
                    let spec = {
                        let reg = registry.lock().await;
                        list_name.and_then(|n| reg.get_spec(&n).cloned())
                    };
                    router.route(spec.as_ref(), &domain, &ips).await;
                })
            })
            .await;
    });

    let api_token = token.child_token();
    let api_registry = registry.clone();
    let api_router = router.clone();
    let api_event_bus = event_bus.clone();
    let api_port = cfg.api_port;
    let api_ignore_interfaces = cfg.networking.ignore_interfaces.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(
            api_port,
            api_registry,
            api_router,
            api_event_bus,
            api_ignore_interfaces,
            api_token,
        )
        .await
        {
            error!("http api error: {}", e);
        }
    });

    info!("freeroute started");

    Ok(RuntimeHandle {
        token,
        join: dns_task,
    })
}
