//! UDP DNS proxy server: receives A queries, resolves them upstream,
//! invokes `resolved_callback` with the answer, and replies with what it
//! got from upstream. Grounded on
//! `original_source/service/src/dns_proxy.py`'s `DnsProxy` (receive loop
//! handing work to a bounded worker pool), with `hickory-proto` standing
//! in for the hand-rolled wire codec the original used (SPEC_FULL.md
//! §1 treats DNS wire parsing as an opaque external library).

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::resolver::{LookupOutcome, UpstreamResolver};

const MAX_DATAGRAM_SIZE: usize = 512;
const NUM_WORKERS: usize = 1000;

type ResolveFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = LookupOutcome> + Send>> + Send + Sync>;

pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    resolve: ResolveFn,
}

impl DnsProxy {
    pub async fn new(port: u16, resolver: UpstreamResolver) -> anyhow::Result<Self> {
        let resolver = Arc::new(resolver);
        let resolve: ResolveFn = Arc::new(move |name: String| {
            let resolver = resolver.clone();
            Box::pin(async move { resolver.lookup_a(&name).await })
        });
        Self::with_resolve_fn(port, resolve).await
    }

    /// For testing: bypasses the real upstream resolver.
    pub async fn with_resolve_fn(port: u16, resolve: ResolveFn) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("dns proxy listening on port {}", socket.local_addr()?.port());
        Ok(Self {
            socket: Arc::new(socket),
            resolve,
        })
    }

    pub fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Runs until `token` is cancelled, then waits for in-flight requests
    /// to finish before returning (spec.md §4.7's graceful shutdown).
    pub async fn run<F, Fut>(self, token: CancellationToken, resolved_callback: F)
    where
        F: Fn(Ipv4Addr, String, Vec<Ipv4Addr>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let resolved_callback = Arc::new(resolved_callback);
        let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(NUM_WORKERS);
        let rx = Arc::new(Mutex::new(rx));

        let mut worker_handles = Vec::with_capacity(NUM_WORKERS);
        for _ in 0..NUM_WORKERS {
            let rx = rx.clone();
            let socket = self.socket.clone();
            let resolve = self.resolve.clone();
            let cb = resolved_callback.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let received = { rx.lock().await.recv().await };
                    let Some((data, addr)) = received else {
                        break;
                    };
                    handle_request(&socket, resolve.as_ref(), cb.as_ref(), &data, addr).await;
                }
            }));
        }

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => {
                            if tx.send((buf[..len].to_vec(), addr)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dns proxy recv_from error: {}", e),
                    }
                }
            }
        }

        info!("dns proxy stopping: waiting for requests to finish");
        drop(tx);
        for handle in worker_handles {
            let _ = handle.await;
        }
        info!("dns proxy stopped");
    }
}

async fn handle_request<F, Fut>(
    socket: &UdpSocket,
    resolve: &(dyn Fn(String) -> Pin<Box<dyn Future<Output = LookupOutcome> + Send>> + Send + Sync),
    resolved_callback: &F,
    data: &[u8],
    addr: SocketAddr,
) where
    F: Fn(Ipv4Addr, String, Vec<Ipv4Addr>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    let query = match Message::from_bytes(data) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse dns query from {}: {}", addr, e);
            return;
        }
    };

    let response = match build_response(&query, resolve, resolved_callback, addr).await {
        Some(r) => r,
        None => return,
    };

    match response.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!("failed to send dns response to {}: {}", addr, e);
            }
        }
        Err(e) => warn!("failed to encode dns response for {}: {}", addr, e),
    }
}

async fn build_response<F, Fut>(
    query: &Message,
    resolve: &(dyn Fn(String) -> Pin<Box<dyn Future<Output = LookupOutcome> + Send>> + Send + Sync),
    resolved_callback: &F,
    addr: SocketAddr,
) -> Option<Message>
where
    F: Fn(Ipv4Addr, String, Vec<Ipv4Addr>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    let question = query.queries().first()?;

    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(false);
    response.set_recursion_available(true);
    response.add_query(question.clone());

    if question.query_type() != RecordType::A || question.query_class() != DNSClass::IN {
        response.set_response_code(ResponseCode::Refused);
        return Some(response);
    }

    let name_str = question.name().to_ascii().trim_end_matches('.').to_lowercase();

    match resolve(name_str.clone()).await {
        LookupOutcome::Found(ips) => {
            let addrs: Vec<Ipv4Addr> = ips.iter().map(|(ip, _)| *ip).collect();
            resolved_callback(remote_ipv4(addr), name_str, addrs).await;

            response.set_response_code(ResponseCode::NoError);
            for (ip, ttl) in ips {
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    ttl,
                    RData::A(A(ip)),
                ));
            }
        }
        LookupOutcome::DoesNotExist => {
            response.set_response_code(ResponseCode::NXDomain);
        }
        LookupOutcome::UpstreamRcode(code) => {
            response.set_response_code(ResponseCode::from(0, code));
        }
        LookupOutcome::ServerFailure => {
            response.set_response_code(ResponseCode::ServFail);
        }
    }

    Some(response)
}

/// The socket always binds to an IPv4 address, so `recv_from` peers are
/// always IPv4 too; this just narrows the type for `ResolveEvent`.
fn remote_ipv4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    }
}
