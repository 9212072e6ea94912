//! Full SOCKS5 session: handshake, access check, dial and relay

use ingress_ipaccess::Policy;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::{self, Address, Reply, CMD_CONNECT};
use crate::SocksError;

/// Default timeout for dialing the requested destination
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves SOCKS5 CONNECT requests against an optional access policy
#[derive(Debug, Clone)]
pub struct RequestHandler<'a> {
    policy: Option<&'a Policy>,
    dial_timeout: Duration,
}

impl<'a> RequestHandler<'a> {
    /// A handler without policy allows every destination
    pub fn new(policy: Option<&'a Policy>) -> Self {
        Self {
            policy,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Run one session on `stream` until the relay finishes.
    ///
    /// A destination denied by the policy is answered with
    /// `NotAllowedByRuleset` and is not an error.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        protocol::negotiate(&mut stream).await?;
        let request = protocol::read_request(&mut stream).await?;

        if request.command != CMD_CONNECT {
            protocol::write_reply(&mut stream, Reply::CommandNotSupported, None).await?;
            return Err(SocksError::UnsupportedCommand(request.command));
        }

        let target = match self.resolve(&request.destination).await {
            Ok(target) => target,
            Err(e) => {
                protocol::write_reply(&mut stream, Reply::HostUnreachable, None).await?;
                return Err(e);
            }
        };

        if let Some(policy) = self.policy {
            let (allowed, rule) = policy.allowed(&target.ip(), target.port());
            if !allowed {
                match rule {
                    Some(rule) => info!(
                        destination = %request.destination,
                        resolved = %target,
                        rule = %rule,
                        "SOCKS destination denied by access policy"
                    ),
                    None => info!(
                        destination = %request.destination,
                        resolved = %target,
                        "SOCKS destination denied by default access policy"
                    ),
                }
                protocol::write_reply(&mut stream, Reply::NotAllowedByRuleset, None).await?;
                return Ok(());
            }
        }

        let mut origin = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(target))
            .await
        {
            Ok(Ok(origin)) => origin,
            Ok(Err(e)) => {
                warn!(destination = %request.destination, "SOCKS dial failed: {}", e);
                protocol::write_reply(&mut stream, Reply::from_io_error(&e), None).await?;
                return Err(SocksError::DialFailed {
                    address: request.destination.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                warn!(destination = %request.destination, "SOCKS dial timed out");
                protocol::write_reply(&mut stream, Reply::HostUnreachable, None).await?;
                return Err(SocksError::DialTimeout(request.destination.to_string()));
            }
        };

        let bound = origin.local_addr().ok();
        protocol::write_reply(&mut stream, Reply::Succeeded, bound).await?;

        debug!(destination = %request.destination, resolved = %target, "SOCKS relay started");

        match tokio::io::copy_bidirectional(&mut stream, &mut origin).await {
            Ok((to_origin, to_client)) => {
                debug!(
                    destination = %request.destination,
                    bytes_to_origin = to_origin,
                    bytes_to_client = to_client,
                    "SOCKS relay completed"
                );
            }
            Err(e) => {
                debug!(destination = %request.destination, "SOCKS relay closed: {}", e);
            }
        }

        Ok(())
    }

    /// Resolve the destination; IPv4-mapped IPv6 addresses come back as IPv4
    /// so the policy check and the dial see the same address
    async fn resolve(&self, destination: &Address) -> Result<SocketAddr, SocksError> {
        let addr = match destination {
            Address::Ip(addr) => *addr,
            Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| SocksError::ResolveFailed(host.clone(), e.to_string()))?
                .next()
                .ok_or_else(|| {
                    SocksError::ResolveFailed(host.clone(), "no addresses".to_string())
                })?,
        };

        Ok(SocketAddr::new(addr.ip().to_canonical(), addr.port()))
    }
}

/// Serve a single SOCKS5 session on `stream`, dialing destinations allowed by
/// `policy` and relaying until both sides are done.
pub async fn stream_net_handler<S>(stream: S, policy: Option<&Policy>) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    RequestHandler::new(policy).serve(stream).await
}
