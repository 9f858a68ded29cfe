//! Request and connection context.

use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// Where a single request came from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    pub transport: Transport,
    /// Owning stream session, if any.
    pub session_id: Option<String>,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(peer: SocketAddr, transport: Transport) -> Self {
        Self {
            peer,
            transport,
            session_id: None,
            received_at: Instant::now(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }
}

/// A TCP client connection.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    request_count: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Records a request and returns its context.
    pub fn record_request(&self) -> RequestContext {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        RequestContext {
            session_id: Some(self.id.clone()),
            ..RequestContext::new(self.remote_addr, Transport::Tcp)
        }
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    #[test]
    fn test_request_context() {
        let ctx = RequestContext::new(test_addr(), Transport::Udp);
        assert_eq!(ctx.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(ctx.session_id.is_none());
        assert_eq!(ctx.transport.as_str(), "udp");
    }

    #[test]
    fn test_session_records_requests() {
        let session = Session::new(test_addr());
        assert_eq!(session.request_count(), 0);

        let ctx = session.record_request();
        session.record_request();

        assert_eq!(session.request_count(), 2);
        assert_eq!(ctx.transport, Transport::Tcp);
        assert_eq!(ctx.session_id.as_deref(), Some(session.id.as_str()));
        assert!(session.idle_duration() <= session.age());
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(Session::new(test_addr()).id, Session::new(test_addr()).id);
    }
}
