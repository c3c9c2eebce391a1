use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::ForwarderError;

/// Shared mutable state guarded by a single mutex. The select-then-
/// increment step and the decrement/quarantine steps all take this
/// lock for the duration of a synchronous critical section that never
/// performs I/O, per spec.
struct ForwarderState {
    counts: HashMap<String, u64>,
    unhealthy: HashMap<String, Instant>,
}

/// Owns the connection-count table and transient unhealthy set for a
/// fixed set of upstreams, and runs the least-connections relay.
///
/// Cheap to share across connection tasks behind an `Arc`; every
/// operation is safe under concurrent invocation.
pub struct Forwarder {
    state: Mutex<ForwarderState>,
    dial_timeout: Duration,
    quarantine_window: Duration,
}

/// Releases the count increment taken by [`Forwarder::select_and_increment`]
/// when it goes out of scope, regardless of which exit path the caller
/// takes (success, dial failure, or an unexpected early return).
struct CountGuard<'a> {
    forwarder: &'a Forwarder,
    upstream: String,
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.forwarder.decrement(&self.upstream);
    }
}

impl Forwarder {
    pub fn new(upstreams: &[String], dial_timeout: Duration, quarantine_window: Duration) -> Self {
        let counts = upstreams.iter().map(|u| (u.clone(), 0u64)).collect();
        Forwarder {
            state: Mutex::new(ForwarderState {
                counts,
                unhealthy: HashMap::new(),
            }),
            dial_timeout,
            quarantine_window,
        }
    }

    /// Returns the current active-connection count for `upstream`, or
    /// 0 if it is not a configured upstream. Useful for tests and for
    /// exposing connection counts to an observability layer.
    pub fn upstream_count(&self, upstream: &str) -> u64 {
        self.state.lock().counts.get(upstream).copied().unwrap_or(0)
    }

    /// Filters `allowed` to known, healthy upstreams, picks the
    /// minimum-count one (ties broken by allow-list order), and
    /// increments its count as part of the same critical section.
    fn select_and_increment(&self, allowed: &[String]) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut best: Option<(usize, u64)> = None;
        for (idx, candidate) in allowed.iter().enumerate() {
            let Some(&count) = state.counts.get(candidate.as_str()) else {
                continue;
            };
            if let Some(&expiry) = state.unhealthy.get(candidate.as_str()) {
                if expiry > now {
                    continue;
                }
            }
            match best {
                None => best = Some((idx, count)),
                Some((_, best_count)) if count < best_count => best = Some((idx, count)),
                _ => {}
            }
        }

        let chosen = allowed.get(best?.0)?.clone();
        // Stale unhealthy entries are pruned lazily here, the one place
        // we already hold the lock and have just proven the entry expired.
        state.unhealthy.remove(&chosen);
        *state.counts.get_mut(&chosen).expect("chosen upstream is known") += 1;
        Some(chosen)
    }

    fn decrement(&self, upstream: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.counts.get_mut(upstream) {
            *count = count.saturating_sub(1);
        }
    }

    fn quarantine(&self, upstream: &str) {
        let mut state = self.state.lock();
        state
            .unhealthy
            .insert(upstream.to_owned(), Instant::now() + self.quarantine_window);
    }

    /// Establishes a relay between `client` and the least-loaded
    /// eligible member of `allowed`, falling back through the rest of
    /// the eligible set on dial failure. Closes `client` if every
    /// candidate is exhausted. Returns when the session ends.
    ///
    /// `client` is generic over any duplex byte stream rather than a
    /// bare `TcpStream` because the caller hands in an already
    /// TLS-terminated stream: application bytes past the handshake are
    /// still TLS records, so the forwarder must relay through rustls's
    /// decrypting `AsyncRead`/`AsyncWrite` impl, not the raw socket.
    pub async fn relay<C>(&self, mut client: C, allowed: &[String])
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        use tokio::io::AsyncWriteExt;

        let mut remaining: Vec<String> = allowed.to_vec();

        loop {
            let Some(chosen) = self.select_and_increment(&remaining) else {
                let err = ForwarderError::NoEligibleUpstream;
                warn!(error = %err, "closing connection");
                let _ = client.shutdown().await;
                return;
            };
            let _guard = CountGuard {
                forwarder: self,
                upstream: chosen.clone(),
            };

            match timeout(self.dial_timeout, TcpStream::connect(chosen.as_str())).await {
                Ok(Ok(upstream_sock)) => {
                    self.pipe(client, upstream_sock, chosen).await;
                    return;
                }
                Ok(Err(e)) => {
                    let err = ForwarderError::DialFailed(chosen.clone(), e);
                    warn!(error = %err, "quarantining upstream");
                    self.quarantine(&chosen);
                    remaining.retain(|u| u != &chosen);
                }
                Err(_) => {
                    let err = ForwarderError::DialTimeout(chosen.clone());
                    warn!(error = %err, "quarantining upstream");
                    self.quarantine(&chosen);
                    remaining.retain(|u| u != &chosen);
                }
            }
        }
    }

    /// Bidirectional byte copy between `client` and `upstream`. Each
    /// direction runs as its own task; the completing direction
    /// half-closes its destination for writes so the other direction
    /// can keep draining. Returns once both directions have finished.
    async fn pipe<C>(&self, client: C, upstream: TcpStream, upstream_addr: String)
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        use tokio::io::AsyncWriteExt;

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = upstream.into_split();

        let client_to_upstream = tokio::spawn(async move {
            let result = tokio::io::copy(&mut client_r, &mut upstream_w).await;
            let _ = upstream_w.shutdown().await;
            result
        });

        let upstream_to_client = tokio::spawn(async move {
            let result = tokio::io::copy(&mut upstream_r, &mut client_w).await;
            let _ = client_w.shutdown().await;
            result
        });

        let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
        match (sent, received) {
            (Ok(Ok(n_sent)), Ok(Ok(n_recv))) => {
                info!(
                    upstream = %upstream_addr,
                    bytes_client_to_upstream = n_sent,
                    bytes_upstream_to_client = n_recv,
                    "relay session closed"
                );
            }
            (sent, received) => {
                warn!(
                    upstream = %upstream_addr,
                    client_to_upstream = ?sent,
                    upstream_to_client = ?received,
                    "relay session ended with an error"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn addrs(listeners: &[TcpListener]) -> Vec<String> {
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn least_connections_selection_distributes_evenly() {
        let l_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l_c = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstreams = addrs(&[l_a, l_b, l_c]);

        let forwarder = Forwarder::new(&upstreams, Duration::from_millis(500), Duration::from_secs(30));

        let a = forwarder.select_and_increment(&upstreams).unwrap();
        let b = forwarder.select_and_increment(&upstreams).unwrap();
        let c = forwarder.select_and_increment(&upstreams).unwrap();

        let mut chosen = vec![a, b, c];
        chosen.sort();
        let mut expected = upstreams.clone();
        expected.sort();
        assert_eq!(chosen, expected);

        for u in &upstreams {
            assert_eq!(forwarder.upstream_count(u), 1);
        }
    }

    #[tokio::test]
    async fn tie_break_follows_allow_list_order() {
        let l_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l_c = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let [a, b, c]: [String; 3] = addrs(&[l_a, l_b, l_c]).try_into().unwrap();

        let forwarder = Forwarder::new(
            &[a.clone(), b.clone(), c.clone()],
            Duration::from_millis(500),
            Duration::from_secs(30),
        );

        // Drive counts to (1, 1, 2) for (a, b, c).
        forwarder.select_and_increment(std::slice::from_ref(&a));
        forwarder.select_and_increment(std::slice::from_ref(&b));
        forwarder.select_and_increment(std::slice::from_ref(&c));
        forwarder.select_and_increment(std::slice::from_ref(&c));

        let allowed = vec![b.clone(), a.clone(), c.clone()];
        let picked = forwarder.select_and_increment(&allowed).unwrap();
        assert_eq!(picked, b);
    }

    #[tokio::test]
    async fn unknown_upstream_names_are_filtered_silently() {
        let l_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = l_a.local_addr().unwrap().to_string();
        let forwarder = Forwarder::new(&[a.clone()], Duration::from_millis(500), Duration::from_secs(30));

        let picked = forwarder
            .select_and_increment(&[a.clone(), "127.0.0.1:1".to_string()])
            .unwrap();
        assert_eq!(picked, a);
    }

    #[tokio::test]
    async fn empty_eligible_set_yields_none() {
        let forwarder = Forwarder::new(&[], Duration::from_millis(500), Duration::from_secs(30));
        assert!(forwarder
            .select_and_increment(&["127.0.0.1:1".to_string()])
            .is_none());
    }

    #[tokio::test]
    async fn quarantined_upstream_is_skipped_until_window_elapses() {
        let l_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = l_a.local_addr().unwrap().to_string();
        let forwarder = Forwarder::new(&[a.clone()], Duration::from_millis(500), Duration::from_millis(50));

        forwarder.quarantine(&a);
        assert!(forwarder.select_and_increment(&[a.clone()]).is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(forwarder.select_and_increment(&[a.clone()]).is_some());
    }

    #[tokio::test]
    async fn count_released_when_client_closes() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            if let Ok((mut sock, _)) = upstream_listener.accept().await {
                use tokio::io::AsyncReadExt;
                let mut buf = [0u8; 16];
                let _ = sock.read(&mut buf).await;
            }
        });

        let forwarder = Arc::new(Forwarder::new(
            &[upstream_addr.clone()],
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();

        let fwd = forwarder.clone();
        let allowed = vec![upstream_addr.clone()];
        let relay_task = tokio::spawn(async move {
            let (client_sock, _) = client_listener.accept().await.unwrap();
            fwd.relay(client_sock, &allowed).await;
        });

        let client_side = TcpStream::connect(client_addr).await.unwrap();
        drop(client_side);

        tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay task did not finish in time")
            .unwrap();

        assert_eq!(forwarder.upstream_count(&upstream_addr), 0);
    }

    #[tokio::test]
    async fn dial_failure_quarantines_and_falls_back() {
        // Bind then immediately drop to get a port nobody is listening on.
        let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead_listener.local_addr().unwrap().to_string();
        drop(dead_listener);

        let live_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live_listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = live_listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = sock.shutdown().await;
            }
        });

        let forwarder = Arc::new(Forwarder::new(
            &[dead_addr.clone(), live_addr.clone()],
            Duration::from_millis(300),
            Duration::from_secs(30),
        ));

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let allowed = vec![dead_addr.clone(), live_addr.clone()];
        let fwd = forwarder.clone();
        let relay_task = tokio::spawn(async move {
            let (client_sock, _) = client_listener.accept().await.unwrap();
            fwd.relay(client_sock, &allowed).await;
        });

        let client_side = TcpStream::connect(client_addr).await.unwrap();
        drop(client_side);

        tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay task did not finish in time")
            .unwrap();

        assert_eq!(forwarder.upstream_count(&dead_addr), 0);
        assert_eq!(forwarder.upstream_count(&live_addr), 0);
    }
}
