//! Connection lifecycle as a pure state machine.
//!
//! [`Connection::handle`] takes an event and returns the effects the session
//! loop has to perform (resolve, arm a timer, dial, tear down). Nothing in
//! here touches a socket or a clock, so every transition is unit tested.
//!
//! ```text
//! Disconnected --tick(ready)--> Resolving --resolved--> Connecting --ok--> Connected
//!      ^                            |                       |                  |
//!      +-------- resolve failed ----+---- exhausted --------+---- error/idle --+
//! ```

use crate::config::Settings;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long to wait before re-checking an attempt that came due while the
/// game was not ready. Such waits do not count as attempts.
pub const NOT_READY_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per endpoint before moving to the next one
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub connect_timeout: Duration,
    pub network_timeout: Duration,
}

impl From<&Settings> for RetryPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_attempts: settings.connect_attempts.max(1),
            connect_delay: settings.connect_delay(),
            connect_timeout: settings.connect_timeout(),
            network_timeout: settings.network_timeout(),
        }
    }
}

/// Progress through the resolved endpoint list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPlan {
    endpoints: Vec<SocketAddr>,
    index: usize,
    /// 1-based attempt number against the current endpoint, 0 before the first
    attempt: u32,
    dialing: bool,
}

impl ConnectPlan {
    fn new(endpoints: Vec<SocketAddr>) -> Self {
        Self {
            endpoints,
            index: 0,
            attempt: 0,
            dialing: false,
        }
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.get(self.index).copied()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting(ConnectPlan),
    Connected { endpoint: SocketAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Periodic liveness check
    Tick { now: Instant, ready: bool },
    Resolved(Vec<SocketAddr>),
    ResolveFailed,
    /// The delay armed by [`ConnectionEffect::ScheduleAttempt`] elapsed
    AttemptDue { ready: bool },
    ConnectSucceeded { now: Instant },
    /// Refused, unreachable or timed out
    ConnectFailed,
    /// A read or write completed
    Activity { now: Instant },
    TransportFailed,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    Resolve,
    ScheduleAttempt {
        delay: Duration,
    },
    Connect {
        endpoint: SocketAddr,
        timeout: Duration,
    },
    /// Start reading and authenticate
    BeginSession {
        endpoint: SocketAddr,
    },
    /// Cancel pending work and drop the socket. `was_connected` tells the
    /// session whether per-connection state (streams, download dir) exists.
    Teardown {
        was_connected: bool,
    },
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    policy: RetryPolicy,
    authenticated: bool,
    last_activity: Option<Instant>,
}

impl Connection {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            authenticated: false,
            last_activity: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Record the server's `Connect`. Returns true the first time per
    /// connection.
    pub fn mark_authenticated(&mut self) -> bool {
        if !self.is_connected() || self.authenticated {
            return false;
        }
        self.authenticated = true;
        true
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionEffect> {
        match event {
            ConnectionEvent::Tick { now, ready } => self.on_tick(now, ready),
            ConnectionEvent::Resolved(endpoints) => self.on_resolved(endpoints),
            ConnectionEvent::ResolveFailed => {
                if self.state == ConnectionState::Resolving {
                    self.state = ConnectionState::Disconnected;
                }
                Vec::new()
            }
            ConnectionEvent::AttemptDue { ready } => self.on_attempt_due(ready),
            ConnectionEvent::ConnectSucceeded { now } => self.on_connected(now),
            ConnectionEvent::ConnectFailed => match &mut self.state {
                ConnectionState::Connecting(plan) if plan.dialing => {
                    plan.dialing = false;
                    self.advance()
                }
                _ => Vec::new(),
            },
            ConnectionEvent::Activity { now } => {
                if self.is_connected() {
                    self.last_activity = Some(now);
                }
                Vec::new()
            }
            ConnectionEvent::TransportFailed | ConnectionEvent::Close => self.disconnect(),
        }
    }

    fn on_tick(&mut self, now: Instant, ready: bool) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();

        if let (true, Some(last)) = (self.is_connected(), self.last_activity) {
            let idle = now.saturating_duration_since(last);
            if idle > self.policy.network_timeout {
                warn!("⏱️ No network activity for {:?}, dropping connection", idle);
                effects.extend(self.disconnect());
            }
        }

        if self.state == ConnectionState::Disconnected && ready {
            debug!("Resolving server address");
            self.state = ConnectionState::Resolving;
            effects.push(ConnectionEffect::Resolve);
        }

        effects
    }

    fn on_resolved(&mut self, endpoints: Vec<SocketAddr>) -> Vec<ConnectionEffect> {
        if self.state != ConnectionState::Resolving {
            return Vec::new();
        }
        if endpoints.is_empty() {
            warn!("Server address resolved to no endpoints");
            self.state = ConnectionState::Disconnected;
            return Vec::new();
        }
        self.state = ConnectionState::Connecting(ConnectPlan::new(endpoints));
        self.advance()
    }

    fn on_attempt_due(&mut self, ready: bool) -> Vec<ConnectionEffect> {
        let ConnectionState::Connecting(plan) = &mut self.state else {
            return Vec::new();
        };
        if plan.dialing {
            return Vec::new();
        }
        if !ready {
            return vec![ConnectionEffect::ScheduleAttempt {
                delay: NOT_READY_RETRY_DELAY,
            }];
        }
        match plan.endpoint() {
            Some(endpoint) => {
                plan.dialing = true;
                vec![ConnectionEffect::Connect {
                    endpoint,
                    timeout: self.policy.connect_timeout,
                }]
            }
            None => self.disconnect(),
        }
    }

    fn on_connected(&mut self, now: Instant) -> Vec<ConnectionEffect> {
        let endpoint = match &self.state {
            ConnectionState::Connecting(plan) if plan.dialing => plan.endpoint(),
            _ => None,
        };
        let Some(endpoint) = endpoint else {
            return Vec::new();
        };

        info!("🔌 Connected to {}", endpoint);
        self.state = ConnectionState::Connected { endpoint };
        self.authenticated = false;
        self.last_activity = Some(now);
        vec![ConnectionEffect::BeginSession { endpoint }]
    }

    /// Count one attempt: retry the same endpoint until the limit, then move
    /// on to the next. Running out of endpoints gives up until the next tick.
    fn advance(&mut self) -> Vec<ConnectionEffect> {
        let max_attempts = self.policy.connect_attempts.max(1);
        let exhausted = match &mut self.state {
            ConnectionState::Connecting(plan) => {
                if plan.attempt < max_attempts {
                    plan.attempt += 1;
                } else {
                    plan.attempt = 1;
                    plan.index += 1;
                }
                plan.index >= plan.endpoints.len()
            }
            _ => return Vec::new(),
        };

        if exhausted {
            warn!("Every server endpoint failed, waiting for the next tick");
            self.state = ConnectionState::Disconnected;
            return vec![ConnectionEffect::Teardown {
                was_connected: false,
            }];
        }

        vec![ConnectionEffect::ScheduleAttempt {
            delay: self.policy.connect_delay,
        }]
    }

    fn disconnect(&mut self) -> Vec<ConnectionEffect> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        let was_connected = self.is_connected();
        self.state = ConnectionState::Disconnected;
        self.authenticated = false;
        self.last_activity = None;
        vec![ConnectionEffect::Teardown { was_connected }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            connect_attempts: attempts,
            connect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            network_timeout: Duration::from_secs(20),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connecting(connection: &mut Connection, endpoints: Vec<SocketAddr>) {
        let now = Instant::now();
        assert_eq!(
            connection.handle(ConnectionEvent::Tick { now, ready: true }),
            vec![ConnectionEffect::Resolve]
        );
        assert_eq!(
            connection.handle(ConnectionEvent::Resolved(endpoints)),
            vec![ConnectionEffect::ScheduleAttempt {
                delay: Duration::from_secs(10)
            }]
        );
    }

    fn dial(connection: &mut Connection) -> SocketAddr {
        match connection
            .handle(ConnectionEvent::AttemptDue { ready: true })
            .as_slice()
        {
            [ConnectionEffect::Connect { endpoint, .. }] => *endpoint,
            other => panic!("expected a connect, got {:?}", other),
        }
    }

    #[test]
    fn not_ready_game_never_resolves() {
        let mut connection = Connection::new(policy(3));
        let effects = connection.handle(ConnectionEvent::Tick {
            now: Instant::now(),
            ready: false,
        });
        assert!(effects.is_empty());
        assert_eq!(connection.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn retries_each_endpoint_then_exhausts() {
        let mut connection = Connection::new(policy(2));
        connecting(&mut connection, vec![addr(1), addr(2)]);

        let mut dialed = Vec::new();
        for _ in 0..3 {
            dialed.push(dial(&mut connection));
            assert!(matches!(
                connection.handle(ConnectionEvent::ConnectFailed).as_slice(),
                [ConnectionEffect::ScheduleAttempt { .. }]
            ));
        }
        dialed.push(dial(&mut connection));

        assert_eq!(dialed, vec![addr(1), addr(1), addr(2), addr(2)]);
        assert_eq!(
            connection.handle(ConnectionEvent::ConnectFailed),
            vec![ConnectionEffect::Teardown {
                was_connected: false
            }]
        );
        assert_eq!(connection.state(), &ConnectionState::Disconnected);

        // The next ready tick starts over from resolution
        assert_eq!(
            connection.handle(ConnectionEvent::Tick {
                now: Instant::now(),
                ready: true
            }),
            vec![ConnectionEffect::Resolve]
        );
    }

    #[test]
    fn attempt_while_not_ready_is_deferred_without_counting() {
        let mut connection = Connection::new(policy(1));
        connecting(&mut connection, vec![addr(1)]);

        assert_eq!(
            connection.handle(ConnectionEvent::AttemptDue { ready: false }),
            vec![ConnectionEffect::ScheduleAttempt {
                delay: NOT_READY_RETRY_DELAY
            }]
        );
        match connection.state() {
            ConnectionState::Connecting(plan) => assert_eq!(plan.attempt(), 1),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(dial(&mut connection), addr(1));
    }

    #[test]
    fn successful_connect_begins_session() {
        let mut connection = Connection::new(policy(3));
        connecting(&mut connection, vec![addr(7)]);
        dial(&mut connection);

        let effects = connection.handle(ConnectionEvent::ConnectSucceeded {
            now: Instant::now(),
        });
        assert_eq!(
            effects,
            vec![ConnectionEffect::BeginSession { endpoint: addr(7) }]
        );
        assert!(connection.is_connected());
        assert!(!connection.is_authenticated());
        assert!(connection.mark_authenticated());
        assert!(!connection.mark_authenticated());
    }

    #[test]
    fn idle_connection_times_out_then_reconnects() {
        let mut connection = Connection::new(policy(3));
        connecting(&mut connection, vec![addr(7)]);
        dial(&mut connection);

        let start = Instant::now();
        connection.handle(ConnectionEvent::ConnectSucceeded { now: start });
        connection.handle(ConnectionEvent::Activity {
            now: start + Duration::from_secs(5),
        });

        // 20s after the last activity is still within the limit
        assert!(connection
            .handle(ConnectionEvent::Tick {
                now: start + Duration::from_secs(25),
                ready: true
            })
            .is_empty());

        let effects = connection.handle(ConnectionEvent::Tick {
            now: start + Duration::from_secs(26),
            ready: true,
        });
        assert_eq!(
            effects,
            vec![
                ConnectionEffect::Teardown {
                    was_connected: true
                },
                ConnectionEffect::Resolve
            ]
        );
        assert_eq!(connection.state(), &ConnectionState::Resolving);
        assert!(!connection.is_authenticated());
    }

    #[test]
    fn transport_failure_tears_down_once() {
        let mut connection = Connection::new(policy(3));
        connecting(&mut connection, vec![addr(7)]);
        dial(&mut connection);
        connection.handle(ConnectionEvent::ConnectSucceeded {
            now: Instant::now(),
        });

        assert_eq!(
            connection.handle(ConnectionEvent::TransportFailed),
            vec![ConnectionEffect::Teardown {
                was_connected: true
            }]
        );
        assert!(connection.handle(ConnectionEvent::Close).is_empty());
    }

    #[test]
    fn stale_results_are_ignored() {
        let mut connection = Connection::new(policy(3));
        assert!(connection
            .handle(ConnectionEvent::Resolved(vec![addr(1)]))
            .is_empty());
        assert!(connection.handle(ConnectionEvent::ConnectFailed).is_empty());
        assert!(connection
            .handle(ConnectionEvent::ConnectSucceeded {
                now: Instant::now()
            })
            .is_empty());
        assert_eq!(connection.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn empty_resolution_returns_to_disconnected() {
        let mut connection = Connection::new(policy(3));
        connection.handle(ConnectionEvent::Tick {
            now: Instant::now(),
            ready: true,
        });
        assert!(connection
            .handle(ConnectionEvent::Resolved(Vec::new()))
            .is_empty());
        assert_eq!(connection.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn close_while_connecting_tears_down() {
        let mut connection = Connection::new(policy(3));
        connecting(&mut connection, vec![addr(1)]);
        assert_eq!(
            connection.handle(ConnectionEvent::Close),
            vec![ConnectionEffect::Teardown {
                was_connected: false
            }]
        );
    }
}
