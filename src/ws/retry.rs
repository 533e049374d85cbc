//! Close cause classification and reconnect backoff.

use std::{fmt::Display, time::Duration};

use rand::Rng;

use super::{session::ConnectionState, transport::CloseStatus};

/// Close codes after which reconnecting can never succeed
pub const FATAL_CLOSE_CODES: [u16; 6] = [
    4004, // authentication failed
    4010, // invalid shard
    4011, // sharding required
    4012, // invalid api version
    4013, // invalid intents
    4014, // disallowed intents
];

/// Check if a remote close code forbids reconnecting
pub fn is_fatal_close_code(code: u16) -> bool {
    FATAL_CLOSE_CODES.contains(&code)
}

/// Reconnect policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    /// backoff of the first attempt, doubled on every further attempt
    pub first_backoff: Duration,
    /// backoff upper bound
    pub max_backoff: Duration,
    /// random jitter, as a fraction of the backoff
    pub jitter_factor: f64,
    /// attempts before giving up, none for unlimited
    pub max_retries: Option<u32>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            first_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
            jitter_factor: 0.5,
            max_retries: None,
        }
    }
}

impl ReconnectOptions {
    /// Backoff without jitter: `first_backoff * 2^iteration`, capped at `max_backoff`
    pub fn backoff(&self, iteration: u32) -> Duration {
        2u32.checked_pow(iteration)
            .and_then(|factor| self.first_backoff.checked_mul(factor))
            .map(|backoff| backoff.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    /// Add random jitter to a backoff, the result stays within `[first_backoff, max_backoff]`
    pub fn jitter<R: Rng + ?Sized>(&self, backoff: Duration, rng: &mut R) -> Duration {
        let backoff_ms = backoff.as_millis() as i64;
        let min_ms = self.first_backoff.as_millis() as i64;
        let max_ms = self.max_backoff.as_millis() as i64;

        let offset = (backoff_ms as f64 * self.jitter_factor).round() as i64;
        let low = (min_ms - backoff_ms).max(-offset);
        let high = (max_ms - backoff_ms).min(offset);

        let jitter = if low < high {
            rng.gen_range(low..high)
        } else {
            0
        };

        Duration::from_millis((backoff_ms + jitter).max(0) as u64)
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// remote closed the transport, 1006 if it just went away
    RemoteClosed(CloseStatus),
    /// transport, decompression or limiter failure
    Failure(String),
    /// heartbeats were not acknowledged
    Zombie,
    /// remote sent a reconnect request
    ReconnectRequested,
    /// remote invalidated the session
    SessionInvalidated,
    /// user asked for a reconnect
    UserReconnect,
    /// user asked to stop
    UserClose {
        /// keep the session so it can be resumed later
        resumable: bool,
    },
}

impl Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteClosed(status) => write!(f, "closed by remote with status {}", status),
            Self::Failure(reason) => write!(f, "connection failed: {}", reason),
            Self::Zombie => f.write_str("zombie connection"),
            Self::ReconnectRequested => f.write_str("reconnect requested by remote"),
            Self::SessionInvalidated => f.write_str("session invalidated by remote"),
            Self::UserReconnect => f.write_str("reconnect requested by user"),
            Self::UserClose { resumable: true } => f.write_str("closed by user, resumable"),
            Self::UserClose { resumable: false } => f.write_str("closed by user"),
        }
    }
}

/// What the supervisor does after a disconnect
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectAction {
    /// reconnect and RESUME the session
    Resume,
    /// drop the session, reconnect and IDENTIFY
    Reidentify,
    /// stop for good
    Stop {
        /// the session was kept
        resumable: bool,
    },
    /// stop for good, the remote refused the client
    Fatal,
}

impl DisconnectAction {
    /// State entered after the disconnect
    pub fn next_state(self) -> ConnectionState {
        match self {
            Self::Resume => ConnectionState::Resuming,
            Self::Reidentify => ConnectionState::Reconnecting,
            Self::Stop { .. } | Self::Fatal => ConnectionState::Disconnected,
        }
    }

    /// Is the session kept after this action
    pub fn keeps_session(self) -> bool {
        matches!(self, Self::Resume | Self::Stop { resumable: true })
    }
}

impl DisconnectCause {
    /// Decide how to continue, `has_session` tells whether a session could be resumed
    pub fn classify(&self, has_session: bool) -> DisconnectAction {
        let retry = if has_session {
            DisconnectAction::Resume
        } else {
            DisconnectAction::Reidentify
        };

        match self {
            Self::RemoteClosed(status) if is_fatal_close_code(status.code) => DisconnectAction::Fatal,
            Self::RemoteClosed(_)
            | Self::Failure(_)
            | Self::Zombie
            | Self::ReconnectRequested
            | Self::UserReconnect => retry,
            Self::SessionInvalidated => DisconnectAction::Reidentify,
            Self::UserClose { resumable } => DisconnectAction::Stop {
                resumable: *resumable && has_session,
            },
        }
    }

    /// Status to close the local side of the transport with.
    ///
    /// Any code other than 1000 keeps the remote session resumable.
    pub fn local_close_status(&self, action: DisconnectAction) -> CloseStatus {
        if action.keeps_session() {
            CloseStatus::new(CloseStatus::PROTOCOL_ERROR, self.to_string())
        } else {
            CloseStatus::new(CloseStatus::NORMAL_CLOSE, self.to_string())
        }
    }

    /// Status reported for this disconnect
    pub fn status(&self, action: DisconnectAction) -> CloseStatus {
        match self {
            Self::RemoteClosed(status) => status.clone(),
            _ => self.local_close_status(action),
        }
    }
}

/// A planned reconnect attempt
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    /// attempt number since the last healthy connection, starts at 1
    pub attempt: u32,
    /// delay before the attempt
    pub backoff: Duration,
    /// will the attempt RESUME
    pub resume: bool,
}

/// Reconnect attempts since the last healthy connection, owned by the supervisor
#[derive(Debug, Default, Clone)]
pub struct RetryContext {
    attempts: u32,
    resets: u32,
}

impl RetryContext {
    /// Failed attempts since the last healthy connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Healthy connections after at least one failed attempt
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// A connection became healthy, returns the attempts it took
    pub fn reset(&mut self) -> u32 {
        let attempts = std::mem::take(&mut self.attempts);
        if attempts > 0 {
            self.resets += 1;
        }
        attempts
    }

    /// Forget everything, used on intentional shutdown
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Plan the next attempt, none if retries are exhausted
    pub fn next(&mut self, options: &ReconnectOptions, resume: bool) -> Option<RetryPlan> {
        self.next_with_rng(options, resume, &mut rand::thread_rng())
    }

    /// [RetryContext::next] with a given random source
    pub fn next_with_rng<R: Rng + ?Sized>(
        &mut self,
        options: &ReconnectOptions,
        resume: bool,
        rng: &mut R,
    ) -> Option<RetryPlan> {
        if let Some(max) = options.max_retries {
            if self.attempts >= max {
                log::debug!("Retries exhausted: {}/{}", self.attempts, max);
                return None;
            }
        }

        self.attempts += 1;
        let attempt = self.attempts;

        let base = match (resume, attempt) {
            // a resume can happen right away, later ones back off to avoid spamming
            (true, 1) => Duration::ZERO,
            (true, n) => options.backoff(n - 2),
            (false, n) => options.backoff(n - 1),
        };

        let backoff = if base.is_zero() {
            base
        } else {
            options.jitter(base, rng)
        };

        Some(RetryPlan {
            attempt,
            backoff,
            resume,
        })
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn no_jitter() -> ReconnectOptions {
        ReconnectOptions {
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = ReconnectOptions::default();
        let secs: Vec<_> = (0..9).map(|i| options.backoff(i).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 64, 120, 120, 120]);
        assert_eq!(options.backoff(200), Duration::from_secs(120));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let options = ReconnectOptions::default();
        let mut rng = StdRng::seed_from_u64(7);

        for iteration in 0..10 {
            let base = options.backoff(iteration);
            for _ in 0..100 {
                let backoff = options.jitter(base, &mut rng);
                assert!(backoff >= options.first_backoff, "{:?}", backoff);
                assert!(backoff <= options.max_backoff, "{:?}", backoff);
                assert!(backoff.as_millis() as f64 >= base.as_millis() as f64 * 0.5);
            }
        }
    }

    #[test]
    fn test_resume_first_attempt_is_immediate() {
        let options = no_jitter();
        let mut context = RetryContext::default();

        let plans: Vec<_> = (0..4)
            .map(|_| context.next(&options, true).unwrap().backoff.as_secs())
            .collect();
        assert_eq!(plans, vec![0, 2, 4, 8]);
    }

    #[test]
    fn test_reidentify_backoff() {
        let options = no_jitter();
        let mut context = RetryContext::default();

        let plans: Vec<_> = (0..3)
            .map(|_| context.next(&options, false).unwrap())
            .collect();
        assert_eq!(plans[0].attempt, 1);
        assert_eq!(plans[0].backoff, Duration::from_secs(2));
        assert_eq!(plans[2].backoff, Duration::from_secs(8));
    }

    #[test]
    fn test_max_retries() {
        let options = ReconnectOptions {
            max_retries: Some(2),
            ..no_jitter()
        };
        let mut context = RetryContext::default();

        assert!(context.next(&options, true).is_some());
        assert!(context.next(&options, true).is_some());
        assert!(context.next(&options, true).is_none());
        assert_eq!(context.attempts(), 2);
    }

    #[test]
    fn test_reset_and_clear() {
        let options = no_jitter();
        let mut context = RetryContext::default();
        context.next(&options, false);
        context.next(&options, false);

        assert_eq!(context.reset(), 2);
        assert_eq!(context.attempts(), 0);
        assert_eq!(context.resets(), 1);

        // a healthy connection without failures is not counted
        assert_eq!(context.reset(), 0);
        assert_eq!(context.resets(), 1);

        context.clear();
        assert_eq!(context.resets(), 0);
    }

    #[test]
    fn test_classify_close_codes() {
        let closed = |code| DisconnectCause::RemoteClosed(CloseStatus::new(code, ""));

        assert_eq!(closed(4004).classify(true), DisconnectAction::Fatal);
        assert_eq!(closed(4014).classify(false), DisconnectAction::Fatal);
        assert_eq!(closed(1006).classify(true), DisconnectAction::Resume);
        assert_eq!(closed(1006).classify(false), DisconnectAction::Reidentify);
        assert_eq!(closed(4000).classify(true), DisconnectAction::Resume);
        assert_eq!(closed(4009).classify(false), DisconnectAction::Reidentify);
    }

    #[test]
    fn test_classify_local_causes() {
        assert_eq!(
            DisconnectCause::Zombie.classify(true),
            DisconnectAction::Resume
        );
        assert_eq!(
            DisconnectCause::SessionInvalidated.classify(true),
            DisconnectAction::Reidentify
        );
        assert_eq!(
            DisconnectCause::UserClose { resumable: true }.classify(true),
            DisconnectAction::Stop { resumable: true }
        );
        assert_eq!(
            DisconnectCause::UserClose { resumable: true }.classify(false),
            DisconnectAction::Stop { resumable: false }
        );
        assert_eq!(
            DisconnectAction::Fatal.next_state(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_local_close_status_keeps_session() {
        let cause = DisconnectCause::Zombie;
        assert_eq!(
            cause.local_close_status(DisconnectAction::Resume).code,
            1002
        );
        let cause = DisconnectCause::UserClose { resumable: false };
        assert_eq!(
            cause
                .local_close_status(DisconnectAction::Stop { resumable: false })
                .code,
            1000
        );
    }
}
