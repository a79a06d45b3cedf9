//! Dialer-side connection state machine
//!
//! `Disconnected -> Connecting -> Authenticating -> Established`, with `Error` reachable
//! from the two middle states when the retry budget runs out or the server rejects the
//! attempt. The machine only decides; the session loop sends the frames and drives the
//! retry timer.

use shared::frame::Authentication;
use shared::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Established,
    Error,
}

#[derive(Debug)]
pub struct Dialer {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
}

impl Dialer {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Socket is open; authentication attempts may start
    pub fn open(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
            self.attempts = 0;
        }
    }

    /// Called on every retry tick
    ///
    /// Returns `Ok(true)` when an `Authentication` frame should go out now, and fails
    /// with `ConnectionFailed` once the budget is spent without an answer.
    pub fn next_attempt(&mut self) -> Result<bool, NetError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                if self.attempts >= self.max_attempts {
                    self.state = ConnectionState::Error;
                    return Err(NetError::ConnectionFailed(self.attempts));
                }
                self.attempts += 1;
                self.state = ConnectionState::Authenticating;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Applies the server's answer
    ///
    /// Returns `Ok(true)` on the transition to `Established`. Any response other than
    /// `Connected` moves to `Error` and is returned as the matching error.
    pub fn on_response(&mut self, auth: &Authentication) -> Result<bool, NetError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                match auth.response.into_result(&auth.message) {
                    Ok(()) => {
                        self.state = ConnectionState::Established;
                        Ok(true)
                    }
                    Err(e) => {
                        self.state = ConnectionState::Error;
                        Err(e)
                    }
                }
            }
            // Late answers to earlier retries
            _ => Ok(false),
        }
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Error {
            self.state = ConnectionState::Disconnected;
        }
    }
}
