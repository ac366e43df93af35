//! Stateless connect challenges
//!
//! A challenge is an HMAC of the peer address and a coarse time window under a
//! secret chosen at startup, so nothing is stored per request and spoofed
//! sources cannot complete a handshake they never saw the reply to.

use std::net::{IpAddr, SocketAddr};

use rand::RngCore;
use ring::hmac;

/// Width of one challenge window; a challenge stays valid for this window and
/// the next one
pub const CHALLENGE_WINDOW_MS: u64 = 5_000;

pub struct ChallengeIssuer {
    key: hmac::Key,
    window_ms: u64,
}

impl ChallengeIssuer {
    /// Random per-run secret
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(&secret, CHALLENGE_WINDOW_MS)
    }

    pub fn with_secret(secret: &[u8], window_ms: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            window_ms: window_ms.max(1),
        }
    }

    fn compute(&self, addr: SocketAddr, window: u64) -> u32 {
        let mut ctx = hmac::Context::with_key(&self.key);
        match addr.ip() {
            IpAddr::V4(ip) => ctx.update(&ip.octets()),
            IpAddr::V6(ip) => ctx.update(&ip.octets()),
        }
        ctx.update(&addr.port().to_be_bytes());
        ctx.update(&window.to_be_bytes());
        let tag = ctx.sign();
        let bytes = tag.as_ref();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Challenge to hand to `addr` now
    pub fn issue(&self, addr: SocketAddr, now_ms: u64) -> u32 {
        self.compute(addr, now_ms / self.window_ms)
    }

    /// Accept challenges from the current or the previous window
    pub fn verify(&self, addr: SocketAddr, challenge: u32, now_ms: u64) -> bool {
        let window = now_ms / self.window_ms;
        self.compute(addr, window) == challenge
            || (window > 0 && self.compute(addr, window - 1) == challenge)
    }
}

impl Default for ChallengeIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    #[test]
    fn test_issued_challenge_verifies() {
        let issuer = ChallengeIssuer::with_secret(b"secret", 1000);
        let challenge = issuer.issue(addr(27960), 1500);
        assert!(issuer.verify(addr(27960), challenge, 1500));
        assert!(issuer.verify(addr(27960), challenge, 2999));
    }

    #[test]
    fn test_challenge_expires() {
        let issuer = ChallengeIssuer::with_secret(b"secret", 1000);
        let challenge = issuer.issue(addr(27960), 1500);
        assert!(!issuer.verify(addr(27960), challenge, 3000));
    }

    #[test]
    fn test_challenge_bound_to_address() {
        let issuer = ChallengeIssuer::with_secret(b"secret", 1000);
        let challenge = issuer.issue(addr(27960), 0);
        assert!(!issuer.verify(addr(27961), challenge, 0));
    }

    #[test]
    fn test_secret_matters() {
        let a = ChallengeIssuer::with_secret(b"one", 1000);
        let b = ChallengeIssuer::with_secret(b"two", 1000);
        assert_ne!(a.issue(addr(1), 0), b.issue(addr(1), 0));
    }
}
