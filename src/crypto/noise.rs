//! Noise NN session wrapper.
//!
//! Both sides run the two-message NN pattern (no static keys, anonymous):
//!
//! ```text
//! Noise_NN:
//!   -> e            # dialer's ephemeral, carries the conn_id
//!   <- e, ee        # listener's ephemeral, carries the session tokens
//! ```
//!
//! After the exchange each side holds two directional ciphers; the transport
//! state maps send/receive to the right one based on who initiated. Sealed
//! data chunks are the AEAD ciphertext prefixed with a 4-byte big-endian
//! length, so a receiver can reassemble them from an unaligned byte stream.

use thiserror::Error;

use crate::core::{AEAD_TAG_SIZE, SEAL_LEN_PREFIX_SIZE};

/// The fixed cipher suite every connection uses.
const NOISE_PATTERN: &str = "Noise_NN_25519_AESGCM_SHA256";

/// Upper bound on a single Noise message.
const MAX_NOISE_MESSAGE: usize = 65535;

/// Largest plaintext a single [`NoiseSession::seal`] call accepts; the
/// ciphertext plus tag must still fit one Noise message.
pub const MAX_SEAL_PLAINTEXT: usize = MAX_NOISE_MESSAGE - AEAD_TAG_SIZE;

/// Errors from the security layer.
#[derive(Debug, Error)]
pub enum NoiseError {
    /// The Noise protocol state could not be initialized.
    #[error("noise handshake initialization failed: {0}")]
    InitFailed(String),

    /// A handshake message could not be created.
    #[error("handshake message creation failed: {0}")]
    MessageFailed(String),

    /// The handshake failed while consuming a peer message.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Data flowed before the handshake reached the complete state.
    #[error("handshake not complete")]
    Incomplete,

    /// Plaintext could not be encrypted.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// A sealed chunk failed AEAD verification. Fatal for the connection.
    #[error("decryption failed")]
    DecryptionFailed,
}

enum State {
    Handshaking(Box<snow::HandshakeState>),
    Established(Box<snow::TransportState>),
}

/// An anonymous authenticated session: the in-progress NN handshake, then the
/// pair of directional ciphers once both messages have been exchanged.
pub struct NoiseSession {
    state: Option<State>,
    initiator: bool,
}

impl NoiseSession {
    /// Create the dialer-side handshake state.
    pub fn new_initiator() -> Result<Self, NoiseError> {
        Self::new(true)
    }

    /// Create the listener-side handshake state.
    pub fn new_responder() -> Result<Self, NoiseError> {
        Self::new(false)
    }

    fn new(initiator: bool) -> Result<Self, NoiseError> {
        let builder = snow::Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|_| NoiseError::InitFailed(format!("bad pattern {NOISE_PATTERN}")))?,
        );
        let hs = if initiator {
            builder.build_initiator()
        } else {
            builder.build_responder()
        }
        .map_err(|e| NoiseError::InitFailed(e.to_string()))?;

        Ok(Self {
            state: Some(State::Handshaking(Box::new(hs))),
            initiator,
        })
    }

    /// Produce the next handshake message embedding `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let Some(State::Handshaking(hs)) = self.state.as_mut() else {
            return Err(NoiseError::MessageFailed("handshake already complete".into()));
        };
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = hs
            .write_message(payload, &mut buf)
            .map_err(|e| NoiseError::MessageFailed(e.to_string()))?;
        buf.truncate(len);
        self.try_finish()?;
        Ok(buf)
    }

    /// Consume a peer handshake message, returning its embedded payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let Some(State::Handshaking(hs)) = self.state.as_mut() else {
            return Err(NoiseError::HandshakeFailed("handshake already complete".into()));
        };
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = hs
            .read_message(message, &mut buf)
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        buf.truncate(len);
        self.try_finish()?;
        Ok(buf)
    }

    // After the second NN message both cipher states exist; switch over.
    fn try_finish(&mut self) -> Result<(), NoiseError> {
        if let Some(State::Handshaking(hs)) = self.state.as_ref() {
            if hs.is_handshake_finished() {
                let Some(State::Handshaking(hs)) = self.state.take() else {
                    unreachable!()
                };
                let transport = hs
                    .into_transport_mode()
                    .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
                self.state = Some(State::Established(Box::new(transport)));
            }
        }
        Ok(())
    }

    /// True once both cipher states are established.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, Some(State::Established(_)))
    }

    /// True for the dialer side.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Encrypt `plaintext` with the send cipher and prepend a 4-byte
    /// big-endian length of the ciphertext plus tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let Some(State::Established(transport)) = self.state.as_mut() else {
            return Err(NoiseError::Incomplete);
        };
        let mut out = vec![0u8; SEAL_LEN_PREFIX_SIZE + plaintext.len() + AEAD_TAG_SIZE];
        let len = transport
            .write_message(plaintext, &mut out[SEAL_LEN_PREFIX_SIZE..])
            .map_err(|e| NoiseError::EncryptionFailed(e.to_string()))?;
        out[..SEAL_LEN_PREFIX_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        out.truncate(SEAL_LEN_PREFIX_SIZE + len);
        Ok(out)
    }

    /// Extract and decrypt one sealed chunk from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a complete chunk
    /// (accumulate more and retry), otherwise the plaintext and the number of
    /// raw bytes consumed. A verification failure is fatal.
    pub fn unseal(&mut self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, NoiseError> {
        if data.len() < SEAL_LEN_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < SEAL_LEN_PREFIX_SIZE + len {
            return Ok(None);
        }

        let Some(State::Established(transport)) = self.state.as_mut() else {
            return Err(NoiseError::Incomplete);
        };
        let mut out = vec![0u8; len];
        let n = transport
            .read_message(&data[SEAL_LEN_PREFIX_SIZE..SEAL_LEN_PREFIX_SIZE + len], &mut out)
            .map_err(|_| NoiseError::DecryptionFailed)?;
        out.truncate(n);
        Ok(Some((out, SEAL_LEN_PREFIX_SIZE + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (NoiseSession, NoiseSession) {
        let mut dialer = NoiseSession::new_initiator().unwrap();
        let mut listener = NoiseSession::new_responder().unwrap();

        let msg1 = dialer.write_message(b"conn-id").unwrap();
        let payload1 = listener.read_message(&msg1).unwrap();
        assert_eq!(payload1, b"conn-id");

        let msg2 = listener.write_message(b"tokens").unwrap();
        let payload2 = dialer.read_message(&msg2).unwrap();
        assert_eq!(payload2, b"tokens");

        assert!(dialer.is_complete());
        assert!(listener.is_complete());
        (dialer, listener)
    }

    #[test]
    fn test_handshake_completes_after_two_messages() {
        let (dialer, listener) = established_pair();
        assert!(dialer.is_initiator());
        assert!(!listener.is_initiator());
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let (mut dialer, mut listener) = established_pair();

        let sealed = dialer.seal(b"hello through storage").unwrap();
        assert_eq!(sealed.len(), 4 + b"hello through storage".len() + 16);

        let (plaintext, consumed) = listener.unseal(&sealed).unwrap().unwrap();
        assert_eq!(plaintext, b"hello through storage");
        assert_eq!(consumed, sealed.len());
    }

    #[test]
    fn test_both_directions() {
        let (mut dialer, mut listener) = established_pair();

        let to_listener = dialer.seal(b"ping").unwrap();
        let (p, _) = listener.unseal(&to_listener).unwrap().unwrap();
        assert_eq!(p, b"ping");

        let to_dialer = listener.seal(b"pong").unwrap();
        let (p, _) = dialer.unseal(&to_dialer).unwrap().unwrap();
        assert_eq!(p, b"pong");
    }

    #[test]
    fn test_unseal_short_buffer() {
        let (mut dialer, mut listener) = established_pair();
        let sealed = dialer.seal(b"partial delivery").unwrap();

        assert!(listener.unseal(&sealed[..2]).unwrap().is_none());
        assert!(listener.unseal(&sealed[..sealed.len() - 1]).unwrap().is_none());

        let (p, _) = listener.unseal(&sealed).unwrap().unwrap();
        assert_eq!(p, b"partial delivery");
    }

    #[test]
    fn test_unseal_concatenated_chunks() {
        let (mut dialer, mut listener) = established_pair();
        let mut stream = dialer.seal(b"first").unwrap();
        stream.extend_from_slice(&dialer.seal(b"second").unwrap());

        let (p1, used1) = listener.unseal(&stream).unwrap().unwrap();
        assert_eq!(p1, b"first");
        let (p2, used2) = listener.unseal(&stream[used1..]).unwrap().unwrap();
        assert_eq!(p2, b"second");
        assert_eq!(used1 + used2, stream.len());
    }

    #[test]
    fn test_tampered_chunk_is_fatal() {
        let (mut dialer, mut listener) = established_pair();
        let mut sealed = dialer.seal(b"integrity matters").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(matches!(
            listener.unseal(&sealed),
            Err(NoiseError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_seal_before_complete_fails() {
        let mut dialer = NoiseSession::new_initiator().unwrap();
        assert!(matches!(dialer.seal(b"x"), Err(NoiseError::Incomplete)));
    }

    #[test]
    fn test_empty_payload_seal() {
        let (mut dialer, mut listener) = established_pair();
        let sealed = dialer.seal(b"").unwrap();
        let (p, consumed) = listener.unseal(&sealed).unwrap().unwrap();
        assert!(p.is_empty());
        assert_eq!(consumed, 4 + 16);
    }
}
