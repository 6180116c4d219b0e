// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of ravelin.
//
// ravelin is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// ravelin is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with ravelin.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Client-signature verification
//!
//! A signed request carries a signature over the binary-framed packing of its inner envelope; the
//! front-end checks it against the caller's registered certificate. The cryptographic primitive
//! itself is a collaborator: the front-end only needs "build me a verifier from these certificate
//! bytes" and "does this signature match". [Ed25519Verifier] is the stock implementation, where
//! the "certificate" is a raw 32-byte Ed25519 verifying key.

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey, PUBLIC_KEY_LENGTH};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

pub type StdResult<T, E> = std::result::Result<T, E>;

/// A per-caller signature verifier, materialized from that caller's certificate bytes
pub trait Verifier: Sized {
    type Error: std::error::Error;

    /// Build a verifier from certificate bytes; fails if the bytes don't describe a usable key
    fn from_cert(cert: &[u8]) -> StdResult<Self, Self::Error>;
    /// Does `sig` match `msg` under this caller's key?
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Expected a {PUBLIC_KEY_LENGTH}-byte Ed25519 key, got {length} bytes"))]
    BadKeyLength { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to parse an Ed25519 verifying key: {source}"))]
    BadKey {
        source: ed25519_dalek::SignatureError,
        backtrace: Backtrace,
    },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     the stock implementation                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Verifier] over a raw 32-byte Ed25519 verifying key
#[derive(Clone, Debug)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Verifier for Ed25519Verifier {
    type Error = Error;

    fn from_cert(cert: &[u8]) -> StdResult<Ed25519Verifier, Error> {
        let bytes: &[u8; PUBLIC_KEY_LENGTH] = cert
            .try_into()
            .ok()
            .context(BadKeyLengthSnafu { length: cert.len() })?;
        Ok(Ed25519Verifier {
            key: VerifyingKey::from_bytes(bytes).context(BadKeySnafu)?,
        })
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match Signature::from_slice(sig) {
            Ok(sig) => self.key.verify(msg, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod verify_tests {
    use super::*;

    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn accepts_a_valid_signature_and_nothing_else() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let cert = signing.verifying_key().to_bytes();

        let verifier = Ed25519Verifier::from_cert(&cert).unwrap(/* known good */);
        let msg = b"the signed content";
        let sig = signing.sign(msg).to_vec();

        assert!(verifier.verify(msg, &sig));
        assert!(!verifier.verify(b"tampered content", &sig));
        assert!(!verifier.verify(msg, &[0u8; 64]));
        assert!(!verifier.verify(msg, b"too short"));
    }

    #[test]
    fn rejects_malformed_certificates() {
        assert!(Ed25519Verifier::from_cert(b"not a key").is_err());
        assert!(Ed25519Verifier::from_cert(&[]).is_err());
    }
}
