//! # MDL address codec
//!
//! MDL addresses are base58 strings (bitcoin alphabet) decoding to 25
//! bytes: a 20 byte key digest, a 1 byte version and a 4 byte checksum.
//! The checksum is the first four bytes of SHA-256 over the preceding 21
//! bytes. Only version 0 addresses exist on the chain.

use sha2::Digest as _;
use sha2::Sha256;

/// Decoded length of an address, checksum included.
const ADDRESS_LENGTH: usize = 25;
/// Length of the trailing checksum.
const CHECKSUM_LENGTH: usize = 4;
/// The only address version in circulation.
const ADDRESS_VERSION: u8 = 0;

/// Ways an address string can fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The string is not valid base58.
    #[error("invalid base58: {0}")]
    Base58(String),
    /// The decoded payload has the wrong length.
    #[error("invalid address length: {0} bytes")]
    Length(usize),
    /// The trailing checksum does not match the payload.
    #[error("address checksum mismatch")]
    Checksum,
    /// The version byte is not one we know.
    #[error("unknown address version: {0}")]
    Version(u8),
}

/// Check that `address` is a well-formed MDL address.
pub fn validate(address: &str) -> Result<(), AddressError> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|error| AddressError::Base58(error.to_string()))?;

    if bytes.len() != ADDRESS_LENGTH {
        return Err(AddressError::Length(bytes.len()));
    }

    let (payload, checksum) = bytes.split_at(ADDRESS_LENGTH - CHECKSUM_LENGTH);
    let digest = Sha256::digest(payload);
    if digest[..CHECKSUM_LENGTH] != *checksum {
        return Err(AddressError::Checksum);
    }

    let version = payload[ADDRESS_LENGTH - CHECKSUM_LENGTH - 1];
    if version != ADDRESS_VERSION {
        return Err(AddressError::Version(version));
    }

    Ok(())
}

/// Encode a 20 byte key digest as an MDL address.
///
/// The teller never derives keys, but pool tooling and tests need a way to
/// mint syntactically valid addresses.
pub fn encode(digest: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(ADDRESS_LENGTH);
    payload.extend_from_slice(digest);
    payload.push(ADDRESS_VERSION);

    let checksum = Sha256::digest(&payload);
    payload.extend_from_slice(&checksum[..CHECKSUM_LENGTH]);

    bs58::encode(payload).into_string()
}
